// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;

#[tokio::test]
async fn new_runtime_has_no_backend_or_consumers() {
    let runtime = SessionRuntime::new("s1");
    assert!(!runtime.has_backend().await);
    assert_eq!(runtime.consumer_count().await, 0);
    assert!(runtime.queued_message.lock().unwrap().is_none());
}

#[test]
fn request_ids_are_unique_and_session_scoped() {
    let runtime = SessionRuntime::new("s1");
    let a = runtime.next_request_id();
    let b = runtime.next_request_id();
    assert_ne!(a, b);
    assert!(a.starts_with("s1-"));
}

#[tokio::test]
async fn queued_message_holds_at_most_one_slot() {
    let runtime = SessionRuntime::new("s1");
    {
        let mut slot = runtime.queued_message.lock().unwrap();
        *slot = Some(QueuedMessage {
            owner_consumer_id: "c1".to_owned(),
            content: "first".to_owned(),
            images: vec![],
        });
    }
    {
        let mut slot = runtime.queued_message.lock().unwrap();
        let replaced = slot.replace(QueuedMessage {
            owner_consumer_id: "c1".to_owned(),
            content: "second".to_owned(),
            images: vec![],
        });
        assert_eq!(replaced.unwrap().content, "first");
    }
    assert_eq!(runtime.queued_message.lock().unwrap().as_ref().unwrap().content, "second");
}

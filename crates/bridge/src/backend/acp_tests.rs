// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::sync::atomic::AtomicU64;

use serde_json::json;

use super::*;
use crate::message::Role;

#[test]
fn user_message_becomes_tracked_prompt_request() {
    let next_id = AtomicU64::new(1);
    let msg = UnifiedMessage::new(MessageType::UserMessage, Role::User).with_text("ls -la");
    let frame = build_outbound_frame("bridge-sid", &next_id, msg).unwrap();

    match frame {
        OutboundFrame::Tracked { id, kind: PendingKind::Prompt, bytes } => {
            assert_eq!(id, 1);
            let text = String::from_utf8(bytes).unwrap();
            assert!(text.ends_with('\n'));
            let value: Value = serde_json::from_str(text.trim_end()).unwrap();
            assert_eq!(value["method"], "session/prompt");
            assert_eq!(value["params"]["sessionId"], "bridge-sid");
            assert_eq!(value["params"]["prompt"][0]["text"], "ls -la");
        }
        _ => panic!("expected a tracked prompt frame"),
    }
}

#[test]
fn interrupt_becomes_untracked_notification() {
    let next_id = AtomicU64::new(5);
    let msg = UnifiedMessage::new(MessageType::Interrupt, Role::User);
    let frame = build_outbound_frame("bridge-sid", &next_id, msg).unwrap();

    match frame {
        OutboundFrame::Raw(bytes) => {
            let value: Value = serde_json::from_slice(&bytes).unwrap();
            assert_eq!(value["method"], "session/cancel");
            assert!(value.get("id").is_none());
        }
        _ => panic!("expected a raw notification frame"),
    }
    // Untracked frames must not consume an id.
    assert_eq!(next_id.load(Ordering::SeqCst), 5);
}

#[test]
fn permission_response_allow_carries_selected_outcome() {
    let next_id = AtomicU64::new(1);
    let msg = UnifiedMessage::new(MessageType::PermissionResponse, Role::User)
        .with_meta("request_id", "7")
        .with_meta("behavior", "allow");
    let frame = build_outbound_frame("sid", &next_id, msg).unwrap();

    let OutboundFrame::Raw(bytes) = frame else { panic!("expected raw frame") };
    let value: Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(value["id"], 7);
    assert_eq!(value["result"]["outcome"]["outcome"], "selected");
}

#[test]
fn permission_response_deny_carries_cancelled_outcome() {
    let next_id = AtomicU64::new(1);
    let msg = UnifiedMessage::new(MessageType::PermissionResponse, Role::User)
        .with_meta("request_id", "p1")
        .with_meta("behavior", "deny");
    let frame = build_outbound_frame("sid", &next_id, msg).unwrap();

    let OutboundFrame::Raw(bytes) = frame else { panic!("expected raw frame") };
    let value: Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(value["id"], "p1");
    assert_eq!(value["result"]["outcome"]["outcome"], "cancelled");
}

#[test]
fn assistant_messages_are_not_sendable_to_the_backend() {
    let next_id = AtomicU64::new(1);
    let msg = UnifiedMessage::new(MessageType::Assistant, Role::Assistant);
    let err = build_outbound_frame("sid", &next_id, msg).unwrap_err();
    assert_eq!(err.code, crate::error::ErrorCode::NotSupported);
}

#[test]
fn chunk_text_reads_nested_content_text() {
    let update = json!({"content": {"type": "text", "text": "hello"}});
    assert_eq!(chunk_text(&update), "hello");
}

#[test]
fn unknown_response_id_becomes_control_response() {
    let value = json!({"id": "r1", "result": {"commands": ["/help"]}});
    let msg = build_control_response(&json!("r1"), &value);
    assert_eq!(msg.kind, MessageType::ControlResponse);
    assert_eq!(msg.meta_str("request_id"), Some("r1"));
}

// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;

#[test]
fn plain_text_joins_text_and_thinking_blocks() {
    let msg = UnifiedMessage::new(MessageType::Assistant, Role::Assistant).with_content(vec![
        ContentBlock::Text { text: "hello ".to_owned() },
        ContentBlock::ToolUse { id: "t1".to_owned(), name: "Bash".to_owned(), input: Value::Null },
        ContentBlock::Text { text: "world".to_owned() },
    ]);
    assert_eq!(msg.plain_text(), "hello world");
}

#[test]
fn meta_accessors_read_typed_values() {
    let msg = UnifiedMessage::new(MessageType::Result, Role::System)
        .with_meta("session_id", "s1")
        .with_meta("num_turns", 3)
        .with_meta("total_cost_usd", 1.5);

    assert_eq!(msg.meta_str("session_id"), Some("s1"));
    assert_eq!(msg.meta_u64("num_turns"), Some(3));
    assert_eq!(msg.meta_f64("total_cost_usd"), Some(1.5));
    assert_eq!(msg.meta_str("missing"), None);
}

#[test]
fn round_trips_through_json_with_tagged_content() {
    let msg = UnifiedMessage::new(MessageType::UserMessage, Role::User).with_text("ls");
    let json = serde_json::to_string(&msg).unwrap();
    assert!(json.contains("\"type\":\"user_message\""));
    let back: UnifiedMessage = serde_json::from_str(&json).unwrap();
    assert_eq!(back, msg);
}

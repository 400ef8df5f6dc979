// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use serde::{Deserialize, Serialize};

use super::*;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Ping {
    kind: String,
    seq: u64,
}

fn paired_pair(session_id: &str) -> (EncryptionLayer, EncryptionLayer) {
    let (daemon, daemon_pub) = EncryptionLayer::generate(session_id).unwrap();
    let (consumer, consumer_pub) = EncryptionLayer::generate(session_id).unwrap();
    daemon.pair(&consumer_pub).unwrap();
    consumer.pair(&daemon_pub).unwrap();
    (daemon, consumer)
}

#[test]
fn round_trip_decrypts_to_original_value() {
    let (daemon, consumer) = paired_pair("test-session");
    let msg = Ping { kind: "cli_connected".to_owned(), seq: 1 };

    let envelope = daemon.encrypt_outbound(&msg).unwrap();
    let decoded: Ping = consumer.decrypt_inbound(&envelope).unwrap();

    assert_eq!(decoded, msg);
}

#[test]
fn envelope_carries_expected_shape() {
    let (daemon, _consumer) = paired_pair("test-session");
    let msg = Ping { kind: "cli_connected".to_owned(), seq: 1 };

    let envelope = daemon.encrypt_outbound(&msg).unwrap();
    let parsed: EncryptedEnvelope = serde_json::from_str(&envelope).unwrap();

    assert_eq!(parsed.v, 1);
    assert_eq!(parsed.sid, "test-session");
    assert!(EncryptionLayer::is_encrypted(&envelope));
}

#[test]
fn stale_envelope_fails_after_peer_key_rotation() {
    let (daemon, consumer) = paired_pair("test-session");
    let msg = Ping { kind: "cli_connected".to_owned(), seq: 1 };
    let stale_envelope = daemon.encrypt_outbound(&msg).unwrap();

    let (_new_consumer, new_consumer_pub) = EncryptionLayer::generate("test-session").unwrap();
    daemon.update_peer_key(&new_consumer_pub).unwrap();

    // consumer never rotates, so it still decrypts under the old secret...
    let fresh_envelope = daemon.encrypt_outbound(&msg).unwrap();
    let result: Result<Ping, _> = consumer.decrypt_inbound(&fresh_envelope);
    assert!(matches!(result, Err(e) if e.code == error::ErrorCode::AuthFailed));

    let _ = stale_envelope;
}

#[test]
fn deactivated_layer_rejects_encrypt_and_decrypt() {
    let (daemon, consumer) = paired_pair("test-session");
    daemon.deactivate();

    let msg = Ping { kind: "cli_connected".to_owned(), seq: 1 };
    let err = daemon.encrypt_outbound(&msg).unwrap_err();
    assert_eq!(err.code, error::ErrorCode::Deactivated);

    let envelope = consumer.encrypt_outbound(&msg).unwrap();
    consumer.deactivate();
    let err = consumer.decrypt_inbound::<Ping>(&envelope).unwrap_err();
    assert_eq!(err.code, error::ErrorCode::Deactivated);
}

#[test]
fn duplicate_nonce_is_rejected() {
    let (daemon, consumer) = paired_pair("test-session");
    let msg = Ping { kind: "cli_connected".to_owned(), seq: 1 };
    let envelope = daemon.encrypt_outbound(&msg).unwrap();

    let first: Ping = consumer.decrypt_inbound(&envelope).unwrap();
    assert_eq!(first, msg);

    let replay: Result<Ping, _> = consumer.decrypt_inbound(&envelope);
    assert!(matches!(replay, Err(e) if e.code == error::ErrorCode::AuthFailed));
}

#[test]
fn is_encrypted_rejects_plain_json() {
    assert!(!EncryptionLayer::is_encrypted(r#"{"type":"user_message","content":"hi"}"#));
}

// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! `EncryptionLayer` — authenticated envelope encryption for consumer
//! traffic (spec.md §4.6). Transparent middleware sitting between
//! [`crate::bridge::SessionBridge`] and one consumer's WebSocket.
//!
//! Key agreement uses X25519 (`ring::agreement`), matching the one-shot,
//! single-use-private-key design `ring` enforces: [`EncryptionLayer::generate`]
//! creates a fresh ephemeral keypair and hands back its public half so it can
//! be exchanged with the peer out-of-band; [`EncryptionLayer::pair`] consumes
//! that keypair in exactly one agreement against the peer's public key and
//! expands the shared secret via HKDF-SHA256 into a ChaCha20-Poly1305 key
//! that is then reused for the pairing's lifetime. `updatePeerKey` re-pairs
//! by generating a fresh ephemeral keypair and repeating the process, which
//! is why the wire envelope carries a `k` field — the sender's current
//! ephemeral public key, so the peer can re-derive the secret after rotation.

use std::collections::HashSet;
use std::sync::Mutex;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use ring::aead::{Aad, LessSafeKey, Nonce, UnboundKey, CHACHA20_POLY1305, NONCE_LEN};
use ring::agreement::{self, EphemeralPrivateKey, UnparsedPublicKey, X25519};
use ring::hkdf::{Salt, HKDF_SHA256};
use ring::rand::{SecureRandom, SystemRandom};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{self, BridgeError};

/// Wire form for encrypted consumer traffic (spec.md §3 "EncryptedEnvelope").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncryptedEnvelope {
    pub v: u8,
    pub sid: String,
    /// Per-message nonce, base64-encoded.
    pub n: String,
    /// Ciphertext, base64-encoded (excludes the auth tag, carried in `t`).
    pub c: String,
    /// Sender's current ephemeral public key, present when re-pairing.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub k: Option<String>,
    /// Auth tag, base64-encoded.
    pub t: String,
}

struct Inner {
    /// Consumed by the first call to `pair`; `None` afterwards, at which
    /// point rotation generates a fresh ephemeral key instead.
    pending_private: Option<EphemeralPrivateKey>,
    our_public_key: Vec<u8>,
    #[allow(dead_code)]
    peer_public_key: Vec<u8>,
    key: Option<LessSafeKey>,
    active: bool,
    seen_nonces: HashSet<[u8; NONCE_LEN]>,
}

/// Authenticated-encryption middleware for one consumer connection.
pub struct EncryptionLayer {
    session_id: String,
    rng: SystemRandom,
    inner: Mutex<Inner>,
}

impl EncryptionLayer {
    /// Generate a fresh ephemeral keypair for `session_id`, returning the
    /// layer (inactive, unpaired) alongside our public key bytes to hand to
    /// the peer. Call [`Self::pair`] once the peer's public key is known.
    pub fn generate(session_id: impl Into<String>) -> Result<(Self, Vec<u8>), BridgeError> {
        let rng = SystemRandom::new();
        let private = EphemeralPrivateKey::generate(&X25519, &rng)
            .map_err(|_| error::internal_error("keypair generation failed"))?;
        let public = private
            .compute_public_key()
            .map_err(|_| error::internal_error("public key derivation failed"))?
            .as_ref()
            .to_vec();

        let layer = Self {
            session_id: session_id.into(),
            rng,
            inner: Mutex::new(Inner {
                pending_private: Some(private),
                our_public_key: public.clone(),
                peer_public_key: Vec::new(),
                key: None,
                active: false,
                seen_nonces: HashSet::new(),
            }),
        };
        Ok((layer, public))
    }

    /// Our current ephemeral public key, to be shared with the peer
    /// out-of-band (or via the envelope's `k` field after a rotation).
    pub fn public_key_bytes(&self) -> Vec<u8> {
        self.inner.lock().expect("encryption layer mutex poisoned").our_public_key.clone()
    }

    pub fn is_active(&self) -> bool {
        self.inner.lock().expect("encryption layer mutex poisoned").active
    }

    /// Complete (or redo) the key agreement against `peer_public_key`.
    /// The first call consumes the keypair handed out by [`Self::generate`];
    /// later calls (re-pairing, spec.md §4.6 `updatePeerKey`) generate a
    /// fresh ephemeral keypair, so messages sealed under the prior secret
    /// are unrecoverable afterwards.
    pub fn pair(&self, peer_public_key: &[u8]) -> Result<(), BridgeError> {
        let mut inner = self.inner.lock().expect("encryption layer mutex poisoned");

        let private = match inner.pending_private.take() {
            Some(key) => key,
            None => EphemeralPrivateKey::generate(&X25519, &self.rng)
                .map_err(|_| error::internal_error("keypair generation failed"))?,
        };
        let our_public = private
            .compute_public_key()
            .map_err(|_| error::internal_error("public key derivation failed"))?
            .as_ref()
            .to_vec();

        let peer = UnparsedPublicKey::new(&X25519, peer_public_key);
        let shared_secret: Vec<u8> = agreement::agree_ephemeral(private, &peer, |material| {
            Ok::<Vec<u8>, ring::error::Unspecified>(material.to_vec())
        })
        .map_err(|_| error::internal_error("key agreement failed"))?;

        inner.key = Some(derive_key(&shared_secret, &self.session_id)?);
        inner.our_public_key = our_public;
        inner.peer_public_key = peer_public_key.to_vec();
        inner.active = true;
        inner.seen_nonces.clear();
        Ok(())
    }

    /// Re-activate and replace the peer key (spec.md §4.6 `updatePeerKey`).
    pub fn update_peer_key(&self, new_peer_public_key: &[u8]) -> Result<(), BridgeError> {
        self.pair(new_peer_public_key)
    }

    /// Encrypt and frame a value as an [`EncryptedEnvelope`], serialized to
    /// its wire string.
    pub fn encrypt_outbound<T: Serialize>(&self, value: &T) -> Result<String, BridgeError> {
        let mut inner = self.inner.lock().expect("encryption layer mutex poisoned");
        if !inner.active {
            return Err(error::deactivated("encryption layer is not paired or was deactivated"));
        }
        let key = inner.key.as_ref().expect("active implies a derived key is present");

        let mut in_out = serde_json::to_vec(value).map_err(|e| error::internal_error(e.to_string()))?;

        let mut nonce_bytes = [0u8; NONCE_LEN];
        self.rng.fill(&mut nonce_bytes).map_err(|_| error::internal_error("rng failure"))?;
        let nonce = Nonce::assume_unique_for_key(nonce_bytes);

        key.seal_in_place_append_tag(nonce, Aad::from(self.session_id.as_bytes()), &mut in_out)
            .map_err(|_| error::internal_error("envelope seal failed"))?;

        let tag_len = CHACHA20_POLY1305.tag_len();
        let tag = in_out.split_off(in_out.len() - tag_len);

        let envelope = EncryptedEnvelope {
            v: 1,
            sid: self.session_id.clone(),
            n: BASE64.encode(nonce_bytes),
            c: BASE64.encode(in_out),
            k: Some(BASE64.encode(&inner.our_public_key)),
            t: BASE64.encode(tag),
        };
        serde_json::to_string(&envelope).map_err(|e| error::internal_error(e.to_string()))
    }

    /// Parse, authenticate, decrypt, and JSON-decode an inbound envelope.
    pub fn decrypt_inbound<T: DeserializeOwned>(&self, data: &str) -> Result<T, BridgeError> {
        let envelope: EncryptedEnvelope =
            serde_json::from_str(data).map_err(|_| error::malformed_envelope("not a JSON envelope"))?;

        let mut inner = self.inner.lock().expect("encryption layer mutex poisoned");
        if !inner.active {
            return Err(error::deactivated("encryption layer is not paired or was deactivated"));
        }
        let key = inner.key.as_ref().expect("active implies a derived key is present");

        let nonce_raw =
            BASE64.decode(envelope.n.as_bytes()).map_err(|_| error::malformed_envelope("bad nonce"))?;
        let nonce_bytes: [u8; NONCE_LEN] =
            nonce_raw.try_into().map_err(|_| error::malformed_envelope("wrong nonce length"))?;

        if !inner.seen_nonces.insert(nonce_bytes) {
            return Err(error::auth_failed("nonce reused"));
        }

        let mut sealed =
            BASE64.decode(envelope.c.as_bytes()).map_err(|_| error::malformed_envelope("bad ciphertext"))?;
        let tag =
            BASE64.decode(envelope.t.as_bytes()).map_err(|_| error::malformed_envelope("bad tag"))?;
        sealed.extend_from_slice(&tag);

        let nonce = Nonce::assume_unique_for_key(nonce_bytes);
        let plaintext = key
            .open_in_place(nonce, Aad::from(self.session_id.as_bytes()), &mut sealed)
            .map_err(|_| error::auth_failed("authentication failed"))?;

        serde_json::from_slice(plaintext).map_err(|_| error::malformed_envelope("bad plaintext"))
    }

    pub fn deactivate(&self) {
        self.inner.lock().expect("encryption layer mutex poisoned").active = false;
    }

    /// Best-effort detection: does `data` parse as JSON carrying the
    /// envelope's required fields?
    pub fn is_encrypted(data: &str) -> bool {
        let Ok(value) = serde_json::from_str::<serde_json::Value>(data) else {
            return false;
        };
        let Some(obj) = value.as_object() else {
            return false;
        };
        ["v", "sid", "n", "c", "t"].iter().all(|key| obj.contains_key(*key))
    }
}

fn derive_key(shared_secret: &[u8], session_id: &str) -> Result<LessSafeKey, BridgeError> {
    let salt = Salt::new(HKDF_SHA256, b"session-bridge-consumer-envelope-v1");
    let prk = salt.extract(shared_secret);
    let okm = prk
        .expand(&[session_id.as_bytes()], &CHACHA20_POLY1305)
        .map_err(|_| error::internal_error("hkdf expand failed"))?;

    let mut key_bytes = [0u8; 32];
    okm.fill(&mut key_bytes).map_err(|_| error::internal_error("hkdf fill failed"))?;

    let unbound = UnboundKey::new(&CHACHA20_POLY1305, &key_bytes)
        .map_err(|_| error::internal_error("invalid derived key"))?;
    Ok(LessSafeKey::new(unbound))
}

#[cfg(test)]
#[path = "encryption_tests.rs"]
mod tests;

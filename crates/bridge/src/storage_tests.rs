// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;

fn snapshot(id: &str) -> SessionSnapshot {
    SessionSnapshot {
        id: id.to_owned(),
        backend_session_id: None,
        cwd: None,
        created_at: 0,
        name: None,
        state: SessionState::new(id),
        history: Vec::new(),
    }
}

#[tokio::test]
async fn round_trips_a_snapshot() {
    let storage = InMemoryStorage::new();
    storage.save(snapshot("s1")).await.unwrap();
    let loaded = storage.load("s1".to_owned()).await.unwrap();
    assert_eq!(loaded.unwrap().id, "s1");
}

#[tokio::test]
async fn missing_session_loads_none() {
    let storage = InMemoryStorage::new();
    let loaded = storage.load("missing".to_owned()).await.unwrap();
    assert!(loaded.is_none());
}

#[tokio::test]
async fn save_overwrites_prior_snapshot() {
    let storage = InMemoryStorage::new();
    storage.save(snapshot("s1")).await.unwrap();
    let mut second = snapshot("s1");
    second.name = Some("renamed".to_owned());
    storage.save(second).await.unwrap();
    let loaded = storage.load("s1".to_owned()).await.unwrap().unwrap();
    assert_eq!(loaded.name.as_deref(), Some("renamed"));
}

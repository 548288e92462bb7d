//! Session Store Tests
//!
//! Runs against the in-process backend; the store itself only speaks the
//! shared map contract, so backend choice is immaterial here.

use std::time::Duration;

use crate::coordination::local::LocalBackend;
use crate::coordination::BackendHandle;
use crate::session::types::SessionError;
use crate::session::{SessionStore, SESSION_MAP};

fn store_with_timeout(timeout: Duration) -> SessionStore {
    let handle = BackendHandle::new(LocalBackend::new());
    SessionStore::new(handle, timeout)
}

#[tokio::test]
async fn test_create_then_get_roundtrip() {
    let store = store_with_timeout(Duration::from_secs(30));

    let created = store.create().await.unwrap();
    assert_eq!(created.version, 0);

    let loaded = store.get(&created.id).await.unwrap().expect("session found");
    assert_eq!(loaded, created);
}

#[tokio::test]
async fn test_put_increments_version() {
    let store = store_with_timeout(Duration::from_secs(30));
    let created = store.create().await.unwrap();

    let mut update = created.clone();
    update.data.insert("player".to_string(), b"alice".to_vec());
    let stored = store.put(update).await.unwrap();
    assert_eq!(stored.version, 1);

    let loaded = store.get(&created.id).await.unwrap().unwrap();
    assert_eq!(loaded.version, 1);
    assert_eq!(loaded.data.get("player"), Some(&b"alice".to_vec()));
}

#[tokio::test]
async fn test_stale_version_is_rejected_and_winner_survives() {
    let store = store_with_timeout(Duration::from_secs(30));
    let created = store.create().await.unwrap();

    // Two writers observed version 0; the first wins.
    let mut winner = created.clone();
    winner.data.insert("seat".to_string(), b"1".to_vec());
    store.put(winner).await.unwrap();

    let mut loser = created.clone();
    loser.data.insert("seat".to_string(), b"2".to_vec());
    let error = store.put(loser).await.unwrap_err();
    match error {
        SessionError::VersionConflict {
            id,
            submitted,
            stored,
        } => {
            assert_eq!(id, created.id);
            assert_eq!(submitted, 0);
            assert_eq!(stored, 1);
        }
        other => panic!("expected version conflict, got {other}"),
    }

    // The winning write is untouched by the rejected one.
    let loaded = store.get(&created.id).await.unwrap().unwrap();
    assert_eq!(loaded.data.get("seat"), Some(&b"1".to_vec()));
    assert_eq!(loaded.version, 1);
}

#[tokio::test]
async fn test_put_for_unknown_id_starts_a_new_session() {
    let store = store_with_timeout(Duration::from_secs(30));

    let fresh = crate::session::SessionRecord::new(Duration::from_secs(30));
    let id = fresh.id.clone();
    let stored = store.put(fresh).await.unwrap();
    assert_eq!(stored.version, 1);
    assert!(store.get(&id).await.unwrap().is_some());
}

#[tokio::test]
async fn test_delete_and_size() {
    let store = store_with_timeout(Duration::from_secs(30));
    let a = store.create().await.unwrap();
    let _b = store.create().await.unwrap();
    assert_eq!(store.size().await.unwrap(), 2);

    assert!(store.delete(&a.id).await.unwrap());
    assert!(!store.delete(&a.id).await.unwrap(), "second delete is a no-op");
    assert_eq!(store.size().await.unwrap(), 1);
    assert!(store.get(&a.id).await.unwrap().is_none());
}

#[tokio::test]
async fn test_clear_drops_everything() {
    let store = store_with_timeout(Duration::from_secs(30));
    store.create().await.unwrap();
    store.create().await.unwrap();

    store.clear().await.unwrap();
    assert_eq!(store.size().await.unwrap(), 0);
}

#[tokio::test]
async fn test_expired_shadow_hides_live_payload() {
    let handle = BackendHandle::new(LocalBackend::new());
    let store = SessionStore::new(handle.clone(), Duration::from_millis(100));

    let created = store.create().await.unwrap();

    // Past the shadow's timeout but inside the payload's doubled TTL: the
    // payload entry still physically exists, yet the session reads as gone.
    tokio::time::sleep(Duration::from_millis(150)).await;

    let payload = handle
        .map(SESSION_MAP, None)
        .get(&created.id)
        .await
        .unwrap();
    assert!(payload.is_some(), "payload not yet reaped");
    assert!(store.get(&created.id).await.unwrap().is_none());
}

#[tokio::test]
async fn test_session_fully_expires() {
    let store = store_with_timeout(Duration::from_millis(80));
    let created = store.create().await.unwrap();
    assert!(store.get(&created.id).await.unwrap().is_some());

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(store.get(&created.id).await.unwrap().is_none());
    assert_eq!(store.size().await.unwrap(), 0);
}

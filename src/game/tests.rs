//! Game Consumer Tests

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::coordination::local::LocalBackend;
use crate::coordination::BackendHandle;
use crate::expiry::ExpiryBridge;
use crate::game::{watch_session_expiry, GameEventSink, GameRepository, GameRepositoryError};
use crate::session::SessionStore;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
struct TestGame {
    name: String,
    players: Vec<String>,
}

fn repository(lifetime: Duration) -> (GameRepository<TestGame>, watch::Sender<Duration>) {
    let handle = BackendHandle::new(LocalBackend::new());
    let (tx, rx) = watch::channel(lifetime);
    (GameRepository::new(handle, rx), tx)
}

#[tokio::test]
async fn test_game_crud() {
    let (repo, _lifetime) = repository(Duration::from_secs(60));
    let game = TestGame {
        name: "skirmish".to_string(),
        players: vec!["alice".to_string()],
    };

    assert!(!repo.game_exists("g1").await.unwrap());
    repo.create_game("g1", &game).await.unwrap();
    assert!(repo.game_exists("g1").await.unwrap());
    assert_eq!(repo.load_game("g1").await.unwrap(), Some(game.clone()));

    let mut updated = game.clone();
    updated.players.push("bob".to_string());
    repo.update_game("g1", &updated).await.unwrap();
    assert_eq!(repo.load_game("g1").await.unwrap(), Some(updated));

    assert!(repo.delete_game("g1").await.unwrap());
    assert!(!repo.delete_game("g1").await.unwrap());
    assert_eq!(repo.load_game("g1").await.unwrap(), None);
}

#[tokio::test]
async fn test_create_refuses_duplicate_id() {
    let (repo, _lifetime) = repository(Duration::from_secs(60));
    let game = TestGame {
        name: "original".to_string(),
        players: vec![],
    };
    repo.create_game("g1", &game).await.unwrap();

    let intruder = TestGame {
        name: "intruder".to_string(),
        players: vec![],
    };
    let error = repo.create_game("g1", &intruder).await.unwrap_err();
    assert!(matches!(error, GameRepositoryError::AlreadyExists { .. }));

    // Original untouched.
    assert_eq!(
        repo.load_game("g1").await.unwrap().unwrap().name,
        "original"
    );
}

#[tokio::test]
async fn test_update_requires_existing_game() {
    let (repo, _lifetime) = repository(Duration::from_secs(60));
    let game = TestGame {
        name: "ghost".to_string(),
        players: vec![],
    };
    let error = repo.update_game("nope", &game).await.unwrap_err();
    assert!(matches!(error, GameRepositoryError::NotFound { .. }));
}

#[tokio::test]
async fn test_lifetime_reload_applies_to_new_writes() {
    let (repo, lifetime) = repository(Duration::from_millis(80));
    let game = TestGame {
        name: "fleeting".to_string(),
        players: vec![],
    };
    repo.create_game("short", &game).await.unwrap();

    // Raise the lifetime; only games written afterwards get it.
    lifetime.send(Duration::from_secs(60)).unwrap();
    repo.create_game("long", &game).await.unwrap();

    tokio::time::sleep(Duration::from_millis(250)).await;
    assert!(!repo.game_exists("short").await.unwrap());
    assert!(repo.game_exists("long").await.unwrap());
}

struct RecordingSink {
    expired: Mutex<Vec<String>>,
}

#[async_trait]
impl GameEventSink for RecordingSink {
    async fn session_expired(&self, session_id: &str) -> anyhow::Result<()> {
        self.expired
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(session_id.to_string());
        Ok(())
    }
}

#[tokio::test]
async fn test_session_expiry_reaches_game_domain() {
    let handle = BackendHandle::new(LocalBackend::new());
    let bridge = ExpiryBridge::new(handle.clone());
    let sessions = SessionStore::new(handle.clone(), Duration::from_millis(80));

    let sink = Arc::new(RecordingSink {
        expired: Mutex::new(Vec::new()),
    });
    let watcher = watch_session_expiry(&bridge, sink.clone());

    let session = sessions.create().await.unwrap();

    // Wait past the shadow timeout and the doubled payload TTL so both
    // entries have expired; only the shadow may reach the sink.
    tokio::time::sleep(Duration::from_millis(400)).await;

    let expired = sink
        .expired
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
        .clone();
    assert_eq!(expired, vec![session.id.clone()], "one shadow expiry, no payload echo");

    watcher.abort();
}

#[tokio::test]
async fn test_unrelated_map_expiry_is_ignored() {
    let handle = BackendHandle::new(LocalBackend::new());
    let bridge = ExpiryBridge::new(handle.clone());

    let sink = Arc::new(RecordingSink {
        expired: Mutex::new(Vec::new()),
    });
    let watcher = watch_session_expiry(&bridge, sink.clone());

    let map = handle.map("games", None);
    map.put(
        "g1",
        b"x".to_vec(),
        crate::coordination::types::Ttl::After(Duration::from_millis(60)),
    )
    .await
    .unwrap();

    tokio::time::sleep(Duration::from_millis(250)).await;
    assert!(sink
        .expired
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
        .is_empty());

    watcher.abort();
}

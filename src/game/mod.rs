//! Game-Facing Consumers
//!
//! The narrow surfaces the game domain uses to reach the coordination
//! layer: a repository storing encoded games in one shared map under one
//! named lock, and the glue translating session-expiry events into domain
//! calls. Game rules themselves live outside this crate; everything here
//! treats games as opaque serializable values.

#[cfg(test)]
mod tests;

use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::coordination::error::CoordinationError;
use crate::coordination::types::Ttl;
use crate::coordination::{with_lock, BackendHandle};
use crate::expiry::ExpiryBridge;
use crate::session::SHADOW_MAP;

/// Map holding encoded games.
pub const GAME_MAP: &str = "games";
/// Single lock serializing every game read-modify-write.
pub const GAME_LOCK: &str = "games";

#[derive(Debug, thiserror::Error)]
pub enum GameRepositoryError {
    #[error("game '{id}' already exists")]
    AlreadyExists { id: String },

    #[error("game '{id}' not found")]
    NotFound { id: String },

    #[error("game codec failure: {0}")]
    Codec(String),

    #[error(transparent)]
    Coordination(#[from] CoordinationError),
}

/// Shared-map-backed storage for games.
///
/// Every mutation runs under the repository's named lock; the game
/// lifetime doubles as the entry TTL and follows runtime configuration
/// changes through the watch channel.
pub struct GameRepository<G> {
    handle: Arc<BackendHandle>,
    lifetime: watch::Receiver<Duration>,
    _game: PhantomData<fn() -> G>,
}

impl<G> GameRepository<G>
where
    G: Serialize + DeserializeOwned + Send + Sync,
{
    pub fn new(handle: Arc<BackendHandle>, lifetime: watch::Receiver<Duration>) -> Self {
        Self {
            handle,
            lifetime,
            _game: PhantomData,
        }
    }

    fn ttl(&self) -> Ttl {
        let lifetime = *self.lifetime.borrow();
        if lifetime.is_zero() {
            Ttl::None
        } else {
            Ttl::After(lifetime)
        }
    }

    fn encode(game: &G) -> Result<Vec<u8>, GameRepositoryError> {
        bincode::serialize(game).map_err(|e| GameRepositoryError::Codec(e.to_string()))
    }

    fn decode(bytes: &[u8]) -> Result<G, GameRepositoryError> {
        bincode::deserialize(bytes).map_err(|e| GameRepositoryError::Codec(e.to_string()))
    }

    /// Stores a new game; an existing live game under the same id wins.
    pub async fn create_game(&self, id: &str, game: &G) -> Result<(), GameRepositoryError> {
        let encoded = Self::encode(game)?;
        let ttl = self.ttl();
        let lock = self.handle.lock(GAME_LOCK);
        let map = self.handle.map(GAME_MAP, None);
        let id_owned = id.to_string();
        with_lock(lock, || async move {
            match map.put_if_absent(&id_owned, encoded, ttl).await? {
                None => Ok(()),
                Some(_) => Err(GameRepositoryError::AlreadyExists { id: id_owned }),
            }
        })
        .await
    }

    pub async fn load_game(&self, id: &str) -> Result<Option<G>, GameRepositoryError> {
        match self.handle.map(GAME_MAP, None).get(id).await? {
            Some(bytes) => Ok(Some(Self::decode(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Replaces a stored game, refreshing its lifetime.
    pub async fn update_game(&self, id: &str, game: &G) -> Result<(), GameRepositoryError> {
        let encoded = Self::encode(game)?;
        let ttl = self.ttl();
        let lock = self.handle.lock(GAME_LOCK);
        let map = self.handle.map(GAME_MAP, None);
        let id_owned = id.to_string();
        with_lock(lock, || async move {
            if map.get(&id_owned).await?.is_none() {
                return Err(GameRepositoryError::NotFound { id: id_owned });
            }
            map.put(&id_owned, encoded, ttl).await?;
            Ok(())
        })
        .await
    }

    pub async fn delete_game(&self, id: &str) -> Result<bool, GameRepositoryError> {
        let lock = self.handle.lock(GAME_LOCK);
        let map = self.handle.map(GAME_MAP, None);
        let id_owned = id.to_string();
        with_lock(lock, || async move {
            Ok(map.remove(&id_owned).await?.is_some())
        })
        .await
    }

    pub async fn game_exists(&self, id: &str) -> Result<bool, GameRepositoryError> {
        Ok(self.handle.map(GAME_MAP, None).get(id).await?.is_some())
    }
}

/// Domain-side receiver for expired sessions.
#[async_trait]
pub trait GameEventSink: Send + Sync {
    /// Called once per expired session; must tolerate duplicates.
    async fn session_expired(&self, session_id: &str) -> anyhow::Result<()>;
}

/// Bridges session expirations into the game domain.
///
/// Subscribes to the expiry bridge, filters for shadow-marker expirations
/// (the payload entry expiring later is not a second logical expiry) and
/// forwards the session id to the sink. Sink failures are logged and do
/// not stop the watch.
pub fn watch_session_expiry(
    bridge: &ExpiryBridge,
    sink: Arc<dyn GameEventSink>,
) -> JoinHandle<()> {
    let mut subscription = bridge.subscribe();
    tokio::spawn(async move {
        while let Some(event) = subscription.recv().await {
            if event.map != SHADOW_MAP {
                continue;
            }
            tracing::debug!("session '{}' expired, notifying game domain", event.key);
            if let Err(e) = sink.session_expired(&event.key).await {
                tracing::warn!("session expiry handler failed for '{}': {}", event.key, e);
            }
        }
    })
}

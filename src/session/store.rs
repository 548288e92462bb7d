use std::sync::Arc;
use std::time::Duration;

use crate::coordination::types::Ttl;
use crate::coordination::{with_lock, BackendHandle, SharedMap};

use super::types::{SessionError, SessionRecord};
use super::{SESSION_MAP, SHADOW_MAP};

/// Payload entries outlive their shadow so a late read under a still-live
/// shadow never finds the payload already reaped.
const PAYLOAD_TTL_FACTOR: u32 = 2;

/// Versioned session storage on top of the active coordination backend.
///
/// Resolves its maps and locks through the [`BackendHandle`] on every call,
/// so a runtime backend swap takes effect without rebuilding the store.
pub struct SessionStore {
    handle: Arc<BackendHandle>,
    /// Idle timeout applied to sessions created through this store.
    default_timeout: Duration,
}

impl SessionStore {
    pub fn new(handle: Arc<BackendHandle>, default_timeout: Duration) -> Self {
        Self {
            handle,
            default_timeout,
        }
    }

    fn payload_map(&self) -> Arc<dyn SharedMap> {
        self.handle.map(SESSION_MAP, None)
    }

    fn shadow_map(&self) -> Arc<dyn SharedMap> {
        self.handle.map(SHADOW_MAP, None)
    }

    fn lock_name(id: &str) -> String {
        format!("session/{}", id)
    }

    fn ttls(record: &SessionRecord) -> (Ttl, Ttl) {
        match record.timeout() {
            Some(timeout) => (
                Ttl::After(timeout * PAYLOAD_TTL_FACTOR),
                Ttl::After(timeout),
            ),
            None => (Ttl::None, Ttl::None),
        }
    }

    /// Creates and stores a fresh session with the store's default timeout.
    pub async fn create(&self) -> Result<SessionRecord, SessionError> {
        let record = SessionRecord::new(self.default_timeout);
        self.store_record(&record).await?;
        Ok(record)
    }

    /// Loads a session. Absent payload and an independently expired shadow
    /// both read as "not found".
    pub async fn get(&self, id: &str) -> Result<Option<SessionRecord>, SessionError> {
        if self.shadow_map().get(id).await?.is_none() {
            return Ok(None);
        }
        match self.payload_map().get(id).await? {
            Some(bytes) => Ok(Some(SessionRecord::decode(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Stores a session under optimistic concurrency.
    ///
    /// The stored version must equal the caller's observed one; on success
    /// the returned record carries the incremented version and a refreshed
    /// last-accessed stamp. A put for an id with no stored session is
    /// accepted as version zero of a new session.
    pub async fn put(&self, session: SessionRecord) -> Result<SessionRecord, SessionError> {
        let lock = self.handle.lock(&Self::lock_name(&session.id));
        let store = self;
        with_lock(lock, || async move {
            if let Some(stored_bytes) = store.payload_map().get(&session.id).await? {
                let stored = SessionRecord::decode(&stored_bytes)?;
                if stored.version != session.version {
                    return Err(SessionError::VersionConflict {
                        id: session.id,
                        submitted: session.version,
                        stored: stored.version,
                    });
                }
            }
            let mut accepted = session;
            accepted.version += 1;
            accepted.last_accessed_ms = crate::coordination::types::now_ms();
            store.store_record(&accepted).await?;
            Ok(accepted)
        })
        .await
    }

    /// Removes a session entirely. A delete never emits an expiry event.
    pub async fn delete(&self, id: &str) -> Result<bool, SessionError> {
        let had_shadow = self.shadow_map().remove(id).await?.is_some();
        let had_payload = self.payload_map().remove(id).await?.is_some();
        Ok(had_shadow || had_payload)
    }

    /// Number of live (non-expired) sessions.
    pub async fn size(&self) -> Result<usize, SessionError> {
        Ok(self.shadow_map().keys().await?.len())
    }

    /// Drops every session.
    pub async fn clear(&self) -> Result<(), SessionError> {
        self.shadow_map().clear().await?;
        self.payload_map().clear().await?;
        Ok(())
    }

    async fn store_record(&self, record: &SessionRecord) -> Result<(), SessionError> {
        let (payload_ttl, shadow_ttl) = Self::ttls(record);
        self.payload_map()
            .put(&record.id, record.encode()?, payload_ttl)
            .await?;
        // The shadow carries the version so observers can tell which write
        // it belongs to.
        self.shadow_map()
            .put(&record.id, record.version.to_be_bytes().to_vec(), shadow_ttl)
            .await?;
        Ok(())
    }
}

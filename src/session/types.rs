use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::coordination::error::CoordinationError;
use crate::coordination::types::now_ms;

/// One replicated HTTP session.
///
/// `version` increments on every accepted write; a writer presenting a
/// version other than the stored one has lost an update race and is
/// rejected.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SessionRecord {
    pub id: String,
    /// Idle timeout in milliseconds; zero disables expiry.
    pub timeout_ms: u64,
    pub last_accessed_ms: u64,
    pub version: u64,
    /// Opaque session attributes; codecs live with the HTTP layer.
    pub data: HashMap<String, Vec<u8>>,
}

impl SessionRecord {
    pub fn new(timeout: Duration) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            timeout_ms: timeout.as_millis() as u64,
            last_accessed_ms: now_ms(),
            version: 0,
            data: HashMap::new(),
        }
    }

    pub fn timeout(&self) -> Option<Duration> {
        (self.timeout_ms > 0).then(|| Duration::from_millis(self.timeout_ms))
    }

    pub(crate) fn encode(&self) -> Result<Vec<u8>, SessionError> {
        bincode::serialize(self).map_err(|e| SessionError::Codec(e.to_string()))
    }

    pub(crate) fn decode(bytes: &[u8]) -> Result<Self, SessionError> {
        bincode::deserialize(bytes).map_err(|e| SessionError::Codec(e.to_string()))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// The caller's observed version lost an update race.
    #[error("version conflict on session '{id}': submitted {submitted}, stored {stored}")]
    VersionConflict {
        id: String,
        submitted: u64,
        stored: u64,
    },

    #[error("session codec failure: {0}")]
    Codec(String),

    #[error(transparent)]
    Coordination(#[from] CoordinationError),
}

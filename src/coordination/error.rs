//! Error taxonomy of the coordination layer.
//!
//! A bounded lock wait that runs out is *not* an error — it comes back as
//! `false` from `lock_with_ttl`. Transient backend failures surface as
//! `BackendUnavailable` with no internal retry; retrying is the caller's
//! responsibility.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoordinationError {
    /// Missing or invalid connection parameters. Fatal at startup.
    #[error("invalid configuration: {0}")]
    Configuration(String),

    /// Transient connectivity failure talking to a non-local backend.
    #[error("backend unavailable: {0}")]
    BackendUnavailable(String),

    /// `unlock` was called through a handle that does not hold the lock,
    /// or whose hold already self-released.
    #[error("lock '{name}' is not held by this handle")]
    NotLockHolder { name: String },

    /// A counter reached i64::MAX; the layer refuses to wrap.
    #[error("counter '{name}' exhausted")]
    CounterExhausted { name: String },

    /// A remote peer answered with something unparseable.
    #[error("malformed response from peer: {0}")]
    MalformedResponse(String),
}

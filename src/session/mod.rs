//! Session Replication Store
//!
//! Versioned HTTP-session storage built entirely on the shared map
//! contract. Each session is a two-key pair: the payload entry carries the
//! encoded record with a generous TTL, the shadow entry is a short-lived
//! marker whose own expiry makes the session logically expired before the
//! payload is physically reaped. Writes go through optimistic concurrency:
//! a put presenting a stale version is rejected, never merged.

pub mod store;
pub mod types;

#[cfg(test)]
mod tests;

pub use store::SessionStore;
pub use types::{SessionError, SessionRecord};

/// Map holding encoded session payloads.
pub const SESSION_MAP: &str = "sessions";
/// Map holding the short-lived shadow markers.
pub const SHADOW_MAP: &str = "session-shadows";

//! Shared Coordination Contracts
//!
//! One contract, three interchangeable backends. Every consumer of
//! cluster-shared state (lobby repository, session store, id counters) talks
//! to the traits in this module; which adapter sits behind them — in-process,
//! replicated cluster, or external store — is decided once at startup from
//! configuration and can be swapped at runtime through [`BackendHandle`].
//!
//! ## Core Pieces
//! - **`SharedMap`**: associative store with optional per-entry TTL, atomic
//!   put-if-absent and expiry listeners.
//! - **`SharedLock`**: named mutual exclusion, blocking or bounded-wait.
//! - **`SharedCounter`**: named 64-bit counter with get / CAS / increment.
//! - **`LocalBackend`**: the single-process adapter (in `local`).
//! - **`BackendHandle`**: the process-wide hot-swappable backend slot.

pub mod counter32;
pub mod error;
pub mod local;
pub mod locks;
pub mod types;


use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};

use error::CoordinationError;
use types::{EntryListener, ExpiredEntry, KeyFilter, ListenerId, Ttl};

/// Associative store shared across the process group.
///
/// Values are opaque bytes; codecs live with the callers. At most one live
/// entry exists per key, cluster-wide for the replicated backends.
#[async_trait]
pub trait SharedMap: Send + Sync {
    /// Returns the live value under `key`, if any. An entry whose deadline
    /// has passed is reported absent even if it has not been reaped yet.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CoordinationError>;

    /// Stores `value`, returning the previous live value. Any existing
    /// expiry timer for the key is cancelled before the new one is
    /// scheduled, so two timers never race for the same key.
    async fn put(&self, key: &str, value: Vec<u8>, ttl: Ttl)
        -> Result<Option<Vec<u8>>, CoordinationError>;

    /// Stores `value` only if no live entry exists. Returns the existing
    /// value otherwise. A timer is scheduled only when the insertion
    /// actually happened; an existing entry's timer is never rescheduled.
    async fn put_if_absent(
        &self,
        key: &str,
        value: Vec<u8>,
        ttl: Ttl,
    ) -> Result<Option<Vec<u8>>, CoordinationError>;

    /// Removes the entry, returning its value. Never emits an expiry event.
    async fn remove(&self, key: &str) -> Result<Option<Vec<u8>>, CoordinationError>;

    /// Removes the entry only if its value equals `expected`.
    async fn remove_if_equals(
        &self,
        key: &str,
        expected: &[u8],
    ) -> Result<bool, CoordinationError>;

    /// Drops every entry and every listener registration of this map.
    async fn clear(&self) -> Result<(), CoordinationError>;

    /// All live keys.
    async fn keys(&self) -> Result<Vec<String>, CoordinationError>;

    /// All live entries.
    async fn entries(&self) -> Result<Vec<(String, Vec<u8>)>, CoordinationError>;

    /// Registers a callback for expiry events on keys matching `filter`.
    fn add_listener(&self, filter: KeyFilter, listener: EntryListener) -> ListenerId;

    /// Removes a listener registration. Returns false if it was unknown.
    fn remove_listener(&self, id: ListenerId) -> bool;
}

/// Named mutual exclusion, cluster-wide for the replicated backends.
///
/// Locks are identified purely by name; distinct names never contend.
/// Reentrancy is not guaranteed by any backend — callers must not rely on
/// it. One handle represents one logical holder.
#[async_trait]
pub trait SharedLock: Send + Sync {
    /// Acquires the lock, suspending the caller indefinitely. The hold has
    /// no deadline and lasts until `unlock`.
    async fn lock(&self) -> Result<(), CoordinationError>;

    /// Bounded acquisition: waits at most `ttl`, returning `false` on
    /// timeout instead of raising. On success the hold self-releases once
    /// `ttl` elapses even if the holder never unlocks, so a crashed holder
    /// cannot deadlock the cluster.
    async fn lock_with_ttl(&self, ttl: Duration) -> Result<bool, CoordinationError>;

    /// Releases the lock held through this handle.
    async fn unlock(&self) -> Result<(), CoordinationError>;

    fn name(&self) -> &str;
}

/// Named 64-bit counter, correct under unbounded concurrent callers.
///
/// The counter never wraps on its own; bounded-range consumption goes
/// through a caller-side fold such as [`counter32::Counter32`].
#[async_trait]
pub trait SharedCounter: Send + Sync {
    async fn get(&self) -> Result<i64, CoordinationError>;

    /// Atomically replaces the value if it currently equals `expect`.
    async fn compare_and_set(&self, expect: i64, new: i64) -> Result<bool, CoordinationError>;

    /// Atomically increments, returning the pre-increment value.
    async fn get_and_increment(&self) -> Result<i64, CoordinationError>;
}

/// One coordination backend is active per process group.
///
/// All three adapters are behaviorally indistinguishable through this
/// surface; selection happens at construction time from configuration,
/// never through type hierarchies.
pub trait CoordinationBackend: Send + Sync {
    /// Returns the named map, creating it on first use. `default_ttl` is
    /// what [`Ttl::Default`] resolves to and is fixed at creation.
    fn map(&self, name: &str, default_ttl: Option<Duration>) -> Arc<dyn SharedMap>;

    /// Returns a fresh handle for the named lock.
    fn lock(&self, name: &str) -> Arc<dyn SharedLock>;

    /// Returns a handle for the named counter, created at zero.
    fn counter(&self, name: &str) -> Arc<dyn SharedCounter>;

    /// Opens the backend's native expiry channel, replacing any previously
    /// open one. Dropping the receiver closes the channel.
    fn open_expiry_channel(&self) -> mpsc::UnboundedReceiver<ExpiredEntry>;
}

/// Process-wide slot for the active backend.
///
/// Swapped atomically on a runtime configuration change; dependents (the
/// expiry bridge) learn about swaps through [`BackendHandle::swaps`] so they
/// can migrate without dropping events.
pub struct BackendHandle {
    current: RwLock<Arc<dyn CoordinationBackend>>,
    generation: AtomicU64,
    swap_tx: watch::Sender<u64>,
}

impl BackendHandle {
    pub fn new(backend: Arc<dyn CoordinationBackend>) -> Arc<Self> {
        let (swap_tx, _) = watch::channel(0);
        Arc::new(Self {
            current: RwLock::new(backend),
            generation: AtomicU64::new(0),
            swap_tx,
        })
    }

    /// The currently active backend.
    pub fn get(&self) -> Arc<dyn CoordinationBackend> {
        self.current
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Installs a new backend and notifies swap watchers.
    pub fn swap(&self, backend: Arc<dyn CoordinationBackend>) {
        {
            let mut current = self
                .current
                .write()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            *current = backend;
        }
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let _ = self.swap_tx.send(generation);
        tracing::info!("coordination backend swapped (generation {})", generation);
    }

    /// Watch channel carrying the swap generation.
    pub fn swaps(&self) -> watch::Receiver<u64> {
        self.swap_tx.subscribe()
    }

    pub fn map(&self, name: &str, default_ttl: Option<Duration>) -> Arc<dyn SharedMap> {
        self.get().map(name, default_ttl)
    }

    pub fn lock(&self, name: &str) -> Arc<dyn SharedLock> {
        self.get().lock(name)
    }

    pub fn counter(&self, name: &str) -> Arc<dyn SharedCounter> {
        self.get().counter(name)
    }
}

/// Runs `op` with the named lock held.
///
/// The lock is released on every exit path of `op`, including failures. A
/// release failure is logged rather than masking `op`'s own result.
pub async fn with_lock<T, E, F, Fut>(lock: Arc<dyn SharedLock>, op: F) -> Result<T, E>
where
    E: From<CoordinationError>,
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    lock.lock().await.map_err(E::from)?;
    let result = op().await;
    if let Err(e) = lock.unlock().await {
        tracing::warn!("failed to release lock '{}': {}", lock.name(), e);
    }
    result
}

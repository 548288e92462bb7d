//! Named-Lock Engine
//!
//! The single mutual-exclusion engine behind both the in-process backend
//! and the owner side of the replicated backend: each named lock is a slot
//! holding at most one holder token, waiters park on a `Notify` and race
//! for the slot when it frees.
//!
//! A hold taken with a lease self-releases at its deadline. Waiters learn
//! about that through a per-acquisition expiry task; an acquirer that
//! arrives later simply steals the slot after checking the deadline.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::Notify;

use super::types::now_ms;

#[derive(Debug, Clone)]
struct Holder {
    token: String,
    /// Distinguishes successive holds by the same token, so a stale lease
    /// task cannot release a newer hold.
    seq: u64,
    deadline_ms: Option<u64>,
}

impl Holder {
    fn expired(&self, now: u64) -> bool {
        matches!(self.deadline_ms, Some(deadline) if now >= deadline)
    }
}

struct LockSlot {
    state: Mutex<Option<Holder>>,
    freed: Notify,
}

/// Table of named lock slots. Distinct names never interact.
pub struct LockTable {
    slots: DashMap<String, Arc<LockSlot>>,
    next_seq: AtomicU64,
}

impl LockTable {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            slots: DashMap::new(),
            next_seq: AtomicU64::new(1),
        })
    }

    fn slot(&self, name: &str) -> Arc<LockSlot> {
        self.slots
            .entry(name.to_string())
            .or_insert_with(|| {
                Arc::new(LockSlot {
                    state: Mutex::new(None),
                    freed: Notify::new(),
                })
            })
            .clone()
    }

    /// Attempts to acquire the named lock for `holder`.
    ///
    /// `wait` bounds the acquisition attempt (`None` blocks indefinitely);
    /// `lease` bounds the hold itself. Returns whether the lock was taken.
    pub async fn acquire(
        &self,
        name: &str,
        holder: &str,
        wait: Option<Duration>,
        lease: Option<Duration>,
    ) -> bool {
        let slot = self.slot(name);
        let deadline = wait.map(|w| tokio::time::Instant::now() + w);

        loop {
            let notified = slot.freed.notified();
            tokio::pin!(notified);
            // Register as a waiter before inspecting the slot, otherwise a
            // release between the check and the await is lost.
            notified.as_mut().enable();

            if let Some(seq) = self.try_take(&slot, holder, lease) {
                if let Some(lease) = lease {
                    Self::spawn_lease_expiry(slot.clone(), holder.to_string(), seq, lease);
                }
                return true;
            }

            match deadline {
                None => notified.await,
                Some(deadline) => {
                    if tokio::time::timeout_at(deadline, notified).await.is_err() {
                        return false;
                    }
                }
            }
        }
    }

    /// Releases the named lock if `holder` owns it.
    pub fn release(&self, name: &str, holder: &str) -> bool {
        let slot = self.slot(name);
        let released = {
            let mut state = slot
                .state
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            match state.as_ref() {
                Some(current) if current.token == holder => {
                    *state = None;
                    true
                }
                _ => false,
            }
        };
        if released {
            slot.freed.notify_waiters();
        }
        released
    }

    /// Whether the named lock is currently held (expired leases count as
    /// free).
    pub fn is_held(&self, name: &str) -> bool {
        let slot = self.slot(name);
        let state = slot
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        matches!(state.as_ref(), Some(holder) if !holder.expired(now_ms()))
    }

    fn try_take(&self, slot: &LockSlot, holder: &str, lease: Option<Duration>) -> Option<u64> {
        let mut state = slot
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        match state.as_ref() {
            Some(current) if !current.expired(now_ms()) => None,
            _ => {
                let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
                *state = Some(Holder {
                    token: holder.to_string(),
                    seq,
                    deadline_ms: lease.map(|l| now_ms() + l.as_millis() as u64),
                });
                Some(seq)
            }
        }
    }

    fn spawn_lease_expiry(slot: Arc<LockSlot>, token: String, seq: u64, lease: Duration) {
        tokio::spawn(async move {
            tokio::time::sleep(lease).await;
            let released = {
                let mut state = slot
                    .state
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner());
                match state.as_ref() {
                    Some(current) if current.token == token && current.seq == seq => {
                        tracing::debug!("lock lease expired, force-releasing");
                        *state = None;
                        true
                    }
                    _ => false,
                }
            };
            if released {
                slot.freed.notify_waiters();
            }
        });
    }
}

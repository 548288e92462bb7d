//! In-Process Backend
//!
//! The single-process adapter for the coordination contracts. Every mutating
//! map call is serialized by one map-wide mutex, so "cancel old timer,
//! install new value, schedule new timer" is effectively atomic. Expiry
//! timers are spawned tasks carrying a generation token; a fired timer whose
//! captured generation is stale no-ops, which makes cancel/reschedule
//! race-free even if an abort arrives late.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, Weak};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::{mpsc, Mutex};
use tokio::task::AbortHandle;

use super::error::CoordinationError;
use super::locks::LockTable;
use super::types::{now_ms, EntryListener, ExpiredEntry, ExpiryOutlet, KeyFilter, ListenerId, Ttl};
use super::{CoordinationBackend, SharedCounter, SharedLock, SharedMap};

struct StoredEntry {
    value: Vec<u8>,
    deadline_ms: Option<u64>,
    generation: u64,
    timer: Option<AbortHandle>,
}

impl StoredEntry {
    fn live(&self, now: u64) -> bool {
        !matches!(self.deadline_ms, Some(deadline) if now >= deadline)
    }

    fn cancel_timer(&self) {
        if let Some(timer) = &self.timer {
            timer.abort();
        }
    }
}

struct MapState {
    entries: HashMap<String, StoredEntry>,
    next_generation: u64,
}

/// One logical map of the in-process backend.
pub struct LocalSharedMap {
    name: String,
    default_ttl: Option<Duration>,
    /// Serializes every mutation; never held across an await.
    state: Mutex<MapState>,
    listeners: StdMutex<HashMap<u64, (KeyFilter, EntryListener)>>,
    next_listener: AtomicU64,
    outlet: ExpiryOutlet,
    weak_self: Weak<LocalSharedMap>,
}

impl LocalSharedMap {
    pub fn new(name: &str, default_ttl: Option<Duration>, outlet: ExpiryOutlet) -> Arc<Self> {
        Arc::new_cyclic(|weak_self| Self {
            name: name.to_string(),
            default_ttl,
            state: Mutex::new(MapState {
                entries: HashMap::new(),
                next_generation: 1,
            }),
            listeners: StdMutex::new(HashMap::new()),
            next_listener: AtomicU64::new(1),
            outlet,
            weak_self: weak_self.clone(),
        })
    }

    fn spawn_timer(&self, key: &str, generation: u64, deadline_ms: u64) -> AbortHandle {
        let weak = self.weak_self.clone();
        let key = key.to_string();
        tokio::spawn(async move {
            let now = now_ms();
            if deadline_ms > now {
                tokio::time::sleep(Duration::from_millis(deadline_ms - now)).await;
            }
            if let Some(map) = weak.upgrade() {
                map.fire_expiry(&key, generation).await;
            }
        })
        .abort_handle()
    }

    async fn fire_expiry(&self, key: &str, generation: u64) {
        let expired = {
            let mut state = self.state.lock().await;
            match state.entries.get(key) {
                Some(entry) if entry.generation == generation && !entry.live(now_ms()) => {
                    state.entries.remove(key)
                }
                _ => None,
            }
        };

        if let Some(entry) = expired {
            tracing::debug!("entry '{}' expired in map '{}'", key, self.name);
            let event = ExpiredEntry {
                map: self.name.clone(),
                key: key.to_string(),
                last_value: entry.value,
            };
            self.dispatch(&event);
            self.outlet.send(event);
        }
    }

    /// Invokes matching listeners, isolating each failure.
    fn dispatch(&self, event: &ExpiredEntry) {
        let matching: Vec<EntryListener> = {
            let listeners = self
                .listeners
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            listeners
                .values()
                .filter(|(filter, _)| filter.matches(&event.key))
                .map(|(_, listener)| listener.clone())
                .collect()
        };
        for listener in matching {
            if let Err(e) = listener(event) {
                tracing::warn!("expiry listener failed for key '{}': {}", event.key, e);
            }
        }
    }

    fn install(
        &self,
        state: &mut MapState,
        key: &str,
        value: Vec<u8>,
        ttl: Ttl,
    ) -> Option<Vec<u8>> {
        let deadline_ms = ttl
            .resolve(self.default_ttl)
            .map(|d| now_ms() + d.as_millis() as u64);
        let generation = state.next_generation;
        state.next_generation += 1;

        // Old timer dies before the new value lands.
        if let Some(previous) = state.entries.get(key) {
            previous.cancel_timer();
        }

        let timer = deadline_ms.map(|deadline| self.spawn_timer(key, generation, deadline));
        let old = state.entries.insert(
            key.to_string(),
            StoredEntry {
                value,
                deadline_ms,
                generation,
                timer,
            },
        );

        old.filter(|e| e.live(now_ms())).map(|e| e.value)
    }
}

#[async_trait]
impl SharedMap for LocalSharedMap {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CoordinationError> {
        let state = self.state.lock().await;
        Ok(state
            .entries
            .get(key)
            .filter(|e| e.live(now_ms()))
            .map(|e| e.value.clone()))
    }

    async fn put(
        &self,
        key: &str,
        value: Vec<u8>,
        ttl: Ttl,
    ) -> Result<Option<Vec<u8>>, CoordinationError> {
        let mut state = self.state.lock().await;
        Ok(self.install(&mut state, key, value, ttl))
    }

    async fn put_if_absent(
        &self,
        key: &str,
        value: Vec<u8>,
        ttl: Ttl,
    ) -> Result<Option<Vec<u8>>, CoordinationError> {
        let mut state = self.state.lock().await;
        if let Some(existing) = state.entries.get(key) {
            if existing.live(now_ms()) {
                return Ok(Some(existing.value.clone()));
            }
        }
        self.install(&mut state, key, value, ttl);
        Ok(None)
    }

    async fn remove(&self, key: &str) -> Result<Option<Vec<u8>>, CoordinationError> {
        let mut state = self.state.lock().await;
        match state.entries.remove(key) {
            Some(entry) => {
                entry.cancel_timer();
                let live = entry.live(now_ms());
                Ok(if live { Some(entry.value) } else { None })
            }
            None => Ok(None),
        }
    }

    async fn remove_if_equals(
        &self,
        key: &str,
        expected: &[u8],
    ) -> Result<bool, CoordinationError> {
        let mut state = self.state.lock().await;
        let matches = matches!(
            state.entries.get(key),
            Some(entry) if entry.live(now_ms()) && entry.value == expected
        );
        if matches {
            if let Some(entry) = state.entries.remove(key) {
                entry.cancel_timer();
            }
        }
        Ok(matches)
    }

    async fn clear(&self) -> Result<(), CoordinationError> {
        let mut state = self.state.lock().await;
        for entry in state.entries.values() {
            entry.cancel_timer();
        }
        state.entries.clear();
        self.listeners
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clear();
        Ok(())
    }

    async fn keys(&self) -> Result<Vec<String>, CoordinationError> {
        let state = self.state.lock().await;
        let now = now_ms();
        Ok(state
            .entries
            .iter()
            .filter(|(_, e)| e.live(now))
            .map(|(k, _)| k.clone())
            .collect())
    }

    async fn entries(&self) -> Result<Vec<(String, Vec<u8>)>, CoordinationError> {
        let state = self.state.lock().await;
        let now = now_ms();
        Ok(state
            .entries
            .iter()
            .filter(|(_, e)| e.live(now))
            .map(|(k, e)| (k.clone(), e.value.clone()))
            .collect())
    }

    fn add_listener(&self, filter: KeyFilter, listener: EntryListener) -> ListenerId {
        let id = self.next_listener.fetch_add(1, Ordering::Relaxed);
        self.listeners
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(id, (filter, listener));
        ListenerId(id)
    }

    fn remove_listener(&self, id: ListenerId) -> bool {
        self.listeners
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(&id.0)
            .is_some()
    }
}

/// Named lock handle of the in-process backend.
pub struct LocalLock {
    name: String,
    table: Arc<LockTable>,
    held: Mutex<Option<String>>,
}

#[async_trait]
impl SharedLock for LocalLock {
    async fn lock(&self) -> Result<(), CoordinationError> {
        let token = uuid::Uuid::new_v4().to_string();
        self.table.acquire(&self.name, &token, None, None).await;
        *self.held.lock().await = Some(token);
        Ok(())
    }

    async fn lock_with_ttl(&self, ttl: Duration) -> Result<bool, CoordinationError> {
        let token = uuid::Uuid::new_v4().to_string();
        if self
            .table
            .acquire(&self.name, &token, Some(ttl), Some(ttl))
            .await
        {
            *self.held.lock().await = Some(token);
            return Ok(true);
        }
        Ok(false)
    }

    async fn unlock(&self) -> Result<(), CoordinationError> {
        let token = self.held.lock().await.take();
        match token {
            Some(token) if self.table.release(&self.name, &token) => Ok(()),
            _ => Err(CoordinationError::NotLockHolder {
                name: self.name.clone(),
            }),
        }
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Named counter handle of the in-process backend.
pub struct LocalCounter {
    name: String,
    values: Arc<DashMap<String, i64>>,
}

#[async_trait]
impl SharedCounter for LocalCounter {
    async fn get(&self) -> Result<i64, CoordinationError> {
        Ok(*self.values.entry(self.name.clone()).or_insert(0))
    }

    async fn compare_and_set(&self, expect: i64, new: i64) -> Result<bool, CoordinationError> {
        let mut value = self.values.entry(self.name.clone()).or_insert(0);
        if *value == expect {
            *value = new;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    async fn get_and_increment(&self) -> Result<i64, CoordinationError> {
        let mut value = self.values.entry(self.name.clone()).or_insert(0);
        let previous = *value;
        *value = previous
            .checked_add(1)
            .ok_or_else(|| CoordinationError::CounterExhausted {
                name: self.name.clone(),
            })?;
        Ok(previous)
    }
}

/// The in-process coordination backend.
pub struct LocalBackend {
    maps: DashMap<String, Arc<LocalSharedMap>>,
    locks: Arc<LockTable>,
    counters: Arc<DashMap<String, i64>>,
    outlet: ExpiryOutlet,
}

impl LocalBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            maps: DashMap::new(),
            locks: LockTable::new(),
            counters: Arc::new(DashMap::new()),
            outlet: ExpiryOutlet::new(),
        })
    }
}

impl CoordinationBackend for LocalBackend {
    fn map(&self, name: &str, default_ttl: Option<Duration>) -> Arc<dyn SharedMap> {
        self.maps
            .entry(name.to_string())
            .or_insert_with(|| LocalSharedMap::new(name, default_ttl, self.outlet.clone()))
            .clone()
    }

    fn lock(&self, name: &str) -> Arc<dyn SharedLock> {
        Arc::new(LocalLock {
            name: name.to_string(),
            table: self.locks.clone(),
            held: Mutex::new(None),
        })
    }

    fn counter(&self, name: &str) -> Arc<dyn SharedCounter> {
        Arc::new(LocalCounter {
            name: name.to_string(),
            values: self.counters.clone(),
        })
    }

    fn open_expiry_channel(&self) -> mpsc::UnboundedReceiver<ExpiredEntry> {
        self.outlet.open()
    }
}

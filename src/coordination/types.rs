use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::mpsc;

/// Time-to-live for a map entry.
///
/// Wire encoding is a signed millisecond count: negative selects the map's
/// configured default, zero disables expiry, positive is an explicit
/// duration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ttl {
    /// Use the map's configured default.
    Default,
    /// Never expire.
    None,
    /// Expire after the given duration.
    After(Duration),
}

impl Ttl {
    pub fn from_millis(ms: i64) -> Self {
        if ms < 0 {
            Ttl::Default
        } else if ms == 0 {
            Ttl::None
        } else {
            Ttl::After(Duration::from_millis(ms as u64))
        }
    }

    pub fn as_millis(&self) -> i64 {
        match self {
            Ttl::Default => -1,
            Ttl::None => 0,
            Ttl::After(d) => (d.as_millis() as i64).max(1),
        }
    }

    /// Resolves against a map's default into a concrete duration, `None`
    /// meaning the entry never expires.
    pub fn resolve(self, default_ttl: Option<Duration>) -> Option<Duration> {
        match self {
            Ttl::Default => default_ttl,
            Ttl::None => None,
            Ttl::After(d) => Some(d),
        }
    }
}

/// Emitted exactly once per expired entry, after the entry was deleted.
///
/// Delivery across the cluster is at-least-once; handlers must be
/// idempotent.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExpiredEntry {
    /// Name of the map the entry lived in.
    pub map: String,
    pub key: String,
    /// The value the entry held when it expired.
    pub last_value: Vec<u8>,
}

/// Handle for a listener registration, returned by `add_listener`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(pub u64);

/// Key predicate for listener registrations.
#[derive(Debug, Clone)]
pub enum KeyFilter {
    All,
    Exact(String),
    Prefix(String),
}

impl KeyFilter {
    pub fn matches(&self, key: &str) -> bool {
        match self {
            KeyFilter::All => true,
            KeyFilter::Exact(k) => k == key,
            KeyFilter::Prefix(p) => key.starts_with(p.as_str()),
        }
    }
}

/// Callback invoked for every expired entry matching a listener's filter.
///
/// A failing callback is logged and never prevents delivery to the
/// remaining listeners.
pub type EntryListener = Arc<dyn Fn(&ExpiredEntry) -> anyhow::Result<()> + Send + Sync>;

/// Slot holding the process's native expiry channel sender.
///
/// Opening the channel replaces any previous sender, which is how "open the
/// new channel before closing the old one" works during a backend swap. A
/// dropped receiver makes the next send fail, which clears the slot.
#[derive(Clone, Default)]
pub struct ExpiryOutlet {
    tx: Arc<Mutex<Option<mpsc::UnboundedSender<ExpiredEntry>>>>,
}

impl ExpiryOutlet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn open(&self) -> mpsc::UnboundedReceiver<ExpiredEntry> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut slot = self.tx.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        *slot = Some(tx);
        rx
    }

    pub fn send(&self, event: ExpiredEntry) {
        let mut slot = self.tx.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(tx) = slot.as_ref() {
            if tx.send(event).is_err() {
                *slot = None;
            }
        }
    }
}

/// Per-map listener registrations for backends whose expiry events arrive
/// over the network rather than from an in-process timer.
pub struct ListenerRegistry {
    sets: dashmap::DashMap<String, std::collections::HashMap<u64, (KeyFilter, EntryListener)>>,
    next_id: std::sync::atomic::AtomicU64,
}

impl ListenerRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            sets: dashmap::DashMap::new(),
            next_id: std::sync::atomic::AtomicU64::new(1),
        })
    }

    pub fn add(&self, map: &str, filter: KeyFilter, listener: EntryListener) -> ListenerId {
        let id = self
            .next_id
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        self.sets
            .entry(map.to_string())
            .or_default()
            .insert(id, (filter, listener));
        ListenerId(id)
    }

    pub fn remove(&self, map: &str, id: ListenerId) -> bool {
        match self.sets.get_mut(map) {
            Some(mut set) => set.remove(&id.0).is_some(),
            None => false,
        }
    }

    /// Drops every registration of the map (map-wide clear).
    pub fn clear_map(&self, map: &str) {
        self.sets.remove(map);
    }

    /// Invokes matching listeners, isolating each failure.
    pub fn dispatch(&self, event: &ExpiredEntry) {
        let matching: Vec<EntryListener> = match self.sets.get(&event.map) {
            Some(set) => set
                .values()
                .filter(|(filter, _)| filter.matches(&event.key))
                .map(|(_, listener)| listener.clone())
                .collect(),
            None => return,
        };
        for listener in matching {
            if let Err(e) = listener(event) {
                tracing::warn!("expiry listener failed for key '{}': {}", event.key, e);
            }
        }
    }
}

/// Current system time in milliseconds.
pub fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

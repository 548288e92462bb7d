//! Expiry Notification Bridge
//!
//! One process-wide fan-out point between a backend's native expiry channel
//! and any number of independent subscribers. The backend channel is opened
//! once: the first subscriber opens it, the last one leaving closes it.
//!
//! The bridge watches [`BackendHandle`] swap notifications; on a swap it
//! opens the new backend's channel before stopping the old pump, so an
//! event fired during the transition lands on at least one of the two
//! channels. Delivery is at-least-once; subscribers are expected to be
//! idempotent.

#[cfg(test)]
mod tests;

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::coordination::types::ExpiredEntry;
use crate::coordination::BackendHandle;

struct BridgeInner {
    subscribers: HashMap<u64, mpsc::UnboundedSender<ExpiredEntry>>,
    next_id: u64,
    pump: Option<JoinHandle<()>>,
}

/// Multiplexes the active backend's expiry events to N subscribers.
pub struct ExpiryBridge {
    handle: Arc<BackendHandle>,
    inner: Mutex<BridgeInner>,
    weak_self: Weak<ExpiryBridge>,
}

impl ExpiryBridge {
    pub fn new(handle: Arc<BackendHandle>) -> Arc<Self> {
        let mut swaps = handle.swaps();
        let bridge = Arc::new_cyclic(|weak_self| Self {
            handle,
            inner: Mutex::new(BridgeInner {
                subscribers: HashMap::new(),
                next_id: 1,
                pump: None,
            }),
            weak_self: weak_self.clone(),
        });

        // Follow backend swaps for as long as the bridge lives.
        let weak = Arc::downgrade(&bridge);
        tokio::spawn(async move {
            while swaps.changed().await.is_ok() {
                let Some(bridge) = weak.upgrade() else {
                    break;
                };
                bridge.rewire();
            }
        });

        bridge
    }

    /// Registers a subscriber. The first registration opens the backend's
    /// native channel.
    pub fn subscribe(&self) -> ExpirySubscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = self
            .inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let id = inner.next_id;
        inner.next_id += 1;
        inner.subscribers.insert(id, tx);

        if inner.pump.is_none() {
            inner.pump = Some(self.spawn_pump());
        }

        ExpirySubscription {
            id,
            rx,
            bridge: self.weak_self.clone(),
        }
    }

    fn unsubscribe(&self, id: u64) {
        let mut inner = self
            .inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        inner.subscribers.remove(&id);
        if inner.subscribers.is_empty() {
            if let Some(pump) = inner.pump.take() {
                tracing::debug!("last expiry subscriber left, closing backend channel");
                pump.abort();
            }
        }
    }

    /// Moves the pump to the currently active backend. The new channel is
    /// live before the old pump stops.
    fn rewire(&self) {
        let mut inner = self
            .inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if inner.pump.is_none() {
            // No subscribers, nothing to migrate.
            return;
        }
        tracing::info!("migrating expiry bridge to swapped backend");
        let new_pump = self.spawn_pump();
        if let Some(old_pump) = inner.pump.replace(new_pump) {
            old_pump.abort();
        }
    }

    fn spawn_pump(&self) -> JoinHandle<()> {
        let mut rx = self.handle.get().open_expiry_channel();
        let weak = self.weak_self.clone();
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                let Some(bridge) = weak.upgrade() else {
                    break;
                };
                bridge.fanout(event);
            }
        })
    }

    fn fanout(&self, event: ExpiredEntry) {
        let mut inner = self
            .inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        // A closed receiver drops out of the set here rather than failing
        // delivery to the others.
        inner
            .subscribers
            .retain(|_, tx| tx.send(event.clone()).is_ok());
    }

    #[cfg(test)]
    fn is_pumping(&self) -> bool {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .pump
            .is_some()
    }
}

/// One subscriber's view of the expiry stream. Dropping it unsubscribes.
pub struct ExpirySubscription {
    id: u64,
    rx: mpsc::UnboundedReceiver<ExpiredEntry>,
    bridge: Weak<ExpiryBridge>,
}

impl ExpirySubscription {
    pub async fn recv(&mut self) -> Option<ExpiredEntry> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<ExpiredEntry> {
        self.rx.try_recv().ok()
    }
}

impl Drop for ExpirySubscription {
    fn drop(&mut self) {
        if let Some(bridge) = self.bridge.upgrade() {
            bridge.unsubscribe(self.id);
        }
    }
}

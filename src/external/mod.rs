//! External Store Backend
//!
//! Thin client adapter over a standalone coordination store reached via
//! HTTP. Maps, locks and counters live entirely inside the store; this
//! backend only translates the trait calls into wire requests and surfaces
//! transport failures as `BackendUnavailable` without retrying — retry
//! policy belongs to the caller.
//!
//! Expiry events are pulled through a cursor-based long poll, so the
//! process observes expirations the store performed even while it was
//! briefly disconnected.

pub mod protocol;

#[cfg(test)]
mod tests;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};

use crate::coordination::error::CoordinationError;
use crate::coordination::types::{
    EntryListener, ExpiredEntry, ExpiryOutlet, KeyFilter, ListenerId, ListenerRegistry, Ttl,
};
use crate::coordination::{CoordinationBackend, SharedCounter, SharedLock, SharedMap};
use self::protocol::*;

/// Request deadline for one-shot store calls.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);
/// How long the store may hold one expiry poll open.
const POLL_WAIT: Duration = Duration::from_secs(25);
/// Backoff between failed polls.
const POLL_RETRY_DELAY: Duration = Duration::from_secs(1);
/// Per-attempt chunk for blocking lock acquisition at the store.
const LOCK_WAIT_CHUNK: Duration = Duration::from_secs(1);

/// Connection settings for the external store.
#[derive(Debug, Clone)]
pub struct ExternalStoreConfig {
    /// Base URL of the store, e.g. `http://coordinator:7400`.
    pub address: String,
    pub auth_token: Option<String>,
    /// Idle connections kept per host.
    pub pool_size: usize,
}

/// Client adapter for the standalone coordination store.
pub struct ExternalStoreBackend {
    config: ExternalStoreConfig,
    http: reqwest::Client,
    listeners: Arc<ListenerRegistry>,
    outlet: ExpiryOutlet,
    poll_cursor: AtomicU64,
    weak_self: Weak<ExternalStoreBackend>,
}

impl ExternalStoreBackend {
    pub fn new(config: ExternalStoreConfig) -> Result<Arc<Self>, CoordinationError> {
        let http = reqwest::Client::builder()
            .pool_max_idle_per_host(config.pool_size)
            .build()
            .map_err(|e| CoordinationError::Configuration(e.to_string()))?;

        Ok(Arc::new_cyclic(|weak_self| Self {
            config,
            http,
            listeners: ListenerRegistry::new(),
            outlet: ExpiryOutlet::new(),
            poll_cursor: AtomicU64::new(0),
            weak_self: weak_self.clone(),
        }))
    }

    /// Spawns the expiry long-poll pump. The pump stops once the backend
    /// is dropped.
    pub fn start(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            loop {
                let Some(backend) = weak.upgrade() else {
                    break;
                };
                if let Err(e) = backend.poll_expiry_once().await {
                    tracing::warn!("expiry poll against external store failed: {}", e);
                    tokio::time::sleep(POLL_RETRY_DELAY).await;
                }
            }
        });
    }

    /// Confirms the store answers before the backend goes live.
    pub async fn check_connection(&self) -> Result<(), CoordinationError> {
        let request = StoreCounterRequest {
            name: "health".to_string(),
            command: StoreCounterCommand::Get,
        };
        self.post::<_, StoreCounterResponse>(ENDPOINT_COUNTER_APPLY, &request, REQUEST_TIMEOUT)
            .await?;
        Ok(())
    }

    async fn poll_expiry_once(&self) -> Result<(), CoordinationError> {
        let request = ExpiryPollRequest {
            cursor: self.poll_cursor.load(Ordering::SeqCst),
            wait_ms: POLL_WAIT.as_millis() as u64,
        };
        let response: ExpiryPollResponse = self
            .post(ENDPOINT_EXPIRY_POLL, &request, POLL_WAIT + REQUEST_TIMEOUT)
            .await?;
        self.poll_cursor.store(response.next_cursor, Ordering::SeqCst);
        for event in response.events {
            self.listeners.dispatch(&event);
            self.outlet.send(event);
        }
        Ok(())
    }

    async fn post<T, R>(
        &self,
        endpoint: &str,
        payload: &T,
        timeout: Duration,
    ) -> Result<R, CoordinationError>
    where
        T: serde::Serialize,
        R: serde::de::DeserializeOwned,
    {
        let url = format!("{}{}", self.config.address, endpoint);
        let mut request = self.http.post(&url).json(payload).timeout(timeout);
        if let Some(token) = &self.config.auth_token {
            request = request.bearer_auth(token);
        }
        let response = request
            .send()
            .await
            .map_err(|e| CoordinationError::BackendUnavailable(e.to_string()))?;
        if !response.status().is_success() {
            return Err(CoordinationError::BackendUnavailable(format!(
                "store answered {} for {}",
                response.status(),
                endpoint
            )));
        }
        response
            .json::<R>()
            .await
            .map_err(|e| CoordinationError::MalformedResponse(e.to_string()))
    }
}

impl CoordinationBackend for ExternalStoreBackend {
    fn map(&self, name: &str, default_ttl: Option<Duration>) -> Arc<dyn SharedMap> {
        Arc::new(ExternalMap {
            name: name.to_string(),
            default_ttl,
            backend: self.weak_self.clone(),
            listeners: self.listeners.clone(),
        })
    }

    fn lock(&self, name: &str) -> Arc<dyn SharedLock> {
        Arc::new(ExternalLock {
            name: name.to_string(),
            backend: self.weak_self.clone(),
            held: Mutex::new(None),
        })
    }

    fn counter(&self, name: &str) -> Arc<dyn SharedCounter> {
        Arc::new(ExternalCounter {
            name: name.to_string(),
            backend: self.weak_self.clone(),
        })
    }

    fn open_expiry_channel(&self) -> mpsc::UnboundedReceiver<ExpiredEntry> {
        self.outlet.open()
    }
}

fn live_backend(
    weak: &Weak<ExternalStoreBackend>,
) -> Result<Arc<ExternalStoreBackend>, CoordinationError> {
    weak.upgrade()
        .ok_or_else(|| CoordinationError::BackendUnavailable("backend shut down".into()))
}

/// Map handle backed by the external store.
pub struct ExternalMap {
    name: String,
    default_ttl: Option<Duration>,
    backend: Weak<ExternalStoreBackend>,
    listeners: Arc<ListenerRegistry>,
}

impl ExternalMap {
    fn wire_ttl(&self, ttl: Ttl) -> u64 {
        ttl.resolve(self.default_ttl)
            .map(|d| (d.as_millis() as u64).max(1))
            .unwrap_or(0)
    }

    async fn apply(&self, key: &str, command: StoreMapCommand) -> Result<StoreMapResponse, CoordinationError> {
        let request = StoreMapRequest {
            map: self.name.clone(),
            key: key.to_string(),
            command,
        };
        live_backend(&self.backend)?
            .post(ENDPOINT_MAP_APPLY, &request, REQUEST_TIMEOUT)
            .await
    }
}

#[async_trait]
impl SharedMap for ExternalMap {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CoordinationError> {
        let request = StoreGetRequest {
            map: self.name.clone(),
            key: key.to_string(),
        };
        let response: StoreGetResponse = live_backend(&self.backend)?
            .post(ENDPOINT_MAP_GET, &request, REQUEST_TIMEOUT)
            .await?;
        Ok(response.value)
    }

    async fn put(
        &self,
        key: &str,
        value: Vec<u8>,
        ttl: Ttl,
    ) -> Result<Option<Vec<u8>>, CoordinationError> {
        let response = self
            .apply(
                key,
                StoreMapCommand::Put {
                    value,
                    ttl_ms: self.wire_ttl(ttl),
                },
            )
            .await?;
        Ok(response.previous)
    }

    async fn put_if_absent(
        &self,
        key: &str,
        value: Vec<u8>,
        ttl: Ttl,
    ) -> Result<Option<Vec<u8>>, CoordinationError> {
        let response = self
            .apply(
                key,
                StoreMapCommand::PutIfAbsent {
                    value,
                    ttl_ms: self.wire_ttl(ttl),
                },
            )
            .await?;
        Ok(if response.applied {
            None
        } else {
            response.previous
        })
    }

    async fn remove(&self, key: &str) -> Result<Option<Vec<u8>>, CoordinationError> {
        let response = self.apply(key, StoreMapCommand::Remove).await?;
        Ok(response.previous)
    }

    async fn remove_if_equals(
        &self,
        key: &str,
        expected: &[u8],
    ) -> Result<bool, CoordinationError> {
        let response = self
            .apply(
                key,
                StoreMapCommand::RemoveIfEquals {
                    expected: expected.to_vec(),
                },
            )
            .await?;
        Ok(response.applied)
    }

    async fn clear(&self) -> Result<(), CoordinationError> {
        let request = StoreClearRequest {
            map: self.name.clone(),
        };
        let _: StoreAck = live_backend(&self.backend)?
            .post(ENDPOINT_MAP_CLEAR, &request, REQUEST_TIMEOUT)
            .await?;
        self.listeners.clear_map(&self.name);
        Ok(())
    }

    async fn keys(&self) -> Result<Vec<String>, CoordinationError> {
        Ok(self
            .entries()
            .await?
            .into_iter()
            .map(|(key, _)| key)
            .collect())
    }

    async fn entries(&self) -> Result<Vec<(String, Vec<u8>)>, CoordinationError> {
        let request = StoreScanRequest {
            map: self.name.clone(),
        };
        let response: StoreScanResponse = live_backend(&self.backend)?
            .post(ENDPOINT_MAP_SCAN, &request, REQUEST_TIMEOUT)
            .await?;
        Ok(response.entries)
    }

    fn add_listener(&self, filter: KeyFilter, listener: EntryListener) -> ListenerId {
        self.listeners.add(&self.name, filter, listener)
    }

    fn remove_listener(&self, id: ListenerId) -> bool {
        self.listeners.remove(&self.name, id)
    }
}

/// Lock handle backed by the external store.
pub struct ExternalLock {
    name: String,
    backend: Weak<ExternalStoreBackend>,
    held: Mutex<Option<String>>,
}

impl ExternalLock {
    async fn acquire_once(
        &self,
        holder: &str,
        wait: Duration,
        lease: Option<Duration>,
    ) -> Result<bool, CoordinationError> {
        let request = StoreLockAcquireRequest {
            name: self.name.clone(),
            holder: holder.to_string(),
            wait_ms: wait.as_millis() as u64,
            lease_ms: lease.map(|l| l.as_millis() as u64),
        };
        let response: StoreLockAcquireResponse = live_backend(&self.backend)?
            .post(ENDPOINT_LOCK_ACQUIRE, &request, wait + REQUEST_TIMEOUT)
            .await?;
        Ok(response.acquired)
    }
}

#[async_trait]
impl SharedLock for ExternalLock {
    async fn lock(&self) -> Result<(), CoordinationError> {
        let token = uuid::Uuid::new_v4().to_string();
        loop {
            if self.acquire_once(&token, LOCK_WAIT_CHUNK, None).await? {
                *self.held.lock().await = Some(token);
                return Ok(());
            }
        }
    }

    async fn lock_with_ttl(&self, ttl: Duration) -> Result<bool, CoordinationError> {
        let token = uuid::Uuid::new_v4().to_string();
        let deadline = tokio::time::Instant::now() + ttl;
        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                return Ok(false);
            }
            if self
                .acquire_once(&token, remaining.min(LOCK_WAIT_CHUNK), Some(ttl))
                .await?
            {
                *self.held.lock().await = Some(token);
                return Ok(true);
            }
        }
    }

    async fn unlock(&self) -> Result<(), CoordinationError> {
        let token = self.held.lock().await.take();
        let Some(token) = token else {
            return Err(CoordinationError::NotLockHolder {
                name: self.name.clone(),
            });
        };
        let request = StoreLockReleaseRequest {
            name: self.name.clone(),
            holder: token,
        };
        let response: StoreLockReleaseResponse = live_backend(&self.backend)?
            .post(ENDPOINT_LOCK_RELEASE, &request, REQUEST_TIMEOUT)
            .await?;
        if response.released {
            Ok(())
        } else {
            Err(CoordinationError::NotLockHolder {
                name: self.name.clone(),
            })
        }
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Counter handle backed by the external store.
pub struct ExternalCounter {
    name: String,
    backend: Weak<ExternalStoreBackend>,
}

impl ExternalCounter {
    async fn apply(&self, command: StoreCounterCommand) -> Result<StoreCounterResponse, CoordinationError> {
        let request = StoreCounterRequest {
            name: self.name.clone(),
            command,
        };
        live_backend(&self.backend)?
            .post(ENDPOINT_COUNTER_APPLY, &request, REQUEST_TIMEOUT)
            .await
    }
}

#[async_trait]
impl SharedCounter for ExternalCounter {
    async fn get(&self) -> Result<i64, CoordinationError> {
        Ok(self.apply(StoreCounterCommand::Get).await?.value)
    }

    async fn compare_and_set(&self, expect: i64, new: i64) -> Result<bool, CoordinationError> {
        Ok(self
            .apply(StoreCounterCommand::CompareAndSet { expect, new })
            .await?
            .applied)
    }

    async fn get_and_increment(&self) -> Result<i64, CoordinationError> {
        Ok(self.apply(StoreCounterCommand::GetAndIncrement).await?.value)
    }
}

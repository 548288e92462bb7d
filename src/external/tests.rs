//! External Backend Tests
//!
//! The store is stubbed with a real axum server backed by the in-process
//! engine: maps by `LocalBackend`, locks by `LockTable`, the expiry feed
//! by an event log behind the long-poll endpoint. The adapter is then
//! exercised end to end over loopback HTTP, bearer auth included.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use axum::extract::{Request, State};
use axum::http::{header, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use tokio::sync::Notify;

use crate::coordination::local::LocalBackend;
use crate::coordination::locks::LockTable;
use crate::coordination::types::{ExpiredEntry, KeyFilter, Ttl};
use crate::coordination::CoordinationBackend;
use crate::external::protocol::*;
use crate::external::{ExternalStoreBackend, ExternalStoreConfig};

struct StubStore {
    backend: Arc<LocalBackend>,
    locks: Arc<LockTable>,
    events: StdMutex<Vec<ExpiredEntry>>,
    event_added: Notify,
    token: Option<String>,
}

async fn require_auth(
    State(store): State<Arc<StubStore>>,
    request: Request,
    next: Next,
) -> Response {
    let authorized = match &store.token {
        None => true,
        Some(token) => request
            .headers()
            .get(header::AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .map(|value| value == format!("Bearer {}", token))
            .unwrap_or(false),
    };
    if authorized {
        next.run(request).await
    } else {
        StatusCode::UNAUTHORIZED.into_response()
    }
}

fn stub_ttl(ttl_ms: u64) -> Ttl {
    Ttl::from_millis(ttl_ms as i64)
}

async fn map_apply(
    State(store): State<Arc<StubStore>>,
    Json(request): Json<StoreMapRequest>,
) -> Json<StoreMapResponse> {
    let map = store.backend.map(&request.map, None);
    let response = match request.command {
        StoreMapCommand::Put { value, ttl_ms } => StoreMapResponse {
            previous: map.put(&request.key, value, stub_ttl(ttl_ms)).await.unwrap(),
            applied: true,
        },
        StoreMapCommand::PutIfAbsent { value, ttl_ms } => {
            let existing = map
                .put_if_absent(&request.key, value, stub_ttl(ttl_ms))
                .await
                .unwrap();
            StoreMapResponse {
                applied: existing.is_none(),
                previous: existing,
            }
        }
        StoreMapCommand::Remove => {
            let previous = map.remove(&request.key).await.unwrap();
            StoreMapResponse {
                applied: previous.is_some(),
                previous,
            }
        }
        StoreMapCommand::RemoveIfEquals { expected } => StoreMapResponse {
            previous: None,
            applied: map.remove_if_equals(&request.key, &expected).await.unwrap(),
        },
    };
    Json(response)
}

async fn map_get(
    State(store): State<Arc<StubStore>>,
    Json(request): Json<StoreGetRequest>,
) -> Json<StoreGetResponse> {
    let map = store.backend.map(&request.map, None);
    Json(StoreGetResponse {
        value: map.get(&request.key).await.unwrap(),
    })
}

async fn map_scan(
    State(store): State<Arc<StubStore>>,
    Json(request): Json<StoreScanRequest>,
) -> Json<StoreScanResponse> {
    let map = store.backend.map(&request.map, None);
    Json(StoreScanResponse {
        entries: map.entries().await.unwrap(),
    })
}

async fn map_clear(
    State(store): State<Arc<StubStore>>,
    Json(request): Json<StoreClearRequest>,
) -> Json<StoreAck> {
    let map = store.backend.map(&request.map, None);
    map.clear().await.unwrap();
    Json(StoreAck { success: true })
}

async fn lock_acquire(
    State(store): State<Arc<StubStore>>,
    Json(request): Json<StoreLockAcquireRequest>,
) -> Json<StoreLockAcquireResponse> {
    let wait = Duration::from_millis(request.wait_ms.min(5_000));
    let lease = request.lease_ms.map(Duration::from_millis);
    let acquired = store
        .locks
        .acquire(&request.name, &request.holder, Some(wait), lease)
        .await;
    Json(StoreLockAcquireResponse { acquired })
}

async fn lock_release(
    State(store): State<Arc<StubStore>>,
    Json(request): Json<StoreLockReleaseRequest>,
) -> Json<StoreLockReleaseResponse> {
    Json(StoreLockReleaseResponse {
        released: store.locks.release(&request.name, &request.holder),
    })
}

async fn counter_apply(
    State(store): State<Arc<StubStore>>,
    Json(request): Json<StoreCounterRequest>,
) -> Json<StoreCounterResponse> {
    let counter = store.backend.counter(&request.name);
    let response = match request.command {
        StoreCounterCommand::Get => StoreCounterResponse {
            value: counter.get().await.unwrap(),
            applied: true,
        },
        StoreCounterCommand::CompareAndSet { expect, new } => StoreCounterResponse {
            value: expect,
            applied: counter.compare_and_set(expect, new).await.unwrap(),
        },
        StoreCounterCommand::GetAndIncrement => StoreCounterResponse {
            value: counter.get_and_increment().await.unwrap(),
            applied: true,
        },
    };
    Json(response)
}

async fn expiry_poll(
    State(store): State<Arc<StubStore>>,
    Json(request): Json<ExpiryPollRequest>,
) -> Json<ExpiryPollResponse> {
    let deadline =
        tokio::time::Instant::now() + Duration::from_millis(request.wait_ms.min(30_000));
    loop {
        {
            let events = store
                .events
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            if (events.len() as u64) > request.cursor {
                return Json(ExpiryPollResponse {
                    next_cursor: events.len() as u64,
                    events: events[request.cursor as usize..].to_vec(),
                });
            }
        }
        let notified = store.event_added.notified();
        if tokio::time::timeout_at(deadline, notified).await.is_err() {
            return Json(ExpiryPollResponse {
                next_cursor: request.cursor,
                events: vec![],
            });
        }
    }
}

/// Boots the stub store on an ephemeral port, returning its base URL.
async fn spawn_stub(token: Option<String>) -> String {
    let backend = LocalBackend::new();
    let mut expiry_rx = backend.open_expiry_channel();

    let store = Arc::new(StubStore {
        backend,
        locks: LockTable::new(),
        events: StdMutex::new(Vec::new()),
        event_added: Notify::new(),
        token,
    });

    // Pump native expirations into the pollable event log.
    let pump_store = store.clone();
    tokio::spawn(async move {
        while let Some(event) = expiry_rx.recv().await {
            pump_store
                .events
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .push(event);
            pump_store.event_added.notify_waiters();
        }
    });

    let router = Router::new()
        .route(ENDPOINT_MAP_APPLY, post(map_apply))
        .route(ENDPOINT_MAP_GET, post(map_get))
        .route(ENDPOINT_MAP_SCAN, post(map_scan))
        .route(ENDPOINT_MAP_CLEAR, post(map_clear))
        .route(ENDPOINT_LOCK_ACQUIRE, post(lock_acquire))
        .route(ENDPOINT_LOCK_RELEASE, post(lock_release))
        .route(ENDPOINT_COUNTER_APPLY, post(counter_apply))
        .route(ENDPOINT_EXPIRY_POLL, post(expiry_poll))
        .layer(axum::middleware::from_fn_with_state(
            store.clone(),
            require_auth,
        ))
        .with_state(store);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    format!("http://{}", addr)
}

fn connect(address: String, auth_token: Option<String>) -> Arc<ExternalStoreBackend> {
    let backend = ExternalStoreBackend::new(ExternalStoreConfig {
        address,
        auth_token,
        pool_size: 4,
    })
    .unwrap();
    backend.start();
    backend
}

#[tokio::test]
async fn test_map_operations_through_store() {
    let address = spawn_stub(None).await;
    let backend = connect(address, None);
    let map = backend.map("lobby", None);

    assert_eq!(map.get("a").await.unwrap(), None);
    assert_eq!(map.put("a", b"1".to_vec(), Ttl::None).await.unwrap(), None);
    assert_eq!(
        map.put("a", b"2".to_vec(), Ttl::None).await.unwrap(),
        Some(b"1".to_vec())
    );

    assert_eq!(
        map.put_if_absent("a", b"3".to_vec(), Ttl::None).await.unwrap(),
        Some(b"2".to_vec())
    );
    assert_eq!(
        map.put_if_absent("b", b"3".to_vec(), Ttl::None).await.unwrap(),
        None
    );

    let mut keys = map.keys().await.unwrap();
    keys.sort();
    assert_eq!(keys, vec!["a".to_string(), "b".to_string()]);

    assert!(!map.remove_if_equals("a", b"wrong").await.unwrap());
    assert!(map.remove_if_equals("a", b"2").await.unwrap());
    assert_eq!(map.remove("b").await.unwrap(), Some(b"3".to_vec()));

    map.clear().await.unwrap();
    assert!(map.entries().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_expiry_events_arrive_through_long_poll() {
    let address = spawn_stub(None).await;
    let backend = connect(address, None);
    let mut expiry_rx = backend.open_expiry_channel();
    let map = backend.map("presence", None);

    let fired = Arc::new(AtomicUsize::new(0));
    let fired_clone = fired.clone();
    map.add_listener(
        KeyFilter::Exact("ghost".to_string()),
        Arc::new(move |event: &ExpiredEntry| {
            assert_eq!(event.last_value, b"boo".to_vec());
            fired_clone.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }),
    );

    map.put("ghost", b"boo".to_vec(), Ttl::After(Duration::from_millis(100)))
        .await
        .unwrap();

    let event = tokio::time::timeout(Duration::from_secs(5), expiry_rx.recv())
        .await
        .expect("event within the poll window")
        .expect("channel open");
    assert_eq!(event.map, "presence");
    assert_eq!(event.key, "ghost");
    assert_eq!(fired.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_lock_excludes_other_client() {
    let address = spawn_stub(None).await;
    let backend_a = connect(address.clone(), None);
    let backend_b = connect(address, None);

    let lock_a = backend_a.lock("arena");
    let lock_b = backend_b.lock("arena");

    lock_a.lock().await.unwrap();
    assert!(!lock_b
        .lock_with_ttl(Duration::from_millis(150))
        .await
        .unwrap());
    lock_a.unlock().await.unwrap();
    assert!(lock_b
        .lock_with_ttl(Duration::from_millis(1500))
        .await
        .unwrap());
    lock_b.unlock().await.unwrap();
}

#[tokio::test]
async fn test_counter_through_store() {
    let address = spawn_stub(None).await;
    let backend = connect(address, None);
    let counter = backend.counter("tickets");

    assert_eq!(counter.get().await.unwrap(), 0);
    assert_eq!(counter.get_and_increment().await.unwrap(), 0);
    assert_eq!(counter.get_and_increment().await.unwrap(), 1);
    assert!(counter.compare_and_set(2, 10).await.unwrap());
    assert_eq!(counter.get().await.unwrap(), 10);
}

#[tokio::test]
async fn test_bearer_auth_enforced() {
    let address = spawn_stub(Some("sekrit".to_string())).await;

    let wrong = connect(address.clone(), Some("wrong".to_string()));
    let map = wrong.map("lobby", None);
    let error = map.get("a").await.unwrap_err();
    assert!(matches!(
        error,
        crate::coordination::error::CoordinationError::BackendUnavailable(_)
    ));

    let right = connect(address, Some("sekrit".to_string()));
    let map = right.map("lobby", None);
    assert_eq!(map.get("a").await.unwrap(), None);
}

#[tokio::test]
async fn test_unreachable_store_reports_unavailable() {
    // Nothing listens on this port.
    let backend = connect("http://127.0.0.1:1".to_string(), None);
    let map = backend.map("lobby", None);
    let error = map.get("a").await.unwrap_err();
    assert!(matches!(
        error,
        crate::coordination::error::CoordinationError::BackendUnavailable(_)
    ));

    assert!(backend.check_connection().await.is_err());
}

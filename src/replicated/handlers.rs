//! Internal HTTP API of the replicated backend.
//!
//! Every route is node-to-node traffic; nothing here is a public surface.
//! Handlers stay thin and delegate straight into `ReplicatedBackend`.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};

use super::protocol::*;
use super::ReplicatedBackend;
use crate::coordination::error::CoordinationError;

pub fn router(backend: Arc<ReplicatedBackend>) -> Router {
    Router::new()
        .route(ENDPOINT_KV_APPLY, post(kv_apply))
        .route(ENDPOINT_KV_GET, post(kv_get))
        .route(ENDPOINT_KV_SCAN, post(kv_scan))
        .route(ENDPOINT_KV_REPLICATE, post(kv_replicate))
        .route(ENDPOINT_KV_CLEAR, post(kv_clear))
        .route(
            &format!("{}/:partition", ENDPOINT_KV_PARTITION_DUMP),
            get(kv_partition_dump),
        )
        .route(ENDPOINT_LOCK_ACQUIRE, post(lock_acquire))
        .route(ENDPOINT_LOCK_RELEASE, post(lock_release))
        .route(ENDPOINT_COUNTER_APPLY, post(counter_apply))
        .route(ENDPOINT_COUNTER_REPLICATE, post(counter_replicate))
        .route(ENDPOINT_EXPIRY_BROADCAST, post(expiry_broadcast))
        .with_state(backend)
}

fn error_status(error: &CoordinationError) -> StatusCode {
    match error {
        CoordinationError::BackendUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        CoordinationError::CounterExhausted { .. } => StatusCode::CONFLICT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

async fn kv_apply(
    State(backend): State<Arc<ReplicatedBackend>>,
    Json(request): Json<MapApplyRequest>,
) -> impl IntoResponse {
    // A re-delivered forward must not mutate twice.
    if !backend.should_process_op(&request.op_id) {
        return (
            StatusCode::OK,
            Json(MapApplyResponse {
                previous: None,
                applied: false,
            }),
        );
    }
    let partition = backend.partition_for_map_key(&request.map, &request.key);
    let response = backend
        .apply_as_primary(partition, &request.map, &request.key, request.command)
        .await;
    (StatusCode::OK, Json(response))
}

async fn kv_get(
    State(backend): State<Arc<ReplicatedBackend>>,
    Json(request): Json<GetEntryRequest>,
) -> impl IntoResponse {
    let value = backend.get_entry_local(&request.map, &request.key);
    Json(GetEntryResponse { value })
}

async fn kv_scan(
    State(backend): State<Arc<ReplicatedBackend>>,
    Json(request): Json<ScanRequest>,
) -> impl IntoResponse {
    Json(ScanResponse {
        entries: backend.scan_map_local(&request.map),
    })
}

async fn kv_replicate(
    State(backend): State<Arc<ReplicatedBackend>>,
    Json(request): Json<ReplicateEntryRequest>,
) -> impl IntoResponse {
    backend.store_replica(request);
    Json(Acknowledge { success: true })
}

async fn kv_clear(
    State(backend): State<Arc<ReplicatedBackend>>,
    Json(request): Json<ClearRequest>,
) -> impl IntoResponse {
    backend.clear_map_local(&request.map, &request.op_id);
    Json(Acknowledge { success: true })
}

async fn kv_partition_dump(
    State(backend): State<Arc<ReplicatedBackend>>,
    Path(partition): Path<u32>,
) -> impl IntoResponse {
    Json(PartitionDumpResponse {
        partition,
        entries: backend.dump_partition(partition),
    })
}

async fn lock_acquire(
    State(backend): State<Arc<ReplicatedBackend>>,
    Json(request): Json<LockAcquireRequest>,
) -> impl IntoResponse {
    Json(backend.lock_acquire_local(request).await)
}

async fn lock_release(
    State(backend): State<Arc<ReplicatedBackend>>,
    Json(request): Json<LockReleaseRequest>,
) -> impl IntoResponse {
    let released = backend.lock_release_local(&request.name, &request.holder);
    Json(LockReleaseResponse { released })
}

async fn counter_apply(
    State(backend): State<Arc<ReplicatedBackend>>,
    Json(request): Json<CounterApplyRequest>,
) -> impl IntoResponse {
    match backend.counter_apply_forwarded(&request.name, request.command).await {
        Ok(response) => (StatusCode::OK, Json(response)).into_response(),
        Err(e) => (error_status(&e), e.to_string()).into_response(),
    }
}

async fn counter_replicate(
    State(backend): State<Arc<ReplicatedBackend>>,
    Json(request): Json<CounterReplicateRequest>,
) -> impl IntoResponse {
    backend.store_counter_replica(request);
    Json(Acknowledge { success: true })
}

async fn expiry_broadcast(
    State(backend): State<Arc<ReplicatedBackend>>,
    Json(request): Json<ExpiryBroadcastRequest>,
) -> impl IntoResponse {
    backend.receive_expiry(request);
    Json(Acknowledge { success: true })
}

//! External Store Wire Protocol
//!
//! Endpoints and DTOs of the standalone coordination store's HTTP API.
//! The store is a separate deployment; this module only describes the
//! client side of its contract. All traffic is JSON, authenticated with a
//! bearer token when the store requires one.

use serde::{Deserialize, Serialize};

use crate::coordination::types::ExpiredEntry;

// --- API Endpoints ---

pub const ENDPOINT_MAP_APPLY: &str = "/store/map/apply";
pub const ENDPOINT_MAP_GET: &str = "/store/map/get";
pub const ENDPOINT_MAP_SCAN: &str = "/store/map/scan";
pub const ENDPOINT_MAP_CLEAR: &str = "/store/map/clear";
pub const ENDPOINT_LOCK_ACQUIRE: &str = "/store/lock/acquire";
pub const ENDPOINT_LOCK_RELEASE: &str = "/store/lock/release";
pub const ENDPOINT_COUNTER_APPLY: &str = "/store/counter/apply";
/// Long-poll feed of expiry events, resumed by cursor.
pub const ENDPOINT_EXPIRY_POLL: &str = "/store/expiry/poll";

// --- Data Transfer Objects ---

/// One mutating map operation. The client resolves the handle's default
/// TTL before sending; `ttl_ms` of zero means the entry never expires.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum StoreMapCommand {
    Put { value: Vec<u8>, ttl_ms: u64 },
    PutIfAbsent { value: Vec<u8>, ttl_ms: u64 },
    Remove,
    RemoveIfEquals { expected: Vec<u8> },
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StoreMapRequest {
    pub map: String,
    pub key: String,
    pub command: StoreMapCommand,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StoreMapResponse {
    pub previous: Option<Vec<u8>>,
    pub applied: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StoreGetRequest {
    pub map: String,
    pub key: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StoreGetResponse {
    pub value: Option<Vec<u8>>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StoreScanRequest {
    pub map: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StoreScanResponse {
    pub entries: Vec<(String, Vec<u8>)>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StoreClearRequest {
    pub map: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StoreLockAcquireRequest {
    pub name: String,
    /// Caller-generated holder token; release must present the same one.
    pub holder: String,
    pub wait_ms: u64,
    pub lease_ms: Option<u64>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StoreLockAcquireResponse {
    pub acquired: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StoreLockReleaseRequest {
    pub name: String,
    pub holder: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StoreLockReleaseResponse {
    pub released: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum StoreCounterCommand {
    Get,
    CompareAndSet { expect: i64, new: i64 },
    GetAndIncrement,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StoreCounterRequest {
    pub name: String,
    pub command: StoreCounterCommand,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StoreCounterResponse {
    pub value: i64,
    pub applied: bool,
}

/// Cursor-based long poll: the store holds the request open up to
/// `wait_ms` when no event past `cursor` exists yet.
#[derive(Debug, Serialize, Deserialize)]
pub struct ExpiryPollRequest {
    pub cursor: u64,
    pub wait_ms: u64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ExpiryPollResponse {
    /// Cursor to resume from; covers every returned event.
    pub next_cursor: u64,
    pub events: Vec<ExpiredEntry>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StoreAck {
    pub success: bool,
}

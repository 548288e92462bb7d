//! Replicated Backend Network Protocol
//!
//! Endpoints and DTOs for internode coordination traffic: forwarding
//! mutations to the primary owner, pushing replicas to backups, lock and
//! counter routing, and cluster-wide expiry broadcasts. Everything is JSON
//! over HTTP between the nodes' internal routers.

use serde::{Deserialize, Serialize};

use crate::coordination::types::ExpiredEntry;

// --- API Endpoints ---

/// Applies a mutating map command at the primary owner.
pub const ENDPOINT_KV_APPLY: &str = "/internal/kv/apply";
/// Direct read of a node's local store (bypasses routing).
pub const ENDPOINT_KV_GET: &str = "/internal/kv/get";
/// Entries of one map in partitions the answering node owns as primary.
pub const ENDPOINT_KV_SCAN: &str = "/internal/kv/scan";
/// Pushes entry state (or a deletion) from a primary to a backup.
pub const ENDPOINT_KV_REPLICATE: &str = "/internal/kv/replicate";
/// Bulk transfer of a whole partition (anti-entropy / rejoin).
pub const ENDPOINT_KV_PARTITION_DUMP: &str = "/internal/kv/partition";
/// Map-wide clear, broadcast to every node.
pub const ENDPOINT_KV_CLEAR: &str = "/internal/kv/clear";
/// Named-lock acquisition at the lock's primary owner.
pub const ENDPOINT_LOCK_ACQUIRE: &str = "/internal/lock/acquire";
pub const ENDPOINT_LOCK_RELEASE: &str = "/internal/lock/release";
/// Counter command at the counter's primary owner.
pub const ENDPOINT_COUNTER_APPLY: &str = "/internal/counter/apply";
/// Counter state push to a backup.
pub const ENDPOINT_COUNTER_REPLICATE: &str = "/internal/counter/replicate";
/// Expiry event fan-out to every node.
pub const ENDPOINT_EXPIRY_BROADCAST: &str = "/internal/expiry";

// --- Data Transfer Objects ---

/// One mutating map operation. TTLs are pre-resolved by the calling map
/// handle (zero = never expire), since only that handle knows its default.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum MapCommand {
    Put { value: Vec<u8>, ttl_ms: u64 },
    PutIfAbsent { value: Vec<u8>, ttl_ms: u64 },
    Remove,
    RemoveIfEquals { expected: Vec<u8> },
}

#[derive(Debug, Serialize, Deserialize)]
pub struct MapApplyRequest {
    /// Unique operation id for idempotency across hops.
    pub op_id: String,
    pub map: String,
    pub key: String,
    pub command: MapCommand,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct MapApplyResponse {
    /// Previous live value, where the command reports one.
    pub previous: Option<Vec<u8>>,
    /// Whether a conditional command took effect.
    pub applied: bool,
}

/// Replicated state of one entry; deadline included so backups can answer
/// reads with correct liveness.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReplicaEntry {
    pub value: Vec<u8>,
    pub deadline_ms: Option<u64>,
}

/// Pushed from a primary to a backup after a local write. `entry: None`
/// replicates a deletion.
#[derive(Debug, Serialize, Deserialize)]
pub struct ReplicateEntryRequest {
    pub op_id: String,
    pub partition: u32,
    pub map: String,
    pub key: String,
    pub entry: Option<ReplicaEntry>,
}

/// Body-carried read request; keys may contain path separators, so reads
/// never put the key in the URL.
#[derive(Debug, Serialize, Deserialize)]
pub struct GetEntryRequest {
    pub map: String,
    pub key: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct GetEntryResponse {
    pub value: Option<Vec<u8>>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ScanRequest {
    pub map: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ScanResponse {
    pub entries: Vec<(String, Vec<u8>)>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DumpEntry {
    pub map: String,
    pub key: String,
    pub entry: ReplicaEntry,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PartitionDumpResponse {
    pub partition: u32,
    pub entries: Vec<DumpEntry>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ClearRequest {
    pub op_id: String,
    pub map: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct LockAcquireRequest {
    pub name: String,
    /// Caller-generated holder token; release must present the same one.
    pub holder: String,
    /// Server-side bounded wait for this attempt.
    pub wait_ms: u64,
    /// Lease on the hold itself, when the caller asked for one.
    pub lease_ms: Option<u64>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct LockAcquireResponse {
    pub acquired: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct LockReleaseRequest {
    pub name: String,
    pub holder: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct LockReleaseResponse {
    pub released: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum CounterCommand {
    Get,
    CompareAndSet { expect: i64, new: i64 },
    GetAndIncrement,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CounterApplyRequest {
    pub name: String,
    pub command: CounterCommand,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CounterApplyResponse {
    /// For `Get` the current value; for `GetAndIncrement` the pre-increment
    /// value; for `CompareAndSet` the value before the swap attempt.
    pub value: i64,
    pub applied: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CounterReplicateRequest {
    pub op_id: String,
    pub name: String,
    pub value: i64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ExpiryBroadcastRequest {
    pub op_id: String,
    pub event: ExpiredEntry,
}

/// Standard acknowledgment for fire-and-apply requests.
#[derive(Debug, Serialize, Deserialize)]
pub struct Acknowledge {
    pub success: bool,
}

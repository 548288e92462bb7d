//! Replicated In-Memory Backend
//!
//! Implements the coordination contracts on top of a sharded, replicated
//! in-memory store. Every routing key (map entry, lock name, counter name)
//! hashes to a partition; the partition's primary owner executes the
//! operation, which linearizes all per-key mutations at a single node.
//! Writes are pushed synchronously to backup owners, reads fall back to
//! replicas when the primary is unreachable.
//!
//! Expiry is enforced by a sweeper loop on each node over the partitions it
//! currently owns as primary; each reaped entry produces one event that is
//! broadcast to every alive peer (delivery is at-least-once, deduplicated
//! by operation id where possible).

pub mod handlers;
pub mod partitioner;
pub mod protocol;


use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::{mpsc, Mutex};

use crate::coordination::error::CoordinationError;
use crate::coordination::locks::LockTable;
use crate::coordination::types::{
    now_ms, EntryListener, ExpiredEntry, ExpiryOutlet, KeyFilter, ListenerId, ListenerRegistry,
    Ttl,
};
use crate::coordination::{CoordinationBackend, SharedCounter, SharedLock, SharedMap};
use crate::membership::service::MembershipService;
use crate::membership::types::PeerId;
use self::partitioner::PartitionManager;
use self::protocol::*;

/// How long a forwarded request may take before the peer counts as
/// unavailable.
const FORWARD_TIMEOUT: Duration = Duration::from_secs(5);
/// Sweep cadence for expired entries in locally-owned partitions.
const SWEEP_INTERVAL: Duration = Duration::from_millis(200);
/// Per-attempt chunk for blocking lock acquisition against a remote owner.
const LOCK_WAIT_CHUNK: Duration = Duration::from_secs(1);

type FullKey = (String, String);

fn map_routing_key(map: &str, key: &str) -> String {
    format!("kv/{}/{}", map, key)
}

fn lock_routing_key(name: &str) -> String {
    format!("lock/{}", name)
}

fn counter_routing_key(name: &str) -> String {
    format!("counter/{}", name)
}

fn entry_live(entry: &ReplicaEntry, now: u64) -> bool {
    !matches!(entry.deadline_ms, Some(deadline) if now >= deadline)
}

/// The replicated-cluster coordination backend.
pub struct ReplicatedBackend {
    pub membership: Arc<MembershipService>,
    pub partitioner: Arc<PartitionManager>,
    /// Local shard: partition -> (map, key) -> entry. Holds both primary
    /// and backup copies.
    store: DashMap<u32, DashMap<FullKey, ReplicaEntry>>,
    map_handles: DashMap<String, Arc<ReplicatedMap>>,
    locks: Arc<LockTable>,
    counters: DashMap<String, i64>,
    listeners: Arc<ListenerRegistry>,
    seen_ops: DashMap<String, u64>,
    http: reqwest::Client,
    outlet: ExpiryOutlet,
    weak_self: Weak<ReplicatedBackend>,
}

impl ReplicatedBackend {
    pub fn new(membership: Arc<MembershipService>, partitioner: Arc<PartitionManager>) -> Arc<Self> {
        Arc::new_cyclic(|weak_self| Self {
            membership,
            partitioner,
            store: DashMap::new(),
            map_handles: DashMap::new(),
            locks: LockTable::new(),
            counters: DashMap::new(),
            listeners: ListenerRegistry::new(),
            seen_ops: DashMap::new(),
            http: reqwest::Client::new(),
            outlet: ExpiryOutlet::new(),
            weak_self: weak_self.clone(),
        })
    }

    /// Spawns the expiry sweeper.
    pub fn start(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(SWEEP_INTERVAL);
            loop {
                interval.tick().await;
                let Some(backend) = weak.upgrade() else {
                    break;
                };
                backend.sweep_expired().await;
            }
        });
    }

    /// Idempotency check shared by all replicated apply paths.
    pub(crate) fn should_process_op(&self, op_id: &str) -> bool {
        if self.seen_ops.contains_key(op_id) {
            return false;
        }
        if self.seen_ops.len() > 10_000 {
            self.seen_ops.clear();
        }
        self.seen_ops.insert(op_id.to_string(), now_ms());
        true
    }

    fn peer_base(&self, peer_id: &PeerId) -> Result<String, CoordinationError> {
        let peer = self.membership.get_peer(peer_id).ok_or_else(|| {
            CoordinationError::BackendUnavailable(format!("peer {:?} not in membership", peer_id))
        })?;
        Ok(format!("http://{}", peer.http_addr))
    }

    /// Single-shot JSON POST; the layer performs no internal retry for
    /// caller-facing operations.
    async fn post_json<T, R>(
        &self,
        url: &str,
        payload: &T,
        timeout: Duration,
    ) -> Result<R, CoordinationError>
    where
        T: serde::Serialize,
        R: serde::de::DeserializeOwned,
    {
        let response = self
            .http
            .post(url)
            .json(payload)
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| CoordinationError::BackendUnavailable(e.to_string()))?;
        if !response.status().is_success() {
            return Err(CoordinationError::BackendUnavailable(format!(
                "{} answered {}",
                url,
                response.status()
            )));
        }
        response
            .json::<R>()
            .await
            .map_err(|e| CoordinationError::MalformedResponse(e.to_string()))
    }

    /// Retrying POST for internal durability traffic (backup replication).
    async fn post_with_retry<T: serde::Serialize>(
        &self,
        url: String,
        payload: &T,
        attempts: usize,
    ) -> Result<(), CoordinationError> {
        let mut delay_ms = 150u64;
        for attempt in 0..attempts {
            let response = self
                .http
                .post(url.clone())
                .json(payload)
                .timeout(Duration::from_millis(500))
                .send()
                .await;
            match response {
                Ok(resp) if resp.status().is_success() => return Ok(()),
                Ok(resp) => {
                    if attempt + 1 == attempts {
                        return Err(CoordinationError::BackendUnavailable(format!(
                            "{} answered {}",
                            url,
                            resp.status()
                        )));
                    }
                }
                Err(e) => {
                    if attempt + 1 == attempts {
                        return Err(CoordinationError::BackendUnavailable(e.to_string()));
                    }
                }
            }
            let jitter = rand::random::<u64>() % 50;
            tokio::time::sleep(Duration::from_millis(delay_ms + jitter)).await;
            delay_ms = (delay_ms * 2).min(1200);
        }
        Err(CoordinationError::BackendUnavailable(
            "retry attempts exhausted".into(),
        ))
    }

    // --- Map Operations ---

    pub(crate) fn partition_for_map_key(&self, map: &str, key: &str) -> u32 {
        self.partitioner.get_partition(&map_routing_key(map, key))
    }

    pub(crate) async fn apply_map_command(
        &self,
        map: &str,
        key: &str,
        command: MapCommand,
    ) -> Result<MapApplyResponse, CoordinationError> {
        let partition = self.partitioner.get_partition(&map_routing_key(map, key));
        let owners = self.partitioner.get_owners(partition);

        match owners.first() {
            Some(primary) if *primary != self.membership.local_peer.id => {
                let request = MapApplyRequest {
                    op_id: uuid::Uuid::new_v4().to_string(),
                    map: map.to_string(),
                    key: key.to_string(),
                    command,
                };
                let url = format!("{}{}", self.peer_base(primary)?, ENDPOINT_KV_APPLY);
                self.post_json(&url, &request, FORWARD_TIMEOUT).await
            }
            // We are the primary, or no peer is alive: apply locally.
            _ => Ok(self.apply_as_primary(partition, map, key, command).await),
        }
    }

    pub(crate) async fn apply_as_primary(
        &self,
        partition: u32,
        map: &str,
        key: &str,
        command: MapCommand,
    ) -> MapApplyResponse {
        let now = now_ms();
        let full_key = (map.to_string(), key.to_string());

        // Mutate under the shard's entry lock; the new state to replicate
        // is captured before any await.
        let (response, new_state) = {
            let shard = self.store.entry(partition).or_default();
            match command {
                MapCommand::Put { value, ttl_ms } => {
                    let entry = ReplicaEntry {
                        value,
                        deadline_ms: (ttl_ms > 0).then(|| now + ttl_ms),
                    };
                    let previous = shard.insert(full_key.clone(), entry.clone());
                    (
                        MapApplyResponse {
                            previous: previous.filter(|e| entry_live(e, now)).map(|e| e.value),
                            applied: true,
                        },
                        Some(Some(entry)),
                    )
                }
                MapCommand::PutIfAbsent { value, ttl_ms } => {
                    use dashmap::mapref::entry::Entry;
                    match shard.entry(full_key.clone()) {
                        Entry::Occupied(mut occupied) => {
                            if entry_live(occupied.get(), now) {
                                (
                                    MapApplyResponse {
                                        previous: Some(occupied.get().value.clone()),
                                        applied: false,
                                    },
                                    None,
                                )
                            } else {
                                let entry = ReplicaEntry {
                                    value,
                                    deadline_ms: (ttl_ms > 0).then(|| now + ttl_ms),
                                };
                                occupied.insert(entry.clone());
                                (
                                    MapApplyResponse {
                                        previous: None,
                                        applied: true,
                                    },
                                    Some(Some(entry)),
                                )
                            }
                        }
                        Entry::Vacant(vacant) => {
                            let entry = ReplicaEntry {
                                value,
                                deadline_ms: (ttl_ms > 0).then(|| now + ttl_ms),
                            };
                            vacant.insert(entry.clone());
                            (
                                MapApplyResponse {
                                    previous: None,
                                    applied: true,
                                },
                                Some(Some(entry)),
                            )
                        }
                    }
                }
                MapCommand::Remove => {
                    let previous = shard.remove(&full_key).map(|(_, e)| e);
                    let removed = previous.is_some();
                    (
                        MapApplyResponse {
                            previous: previous.filter(|e| entry_live(e, now)).map(|e| e.value),
                            applied: removed,
                        },
                        removed.then_some(None),
                    )
                }
                MapCommand::RemoveIfEquals { expected } => {
                    let removed = shard
                        .remove_if(&full_key, |_, e| entry_live(e, now) && e.value == expected)
                        .is_some();
                    (
                        MapApplyResponse {
                            previous: None,
                            applied: removed,
                        },
                        removed.then_some(None),
                    )
                }
            }
        };

        if let Some(state) = new_state {
            self.replicate_entry(partition, map, key, state).await;
        }
        response
    }

    /// Pushes entry state (or a deletion) to every backup owner.
    /// Best-effort: a dead backup must not fail the caller's write.
    async fn replicate_entry(
        &self,
        partition: u32,
        map: &str,
        key: &str,
        entry: Option<ReplicaEntry>,
    ) {
        let owners = self.partitioner.get_owners(partition);
        if owners.len() < 2 {
            return;
        }
        let request = ReplicateEntryRequest {
            op_id: uuid::Uuid::new_v4().to_string(),
            partition,
            map: map.to_string(),
            key: key.to_string(),
            entry,
        };
        for backup in owners.iter().skip(1) {
            let url = match self.peer_base(backup) {
                Ok(base) => format!("{}{}", base, ENDPOINT_KV_REPLICATE),
                Err(e) => {
                    tracing::warn!("Backup {:?} unknown: {}", backup, e);
                    continue;
                }
            };
            if let Err(e) = self.post_with_retry(url, &request, 3).await {
                tracing::warn!("Replication to {:?} failed: {}", backup, e);
            }
        }
    }

    /// Applies a replica push from a primary.
    pub(crate) fn store_replica(&self, request: ReplicateEntryRequest) {
        if !self.should_process_op(&request.op_id) {
            return;
        }
        let shard = self.store.entry(request.partition).or_default();
        let full_key = (request.map, request.key);
        match request.entry {
            Some(entry) => {
                shard.insert(full_key, entry);
            }
            None => {
                shard.remove(&full_key);
            }
        }
    }

    pub(crate) async fn get_entry(
        &self,
        map: &str,
        key: &str,
    ) -> Result<Option<Vec<u8>>, CoordinationError> {
        let partition = self.partitioner.get_partition(&map_routing_key(map, key));
        let full_key = (map.to_string(), key.to_string());

        // Local copy first (primary or backup).
        if let Some(shard) = self.store.get(&partition) {
            if let Some(entry) = shard.get(&full_key) {
                return Ok(Some(entry.value.clone()).filter(|_| entry_live(&entry, now_ms())));
            }
        }

        let owners = self.partitioner.get_owners(partition);
        let Some(primary) = owners.first() else {
            return Ok(None);
        };
        if *primary == self.membership.local_peer.id {
            // We are authoritative and the entry is simply absent.
            return Ok(None);
        }

        let request = GetEntryRequest {
            map: map.to_string(),
            key: key.to_string(),
        };
        let mut last_error = None;
        for owner in &owners {
            if *owner == self.membership.local_peer.id {
                continue;
            }
            let url = match self.peer_base(owner) {
                Ok(base) => format!("{}{}", base, ENDPOINT_KV_GET),
                Err(e) => {
                    last_error = Some(e);
                    continue;
                }
            };
            match self
                .post_json::<_, GetEntryResponse>(&url, &request, FORWARD_TIMEOUT)
                .await
            {
                Ok(response) => return Ok(response.value),
                Err(e) => {
                    tracing::warn!("Read from {:?} failed: {}", owner, e);
                    last_error = Some(e);
                }
            }
        }
        Err(last_error.unwrap_or_else(|| {
            CoordinationError::BackendUnavailable("no owner reachable".into())
        }))
    }

    /// Reads a key from the local shard only (owner-side of a forwarded
    /// read).
    pub(crate) fn get_entry_local(&self, map: &str, key: &str) -> Option<Vec<u8>> {
        let partition = self.partitioner.get_partition(&map_routing_key(map, key));
        let shard = self.store.get(&partition)?;
        let entry = shard.get(&(map.to_string(), key.to_string()))?;
        Some(entry.value.clone()).filter(|_| entry_live(&entry, now_ms()))
    }

    /// Live entries of one map across the whole cluster.
    pub(crate) async fn scan_map(
        &self,
        map: &str,
    ) -> Result<Vec<(String, Vec<u8>)>, CoordinationError> {
        let mut merged: std::collections::HashMap<String, Vec<u8>> =
            self.scan_map_local(map).into_iter().collect();

        let request = ScanRequest {
            map: map.to_string(),
        };
        for peer in self.membership.get_alive_peers() {
            if peer.id == self.membership.local_peer.id {
                continue;
            }
            let url = format!("http://{}{}", peer.http_addr, ENDPOINT_KV_SCAN);
            let response: ScanResponse = self.post_json(&url, &request, FORWARD_TIMEOUT).await?;
            merged.extend(response.entries);
        }
        Ok(merged.into_iter().collect())
    }

    /// Live entries of one map in partitions this node owns as primary.
    pub(crate) fn scan_map_local(&self, map: &str) -> Vec<(String, Vec<u8>)> {
        let now = now_ms();
        let mut entries = Vec::new();
        for partition in self.partitioner.my_primary_partitions() {
            if let Some(shard) = self.store.get(&partition) {
                for item in shard.iter() {
                    let (entry_map, key) = item.key();
                    if entry_map == map && entry_live(item.value(), now) {
                        entries.push((key.clone(), item.value().value.clone()));
                    }
                }
            }
        }
        entries
    }

    pub(crate) async fn clear_map(&self, map: &str) -> Result<(), CoordinationError> {
        let op_id = uuid::Uuid::new_v4().to_string();
        self.clear_map_local(map, &op_id);

        let request = ClearRequest {
            op_id,
            map: map.to_string(),
        };
        for peer in self.membership.get_alive_peers() {
            if peer.id == self.membership.local_peer.id {
                continue;
            }
            let url = format!("http://{}{}", peer.http_addr, ENDPOINT_KV_CLEAR);
            if let Err(e) = self.post_with_retry(url, &request, 3).await {
                tracing::warn!("Clear broadcast to {:?} failed: {}", peer.id, e);
            }
        }
        Ok(())
    }

    pub(crate) fn clear_map_local(&self, map: &str, op_id: &str) {
        if !self.should_process_op(op_id) {
            return;
        }
        for shard in self.store.iter() {
            shard.value().retain(|(entry_map, _), _| entry_map != map);
        }
        self.listeners.clear_map(map);
    }

    // --- Expiry Sweeper ---

    async fn sweep_expired(&self) {
        let now = now_ms();
        let mut reaped: Vec<(u32, String, String, ReplicaEntry)> = Vec::new();

        for partition in self.partitioner.my_primary_partitions() {
            let Some(shard) = self.store.get(&partition) else {
                continue;
            };
            let dead: Vec<FullKey> = shard
                .iter()
                .filter(|item| !entry_live(item.value(), now))
                .map(|item| item.key().clone())
                .collect();
            for full_key in dead {
                if let Some((_, entry)) =
                    shard.remove_if(&full_key, |_, e| !entry_live(e, now))
                {
                    reaped.push((partition, full_key.0, full_key.1, entry));
                }
            }
        }

        for (partition, map, key, entry) in reaped {
            self.replicate_entry(partition, &map, &key, None).await;
            let event = ExpiredEntry {
                map,
                key,
                last_value: entry.value,
            };
            tracing::debug!("entry '{}' expired in map '{}'", event.key, event.map);
            self.listeners.dispatch(&event);
            self.outlet.send(event.clone());
            self.broadcast_expiry(event).await;
        }
    }

    async fn broadcast_expiry(&self, event: ExpiredEntry) {
        let request = ExpiryBroadcastRequest {
            op_id: uuid::Uuid::new_v4().to_string(),
            event,
        };
        for peer in self.membership.get_alive_peers() {
            if peer.id == self.membership.local_peer.id {
                continue;
            }
            let url = format!("http://{}{}", peer.http_addr, ENDPOINT_EXPIRY_BROADCAST);
            if let Err(e) = self.post_with_retry(url, &request, 2).await {
                tracing::warn!("Expiry broadcast to {:?} failed: {}", peer.id, e);
            }
        }
    }

    /// Delivers a broadcast expiry event to local subscribers.
    pub(crate) fn receive_expiry(&self, request: ExpiryBroadcastRequest) {
        if !self.should_process_op(&request.op_id) {
            return;
        }
        self.listeners.dispatch(&request.event);
        self.outlet.send(request.event);
    }

    // --- Locks ---

    pub(crate) async fn lock_acquire(
        &self,
        name: &str,
        holder: &str,
        wait: Duration,
        lease: Option<Duration>,
    ) -> Result<bool, CoordinationError> {
        let partition = self.partitioner.get_partition(&lock_routing_key(name));
        let owners = self.partitioner.get_owners(partition);

        match owners.first() {
            Some(primary) if *primary != self.membership.local_peer.id => {
                let request = LockAcquireRequest {
                    name: name.to_string(),
                    holder: holder.to_string(),
                    wait_ms: wait.as_millis() as u64,
                    lease_ms: lease.map(|l| l.as_millis() as u64),
                };
                let url = format!("{}{}", self.peer_base(primary)?, ENDPOINT_LOCK_ACQUIRE);
                let response: LockAcquireResponse = self
                    .post_json(&url, &request, wait + FORWARD_TIMEOUT)
                    .await?;
                Ok(response.acquired)
            }
            _ => Ok(self.locks.acquire(name, holder, Some(wait), lease).await),
        }
    }

    pub(crate) async fn lock_release(
        &self,
        name: &str,
        holder: &str,
    ) -> Result<bool, CoordinationError> {
        let partition = self.partitioner.get_partition(&lock_routing_key(name));
        let owners = self.partitioner.get_owners(partition);

        match owners.first() {
            Some(primary) if *primary != self.membership.local_peer.id => {
                let request = LockReleaseRequest {
                    name: name.to_string(),
                    holder: holder.to_string(),
                };
                let url = format!("{}{}", self.peer_base(primary)?, ENDPOINT_LOCK_RELEASE);
                let response: LockReleaseResponse =
                    self.post_json(&url, &request, FORWARD_TIMEOUT).await?;
                Ok(response.released)
            }
            _ => Ok(self.locks.release(name, holder)),
        }
    }

    pub(crate) async fn lock_acquire_local(
        &self,
        request: LockAcquireRequest,
    ) -> LockAcquireResponse {
        // Cap the server-side wait so a slow waiter cannot pin the
        // connection; the client loops for longer waits.
        let wait = Duration::from_millis(request.wait_ms.min(5_000));
        let lease = request.lease_ms.map(Duration::from_millis);
        let acquired = self
            .locks
            .acquire(&request.name, &request.holder, Some(wait), lease)
            .await;
        LockAcquireResponse { acquired }
    }

    pub(crate) fn lock_release_local(&self, name: &str, holder: &str) -> bool {
        self.locks.release(name, holder)
    }

    // --- Counters ---

    pub(crate) async fn apply_counter(
        &self,
        name: &str,
        command: CounterCommand,
    ) -> Result<CounterApplyResponse, CoordinationError> {
        let partition = self.partitioner.get_partition(&counter_routing_key(name));
        let owners = self.partitioner.get_owners(partition);

        match owners.first() {
            Some(primary) if *primary != self.membership.local_peer.id => {
                let request = CounterApplyRequest {
                    name: name.to_string(),
                    command,
                };
                let url = format!("{}{}", self.peer_base(primary)?, ENDPOINT_COUNTER_APPLY);
                self.post_json(&url, &request, FORWARD_TIMEOUT).await
            }
            _ => {
                let (response, changed) = self.apply_counter_local(name, command)?;
                if changed {
                    self.replicate_counter(partition, name).await;
                }
                Ok(response)
            }
        }
    }

    pub(crate) fn apply_counter_local(
        &self,
        name: &str,
        command: CounterCommand,
    ) -> Result<(CounterApplyResponse, bool), CoordinationError> {
        let mut value = self.counters.entry(name.to_string()).or_insert(0);
        match command {
            CounterCommand::Get => Ok((
                CounterApplyResponse {
                    value: *value,
                    applied: true,
                },
                false,
            )),
            CounterCommand::CompareAndSet { expect, new } => {
                let before = *value;
                let applied = before == expect;
                if applied {
                    *value = new;
                }
                Ok((
                    CounterApplyResponse {
                        value: before,
                        applied,
                    },
                    applied,
                ))
            }
            CounterCommand::GetAndIncrement => {
                let previous = *value;
                *value = previous
                    .checked_add(1)
                    .ok_or_else(|| CoordinationError::CounterExhausted {
                        name: name.to_string(),
                    })?;
                Ok((
                    CounterApplyResponse {
                        value: previous,
                        applied: true,
                    },
                    true,
                ))
            }
        }
    }

    /// Owner side of a forwarded counter command: apply locally, then push
    /// the new value to backups.
    pub(crate) async fn counter_apply_forwarded(
        &self,
        name: &str,
        command: CounterCommand,
    ) -> Result<CounterApplyResponse, CoordinationError> {
        let (response, changed) = self.apply_counter_local(name, command)?;
        if changed {
            let partition = self.partitioner.get_partition(&counter_routing_key(name));
            self.replicate_counter(partition, name).await;
        }
        Ok(response)
    }

    async fn replicate_counter(&self, partition: u32, name: &str) {
        let owners = self.partitioner.get_owners(partition);
        if owners.len() < 2 {
            return;
        }
        let value = self.counters.get(name).map(|v| *v).unwrap_or(0);
        let request = CounterReplicateRequest {
            op_id: uuid::Uuid::new_v4().to_string(),
            name: name.to_string(),
            value,
        };
        for backup in owners.iter().skip(1) {
            let url = match self.peer_base(backup) {
                Ok(base) => format!("{}{}", base, ENDPOINT_COUNTER_REPLICATE),
                Err(_) => continue,
            };
            if let Err(e) = self.post_with_retry(url, &request, 2).await {
                tracing::warn!("Counter replication to {:?} failed: {}", backup, e);
            }
        }
    }

    pub(crate) fn store_counter_replica(&self, request: CounterReplicateRequest) {
        if !self.should_process_op(&request.op_id) {
            return;
        }
        self.counters.insert(request.name, request.value);
    }

    // --- Anti-Entropy ---

    /// Everything this node holds for one partition.
    pub(crate) fn dump_partition(&self, partition: u32) -> Vec<DumpEntry> {
        let Some(shard) = self.store.get(&partition) else {
            return Vec::new();
        };
        shard
            .iter()
            .map(|item| DumpEntry {
                map: item.key().0.clone(),
                key: item.key().1.clone(),
                entry: item.value().clone(),
            })
            .collect()
    }

    pub(crate) fn apply_partition_entries(&self, partition: u32, entries: Vec<DumpEntry>) {
        let shard = self.store.entry(partition).or_default();
        for dumped in entries {
            let full_key = (dumped.map, dumped.key);
            if !shard.contains_key(&full_key) {
                shard.insert(full_key, dumped.entry);
            }
        }
    }

    /// Pulls partitions this node backs up from their primaries. Meant for
    /// a node (re)joining an established cluster.
    pub async fn sync_from_primaries(&self) {
        for partition in 0..self.partitioner.num_partitions {
            let owners = self.partitioner.get_owners(partition);
            let is_backup = owners
                .iter()
                .skip(1)
                .any(|id| *id == self.membership.local_peer.id);
            if !is_backup {
                continue;
            }
            let Some(primary) = owners.first() else {
                continue;
            };
            let url = match self.peer_base(primary) {
                Ok(base) => format!("{}{}/{}", base, ENDPOINT_KV_PARTITION_DUMP, partition),
                Err(_) => continue,
            };
            let response = self
                .http
                .get(url)
                .timeout(FORWARD_TIMEOUT)
                .send()
                .await;
            match response {
                Ok(resp) if resp.status().is_success() => {
                    match resp.json::<PartitionDumpResponse>().await {
                        Ok(dump) => self.apply_partition_entries(partition, dump.entries),
                        Err(e) => tracing::warn!("Bad partition dump: {}", e),
                    }
                }
                Ok(resp) => tracing::warn!("Partition dump answered {}", resp.status()),
                Err(e) => tracing::warn!("Partition dump from {:?} failed: {}", primary, e),
            }
        }
    }
}

impl CoordinationBackend for ReplicatedBackend {
    fn map(&self, name: &str, default_ttl: Option<Duration>) -> Arc<dyn SharedMap> {
        self.map_handles
            .entry(name.to_string())
            .or_insert_with(|| {
                Arc::new(ReplicatedMap {
                    name: name.to_string(),
                    default_ttl,
                    backend: self.weak_self.clone(),
                    listeners: self.listeners.clone(),
                })
            })
            .clone()
    }

    fn lock(&self, name: &str) -> Arc<dyn SharedLock> {
        Arc::new(ReplicatedLock {
            name: name.to_string(),
            backend: self.weak_self.clone(),
            held: Mutex::new(None),
        })
    }

    fn counter(&self, name: &str) -> Arc<dyn SharedCounter> {
        Arc::new(ReplicatedCounter {
            name: name.to_string(),
            backend: self.weak_self.clone(),
        })
    }

    fn open_expiry_channel(&self) -> mpsc::UnboundedReceiver<ExpiredEntry> {
        self.outlet.open()
    }
}

fn live_backend(weak: &Weak<ReplicatedBackend>) -> Result<Arc<ReplicatedBackend>, CoordinationError> {
    weak.upgrade()
        .ok_or_else(|| CoordinationError::BackendUnavailable("backend shut down".into()))
}

/// Map handle of the replicated backend.
pub struct ReplicatedMap {
    name: String,
    default_ttl: Option<Duration>,
    backend: Weak<ReplicatedBackend>,
    listeners: Arc<ListenerRegistry>,
}

impl ReplicatedMap {
    /// TTLs are resolved against the handle's default before they go on
    /// the wire; zero means "never expire".
    fn wire_ttl(&self, ttl: Ttl) -> u64 {
        ttl.resolve(self.default_ttl)
            .map(|d| (d.as_millis() as u64).max(1))
            .unwrap_or(0)
    }
}

#[async_trait]
impl SharedMap for ReplicatedMap {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CoordinationError> {
        live_backend(&self.backend)?.get_entry(&self.name, key).await
    }

    async fn put(
        &self,
        key: &str,
        value: Vec<u8>,
        ttl: Ttl,
    ) -> Result<Option<Vec<u8>>, CoordinationError> {
        let response = live_backend(&self.backend)?
            .apply_map_command(
                &self.name,
                key,
                MapCommand::Put {
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
        let response = live_backend(&self.backend)?
            .apply_map_command(
                &self.name,
                key,
                MapCommand::PutIfAbsent {
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
        let response = live_backend(&self.backend)?
            .apply_map_command(&self.name, key, MapCommand::Remove)
            .await?;
        Ok(response.previous)
    }

    async fn remove_if_equals(
        &self,
        key: &str,
        expected: &[u8],
    ) -> Result<bool, CoordinationError> {
        let response = live_backend(&self.backend)?
            .apply_map_command(
                &self.name,
                key,
                MapCommand::RemoveIfEquals {
                    expected: expected.to_vec(),
                },
            )
            .await?;
        Ok(response.applied)
    }

    async fn clear(&self) -> Result<(), CoordinationError> {
        live_backend(&self.backend)?.clear_map(&self.name).await
    }

    async fn keys(&self) -> Result<Vec<String>, CoordinationError> {
        Ok(live_backend(&self.backend)?
            .scan_map(&self.name)
            .await?
            .into_iter()
            .map(|(key, _)| key)
            .collect())
    }

    async fn entries(&self) -> Result<Vec<(String, Vec<u8>)>, CoordinationError> {
        live_backend(&self.backend)?.scan_map(&self.name).await
    }

    fn add_listener(&self, filter: KeyFilter, listener: EntryListener) -> ListenerId {
        self.listeners.add(&self.name, filter, listener)
    }

    fn remove_listener(&self, id: ListenerId) -> bool {
        self.listeners.remove(&self.name, id)
    }
}

/// Lock handle of the replicated backend. The holder token travels with
/// every request so the lock's owner node can validate the release.
pub struct ReplicatedLock {
    name: String,
    backend: Weak<ReplicatedBackend>,
    held: Mutex<Option<String>>,
}

#[async_trait]
impl SharedLock for ReplicatedLock {
    async fn lock(&self) -> Result<(), CoordinationError> {
        let token = uuid::Uuid::new_v4().to_string();
        loop {
            let acquired = live_backend(&self.backend)?
                .lock_acquire(&self.name, &token, LOCK_WAIT_CHUNK, None)
                .await?;
            if acquired {
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
            let acquired = live_backend(&self.backend)?
                .lock_acquire(&self.name, &token, remaining.min(LOCK_WAIT_CHUNK), Some(ttl))
                .await?;
            if acquired {
                *self.held.lock().await = Some(token);
                return Ok(true);
            }
        }
    }

    async fn unlock(&self) -> Result<(), CoordinationError> {
        let token = self.held.lock().await.take();
        match token {
            Some(token) => {
                let released = live_backend(&self.backend)?
                    .lock_release(&self.name, &token)
                    .await?;
                if released {
                    Ok(())
                } else {
                    Err(CoordinationError::NotLockHolder {
                        name: self.name.clone(),
                    })
                }
            }
            None => Err(CoordinationError::NotLockHolder {
                name: self.name.clone(),
            }),
        }
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Counter handle of the replicated backend.
pub struct ReplicatedCounter {
    name: String,
    backend: Weak<ReplicatedBackend>,
}

#[async_trait]
impl SharedCounter for ReplicatedCounter {
    async fn get(&self) -> Result<i64, CoordinationError> {
        let response = live_backend(&self.backend)?
            .apply_counter(&self.name, CounterCommand::Get)
            .await?;
        Ok(response.value)
    }

    async fn compare_and_set(&self, expect: i64, new: i64) -> Result<bool, CoordinationError> {
        let response = live_backend(&self.backend)?
            .apply_counter(&self.name, CounterCommand::CompareAndSet { expect, new })
            .await?;
        Ok(response.applied)
    }

    async fn get_and_increment(&self) -> Result<i64, CoordinationError> {
        let response = live_backend(&self.backend)?
            .apply_counter(&self.name, CounterCommand::GetAndIncrement)
            .await?;
        Ok(response.value)
    }
}

use crate::membership::{service::MembershipService, types::PeerId};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

/// Assigns routing keys to partitions and partitions to owner nodes.
///
/// Ownership is a pure function of the sorted alive-peer list, so every
/// node with a converged membership view computes the same owners.
pub struct PartitionManager {
    pub num_partitions: u32,
    /// Number of backup owners behind the primary.
    backup_count: usize,
    membership: Arc<MembershipService>,
}

impl PartitionManager {
    pub fn new(membership: Arc<MembershipService>) -> Arc<Self> {
        Arc::new(Self {
            num_partitions: 256,
            backup_count: 1,
            membership,
        })
    }

    pub fn get_partition(&self, routing_key: &str) -> u32 {
        let mut hasher = DefaultHasher::new();
        routing_key.hash(&mut hasher);
        (hasher.finish() as u32) % self.num_partitions
    }

    /// Owner list for a partition: primary first, then backups. Empty only
    /// when no peer is alive.
    pub fn get_owners(&self, partition: u32) -> Vec<PeerId> {
        let mut peer_ids: Vec<PeerId> = self
            .membership
            .get_alive_peers()
            .into_iter()
            .map(|peer| peer.id)
            .collect();
        if peer_ids.is_empty() {
            return vec![];
        }
        peer_ids.sort();

        let owner_count = (self.backup_count + 1).min(peer_ids.len());
        (0..owner_count)
            .map(|i| peer_ids[(partition as usize + i) % peer_ids.len()].clone())
            .collect()
    }

    pub fn is_local_primary(&self, partition: u32) -> bool {
        let owners = self.get_owners(partition);
        matches!(owners.first(), Some(primary) if *primary == self.membership.local_peer.id)
    }

    pub fn my_primary_partitions(&self) -> Vec<u32> {
        (0..self.num_partitions)
            .filter(|&partition| self.is_local_primary(partition))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;

    #[tokio::test]
    async fn test_partition_is_deterministic_and_in_range() {
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let membership = MembershipService::new(addr, addr, vec![]).await.unwrap();
        let partitioner = PartitionManager::new(membership);

        let p1 = partitioner.get_partition("lobby/alpha");
        let p2 = partitioner.get_partition("lobby/alpha");
        assert_eq!(p1, p2);
        assert!(p1 < partitioner.num_partitions);
    }

    #[tokio::test]
    async fn test_single_node_owns_everything() {
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let membership = MembershipService::new(addr, addr, vec![]).await.unwrap();
        let partitioner = PartitionManager::new(membership);

        assert_eq!(
            partitioner.my_primary_partitions().len() as u32,
            partitioner.num_partitions
        );
        let owners = partitioner.get_owners(17);
        assert_eq!(owners.len(), 1, "single node has no distinct backup");
    }

    #[tokio::test]
    async fn test_keys_spread_over_partitions() {
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let membership = MembershipService::new(addr, addr, vec![]).await.unwrap();
        let partitioner = PartitionManager::new(membership);

        let mut counts = std::collections::HashMap::new();
        for i in 0..10_000 {
            let partition = partitioner.get_partition(&format!("session/{}", i));
            *counts.entry(partition).or_insert(0) += 1;
        }
        assert!(
            counts.len() > 100,
            "expected a broad spread, got {} partitions",
            counts.len()
        );
    }
}

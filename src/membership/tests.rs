//! Membership Module Tests
//!
//! Single-node construction plus a real two-node join over loopback UDP
//! with shrunken gossip timers.

use std::net::SocketAddr;
use std::time::Duration;

use crate::membership::service::{GossipConfig, MembershipService};
use crate::membership::types::{PeerId, PeerState};

fn loopback() -> SocketAddr {
    "127.0.0.1:0".parse().unwrap()
}

fn fast_gossip() -> GossipConfig {
    GossipConfig {
        gossip_interval: Duration::from_millis(50),
        failure_check_interval: Duration::from_millis(100),
        suspect_after: Duration::from_millis(500),
        dead_after: Duration::from_millis(1000),
    }
}

#[tokio::test]
async fn test_membership_creation() {
    let service = MembershipService::new(loopback(), loopback(), vec![])
        .await
        .expect("failed to create service");

    assert_eq!(service.peers.len(), 1);
    let alive = service.get_alive_peers();
    assert_eq!(alive.len(), 1);
    assert_eq!(alive[0].state, PeerState::Alive);
    assert_eq!(alive[0].id, service.local_peer.id);
}

#[tokio::test]
async fn test_two_nodes_discover_each_other() {
    let seed = MembershipService::with_config(loopback(), loopback(), vec![], fast_gossip())
        .await
        .unwrap();
    seed.clone().start().await;

    let joiner = MembershipService::with_config(
        loopback(),
        loopback(),
        vec![seed.local_peer.gossip_addr],
        fast_gossip(),
    )
    .await
    .unwrap();
    joiner.clone().start().await;

    // Join + one gossip round trip.
    tokio::time::sleep(Duration::from_millis(600)).await;

    assert_eq!(seed.get_alive_peers().len(), 2, "seed should see the joiner");
    assert_eq!(joiner.get_alive_peers().len(), 2, "joiner should see the seed");

    let seen = seed.get_peer(&joiner.local_peer.id).expect("joiner known");
    assert_eq!(seen.http_addr, joiner.local_peer.http_addr);
}

#[tokio::test]
async fn test_joiner_learns_seed_http_addr() {
    // The seed first learns of the joiner from the Join message, but the
    // joiner only hears back through pings and ack merges. Those paths
    // must hand it the seed's HTTP socket, not its gossip socket.
    let seed_http: SocketAddr = "127.0.0.1:19321".parse().unwrap();
    let seed = MembershipService::with_config(loopback(), seed_http, vec![], fast_gossip())
        .await
        .unwrap();
    seed.clone().start().await;

    let joiner = MembershipService::with_config(
        loopback(),
        loopback(),
        vec![seed.local_peer.gossip_addr],
        fast_gossip(),
    )
    .await
    .unwrap();
    joiner.clone().start().await;

    tokio::time::sleep(Duration::from_millis(600)).await;

    let seen = joiner.get_peer(&seed.local_peer.id).expect("seed known");
    assert_eq!(seen.http_addr, seed_http, "joiner must hold the seed's HTTP address");
    assert_ne!(seen.http_addr, seed.local_peer.gossip_addr);
}

#[tokio::test]
async fn test_get_peer_unknown_is_none() {
    let service = MembershipService::new(loopback(), loopback(), vec![])
        .await
        .unwrap();
    let unknown = PeerId::new();
    assert!(service.get_peer(&unknown).is_none());
}

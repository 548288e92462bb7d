use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::time::Instant;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId(pub String);

impl PeerId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

impl Default for PeerId {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum PeerState {
    Alive,
    Suspect,
    Dead,
}

/// A single member of the cluster.
///
/// `incarnation` is a logical clock used to order updates and resolve
/// disputes (e.g., a peer refuting a false "Suspect" claim).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Peer {
    pub id: PeerId,
    /// UDP socket gossip runs over.
    pub gossip_addr: SocketAddr,
    /// HTTP socket the coordination endpoints listen on.
    pub http_addr: SocketAddr,
    pub state: PeerState,
    pub incarnation: u64,

    #[serde(skip)]
    pub last_seen: Option<Instant>,
}

/// The gossip wire protocol.
///
/// - `Ping`/`Ack`: liveness checks; the ack piggybacks the full view.
/// - `Join`: sent by a new peer to its seeds.
/// - `Suspect`/`Alive`: disseminate health transitions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum GossipMessage {
    Ping {
        from: PeerId,
        incarnation: u64,
        /// The sender's HTTP socket, so a peer discovering the sender
        /// through a bare ping records a usable address immediately.
        http_addr: SocketAddr,
    },

    Ack {
        from: PeerId,
        incarnation: u64,
        peers: Vec<Peer>,
    },

    Join {
        peer: Peer,
    },

    Suspect {
        peer_id: PeerId,
        incarnation: u64,
    },

    Alive {
        peer_id: PeerId,
        incarnation: u64,
    },
}

use anyhow::Result;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Instant;
use std::{net::SocketAddr, time::Duration};
use tokio::net::UdpSocket;
use tokio::sync::RwLock;
use tracing::info;

use super::types::{GossipMessage, Peer, PeerId, PeerState};

/// Gossip timing knobs. The defaults suit a LAN cluster; tests shrink them.
#[derive(Debug, Clone)]
pub struct GossipConfig {
    pub gossip_interval: Duration,
    pub failure_check_interval: Duration,
    pub suspect_after: Duration,
    pub dead_after: Duration,
}

impl Default for GossipConfig {
    fn default() -> Self {
        Self {
            gossip_interval: Duration::from_millis(500),
            failure_check_interval: Duration::from_secs(2),
            suspect_after: Duration::from_secs(5),
            dead_after: Duration::from_secs(10),
        }
    }
}

pub struct MembershipService {
    pub local_peer: Peer,
    pub peers: Arc<DashMap<PeerId, Peer>>,
    socket: Arc<UdpSocket>,
    incarnation: Arc<RwLock<u64>>,
    config: GossipConfig,
}

impl MembershipService {
    pub async fn new(
        gossip_addr: SocketAddr,
        http_addr: SocketAddr,
        seed_nodes: Vec<SocketAddr>,
    ) -> Result<Arc<Self>> {
        Self::with_config(gossip_addr, http_addr, seed_nodes, GossipConfig::default()).await
    }

    pub async fn with_config(
        gossip_addr: SocketAddr,
        http_addr: SocketAddr,
        seed_nodes: Vec<SocketAddr>,
        config: GossipConfig,
    ) -> Result<Arc<Self>> {
        let socket = UdpSocket::bind(gossip_addr).await?;
        // The bind may have picked an ephemeral port.
        let gossip_addr = socket.local_addr()?;

        let incarnation = Arc::new(RwLock::new(1u64));
        let local_peer = Peer {
            id: PeerId::new(),
            gossip_addr,
            http_addr,
            state: PeerState::Alive,
            incarnation: 1,
            last_seen: Some(Instant::now()),
        };

        let peers = Arc::new(DashMap::new());
        peers.insert(local_peer.id.clone(), local_peer.clone());

        if !seed_nodes.is_empty() {
            info!("Joining cluster via {} seed node(s)", seed_nodes.len());
            let msg = GossipMessage::Join {
                peer: local_peer.clone(),
            };
            let encoded = bincode::serialize(&msg)?;
            for seed in &seed_nodes {
                socket.send_to(&encoded, seed).await?;
                info!("Sent join request to {}", seed);
            }
        }

        Ok(Arc::new(Self {
            local_peer,
            peers,
            socket: Arc::new(socket),
            incarnation,
            config,
        }))
    }

    /// Spawns the gossip, receive and failure-detection loops.
    pub async fn start(self: Arc<Self>) {
        tracing::info!("Starting membership service...");

        let service = self.clone();
        tokio::spawn(async move {
            service.gossip_loop().await;
        });

        let service = self.clone();
        tokio::spawn(async move {
            service.receive_loop().await;
        });

        let service = self.clone();
        tokio::spawn(async move {
            service.failure_detection_loop().await;
        });
    }

    pub fn get_alive_peers(&self) -> Vec<Peer> {
        self.peers
            .iter()
            .filter(|entry| entry.value().state == PeerState::Alive)
            .map(|entry| entry.value().clone())
            .collect()
    }

    pub fn get_peer(&self, id: &PeerId) -> Option<Peer> {
        self.peers.get(id).map(|entry| entry.value().clone())
    }

    async fn gossip_loop(self: Arc<Self>) {
        let mut interval = tokio::time::interval(self.config.gossip_interval);

        loop {
            interval.tick().await;

            let targets: Vec<Peer> = self
                .peers
                .iter()
                .filter(|entry| {
                    entry.value().id != self.local_peer.id
                        && entry.value().state == PeerState::Alive
                })
                .map(|entry| entry.value().clone())
                .collect();

            if targets.is_empty() {
                continue;
            }

            use rand::Rng;
            let target = &targets[rand::thread_rng().gen_range(0..targets.len())];

            let incarnation = *self.incarnation.read().await;
            let msg = GossipMessage::Ping {
                from: self.local_peer.id.clone(),
                incarnation,
                http_addr: self.local_peer.http_addr,
            };

            match bincode::serialize(&msg) {
                Ok(encoded) => {
                    if let Err(e) = self.socket.send_to(&encoded, target.gossip_addr).await {
                        tracing::warn!("Failed to ping {:?}: {}", target.id, e);
                    }
                }
                Err(e) => tracing::error!("Failed to serialize ping: {}", e),
            }
        }
    }

    async fn receive_loop(self: Arc<Self>) {
        let mut buf = vec![0u8; 65536];

        loop {
            match self.socket.recv_from(&mut buf).await {
                Ok((len, src)) => match bincode::deserialize::<GossipMessage>(&buf[..len]) {
                    Ok(msg) => {
                        if let Err(e) = self.handle_message(msg, src).await {
                            tracing::error!("Error handling message from {}: {}", src, e);
                        }
                    }
                    Err(e) => {
                        tracing::warn!("Undecodable gossip packet from {}: {}", src, e);
                    }
                },
                Err(e) => {
                    tracing::error!("Failed to receive UDP packet: {}", e);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
    }

    async fn handle_message(&self, msg: GossipMessage, src: SocketAddr) -> Result<()> {
        match msg {
            GossipMessage::Ping {
                from,
                incarnation,
                http_addr,
            } => self.handle_ping(from, incarnation, http_addr, src).await,
            GossipMessage::Ack {
                from,
                incarnation,
                peers,
            } => self.handle_ack(from, incarnation, peers).await,
            GossipMessage::Join { peer } => self.handle_join(peer).await,
            GossipMessage::Suspect {
                peer_id,
                incarnation,
            } => self.handle_suspect(peer_id, incarnation).await,
            GossipMessage::Alive {
                peer_id,
                incarnation,
            } => {
                self.handle_alive(peer_id, incarnation);
                Ok(())
            }
        }
    }

    async fn handle_ping(
        &self,
        from: PeerId,
        from_incarnation: u64,
        from_http_addr: SocketAddr,
        src: SocketAddr,
    ) -> Result<()> {
        if let Some(mut peer) = self.peers.get_mut(&from) {
            peer.last_seen = Some(Instant::now());
            peer.http_addr = from_http_addr;
            if from_incarnation > peer.incarnation {
                peer.incarnation = from_incarnation;
            }
        } else {
            tracing::info!("Discovered new peer via ping: {:?} at {}", from, src);
            self.peers.insert(
                from.clone(),
                Peer {
                    id: from.clone(),
                    gossip_addr: src,
                    http_addr: from_http_addr,
                    state: PeerState::Alive,
                    incarnation: from_incarnation,
                    last_seen: Some(Instant::now()),
                },
            );
        }

        let view: Vec<Peer> = self
            .peers
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        let my_incarnation = *self.incarnation.read().await;
        let reply = GossipMessage::Ack {
            from: self.local_peer.id.clone(),
            incarnation: my_incarnation,
            peers: view,
        };
        let encoded = bincode::serialize(&reply)?;
        self.socket.send_to(&encoded, src).await?;

        Ok(())
    }

    async fn handle_ack(&self, from: PeerId, from_incarnation: u64, peers: Vec<Peer>) -> Result<()> {
        tracing::debug!(
            "Ack from {:?} (inc={}) with {} peers",
            from,
            from_incarnation,
            peers.len()
        );

        if let Some(mut peer) = self.peers.get_mut(&from) {
            if from_incarnation > peer.incarnation {
                peer.incarnation = from_incarnation;
            }
            peer.last_seen = Some(Instant::now());
        }

        for peer in peers {
            self.merge_peer(peer);
        }

        Ok(())
    }

    fn merge_peer(&self, incoming: Peer) {
        if incoming.id == self.local_peer.id {
            return;
        }
        match self.peers.get_mut(&incoming.id) {
            Some(mut existing) => {
                if incoming.incarnation > existing.incarnation {
                    existing.state = incoming.state;
                    existing.incarnation = incoming.incarnation;
                    existing.http_addr = incoming.http_addr;
                    existing.gossip_addr = incoming.gossip_addr;
                    existing.last_seen = Some(Instant::now());
                } else if incoming.incarnation == existing.incarnation {
                    // Addresses are facts, not disputed state; refresh them
                    // even when the incarnation has not advanced.
                    existing.gossip_addr = incoming.gossip_addr;
                    existing.http_addr = incoming.http_addr;
                    if incoming.state == PeerState::Alive
                        && existing.state == PeerState::Suspect
                    {
                        tracing::info!("{:?} refuted suspicion", incoming.id);
                        existing.state = PeerState::Alive;
                        existing.last_seen = Some(Instant::now());
                    }
                }
            }
            None => {
                tracing::info!(
                    "Discovered new peer: {:?} at {}",
                    incoming.id,
                    incoming.gossip_addr
                );
                let mut stamped = incoming;
                stamped.last_seen = Some(Instant::now());
                self.peers.insert(stamped.id.clone(), stamped);
            }
        }
    }

    async fn handle_suspect(&self, peer_id: PeerId, incarnation: u64) -> Result<()> {
        if peer_id == self.local_peer.id {
            // Refute: bump our incarnation and broadcast Alive.
            let my_incarnation = {
                let mut inc = self.incarnation.write().await;
                *inc += 1;
                *inc
            };
            tracing::info!("Refuting suspicion with incarnation {}", my_incarnation);
            if let Some(mut me) = self.peers.get_mut(&peer_id) {
                me.incarnation = my_incarnation;
                me.state = PeerState::Alive;
                me.last_seen = Some(Instant::now());
            }
            self.broadcast(GossipMessage::Alive {
                peer_id,
                incarnation: my_incarnation,
            })
            .await;
            return Ok(());
        }

        match self.peers.get_mut(&peer_id) {
            Some(mut existing) => {
                if incarnation >= existing.incarnation && existing.state == PeerState::Alive {
                    tracing::info!("Peer {:?} suspected", existing.id);
                    existing.state = PeerState::Suspect;
                    existing.incarnation = incarnation;
                }
            }
            None => {
                tracing::debug!("Suspect for unknown peer {:?}", peer_id);
            }
        }

        Ok(())
    }

    fn handle_alive(&self, peer_id: PeerId, incarnation: u64) {
        match self.peers.get_mut(&peer_id) {
            Some(mut existing) => {
                if incarnation > existing.incarnation
                    || (incarnation == existing.incarnation
                        && existing.state == PeerState::Suspect)
                {
                    tracing::info!("Peer {:?} is Alive (inc={})", existing.id, incarnation);
                    existing.state = PeerState::Alive;
                    existing.incarnation = incarnation;
                    existing.last_seen = Some(Instant::now());
                }
            }
            None => {
                tracing::debug!("Alive for unknown peer {:?}", peer_id);
            }
        }
    }

    async fn handle_join(&self, mut peer: Peer) -> Result<()> {
        tracing::info!("Peer {:?} joining cluster from {}", peer.id, peer.gossip_addr);
        peer.last_seen = Some(Instant::now());
        self.peers.insert(peer.id.clone(), peer);
        tracing::info!("Cluster size now: {}", self.peers.len());
        Ok(())
    }

    async fn failure_detection_loop(self: Arc<Self>) {
        let mut interval = tokio::time::interval(self.config.failure_check_interval);

        loop {
            interval.tick().await;
            let now = Instant::now();
            let mut suspicions = Vec::new();

            for mut entry in self.peers.iter_mut() {
                let peer = entry.value_mut();
                if peer.id == self.local_peer.id {
                    continue;
                }

                let Some(last_seen) = peer.last_seen else {
                    peer.last_seen = Some(now);
                    continue;
                };
                let silence = now.duration_since(last_seen);

                match peer.state {
                    PeerState::Alive if silence > self.config.suspect_after => {
                        tracing::warn!("Peer {:?} suspected ({:?} silent)", peer.id, silence);
                        peer.state = PeerState::Suspect;
                        suspicions.push(GossipMessage::Suspect {
                            peer_id: peer.id.clone(),
                            incarnation: peer.incarnation,
                        });
                    }
                    PeerState::Suspect if silence > self.config.dead_after => {
                        tracing::warn!("Peer {:?} declared dead ({:?} silent)", peer.id, silence);
                        peer.state = PeerState::Dead;
                    }
                    _ => {}
                }
            }

            for msg in suspicions {
                self.broadcast(msg).await;
            }
        }
    }

    async fn broadcast(&self, msg: GossipMessage) {
        let encoded = match bincode::serialize(&msg) {
            Ok(encoded) => encoded,
            Err(e) => {
                tracing::error!("Failed to serialize broadcast: {}", e);
                return;
            }
        };
        for entry in self.peers.iter() {
            let peer = entry.value();
            if peer.id == self.local_peer.id || peer.state != PeerState::Alive {
                continue;
            }
            if let Err(e) = self.socket.send_to(&encoded, peer.gossip_addr).await {
                tracing::warn!("Failed to broadcast to {:?}: {}", peer.id, e);
            }
        }
    }
}

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use session_cluster::config::{BackendKind, ClusterConfig, CoordinationConfig};
use session_cluster::coordination::local::LocalBackend;
use session_cluster::coordination::{BackendHandle, CoordinationBackend};
use session_cluster::expiry::ExpiryBridge;
use session_cluster::external::{ExternalStoreBackend, ExternalStoreConfig};
use session_cluster::membership::service::MembershipService;
use session_cluster::replicated::handlers;
use session_cluster::replicated::partitioner::PartitionManager;
use session_cluster::replicated::ReplicatedBackend;
use session_cluster::session::SessionStore;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    let args: Vec<String> = std::env::args().collect();

    if args.len() < 3 {
        eprintln!(
            "Usage: {} --backend <local|replicated-cluster|external-store> [options]",
            args[0]
        );
        eprintln!("Example: {} --backend local", args[0]);
        eprintln!(
            "Example: {} --backend replicated-cluster --bind 127.0.0.1:5000 [--seed 127.0.0.1:5001]",
            args[0]
        );
        eprintln!(
            "Example: {} --backend external-store --store-address http://coordinator:7400 [--store-token <token>]",
            args[0]
        );
        std::process::exit(1);
    }

    let mut backend_kind: Option<BackendKind> = None;
    let mut bind_addr: Option<SocketAddr> = None;
    let mut seed_nodes: Vec<SocketAddr> = vec![];
    let mut store_address: Option<String> = None;
    let mut store_token: Option<String> = None;
    let mut pool_size: usize = 8;
    let mut session_timeout = Duration::from_secs(30 * 60);

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--backend" => {
                backend_kind = Some(args[i + 1].parse()?);
                i += 2;
            }
            "--bind" => {
                bind_addr = Some(args[i + 1].parse()?);
                i += 2;
            }
            "--seed" => {
                seed_nodes.push(args[i + 1].parse()?);
                i += 2;
            }
            "--store-address" => {
                store_address = Some(args[i + 1].clone());
                i += 2;
            }
            "--store-token" => {
                store_token = Some(args[i + 1].clone());
                i += 2;
            }
            "--pool-size" => {
                pool_size = args[i + 1].parse()?;
                i += 2;
            }
            "--session-timeout-secs" => {
                session_timeout = Duration::from_secs(args[i + 1].parse()?);
                i += 2;
            }
            _ => {
                i += 1;
            }
        }
    }

    let backend_kind = backend_kind.expect("--backend is required");

    let mut config = CoordinationConfig::new(backend_kind);
    config.session_timeout = session_timeout;
    if let Some(bind) = bind_addr {
        // Internode HTTP rides on gossip port + 1000.
        let http_addr = SocketAddr::new(bind.ip(), bind.port() + 1000);
        config.cluster = Some(ClusterConfig {
            gossip_addr: bind,
            http_addr,
            seed_nodes: seed_nodes.clone(),
        });
    }
    if let Some(address) = store_address {
        config.external = Some(ExternalStoreConfig {
            address,
            auth_token: store_token,
            pool_size,
        });
    }
    config.validate()?;

    let backend: Arc<dyn CoordinationBackend> = match config.backend {
        BackendKind::Local => {
            tracing::info!("Starting with the in-process backend");
            LocalBackend::new()
        }
        BackendKind::ReplicatedCluster => {
            let cluster = config.cluster.clone().expect("validated above");
            tracing::info!("Starting cluster node on {}", cluster.gossip_addr);
            if cluster.seed_nodes.is_empty() {
                tracing::info!("Starting as seed node (founder)");
            } else {
                tracing::info!("Seed nodes: {:?}", cluster.seed_nodes);
            }

            let membership = MembershipService::new(
                cluster.gossip_addr,
                cluster.http_addr,
                cluster.seed_nodes.clone(),
            )
            .await?;
            tracing::info!("Node ID: {:?}", membership.local_peer.id);
            membership.clone().start().await;

            let partitioner = PartitionManager::new(membership.clone());
            let replicated = ReplicatedBackend::new(membership, partitioner);
            replicated.start();

            let listener = tokio::net::TcpListener::bind(cluster.http_addr).await?;
            tracing::info!("Internal HTTP listening on {}", cluster.http_addr);
            let app = handlers::router(replicated.clone());
            tokio::spawn(async move {
                if let Err(e) = axum::serve(listener, app).await {
                    tracing::error!("Internal HTTP server failed: {}", e);
                }
            });

            let stats_membership = replicated.membership.clone();
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(Duration::from_secs(5));
                loop {
                    interval.tick().await;
                    let alive = stats_membership.get_alive_peers();
                    tracing::info!("Cluster stats: {} alive node(s)", alive.len());
                    for peer in alive {
                        tracing::info!(
                            "  - {:?} gossip={} http={} (inc={})",
                            peer.id,
                            peer.gossip_addr,
                            peer.http_addr,
                            peer.incarnation
                        );
                    }
                }
            });

            if !cluster.seed_nodes.is_empty() {
                // Pull the partitions we back up from their primaries.
                let joiner = replicated.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(Duration::from_secs(2)).await;
                    joiner.sync_from_primaries().await;
                });
            }

            replicated
        }
        BackendKind::ExternalStore => {
            let external = config.external.clone().expect("validated above");
            tracing::info!("Connecting to external store at {}", external.address);
            let backend = ExternalStoreBackend::new(external)?;
            backend.check_connection().await?;
            backend.start();
            backend
        }
    };

    let handle = BackendHandle::new(backend);
    let bridge = ExpiryBridge::new(handle.clone());
    let sessions = Arc::new(SessionStore::new(handle.clone(), config.session_timeout));

    // Surface expirations in the log until a domain sink is attached.
    let mut expiry_feed = bridge.subscribe();
    tokio::spawn(async move {
        while let Some(event) = expiry_feed.recv().await {
            tracing::info!("entry '{}' expired in map '{}'", event.key, event.map);
        }
    });

    let stats_sessions = sessions.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(30));
        loop {
            interval.tick().await;
            match stats_sessions.size().await {
                Ok(count) => tracing::info!("Session stats: {} live session(s)", count),
                Err(e) => tracing::warn!("Session stats unavailable: {}", e),
            }
        }
    });

    tracing::info!("Press Ctrl+C to shutdown");
    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutting down");

    Ok(())
}

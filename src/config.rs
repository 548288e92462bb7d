//! Node Configuration
//!
//! Backend selection plus the per-backend connection settings, validated
//! before anything starts. The external-store connection can be replaced
//! at runtime through [`reconfigure_external`]; a replacement that fails
//! to come up leaves the previous backend untouched.

use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use crate::coordination::error::CoordinationError;
use crate::coordination::BackendHandle;
use crate::external::{ExternalStoreBackend, ExternalStoreConfig};

/// Which coordination backend the process group runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    Local,
    ReplicatedCluster,
    ExternalStore,
}

impl FromStr for BackendKind {
    type Err = CoordinationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "local" => Ok(BackendKind::Local),
            "replicated-cluster" => Ok(BackendKind::ReplicatedCluster),
            "external-store" => Ok(BackendKind::ExternalStore),
            other => Err(CoordinationError::Configuration(format!(
                "unknown backend '{}', expected local | replicated-cluster | external-store",
                other
            ))),
        }
    }
}

/// Settings for the replicated-cluster backend.
#[derive(Debug, Clone)]
pub struct ClusterConfig {
    /// UDP gossip bind address.
    pub gossip_addr: SocketAddr,
    /// Internal HTTP bind address for internode traffic.
    pub http_addr: SocketAddr,
    pub seed_nodes: Vec<SocketAddr>,
}

/// Full coordination configuration of one node.
#[derive(Debug, Clone)]
pub struct CoordinationConfig {
    pub backend: BackendKind,
    pub cluster: Option<ClusterConfig>,
    pub external: Option<ExternalStoreConfig>,
    /// Idle timeout for HTTP sessions.
    pub session_timeout: Duration,
    /// Lifetime of stored games; hot-reloadable after startup.
    pub game_lifetime: Duration,
}

impl CoordinationConfig {
    pub fn new(backend: BackendKind) -> Self {
        Self {
            backend,
            cluster: None,
            external: None,
            session_timeout: Duration::from_secs(30 * 60),
            game_lifetime: Duration::from_secs(60 * 60),
        }
    }

    /// Rejects configurations missing the selected backend's settings.
    /// Fatal at startup by design.
    pub fn validate(&self) -> Result<(), CoordinationError> {
        match self.backend {
            BackendKind::Local => Ok(()),
            BackendKind::ReplicatedCluster => match &self.cluster {
                Some(_) => Ok(()),
                None => Err(CoordinationError::Configuration(
                    "replicated-cluster backend needs --bind".into(),
                )),
            },
            BackendKind::ExternalStore => match &self.external {
                Some(external) if !external.address.is_empty() => {
                    if external.pool_size == 0 {
                        return Err(CoordinationError::Configuration(
                            "external store pool size must be at least 1".into(),
                        ));
                    }
                    Ok(())
                }
                _ => Err(CoordinationError::Configuration(
                    "external-store backend needs --store-address".into(),
                )),
            },
        }
    }
}

/// Swaps the active backend to a freshly connected external store.
///
/// The replacement is built and probed first; if it cannot be reached, the
/// previously functioning backend stays in place and the error is
/// surfaced to the caller after logging.
pub async fn reconfigure_external(
    handle: &BackendHandle,
    config: ExternalStoreConfig,
) -> Result<(), CoordinationError> {
    let replacement = ExternalStoreBackend::new(config)?;
    if let Err(e) = replacement.check_connection().await {
        tracing::error!("external store reconfiguration failed, keeping current backend: {}", e);
        return Err(e);
    }
    replacement.start();
    handle.swap(replacement);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordination::local::LocalBackend;
    use crate::coordination::types::Ttl;

    #[test]
    fn test_backend_kind_parses() {
        assert_eq!("local".parse::<BackendKind>().unwrap(), BackendKind::Local);
        assert_eq!(
            "replicated-cluster".parse::<BackendKind>().unwrap(),
            BackendKind::ReplicatedCluster
        );
        assert_eq!(
            "external-store".parse::<BackendKind>().unwrap(),
            BackendKind::ExternalStore
        );
        assert!("hazelcast".parse::<BackendKind>().is_err());
    }

    #[test]
    fn test_validate_requires_backend_settings() {
        assert!(CoordinationConfig::new(BackendKind::Local).validate().is_ok());

        let cluster_less = CoordinationConfig::new(BackendKind::ReplicatedCluster);
        assert!(cluster_less.validate().is_err());

        let store_less = CoordinationConfig::new(BackendKind::ExternalStore);
        assert!(store_less.validate().is_err());

        let mut zero_pool = CoordinationConfig::new(BackendKind::ExternalStore);
        zero_pool.external = Some(ExternalStoreConfig {
            address: "http://coordinator:7400".to_string(),
            auth_token: None,
            pool_size: 0,
        });
        assert!(zero_pool.validate().is_err());

        let mut valid = zero_pool;
        if let Some(external) = &mut valid.external {
            external.pool_size = 8;
        }
        assert!(valid.validate().is_ok());
    }

    #[tokio::test]
    async fn test_failed_reconfiguration_keeps_old_backend() {
        let handle = BackendHandle::new(LocalBackend::new());
        let map = handle.map("lobby", None);
        map.put("k", b"v".to_vec(), Ttl::None).await.unwrap();

        // Nothing listens here, so the probe fails and nothing is swapped.
        let result = reconfigure_external(
            &handle,
            ExternalStoreConfig {
                address: "http://127.0.0.1:1".to_string(),
                auth_token: None,
                pool_size: 2,
            },
        )
        .await;
        assert!(result.is_err());

        let map = handle.map("lobby", None);
        assert_eq!(map.get("k").await.unwrap(), Some(b"v".to_vec()));
    }
}

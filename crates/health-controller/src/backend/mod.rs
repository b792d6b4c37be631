//! Store and registry backends.

pub mod etcd;
pub mod memory;

pub use etcd::{EtcdRegistry, EtcdStore};
pub use memory::{MemoryRegistry, MemoryStore};

use crate::discovery::Registry;
use crate::store::CoordinationStore;
use crate::types::{Backend, ServerConfig};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Open the configured coordination store
pub async fn open_store(config: &ServerConfig) -> common::Result<Arc<dyn CoordinationStore>> {
    match config.store_backend {
        Backend::Memory => Ok(Arc::new(MemoryStore::new())),
        Backend::Etcd => {
            let store = EtcdStore::connect(&config.store_endpoints, &config.tls, config.store_timeout)
                .await
                .map_err(common::Error::store)?;
            Ok(Arc::new(store))
        }
    }
}

/// Open the configured registry; registrations end with `scope`
pub async fn open_registry(
    config: &ServerConfig,
    scope: CancellationToken,
) -> common::Result<Arc<dyn Registry>> {
    match config.discovery_backend {
        Backend::Memory => Ok(Arc::new(MemoryRegistry::new())),
        Backend::Etcd => {
            let registry = EtcdRegistry::connect(
                &config.discovery_endpoints,
                &config.tls,
                config.lease_ttl,
                scope,
            )
            .await
            .map_err(common::Error::discovery)?;
            Ok(Arc::new(registry))
        }
    }
}

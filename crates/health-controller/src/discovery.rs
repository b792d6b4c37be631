//! Registry capability used for registration, leader election and
//! scheduler discovery.

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

/// One registration under a watched path
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryEntry {
    /// Full registration key
    pub key: String,
    pub value: Vec<u8>,
}

/// Registry errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DiscoveryError {
    #[error("registry backend error: {0}")]
    Backend(String),

    #[error("registry watch closed")]
    Closed,

    #[error("own registration {0} is missing")]
    SelfMissing(String),

    #[error("failed to decode registration {key}: {reason}")]
    Decode { key: String, reason: String },
}

/// Ordered entry lists from a registry watch.
///
/// Each item is the full list of direct children of the watched path in
/// registration order. An `Err` item ends the watch.
pub type EntryStream = mpsc::Receiver<Result<Vec<RegistryEntry>, DiscoveryError>>;

/// Capability interface over the registry service
#[async_trait]
pub trait Registry: Send + Sync {
    /// Register `value` under `key`, bound to this process' session
    async fn register(&self, key: &str, value: Vec<u8>) -> Result<(), DiscoveryError>;

    /// Watch the direct children of `path`
    async fn watch(&self, path: &str) -> Result<EntryStream, DiscoveryError>;
}

/// Whether `key` is a direct child of `path`
pub fn is_direct_child(path: &str, key: &str) -> bool {
    let prefix = format!("{}/", path.trim_end_matches('/'));
    key.strip_prefix(&prefix)
        .is_some_and(|rest| !rest.is_empty() && !rest.contains('/'))
}

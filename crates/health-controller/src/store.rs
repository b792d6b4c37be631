//! Hierarchical coordination store capability.
//!
//! The store is a tree of nodes addressed by slash-separated paths. Reads can
//! leave a one-shot watch behind that resolves on the next change of the node
//! (value watch) or of its child list (children watch).

use async_trait::async_trait;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::oneshot;

/// Event delivered by a one-shot watch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreEvent {
    NodeCreated,
    NodeDeleted,
    DataChanged,
    ChildrenChanged,
    /// Session state change, carries no node change
    Session,
    /// The store stopped watching; the watch cannot be re-armed from here
    NotWatching,
}

/// Pending one-shot watch.
///
/// A dropped sender reads as [`StoreEvent::NotWatching`].
pub struct StoreWatch(oneshot::Receiver<StoreEvent>);

impl StoreWatch {
    pub fn new(rx: oneshot::Receiver<StoreEvent>) -> Self {
        Self(rx)
    }

    /// Watch and the sender that fires it
    pub fn channel() -> (oneshot::Sender<StoreEvent>, Self) {
        let (tx, rx) = oneshot::channel();
        (tx, Self(rx))
    }

    /// Wait for the event
    pub async fn event(&mut self) -> StoreEvent {
        (&mut self.0).await.unwrap_or(StoreEvent::NotWatching)
    }
}

/// Store errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("node {0} does not exist")]
    NoNode(String),

    #[error("store request for {0} timed out")]
    Timeout(String),

    #[error("store backend error: {0}")]
    Backend(String),
}

/// Capability interface over the coordination store
#[async_trait]
pub trait CoordinationStore: Send + Sync {
    /// Whether `path` exists
    async fn exists(&self, path: &str) -> Result<bool, StoreError>;

    /// Value of `path` and a watch on its next change
    async fn get_watch(&self, path: &str) -> Result<(Vec<u8>, StoreWatch), StoreError>;

    /// Child names of `path` and a watch on the next change of that list
    async fn children_watch(&self, path: &str) -> Result<(Vec<String>, StoreWatch), StoreError>;
}

/// Bound a store request by `limit`
pub async fn with_timeout<T, F>(limit: Duration, path: &str, request: F) -> Result<T, StoreError>
where
    F: Future<Output = Result<T, StoreError>>,
{
    tokio::time::timeout(limit, request)
        .await
        .map_err(|_| StoreError::Timeout(path.to_string()))?
}

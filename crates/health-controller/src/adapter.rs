//! Cluster adapter: binds a task watch tree to one cluster manager flavour.

use crate::metrics::MetricsRegistry;
use crate::store::CoordinationStore;
use crate::types::SyncEvent;
use crate::watch_tree::TaskWatchTree;
use healthcheck::types::TaskMode;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Tags tree events with the cluster's task mode and forwards them
pub struct ClusterAdapter {
    tree: Arc<TaskWatchTree>,
    mode: TaskMode,
    tree_rx: Option<mpsc::Receiver<SyncEvent>>,
    out: mpsc::Sender<SyncEvent>,
    scope: CancellationToken,
}

impl ClusterAdapter {
    pub fn new(
        store: Arc<dyn CoordinationStore>,
        root: impl Into<String>,
        mode: TaskMode,
        out: mpsc::Sender<SyncEvent>,
        scope: CancellationToken,
        read_timeout: Duration,
        metrics: Option<Arc<MetricsRegistry>>,
    ) -> Self {
        let (tree_tx, tree_rx) = mpsc::channel(out.max_capacity());
        let tree = TaskWatchTree::new(store, root, tree_tx, scope.clone())
            .with_read_timeout(read_timeout)
            .with_metrics(metrics);
        Self {
            tree: Arc::new(tree),
            mode,
            tree_rx: Some(tree_rx),
            out,
            scope,
        }
    }

    pub fn tree(&self) -> &Arc<TaskWatchTree> {
        &self.tree
    }

    /// Spawn the tree and the forwarder. A second call is a no-op.
    pub fn start(&mut self) -> Vec<JoinHandle<()>> {
        let Some(rx) = self.tree_rx.take() else {
            return Vec::new();
        };
        info!(root = %self.tree.root(), mode = %self.mode, "Starting cluster adapter");

        vec![
            tokio::spawn(self.tree.clone().run()),
            tokio::spawn(forward(rx, self.out.clone(), self.mode, self.scope.clone())),
        ]
    }
}

async fn forward(
    mut rx: mpsc::Receiver<SyncEvent>,
    out: mpsc::Sender<SyncEvent>,
    mode: TaskMode,
    scope: CancellationToken,
) {
    loop {
        let mut event = tokio::select! {
            _ = scope.cancelled() => break,
            event = rx.recv() => match event {
                Some(event) => event,
                None => break,
            },
        };
        event.def.task_mode = mode;
        event.def.reporter_mode = mode.reporter_mode();

        tokio::select! {
            _ = scope.cancelled() => break,
            sent = out.send(event) => {
                if sent.is_err() {
                    break;
                }
            }
        }
    }
    debug!(mode = %mode, "Cluster adapter forwarder stopped");
}

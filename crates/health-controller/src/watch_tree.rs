//! Recursive watcher mirroring the task tree of the coordination store.
//!
//! The tree below the root is `application / namespace / appname / taskgroup
//! / task`. Every watched path owns one cache entry and one cancellation scope
//! derived from its parent's scope, so deleting a node tears down its whole
//! subtree. Task nodes carry the health checks parsed from their payload;
//! changes to that list are emitted as [`SyncEvent`]s.
//!
//! Each watched node runs a value watch (deletion, payload changes, a periodic
//! existence check) and, unless it is a task, a children watch that starts
//! watching newly seen children. The value watch is the only place a node is
//! evicted from the cache.

use crate::metrics::MetricsRegistry;
use crate::store::{CoordinationStore, StoreError, StoreEvent, StoreWatch, with_timeout};
use crate::supervisor::{BackoffPolicy, Exit, Supervisor};
use crate::task::health_checks_from_task;
use crate::types::{SyncEvent, join_path};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures::future::BoxFuture;
use healthcheck::types::HealthCheckDef;
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::{Instant, interval_at, sleep};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Poll period while waiting for the root to exist
pub const ROOT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Period of the safety existence check and of children re-listing
pub const EXISTENCE_POLL_INTERVAL: Duration = Duration::from_secs(60);

/// Bound on an existence check
pub const EXISTS_TIMEOUT: Duration = Duration::from_secs(5);

/// Default bound on value and children reads
pub const READ_TIMEOUT: Duration = Duration::from_secs(10);

/// Level of a node in the task tree
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeKind {
    Application,
    Namespace,
    Appname,
    Taskgroup,
    Task,
}

impl NodeKind {
    /// Kind of this node's children; `None` for leaves
    pub fn child(self) -> Option<NodeKind> {
        match self {
            NodeKind::Application => Some(NodeKind::Namespace),
            NodeKind::Namespace => Some(NodeKind::Appname),
            NodeKind::Appname => Some(NodeKind::Taskgroup),
            NodeKind::Taskgroup => Some(NodeKind::Task),
            NodeKind::Task => None,
        }
    }

    pub fn is_leaf(self) -> bool {
        self.child().is_none()
    }
}

impl fmt::Display for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            NodeKind::Application => "application",
            NodeKind::Namespace => "namespace",
            NodeKind::Appname => "appname",
            NodeKind::Taskgroup => "taskgroup",
            NodeKind::Task => "task",
        };
        f.write_str(name)
    }
}

/// Watch tree errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WatchError {
    #[error("{0} is already watched")]
    AlreadyWatching(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

struct WatchNode {
    kind: NodeKind,
    /// Last parsed checks, only ever non-empty for tasks
    defs: Vec<HealthCheckDef>,
    scope: CancellationToken,
}

/// Keeps a flat set of health checks in sync with a subtree of the store
pub struct TaskWatchTree {
    store: Arc<dyn CoordinationStore>,
    root: String,
    events: mpsc::Sender<SyncEvent>,
    cache: DashMap<String, WatchNode>,
    scope: CancellationToken,
    read_timeout: Duration,
    metrics: Option<Arc<MetricsRegistry>>,
}

impl TaskWatchTree {
    /// Watch the `application` node at `root`, sending diffs to `events`
    pub fn new(
        store: Arc<dyn CoordinationStore>,
        root: impl Into<String>,
        events: mpsc::Sender<SyncEvent>,
        scope: CancellationToken,
    ) -> Self {
        Self {
            store,
            root: root.into(),
            events,
            cache: DashMap::new(),
            scope,
            read_timeout: READ_TIMEOUT,
            metrics: None,
        }
    }

    pub fn with_read_timeout(mut self, read_timeout: Duration) -> Self {
        self.read_timeout = read_timeout;
        self
    }

    pub fn with_metrics(mut self, metrics: Option<Arc<MetricsRegistry>>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn root(&self) -> &str {
        &self.root
    }

    pub fn is_watching(&self, path: &str) -> bool {
        self.cache.contains_key(path)
    }

    pub fn watched_paths(&self) -> Vec<String> {
        let mut paths: Vec<_> = self.cache.iter().map(|e| e.key().clone()).collect();
        paths.sort();
        paths
    }

    /// Kind and cached checks of a watched path
    pub fn node(&self, path: &str) -> Option<(NodeKind, Vec<HealthCheckDef>)> {
        self.cache
            .get(path)
            .map(|node| (node.kind, node.defs.clone()))
    }

    /// Seed the root and keep it watched until the tree scope ends.
    ///
    /// A root that disappears is waited for and re-seeded.
    pub async fn run(self: Arc<Self>) {
        info!(root = %self.root, "Task watch tree started");

        loop {
            if !self.wait_for_root().await {
                break;
            }

            match self
                .watch_node(self.root.clone(), NodeKind::Application, self.scope.clone())
                .await
            {
                Ok(()) | Err(WatchError::AlreadyWatching(_)) => {}
                Err(e) => {
                    warn!(root = %self.root, error = %e, "Failed to watch root");
                    if !self.pause(ROOT_POLL_INTERVAL).await {
                        break;
                    }
                    continue;
                }
            }

            let root_scope = self.cache.get(&self.root).map(|node| node.scope.clone());
            if let Some(root_scope) = root_scope {
                tokio::select! {
                    _ = self.scope.cancelled() => break,
                    _ = root_scope.cancelled() => {
                        warn!(root = %self.root, "Root node no longer watched, re-seeding");
                    }
                }
            }

            if !self.pause(ROOT_POLL_INTERVAL).await {
                break;
            }
        }

        info!(root = %self.root, "Task watch tree stopped");
    }

    /// Start watching `path`.
    ///
    /// The node's scope derives from its parent's when the parent is watched.
    pub async fn watch_data(self: &Arc<Self>, path: &str, kind: NodeKind) -> Result<(), WatchError> {
        let parent = path
            .rsplit_once('/')
            .and_then(|(parent, _)| self.cache.get(parent).map(|node| node.scope.clone()))
            .unwrap_or_else(|| self.scope.clone());
        self.watch_node(path.to_string(), kind, parent).await
    }

    fn watch_node(
        self: &Arc<Self>,
        path: String,
        kind: NodeKind,
        parent: CancellationToken,
    ) -> BoxFuture<'static, Result<(), WatchError>> {
        let tree = self.clone();
        Box::pin(async move {
            let scope = parent.child_token();
            match tree.cache.entry(path.clone()) {
                Entry::Occupied(_) => return Err(WatchError::AlreadyWatching(path)),
                Entry::Vacant(slot) => {
                    slot.insert(WatchNode {
                        kind,
                        defs: Vec::new(),
                        scope: scope.clone(),
                    });
                }
            }

            let (data, watch) = match tree.read_value(&path).await {
                Ok(pair) => pair,
                Err(e) => {
                    tree.cache.remove(&path);
                    return Err(e.into());
                }
            };
            tree.update_gauge();

            if kind == NodeKind::Task {
                let defs = tree.parse_task(&path, &data);
                if let Some(mut node) = tree.cache.get_mut(&path) {
                    node.defs = defs.clone();
                }
                for def in defs {
                    tree.emit(SyncEvent::add(def)).await;
                }
            }

            debug!(path = %path, kind = %kind, "Watching node");
            tokio::spawn(tree.clone().value_watch(path.clone(), kind, scope.clone(), watch));
            if !kind.is_leaf() {
                tokio::spawn(tree.clone().children_watch(path, kind, scope));
            }
            Ok(())
        })
    }

    async fn value_watch(
        self: Arc<Self>,
        path: String,
        kind: NodeKind,
        scope: CancellationToken,
        mut watch: StoreWatch,
    ) {
        let mut poll = interval_at(
            Instant::now() + EXISTENCE_POLL_INTERVAL,
            EXISTENCE_POLL_INTERVAL,
        );

        loop {
            let event = tokio::select! {
                _ = scope.cancelled() => break,
                event = watch.event() => event,
                _ = poll.tick() => {
                    if let Ok(false) = self.exists(&path).await {
                        warn!(path = %path, "Node missing on existence check");
                        scope.cancel();
                    }
                    continue;
                }
            };

            match event {
                StoreEvent::NodeDeleted => {
                    debug!(path = %path, "Node deleted");
                    scope.cancel();
                    break;
                }
                StoreEvent::NotWatching => {
                    warn!(path = %path, "Store stopped watching node");
                    scope.cancel();
                    break;
                }
                StoreEvent::DataChanged
                | StoreEvent::NodeCreated
                | StoreEvent::ChildrenChanged
                | StoreEvent::Session => {}
            }

            match self.rearm_value(&path, &scope).await {
                Some((data, next)) => {
                    if event == StoreEvent::DataChanged && kind == NodeKind::Task {
                        self.apply_payload(&path, &data).await;
                    }
                    watch = next;
                }
                None => {
                    scope.cancel();
                    break;
                }
            }
        }

        self.evict(&path).await;
    }

    async fn children_watch(
        self: Arc<Self>,
        path: String,
        kind: NodeKind,
        scope: CancellationToken,
    ) {
        let Some(child_kind) = kind.child() else {
            return;
        };
        let mut rescan = interval_at(
            Instant::now() + EXISTENCE_POLL_INTERVAL,
            EXISTENCE_POLL_INTERVAL,
        );

        loop {
            let (children, mut watch) = match self.rearm_children(&path, &scope).await {
                Some(pair) => pair,
                None => return,
            };

            for child in children {
                let child_path = join_path(&path, &child);
                if self.cache.contains_key(&child_path) {
                    continue;
                }
                match self
                    .watch_node(child_path.clone(), child_kind, scope.clone())
                    .await
                {
                    Ok(()) | Err(WatchError::AlreadyWatching(_)) => {}
                    Err(e) => warn!(path = %child_path, error = %e, "Failed to watch child"),
                }
            }

            tokio::select! {
                _ = scope.cancelled() => return,
                event = watch.event() => match event {
                    StoreEvent::NodeDeleted => return,
                    StoreEvent::NotWatching => {
                        warn!(path = %path, "Store stopped watching children");
                        scope.cancel();
                        return;
                    }
                    _ => {}
                },
                // Pick up children whose watch ended without a store event
                _ = rescan.tick() => {}
            }
        }
    }

    /// Re-read the node value; `None` once it is gone or unreadable
    async fn rearm_value(
        &self,
        path: &str,
        scope: &CancellationToken,
    ) -> Option<(Vec<u8>, StoreWatch)> {
        let supervisor = self.rearm_supervisor(scope);
        let outcome = supervisor
            .run(|| async {
                match self.read_value(path).await {
                    Ok(pair) => Ok(Some(pair)),
                    Err(StoreError::NoNode(_)) => Ok(None),
                    Err(e) => Err(e),
                }
            })
            .await;
        self.settle(path, outcome)
    }

    /// Re-list children; `None` once the node is gone or unreadable
    async fn rearm_children(
        &self,
        path: &str,
        scope: &CancellationToken,
    ) -> Option<(Vec<String>, StoreWatch)> {
        let supervisor = self.rearm_supervisor(scope);
        let outcome = supervisor
            .run(|| async {
                let request = self.store.children_watch(path);
                match with_timeout(self.read_timeout, path, request).await {
                    Ok(pair) => Ok(Some(pair)),
                    Err(StoreError::NoNode(_)) => Ok(None),
                    Err(e) => Err(e),
                }
            })
            .await;
        self.settle(path, outcome)
    }

    fn rearm_supervisor(&self, scope: &CancellationToken) -> Supervisor {
        Supervisor::new(
            "watch-rearm",
            BackoffPolicy::exponential(Duration::from_secs(1), Duration::from_secs(30)).bounded(5),
            scope.clone(),
        )
        .with_metrics(self.metrics.clone())
    }

    fn settle<T>(&self, path: &str, outcome: Result<Option<T>, Exit<StoreError>>) -> Option<T> {
        match outcome {
            Ok(found) => found,
            Err(Exit::Cancelled) => None,
            Err(Exit::Exhausted(e)) => {
                error!(path = %path, error = %e, "Giving up on node watch");
                None
            }
        }
    }

    async fn read_value(&self, path: &str) -> Result<(Vec<u8>, StoreWatch), StoreError> {
        with_timeout(self.read_timeout, path, self.store.get_watch(path)).await
    }

    async fn exists(&self, path: &str) -> Result<bool, StoreError> {
        with_timeout(EXISTS_TIMEOUT, path, self.store.exists(path)).await
    }

    async fn wait_for_root(&self) -> bool {
        loop {
            match self.exists(&self.root).await {
                Ok(true) => return true,
                Ok(false) => debug!(root = %self.root, "Waiting for root to exist"),
                Err(e) => warn!(root = %self.root, error = %e, "Failed to check root"),
            }
            if !self.pause(ROOT_POLL_INTERVAL).await {
                return false;
            }
        }
    }

    /// Sleep unless the tree scope ends first
    async fn pause(&self, duration: Duration) -> bool {
        tokio::select! {
            _ = self.scope.cancelled() => false,
            _ = sleep(duration) => true,
        }
    }

    fn parse_task(&self, path: &str, data: &[u8]) -> Vec<HealthCheckDef> {
        match health_checks_from_task(data) {
            Ok(defs) => defs,
            Err(e) => {
                error!(path = %path, error = %e, "Dropping task");
                Vec::new()
            }
        }
    }

    /// Diff a new task payload against the cache and emit the changes
    async fn apply_payload(&self, path: &str, data: &[u8]) {
        let defs = self.parse_task(path, data);
        let previous = {
            let Some(mut node) = self.cache.get_mut(path) else {
                return;
            };
            if node.defs == defs {
                return;
            }
            std::mem::replace(&mut node.defs, defs.clone())
        };

        let before: HashSet<&str> = previous.iter().map(|d| d.id.as_str()).collect();
        let after: HashSet<&str> = defs.iter().map(|d| d.id.as_str()).collect();

        let mut events = Vec::with_capacity(defs.len() + previous.len());
        for def in &defs {
            if before.contains(def.id.as_str()) {
                events.push(SyncEvent::update(def.clone()));
            } else {
                events.push(SyncEvent::add(def.clone()));
            }
        }
        for def in &previous {
            if !after.contains(def.id.as_str()) {
                events.push(SyncEvent::delete(def.clone()));
            }
        }

        info!(path = %path, checks = defs.len(), "Task health checks changed");
        for event in events {
            self.emit(event).await;
        }
    }

    /// Drop `path` from the cache, retracting its checks unless shutting down
    async fn evict(&self, path: &str) {
        let Some((_, node)) = self.cache.remove(path) else {
            return;
        };
        self.update_gauge();
        debug!(path = %path, kind = %node.kind, "Stopped watching node");

        if self.scope.is_cancelled() {
            return;
        }
        for def in node.defs {
            self.emit(SyncEvent::delete(def)).await;
        }
    }

    async fn emit(&self, event: SyncEvent) {
        tokio::select! {
            _ = self.scope.cancelled() => {}
            sent = self.events.send(event) => {
                if sent.is_err() {
                    debug!(root = %self.root, "Sync event queue closed");
                }
            }
        }
    }

    fn update_gauge(&self) {
        if let Some(ref m) = self.metrics {
            m.set_watched_nodes(self.cache.len());
        }
    }
}

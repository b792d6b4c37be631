//! Registration based leader election.
//!
//! Every instance registers the same identity blob under its module and its
//! cluster, then watches the cluster's registrations. The instance owning the
//! first registration is master and runs the dispatcher and the cluster
//! adapter inside a scope that is cancelled on demotion.

use crate::adapter::ClusterAdapter;
use crate::discovery::{DiscoveryError, Registry, RegistryEntry};
use crate::dispatcher::{CheckerFactory, Dispatcher, ReportTarget};
use crate::metrics::MetricsRegistry;
use crate::sink::ReportSink;
use crate::store::CoordinationStore;
use crate::supervisor::{BackoffPolicy, Exit, Supervisor};
use crate::types::{ServerConfig, ServerInfo, join_path};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Delay before the election loop restarts after an error
pub const ELECTION_RETRY_DELAY: Duration = Duration::from_secs(3);

/// Election outcome for this instance
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Slave,
    Master,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Slave => write!(f, "slave"),
            Role::Master => write!(f, "master"),
        }
    }
}

/// Whether `self_key` owns the first registration
pub fn is_master(entries: &[RegistryEntry], self_key: &str) -> bool {
    entries.first().is_some_and(|entry| entry.key == self_key)
}

struct MasterState {
    scope: CancellationToken,
    dispatcher: Arc<Dispatcher>,
    adapter: ClusterAdapter,
}

/// Runs the election and the master-only components
pub struct ElectedServer {
    config: ServerConfig,
    info: ServerInfo,
    store: Arc<dyn CoordinationStore>,
    registry: Arc<dyn Registry>,
    sink: Arc<ReportSink>,
    metrics: Option<Arc<MetricsRegistry>>,
    checkers: Option<CheckerFactory>,
    role: watch::Sender<Role>,
    master: Mutex<Option<MasterState>>,
}

impl ElectedServer {
    pub fn new(
        config: ServerConfig,
        info: ServerInfo,
        store: Arc<dyn CoordinationStore>,
        registry: Arc<dyn Registry>,
        sink: Arc<ReportSink>,
        metrics: Option<Arc<MetricsRegistry>>,
    ) -> Self {
        let (role, _) = watch::channel(Role::Slave);
        Self {
            config,
            info,
            store,
            registry,
            sink,
            metrics,
            checkers: None,
            role,
            master: Mutex::new(None),
        }
    }

    /// Hand `factory` to every dispatcher created on promotion
    pub fn with_checker_factory(mut self, factory: CheckerFactory) -> Self {
        self.checkers = Some(factory);
        self
    }

    /// Key of the module-scope registration
    pub fn module_key(&self) -> String {
        join_path(&self.config.module_path(), &self.info.instance_name())
    }

    /// Key of the cluster-scope registration, the one elections compare
    pub fn cluster_key(&self) -> String {
        join_path(&self.config.cluster_path(), &self.info.instance_name())
    }

    pub fn role(&self) -> Role {
        *self.role.borrow()
    }

    pub fn subscribe_role(&self) -> watch::Receiver<Role> {
        self.role.subscribe()
    }

    pub fn sink(&self) -> &Arc<ReportSink> {
        &self.sink
    }

    /// Dispatcher of the current master term
    pub fn dispatcher(&self) -> Option<Arc<Dispatcher>> {
        self.lock_master().as_ref().map(|m| m.dispatcher.clone())
    }

    /// Store paths watched during the current master term
    pub fn watched_paths(&self) -> Vec<String> {
        self.lock_master()
            .as_ref()
            .map(|m| m.adapter.tree().watched_paths())
            .unwrap_or_default()
    }

    /// Run discovery and the election until `scope` ends
    pub async fn run(self: Arc<Self>, scope: CancellationToken) {
        info!(
            cluster = %self.config.cluster_id,
            instance = %self.info.instance_name(),
            "Starting elected server"
        );

        let sink = self.sink.clone();
        let sink_scope = scope.clone();
        let sink_task = tokio::spawn(async move { sink.run(sink_scope).await });

        let supervisor = Supervisor::new(
            "election",
            BackoffPolicy::fixed(ELECTION_RETRY_DELAY),
            scope.clone(),
        )
        .with_metrics(self.metrics.clone());
        match supervisor.run(|| self.elect(&scope)).await {
            Ok(()) => debug!("Election ended"),
            Err(Exit::Cancelled) => debug!("Election cancelled"),
            Err(Exit::Exhausted(e)) => warn!(error = %e, "Election gave up"),
        }

        self.demote();
        if let Err(e) = sink_task.await {
            warn!(error = %e, "Scheduler discovery task failed");
        }
        info!("Elected server stopped");
    }

    /// One registration and watch session; returns `Ok` only when cancelled
    async fn elect(&self, scope: &CancellationToken) -> Result<(), DiscoveryError> {
        let blob =
            serde_json::to_vec(&self.info).map_err(|e| DiscoveryError::Backend(e.to_string()))?;
        let module_key = self.module_key();
        let cluster_key = self.cluster_key();

        futures::try_join!(
            self.registry.register(&module_key, blob.clone()),
            self.registry.register(&cluster_key, blob),
        )?;
        info!(module_key = %module_key, cluster_key = %cluster_key, "Registered instance");

        let mut siblings = self.registry.watch(&self.config.cluster_path()).await?;
        loop {
            let entries = tokio::select! {
                _ = scope.cancelled() => return Ok(()),
                update = siblings.recv() => match update {
                    Some(Ok(entries)) => entries,
                    Some(Err(e)) => return Err(e),
                    None => return Err(DiscoveryError::Closed),
                },
            };

            if !entries.iter().any(|entry| entry.key == cluster_key) {
                self.demote();
                return Err(DiscoveryError::SelfMissing(cluster_key));
            }

            debug!(
                instances = entries.len(),
                first = %entries[0].key,
                "Cluster registrations changed"
            );
            if is_master(&entries, &cluster_key) {
                self.promote(scope);
            } else {
                self.demote();
            }
        }
    }

    fn promote(&self, scope: &CancellationToken) {
        let mut master = self.lock_master();
        if master.as_ref().is_some_and(|m| !m.scope.is_cancelled()) {
            return;
        }

        let term = scope.child_token();
        let target: Arc<dyn ReportTarget> = self.sink.clone();
        let mut dispatcher = Dispatcher::new(
            target,
            term.clone(),
            self.config.event_queue,
            self.config.report_queue,
            self.metrics.clone(),
        );
        if let Some(ref factory) = self.checkers {
            dispatcher = dispatcher.with_checker_factory(factory.clone());
        }
        dispatcher.start();

        let mut adapter = ClusterAdapter::new(
            self.store.clone(),
            self.config.task_root.clone(),
            self.config.task_mode,
            dispatcher.event_sender(),
            term.clone(),
            self.config.store_timeout,
            self.metrics.clone(),
        );
        adapter.start();

        *master = Some(MasterState {
            scope: term,
            dispatcher: Arc::new(dispatcher),
            adapter,
        });
        drop(master);
        self.set_role(Role::Master);
    }

    fn demote(&self) {
        let Some(state) = self.lock_master().take() else {
            return;
        };
        state.scope.cancel();
        state.dispatcher.stop();
        self.set_role(Role::Slave);
    }

    fn set_role(&self, role: Role) {
        let changed = self.role.send_if_modified(|current| {
            let changed = *current != role;
            *current = role;
            changed
        });
        if changed {
            info!(role = %role, instance = %self.info.instance_name(), "Election role changed");
            if let Some(ref m) = self.metrics {
                m.record_role(role == Role::Master);
            }
        }
    }

    fn lock_master(&self) -> MutexGuard<'_, Option<MasterState>> {
        self.master.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

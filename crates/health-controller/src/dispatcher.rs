//! Dispatcher owning the probe workers of the master instance.
//!
//! Sync events from the watch tree and status reports from the workers each
//! go through a bounded queue drained by one consumer task. Every worker's
//! scope is a child of the dispatcher scope, so [`Dispatcher::stop`] stops
//! the whole fleet.

use crate::metrics::MetricsRegistry;
use crate::sink::SinkError;
use crate::types::{HealthCheckReport, SyncAction, SyncEvent};
use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use healthcheck::types::{HealthCheckDef, ReporterMode, TaskMode};
use healthcheck::{HealthChecker, ProbeWorker};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Default depth of the sync event and report queues
pub const QUEUE_DEPTH: usize = 1024;

/// Dispatcher errors
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("health check {0} already exists")]
    Duplicate(String),

    #[error("health check {0} does not exist")]
    Missing(String),

    #[error("no reporter for task mode {0}")]
    UnsupportedType(TaskMode),

    #[error("dispatcher queue closed")]
    QueueClosed,

    #[error("report failed: {0}")]
    Report(#[from] SinkError),
}

/// Destination of status reports
#[async_trait]
pub trait ReportTarget: Send + Sync {
    async fn send(&self, report: &HealthCheckReport) -> Result<(), SinkError>;
}

/// Builds a checker for a definition, replacing the endpoint-derived one
pub type CheckerFactory = Arc<dyn Fn(&HealthCheckDef) -> Arc<dyn HealthChecker> + Send + Sync>;

struct Shared {
    workers: DashMap<String, ProbeWorker>,
    scope: CancellationToken,
    report_tx: mpsc::Sender<HealthCheckDef>,
    target: Arc<dyn ReportTarget>,
    metrics: Option<Arc<MetricsRegistry>>,
    checkers: Option<CheckerFactory>,
}

/// Registry of probe workers keyed by health check ID
pub struct Dispatcher {
    shared: Arc<Shared>,
    events_tx: mpsc::Sender<SyncEvent>,
    events_rx: Option<mpsc::Receiver<SyncEvent>>,
    report_rx: Option<mpsc::Receiver<HealthCheckDef>>,
}

impl Dispatcher {
    pub fn new(
        target: Arc<dyn ReportTarget>,
        scope: CancellationToken,
        event_queue: usize,
        report_queue: usize,
        metrics: Option<Arc<MetricsRegistry>>,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::channel(event_queue.max(1));
        let (report_tx, report_rx) = mpsc::channel(report_queue.max(1));
        Self {
            shared: Arc::new(Shared {
                workers: DashMap::new(),
                scope,
                report_tx,
                target,
                metrics,
                checkers: None,
            }),
            events_tx,
            events_rx: Some(events_rx),
            report_rx: Some(report_rx),
        }
    }

    /// Probe through checkers built by `factory`. Must precede any `add`.
    pub fn with_checker_factory(mut self, factory: CheckerFactory) -> Self {
        if let Some(shared) = Arc::get_mut(&mut self.shared) {
            shared.checkers = Some(factory);
        }
        self
    }

    /// Queue feeding [`Dispatcher::handle`]
    pub fn event_sender(&self) -> mpsc::Sender<SyncEvent> {
        self.events_tx.clone()
    }

    /// Queue the workers report into
    pub fn report_sender(&self) -> mpsc::Sender<HealthCheckDef> {
        self.shared.report_tx.clone()
    }

    /// Spawn the event and report consumers. A second call is a no-op.
    pub fn start(&mut self) -> Vec<JoinHandle<()>> {
        let (Some(events_rx), Some(report_rx)) = (self.events_rx.take(), self.report_rx.take())
        else {
            return Vec::new();
        };
        info!("Dispatcher started");
        vec![
            tokio::spawn(consume_events(self.shared.clone(), events_rx)),
            tokio::spawn(consume_reports(self.shared.clone(), report_rx)),
        ]
    }

    /// Cancel the dispatcher scope and drop every worker
    pub fn stop(&self) {
        self.shared.scope.cancel();
        self.shared.workers.clear();
        self.shared.update_gauge();
        info!("Dispatcher stopped");
    }

    pub fn add(&self, def: HealthCheckDef) -> Result<(), DispatchError> {
        self.shared.add(def)
    }

    pub fn update(&self, def: HealthCheckDef) -> Result<(), DispatchError> {
        self.shared.update(def)
    }

    pub fn delete(&self, id: &str) {
        self.shared.delete(id)
    }

    pub fn handle(&self, event: SyncEvent) -> Result<(), DispatchError> {
        self.shared.handle(event)
    }

    pub async fn report(&self, def: &HealthCheckDef) -> Result<(), DispatchError> {
        self.shared.report(def).await
    }

    pub fn len(&self) -> usize {
        self.shared.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shared.workers.is_empty()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.shared.workers.contains_key(id)
    }

    /// Definition of `id` carrying its latest observed status
    pub fn snapshot(&self, id: &str) -> Option<HealthCheckDef> {
        self.shared.workers.get(id).map(|w| w.snapshot())
    }

    /// IDs of all registered workers, sorted
    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<_> = self
            .shared
            .workers
            .iter()
            .map(|e| e.key().clone())
            .collect();
        ids.sort();
        ids
    }
}

impl Shared {
    fn add(&self, def: HealthCheckDef) -> Result<(), DispatchError> {
        match self.workers.entry(def.id.clone()) {
            Entry::Occupied(_) => return Err(DispatchError::Duplicate(def.id)),
            Entry::Vacant(slot) => {
                info!(id = %def.id, kind = def.kind().label(), operation = ?def.operation, "Adding health check");
                let mut worker = self.new_worker(def);
                worker.start();
                slot.insert(worker);
            }
        }
        self.update_gauge();
        Ok(())
    }

    fn update(&self, def: HealthCheckDef) -> Result<(), DispatchError> {
        let Some(mut worker) = self.workers.get_mut(&def.id) else {
            return Err(DispatchError::Missing(def.id));
        };
        info!(id = %def.id, operation = ?def.operation, "Updating health check");
        worker.update(def);
        Ok(())
    }

    fn delete(&self, id: &str) {
        match self.workers.remove(id) {
            Some((_, mut worker)) => {
                worker.stop();
                info!(id = %id, "Removed health check");
                self.update_gauge();
            }
            None => warn!(id = %id, "Delete for unknown health check ignored"),
        }
    }

    fn handle(&self, event: SyncEvent) -> Result<(), DispatchError> {
        let action = event.action;
        let result = match action {
            SyncAction::Add => self.add(event.def),
            SyncAction::Update => self.update(event.def),
            SyncAction::Delete => {
                self.delete(&event.def.id);
                Ok(())
            }
        };
        if let Some(ref m) = self.metrics {
            m.record_sync_event(action.as_str(), result.is_ok());
        }
        result
    }

    async fn report(&self, def: &HealthCheckDef) -> Result<(), DispatchError> {
        let kind = def.kind();
        let Some(mode) = def.task_mode.reporter_mode() else {
            if let Some(ref m) = self.metrics {
                m.record_report(kind, def.status, "unsupported");
            }
            return Err(DispatchError::UnsupportedType(def.task_mode));
        };

        let report = match mode {
            ReporterMode::MesosScheduler => HealthCheckReport::from_def(def),
        };

        let started = Instant::now();
        let sent = self.target.send(&report).await;
        if let Some(ref m) = self.metrics {
            m.observe_report_duration(started.elapsed());
            let result = if sent.is_ok() { "sent" } else { "failed" };
            m.record_report(kind, def.status, result);
        }
        sent?;

        debug!(id = %def.id, status = %def.status, "Reported health check status");
        Ok(())
    }

    fn new_worker(&self, def: HealthCheckDef) -> ProbeWorker {
        let checker = self.checkers.as_ref().map(|factory| factory(&def));
        let mut worker = ProbeWorker::new(def, self.scope.clone(), self.report_tx.clone());
        if let Some(checker) = checker {
            worker = worker.with_checker(checker);
        }
        if let Some(ref m) = self.metrics {
            worker = worker.with_drop_counter(m.dropped_reports());
        }
        worker
    }

    fn update_gauge(&self) {
        if let Some(ref m) = self.metrics {
            m.set_workers_active(self.workers.len());
        }
    }
}

async fn consume_events(shared: Arc<Shared>, mut rx: mpsc::Receiver<SyncEvent>) {
    loop {
        let event = tokio::select! {
            _ = shared.scope.cancelled() => break,
            event = rx.recv() => match event {
                Some(event) => event,
                None => break,
            },
        };

        let id = event.def.id.clone();
        let action = event.action;
        if let Err(e) = shared.handle(event) {
            warn!(id = %id, action = %action, error = %e, "Sync event rejected");
        }
    }
    debug!("Sync event consumer stopped");
}

async fn consume_reports(shared: Arc<Shared>, mut rx: mpsc::Receiver<HealthCheckDef>) {
    loop {
        let def = tokio::select! {
            _ = shared.scope.cancelled() => break,
            def = rx.recv() => match def {
                Some(def) => def,
                None => break,
            },
        };

        match shared.report(&def).await {
            Ok(()) => {}
            Err(DispatchError::UnsupportedType(mode)) => {
                error!(id = %def.id, mode = %mode, "Dropping report for unsupported task mode");
            }
            Err(e) => warn!(id = %def.id, error = %e, "Failed to report health check status"),
        }
    }
    debug!("Report consumer stopped");
}

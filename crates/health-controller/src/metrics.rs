//! Prometheus metrics for the health controller.

use healthcheck::types::{CheckKind, CheckStatus};
use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::{Histogram, exponential_buckets};
use prometheus_client::registry::Registry;
use std::time::Duration;

/// Labels for sync event metrics
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct SyncLabels {
    /// add, update, delete
    pub action: String,
    /// applied, rejected
    pub result: String,
}

/// Labels for status report metrics
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ReportLabels {
    /// http, tcp
    pub kind: String,
    /// running, failed
    pub status: String,
    /// sent, failed, unsupported
    pub result: String,
}

/// Labels for role metrics
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct RoleLabels {
    pub role: String,
}

/// Labels for supervised task metrics
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct TaskLabels {
    pub task: String,
}

/// Metrics registry with all health controller metrics
pub struct MetricsRegistry {
    /// Prometheus registry
    pub registry: Registry,

    /// Probe workers currently registered with the dispatcher
    workers_active: Gauge,
    /// Sync events applied or rejected
    sync_events_total: Family<SyncLabels, Counter>,
    /// Status reports by outcome
    reports_total: Family<ReportLabels, Counter>,
    /// Status reports dropped on a full report queue
    reports_dropped_total: Counter,
    /// Scheduler POST latency
    report_duration_seconds: Histogram,
    /// Store nodes currently watched
    watched_nodes: Gauge,
    /// 1 while this instance is master
    master: Gauge,
    /// Role changes
    role_transitions_total: Family<RoleLabels, Counter>,
    /// 1 while a scheduler leader is known
    scheduler_leader_known: Gauge,
    /// Supervised task restarts
    restarts_total: Family<TaskLabels, Counter>,
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsRegistry {
    pub fn new() -> Self {
        let mut registry = Registry::default();

        let workers_active = Gauge::default();
        registry.register(
            "health_controller_workers_active",
            "Number of registered probe workers",
            workers_active.clone(),
        );

        let sync_events_total = Family::<SyncLabels, Counter>::default();
        registry.register(
            "health_controller_sync_events",
            "Sync events handled by the dispatcher",
            sync_events_total.clone(),
        );

        let reports_total = Family::<ReportLabels, Counter>::default();
        registry.register(
            "health_controller_reports",
            "Status reports by kind, status and outcome",
            reports_total.clone(),
        );

        let reports_dropped_total = Counter::default();
        registry.register(
            "health_controller_reports_dropped",
            "Status reports dropped on a full report queue",
            reports_dropped_total.clone(),
        );

        // 1ms to ~16s
        let report_duration_seconds = Histogram::new(exponential_buckets(0.001, 2.0, 15));
        registry.register(
            "health_controller_report_duration_seconds",
            "Scheduler report latency in seconds",
            report_duration_seconds.clone(),
        );

        let watched_nodes = Gauge::default();
        registry.register(
            "health_controller_watched_nodes",
            "Store nodes currently watched",
            watched_nodes.clone(),
        );

        let master = Gauge::default();
        registry.register(
            "health_controller_master",
            "Election role (1=master, 0=slave)",
            master.clone(),
        );

        let role_transitions_total = Family::<RoleLabels, Counter>::default();
        registry.register(
            "health_controller_role_transitions",
            "Election role changes by new role",
            role_transitions_total.clone(),
        );

        let scheduler_leader_known = Gauge::default();
        registry.register(
            "health_controller_scheduler_leader_known",
            "Scheduler leader discovery state (1=known, 0=unknown)",
            scheduler_leader_known.clone(),
        );

        let restarts_total = Family::<TaskLabels, Counter>::default();
        registry.register(
            "health_controller_task_restarts",
            "Restarts of supervised tasks",
            restarts_total.clone(),
        );

        Self {
            registry,
            workers_active,
            sync_events_total,
            reports_total,
            reports_dropped_total,
            report_duration_seconds,
            watched_nodes,
            master,
            role_transitions_total,
            scheduler_leader_known,
            restarts_total,
        }
    }

    pub fn set_workers_active(&self, count: usize) {
        self.workers_active.set(count as i64);
    }

    pub fn record_sync_event(&self, action: &str, applied: bool) {
        self.sync_events_total
            .get_or_create(&SyncLabels {
                action: action.to_string(),
                result: if applied { "applied" } else { "rejected" }.to_string(),
            })
            .inc();
    }

    pub fn record_report(&self, kind: CheckKind, status: CheckStatus, result: &str) {
        self.reports_total
            .get_or_create(&ReportLabels {
                kind: kind.label().to_string(),
                status: status.to_string(),
                result: result.to_string(),
            })
            .inc();
    }

    pub fn observe_report_duration(&self, duration: Duration) {
        self.report_duration_seconds.observe(duration.as_secs_f64());
    }

    /// Counter handed to probe workers for queue-full drops
    pub fn dropped_reports(&self) -> Counter {
        self.reports_dropped_total.clone()
    }

    pub fn set_watched_nodes(&self, count: usize) {
        self.watched_nodes.set(count as i64);
    }

    /// Record a role change
    pub fn record_role(&self, master: bool) {
        self.master.set(i64::from(master));
        self.role_transitions_total
            .get_or_create(&RoleLabels {
                role: if master { "master" } else { "slave" }.to_string(),
            })
            .inc();
    }

    pub fn set_scheduler_leader_known(&self, known: bool) {
        self.scheduler_leader_known.set(i64::from(known));
    }

    pub fn record_restart(&self, task: &str) {
        self.restarts_total
            .get_or_create(&TaskLabels {
                task: task.to_string(),
            })
            .inc();
    }
}

//! Integration tests for the dispatcher and its probe workers

use async_trait::async_trait;
use health_controller::dispatcher::{CheckerFactory, QUEUE_DEPTH};
use health_controller::types::HealthCheckReport;
use health_controller::{Dispatcher, MetricsRegistry, ReportTarget, SinkError, SyncEvent};
use healthcheck::types::{
    CheckStatus, Endpoint, HealthCheckDef, HealthCheckResult, HttpEndpoint, Operation, TaskMode,
};
use healthcheck::HealthChecker;
use mockall::mock;
use prometheus_client::encoding::text::encode;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

mock! {
    pub Checker {}

    #[async_trait]
    impl HealthChecker for Checker {
        async fn check(&self) -> HealthCheckResult;
        fn name(&self) -> &str;
    }
}

struct Recorder {
    tx: mpsc::UnboundedSender<HealthCheckReport>,
}

#[async_trait]
impl ReportTarget for Recorder {
    async fn send(&self, report: &HealthCheckReport) -> Result<(), SinkError> {
        let _ = self.tx.send(report.clone());
        Ok(())
    }
}

fn http_def(id: &str, operation: Operation) -> HealthCheckDef {
    HealthCheckDef {
        id: id.to_string(),
        origin_id: "t1".to_string(),
        task_mode: TaskMode::Mesos,
        reporter_mode: TaskMode::Mesos.reporter_mode(),
        delay_seconds: 0,
        grace_period_seconds: 0,
        interval_seconds: 10,
        timeout_seconds: 2,
        consecutive_failures: 0,
        endpoint: Endpoint::Http(HttpEndpoint {
            ip: "10.0.0.5".to_string(),
            port: 8080,
            scheme: "http".to_string(),
            path: "/healthz".to_string(),
            headers: BTreeMap::new(),
        }),
        operation,
        status: CheckStatus::Running,
        message: String::new(),
    }
}

fn scripted(healthy: bool) -> CheckerFactory {
    Arc::new(move |_def: &HealthCheckDef| -> Arc<dyn HealthChecker> {
        let mut checker = MockChecker::new();
        checker.expect_check().returning(move || {
            if healthy {
                HealthCheckResult::healthy(Duration::from_millis(1))
            } else {
                HealthCheckResult::unhealthy(Duration::from_millis(1), "returned status 503")
            }
        });
        checker.expect_name().return_const("mock".to_string());
        Arc::new(checker)
    })
}

struct Harness {
    dispatcher: Dispatcher,
    reports: mpsc::UnboundedReceiver<HealthCheckReport>,
    metrics: Arc<MetricsRegistry>,
    scope: CancellationToken,
}

fn start(healthy: bool) -> Harness {
    common::logging::init_for_tests();
    let (tx, reports) = mpsc::unbounded_channel();
    let metrics = Arc::new(MetricsRegistry::new());
    let scope = CancellationToken::new();
    let mut dispatcher = Dispatcher::new(
        Arc::new(Recorder { tx }),
        scope.clone(),
        QUEUE_DEPTH,
        QUEUE_DEPTH,
        Some(metrics.clone()),
    )
    .with_checker_factory(scripted(healthy));
    dispatcher.start();
    Harness {
        dispatcher,
        reports,
        metrics,
        scope,
    }
}

fn render(metrics: &MetricsRegistry) -> String {
    let mut buffer = String::new();
    encode(&mut buffer, &metrics.registry).unwrap();
    buffer
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(10)).await;
}

#[tokio::test(start_paused = true)]
async fn test_failing_check_is_reported() {
    let mut h = start(false);
    h.dispatcher
        .event_sender()
        .send(SyncEvent::add(http_def("0.t1", Operation::Running)))
        .await
        .unwrap();

    let report = timeout(Duration::from_secs(30), h.reports.recv())
        .await
        .expect("no report")
        .unwrap();
    assert_eq!(report.id, "t1");
    assert_eq!(report.kind, "REMOTE_HTTP");
    assert!(!report.status);
    assert_eq!(report.message, "returned status 503");
    assert_eq!(report.http.as_ref().map(|h| h.port), Some(8080));

    let text = render(&h.metrics);
    assert!(text.contains(r#"health_controller_reports_total{kind="http",status="failed",result="sent"} 1"#));
    assert!(text.contains("health_controller_workers_active 1"));
}

#[tokio::test(start_paused = true)]
async fn test_healthy_check_only_heartbeats() {
    let mut h = start(true);
    h.dispatcher.add(http_def("0.t1", Operation::Running)).unwrap();

    assert!(timeout(Duration::from_secs(170), h.reports.recv()).await.is_err());
    let report = timeout(Duration::from_secs(20), h.reports.recv())
        .await
        .expect("no heartbeat")
        .unwrap();
    assert!(report.status);
}

#[tokio::test(start_paused = true)]
async fn test_duplicate_and_missing_events_are_rejected() {
    let h = start(true);
    let events = h.dispatcher.event_sender();

    events
        .send(SyncEvent::add(http_def("0.t1", Operation::Stopped)))
        .await
        .unwrap();
    events
        .send(SyncEvent::add(http_def("0.t1", Operation::Running)))
        .await
        .unwrap();
    events
        .send(SyncEvent::update(http_def("1.t1", Operation::Running)))
        .await
        .unwrap();
    settle().await;

    assert_eq!(h.dispatcher.ids(), vec!["0.t1".to_string()]);
    assert_eq!(
        h.dispatcher.snapshot("0.t1").map(|d| d.operation),
        Some(Operation::Stopped)
    );

    let text = render(&h.metrics);
    assert!(text.contains(r#"health_controller_sync_events_total{action="add",result="applied"} 1"#));
    assert!(text.contains(r#"health_controller_sync_events_total{action="add",result="rejected"} 1"#));
    assert!(text.contains(r#"health_controller_sync_events_total{action="update",result="rejected"} 1"#));
}

#[tokio::test(start_paused = true)]
async fn test_update_starts_stopped_worker() {
    let mut h = start(false);
    h.dispatcher.add(http_def("0.t1", Operation::Stopped)).unwrap();
    assert!(timeout(Duration::from_secs(30), h.reports.recv()).await.is_err());

    h.dispatcher
        .update(http_def("0.t1", Operation::Running))
        .unwrap();
    let report = timeout(Duration::from_secs(15), h.reports.recv())
        .await
        .expect("worker did not start")
        .unwrap();
    assert!(!report.status);
}

#[tokio::test(start_paused = true)]
async fn test_delete_twice_is_noop() {
    let h = start(true);
    let events = h.dispatcher.event_sender();
    events
        .send(SyncEvent::add(http_def("0.t1", Operation::Running)))
        .await
        .unwrap();
    events
        .send(SyncEvent::delete(http_def("0.t1", Operation::Running)))
        .await
        .unwrap();
    events
        .send(SyncEvent::delete(http_def("0.t1", Operation::Running)))
        .await
        .unwrap();
    settle().await;

    assert!(h.dispatcher.is_empty());
    let text = render(&h.metrics);
    assert!(text.contains(r#"health_controller_sync_events_total{action="delete",result="applied"} 2"#));
}

#[tokio::test(start_paused = true)]
async fn test_unsupported_mode_is_dropped() {
    let mut h = start(false);
    let mut def = http_def("0.t1", Operation::Running);
    def.task_mode = TaskMode::Kubernetes;
    def.reporter_mode = None;
    h.dispatcher.add(def).unwrap();

    assert!(timeout(Duration::from_secs(30), h.reports.recv()).await.is_err());
    let text = render(&h.metrics);
    assert!(text.contains(r#"result="unsupported"} 1"#));
}

#[tokio::test(start_paused = true)]
async fn test_stop_halts_reporting() {
    let mut h = start(false);
    h.dispatcher.add(http_def("0.t1", Operation::Running)).unwrap();
    h.dispatcher.add(http_def("1.t1", Operation::Running)).unwrap();

    h.dispatcher.stop();
    assert!(h.scope.is_cancelled());
    assert!(h.dispatcher.is_empty());
    assert!(timeout(Duration::from_secs(30), h.reports.recv()).await.is_err());
}

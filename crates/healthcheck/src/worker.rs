//! Per-health-check probe worker.
//!
//! A worker is either stopped or running. While running it owns two tasks
//! sharing one cancellation scope: the probe loop, which probes on a fixed
//! interval, and the report loop, which pushes status snapshots to the
//! dispatcher's report queue. The definition is validated once, before either
//! loop exists.

use crate::checkers::{self, HealthChecker};
use crate::types::{CheckStatus, HealthCheckDef, HealthCheckResult, Operation, ValidationError};
use prometheus_client::metrics::counter::Counter;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Semaphore, mpsc, watch};
use tokio::time::{Instant, MissedTickBehavior, interval, interval_at, sleep};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Probe attempts per tick before the check is declared failed
pub const PROBE_ATTEMPTS: u32 = 3;

/// Pause between two attempts of the same tick
pub const ATTEMPT_SPACING: Duration = Duration::from_secs(1);

/// Unconditional status report period
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(180);

/// How often the report loop looks for a status change
pub const CHANGE_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Observed result of the latest probe
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Observed {
    pub status: CheckStatus,
    pub message: String,
}

impl Observed {
    fn from_result(result: &HealthCheckResult) -> Self {
        if result.is_healthy() {
            Self {
                status: CheckStatus::Running,
                message: String::new(),
            }
        } else {
            Self {
                status: CheckStatus::Failed,
                message: result
                    .message
                    .clone()
                    .unwrap_or_else(|| result.status.to_string()),
            }
        }
    }
}

/// Worker lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Stopped,
    Running,
}

/// Probe `checker` up to `attempts` times, `spacing` apart.
///
/// Returns the first healthy result, or the last failure when every attempt fails.
pub async fn check_endpoint(
    checker: &dyn HealthChecker,
    attempts: u32,
    spacing: Duration,
) -> HealthCheckResult {
    let mut attempt = 1;
    loop {
        let result = checker.check().await;
        if result.is_healthy() || attempt >= attempts {
            return result;
        }
        debug!(
            checker = checker.name(),
            attempt,
            message = result.message.as_deref().unwrap_or("unknown"),
            "Probe attempt failed, retrying"
        );
        attempt += 1;
        sleep(spacing).await;
    }
}

/// Runs the probe and report loops of one health check
pub struct ProbeWorker {
    def: HealthCheckDef,
    parent: CancellationToken,
    scope: Option<CancellationToken>,
    report_tx: mpsc::Sender<HealthCheckDef>,
    checker: Option<Arc<dyn HealthChecker>>,
    dropped: Counter,
    observed: watch::Receiver<Observed>,
}

impl ProbeWorker {
    /// Create a stopped worker whose tasks are children of `parent`
    pub fn new(
        def: HealthCheckDef,
        parent: CancellationToken,
        report_tx: mpsc::Sender<HealthCheckDef>,
    ) -> Self {
        let (_, observed) = watch::channel(Self::initial_observed(&def));
        Self {
            def,
            parent,
            scope: None,
            report_tx,
            checker: None,
            dropped: Counter::default(),
            observed,
        }
    }

    /// Probe with `checker` instead of one built from the endpoint
    pub fn with_checker(mut self, checker: Arc<dyn HealthChecker>) -> Self {
        self.checker = Some(checker);
        self
    }

    /// Count reports dropped on a full queue into `dropped`
    pub fn with_drop_counter(mut self, dropped: Counter) -> Self {
        self.dropped = dropped;
        self
    }

    pub fn id(&self) -> &str {
        &self.def.id
    }

    pub fn def(&self) -> &HealthCheckDef {
        &self.def
    }

    pub fn state(&self) -> WorkerState {
        match &self.scope {
            Some(scope) if !scope.is_cancelled() => WorkerState::Running,
            _ => WorkerState::Stopped,
        }
    }

    /// Latest observed status
    pub fn observed(&self) -> Observed {
        self.observed.borrow().clone()
    }

    /// Copy of the definition carrying the latest observed status
    pub fn snapshot(&self) -> HealthCheckDef {
        let observed = self.observed();
        let mut def = self.def.clone();
        def.status = observed.status;
        def.message = observed.message;
        def
    }

    /// Spawn the probe and report loops.
    ///
    /// No-op unless the task should be running and the worker is stopped.
    /// A definition that fails validation leaves the worker stopped.
    pub fn start(&mut self) {
        if self.def.operation != Operation::Running {
            debug!(id = %self.def.id, "Task not running, worker stays stopped");
            return;
        }
        if self.state() == WorkerState::Running {
            return;
        }

        let checker = match self.resolve_checker() {
            Ok(checker) => checker,
            Err(e) => {
                error!(id = %self.def.id, error = %e, "Invalid health check parameters, worker will not start");
                return;
            }
        };

        let scope = self.parent.child_token();
        let (observed_tx, observed_rx) = watch::channel(Self::initial_observed(&self.def));
        self.observed = observed_rx.clone();

        tokio::spawn(probe_loop(
            self.def.clone(),
            checker,
            observed_tx,
            scope.clone(),
        ));
        tokio::spawn(report_loop(
            self.def.clone(),
            observed_rx,
            self.report_tx.clone(),
            self.dropped.clone(),
            scope.clone(),
        ));

        info!(id = %self.def.id, kind = self.def.kind().label(), "Probe worker started");
        self.scope = Some(scope);
    }

    fn resolve_checker(&self) -> Result<Arc<dyn HealthChecker>, ValidationError> {
        self.def.validate()?;
        match &self.checker {
            Some(checker) => Ok(checker.clone()),
            None => checkers::for_endpoint(&self.def.endpoint, self.def.timeout()),
        }
    }

    /// Cancel both loops if running
    pub fn stop(&mut self) {
        if let Some(scope) = self.scope.take() {
            if !scope.is_cancelled() {
                scope.cancel();
                info!(id = %self.def.id, "Probe worker stopped");
            }
        }
    }

    /// Replace the definition wholesale and restart
    pub fn update(&mut self, def: HealthCheckDef) {
        self.stop();
        self.def = def;
        self.start();
    }

    fn initial_observed(def: &HealthCheckDef) -> Observed {
        Observed {
            status: def.status,
            message: def.message.clone(),
        }
    }
}

impl Drop for ProbeWorker {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn probe_loop(
    def: HealthCheckDef,
    checker: Arc<dyn HealthChecker>,
    observed: watch::Sender<Observed>,
    scope: CancellationToken,
) {
    if def.grace_period_seconds > 0 {
        tokio::select! {
            _ = scope.cancelled() => return,
            _ = sleep(def.grace_period()) => {}
        }
    }

    let observed = Arc::new(observed);
    // One probe in flight per worker; a tick that finds it busy is skipped
    let in_flight = Arc::new(Semaphore::new(1));
    let mut ticker = interval(def.interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = scope.cancelled() => break,
            _ = ticker.tick() => {
                let Ok(permit) = in_flight.clone().try_acquire_owned() else {
                    warn!(id = %def.id, "Previous probe still in flight, skipping tick");
                    continue;
                };

                let checker = checker.clone();
                let observed = observed.clone();
                let id = def.id.clone();
                let probe_scope = scope.clone();
                // A probe in flight when the worker stops runs to completion
                tokio::spawn(async move {
                    let result = check_endpoint(checker.as_ref(), PROBE_ATTEMPTS, ATTEMPT_SPACING).await;
                    drop(permit);
                    if probe_scope.is_cancelled() {
                        debug!(id = %id, "Worker stopped during probe, discarding result");
                        return;
                    }
                    let next = Observed::from_result(&result);
                    if next.status == CheckStatus::Failed {
                        warn!(id = %id, message = %next.message, "Health check failed");
                    }
                    observed.send_replace(next);
                });
            }
        }
    }

    debug!(id = %def.id, "Probe loop stopped");
}

async fn report_loop(
    def: HealthCheckDef,
    observed: watch::Receiver<Observed>,
    report_tx: mpsc::Sender<HealthCheckDef>,
    dropped: Counter,
    scope: CancellationToken,
) {
    let mut heartbeat = interval_at(Instant::now() + HEARTBEAT_INTERVAL, HEARTBEAT_INTERVAL);
    let mut poll = interval(CHANGE_POLL_INTERVAL);
    poll.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut last_reported = observed.borrow().status;

    loop {
        tokio::select! {
            _ = scope.cancelled() => break,
            _ = heartbeat.tick() => {
                let current = observed.borrow().clone();
                last_reported = current.status;
                emit(&def, current, &report_tx, &dropped);
            }
            _ = poll.tick() => {
                let current = observed.borrow().clone();
                if current.status != last_reported {
                    info!(id = %def.id, from = %last_reported, to = %current.status, "Health status changed");
                    last_reported = current.status;
                    emit(&def, current, &report_tx, &dropped);
                }
            }
        }
    }

    debug!(id = %def.id, "Report loop stopped");
}

fn emit(
    def: &HealthCheckDef,
    observed: Observed,
    report_tx: &mpsc::Sender<HealthCheckDef>,
    dropped: &Counter,
) {
    let mut snapshot = def.clone();
    snapshot.status = observed.status;
    snapshot.message = observed.message;

    match report_tx.try_send(snapshot) {
        Ok(()) => {}
        Err(mpsc::error::TrySendError::Full(_)) => {
            dropped.inc();
            warn!(id = %def.id, "Report queue full, dropping status");
        }
        Err(mpsc::error::TrySendError::Closed(_)) => {
            debug!(id = %def.id, "Report queue closed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Endpoint, HealthStatus, TaskMode, TcpEndpoint};
    use async_trait::async_trait;
    use mockall::mock;
    use std::sync::atomic::{AtomicUsize, Ordering};

    mock! {
        pub Checker {}

        #[async_trait]
        impl HealthChecker for Checker {
            async fn check(&self) -> HealthCheckResult;
            fn name(&self) -> &str;
        }
    }

    fn tcp_def(operation: Operation) -> HealthCheckDef {
        HealthCheckDef {
            id: "0.task-1".to_string(),
            origin_id: "task-1".to_string(),
            task_mode: TaskMode::Mesos,
            reporter_mode: None,
            delay_seconds: 0,
            grace_period_seconds: 0,
            interval_seconds: 10,
            timeout_seconds: 2,
            consecutive_failures: 3,
            endpoint: Endpoint::Tcp(TcpEndpoint {
                ip: "10.0.0.5".to_string(),
                port: 6379,
            }),
            operation,
            status: CheckStatus::Running,
            message: String::new(),
        }
    }

    fn failure(message: &str) -> HealthCheckResult {
        HealthCheckResult::unhealthy(Duration::from_millis(1), message)
    }

    fn healthy() -> HealthCheckResult {
        HealthCheckResult::healthy(Duration::from_millis(1))
    }

    #[tokio::test(start_paused = true)]
    async fn test_check_endpoint_short_circuits_on_success() {
        let mut checker = MockChecker::new();
        let mut calls = 0;
        checker.expect_check().times(2).returning(move || {
            calls += 1;
            if calls == 1 { failure("refused") } else { healthy() }
        });
        checker.expect_name().return_const("mock".to_string());

        let result = check_endpoint(&checker, PROBE_ATTEMPTS, ATTEMPT_SPACING).await;
        assert!(result.is_healthy());
    }

    #[tokio::test(start_paused = true)]
    async fn test_check_endpoint_reports_last_failure() {
        let mut checker = MockChecker::new();
        let mut calls = 0;
        checker.expect_check().times(3).returning(move || {
            calls += 1;
            failure(&format!("attempt {}", calls))
        });
        checker.expect_name().return_const("mock".to_string());

        let result = check_endpoint(&checker, PROBE_ATTEMPTS, ATTEMPT_SPACING).await;
        assert_eq!(result.status, HealthStatus::Unhealthy);
        assert_eq!(result.message.as_deref(), Some("attempt 3"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stopped_operation_never_starts() {
        let (report_tx, _report_rx) = mpsc::channel(16);
        let mut worker = ProbeWorker::new(
            tcp_def(Operation::Stopped),
            CancellationToken::new(),
            report_tx,
        );
        worker.start();
        assert_eq!(worker.state(), WorkerState::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_probe_is_reported_on_change() {
        let mut checker = MockChecker::new();
        checker
            .expect_check()
            .returning(|| failure("connection refused"));
        checker.expect_name().return_const("mock".to_string());

        let (report_tx, mut report_rx) = mpsc::channel(16);
        let mut worker = ProbeWorker::new(
            tcp_def(Operation::Running),
            CancellationToken::new(),
            report_tx,
        )
        .with_checker(Arc::new(checker));
        worker.start();
        assert_eq!(worker.state(), WorkerState::Running);

        let report = tokio::time::timeout(Duration::from_secs(10), report_rx.recv())
            .await
            .expect("status change should be reported")
            .expect("report queue open");
        assert_eq!(report.id, "0.task-1");
        assert_eq!(report.status, CheckStatus::Failed);
        assert_eq!(report.message, "connection refused");
        assert_eq!(worker.snapshot().status, CheckStatus::Failed);

        worker.stop();
        assert_eq!(worker.state(), WorkerState::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn test_healthy_probe_only_reports_heartbeat() {
        let mut checker = MockChecker::new();
        checker.expect_check().returning(healthy);
        checker.expect_name().return_const("mock".to_string());

        let (report_tx, mut report_rx) = mpsc::channel(16);
        let mut worker = ProbeWorker::new(
            tcp_def(Operation::Running),
            CancellationToken::new(),
            report_tx,
        )
        .with_checker(Arc::new(checker));
        worker.start();

        // Status never changes from the initial running state
        assert!(
            tokio::time::timeout(Duration::from_secs(60), report_rx.recv())
                .await
                .is_err()
        );

        let report = tokio::time::timeout(HEARTBEAT_INTERVAL, report_rx.recv())
            .await
            .expect("heartbeat should be reported")
            .expect("report queue open");
        assert_eq!(report.status, CheckStatus::Running);
    }

    #[tokio::test(start_paused = true)]
    async fn test_update_to_running_starts_probing_within_interval() {
        let mut checker = MockChecker::new();
        checker.expect_check().returning(|| failure("down"));
        checker.expect_name().return_const("mock".to_string());

        let (report_tx, mut report_rx) = mpsc::channel(16);
        let def = tcp_def(Operation::Stopped);
        let interval = def.interval();
        let mut worker = ProbeWorker::new(def, CancellationToken::new(), report_tx)
            .with_checker(Arc::new(checker));
        worker.start();
        assert_eq!(worker.state(), WorkerState::Stopped);

        worker.update(tcp_def(Operation::Running));
        assert_eq!(worker.state(), WorkerState::Running);

        // Three failing attempts one second apart, then the next change poll
        let budget = interval + ATTEMPT_SPACING * PROBE_ATTEMPTS + CHANGE_POLL_INTERVAL;
        let report = tokio::time::timeout(budget, report_rx.recv())
            .await
            .expect("probing should start after update")
            .expect("report queue open");
        assert_eq!(report.status, CheckStatus::Failed);

        worker.update(tcp_def(Operation::Stopped));
        assert_eq!(worker.state(), WorkerState::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalid_parameters_never_start() {
        let mut checker = MockChecker::new();
        checker.expect_check().never();
        checker.expect_name().return_const("mock".to_string());

        let mut def = tcp_def(Operation::Running);
        def.interval_seconds = 1;
        def.timeout_seconds = 5;

        let (report_tx, mut report_rx) = mpsc::channel(16);
        let mut worker = ProbeWorker::new(def, CancellationToken::new(), report_tx)
            .with_checker(Arc::new(checker));
        worker.start();
        assert_eq!(worker.state(), WorkerState::Stopped);

        // No heartbeat either, so the scheduler never hears a healthy status
        let report = tokio::time::timeout(HEARTBEAT_INTERVAL + Duration::from_secs(20), report_rx.recv()).await;
        assert!(report.is_err(), "invalid worker reported {:?}", report);
        assert_eq!(worker.state(), WorkerState::Stopped);
    }

    /// Checker that takes `delay` per check and tracks concurrency
    struct SlowChecker {
        delay: Duration,
        started: AtomicUsize,
        finished: AtomicUsize,
        running: AtomicUsize,
        max_running: AtomicUsize,
    }

    impl SlowChecker {
        fn new(delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                delay,
                started: AtomicUsize::new(0),
                finished: AtomicUsize::new(0),
                running: AtomicUsize::new(0),
                max_running: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl HealthChecker for SlowChecker {
        async fn check(&self) -> HealthCheckResult {
            self.started.fetch_add(1, Ordering::SeqCst);
            let running = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_running.fetch_max(running, Ordering::SeqCst);
            sleep(self.delay).await;
            self.running.fetch_sub(1, Ordering::SeqCst);
            self.finished.fetch_add(1, Ordering::SeqCst);
            healthy()
        }

        fn name(&self) -> &str {
            "slow"
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_busy_ticks_are_skipped() {
        // Each check outlasts two 10s ticks
        let checker = SlowChecker::new(Duration::from_secs(25));
        let (report_tx, _report_rx) = mpsc::channel(16);
        let mut worker = ProbeWorker::new(
            tcp_def(Operation::Running),
            CancellationToken::new(),
            report_tx,
        )
        .with_checker(checker.clone());
        worker.start();

        sleep(Duration::from_secs(100)).await;
        assert_eq!(checker.max_running.load(Ordering::SeqCst), 1);
        // Probes start at 0s, 30s, 60s and 90s
        assert_eq!(checker.started.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_lets_in_flight_probe_finish() {
        let checker = SlowChecker::new(Duration::from_secs(5));
        let mut def = tcp_def(Operation::Running);
        def.status = CheckStatus::Failed;
        def.message = "down".to_string();

        let (report_tx, mut report_rx) = mpsc::channel(16);
        let mut worker = ProbeWorker::new(def, CancellationToken::new(), report_tx)
            .with_checker(checker.clone());
        worker.start();

        sleep(Duration::from_secs(1)).await;
        assert_eq!(checker.started.load(Ordering::SeqCst), 1);
        worker.stop();

        sleep(Duration::from_secs(20)).await;
        assert_eq!(checker.finished.load(Ordering::SeqCst), 1);
        assert_eq!(checker.started.load(Ordering::SeqCst), 1);
        // The healthy result arrived after the stop and is discarded
        assert_eq!(worker.observed().status, CheckStatus::Failed);
        assert!(report_rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_report_queue_counts_drops() {
        let mut checker = MockChecker::new();
        checker.expect_check().returning(|| failure("down"));
        checker.expect_name().return_const("mock".to_string());

        let (report_tx, _report_rx) = mpsc::channel(1);
        report_tx
            .try_send(tcp_def(Operation::Running))
            .expect("queue has room for one");

        let dropped = Counter::default();
        let mut worker = ProbeWorker::new(
            tcp_def(Operation::Running),
            CancellationToken::new(),
            report_tx,
        )
        .with_checker(Arc::new(checker))
        .with_drop_counter(dropped.clone());
        worker.start();

        sleep(Duration::from_secs(10)).await;
        assert_eq!(dropped.get(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_parent_cancel_stops_worker() {
        let (report_tx, _report_rx) = mpsc::channel(16);
        let parent = CancellationToken::new();
        let mut checker = MockChecker::new();
        checker.expect_check().returning(healthy);
        checker.expect_name().return_const("mock".to_string());

        let mut worker = ProbeWorker::new(tcp_def(Operation::Running), parent.clone(), report_tx)
            .with_checker(Arc::new(checker));
        worker.start();
        assert_eq!(worker.state(), WorkerState::Running);

        parent.cancel();
        assert_eq!(worker.state(), WorkerState::Stopped);
    }
}

//! Remote health probing for orchestrator tasks.
//!
//! This crate holds everything needed to probe one task endpoint:
//! - health check definitions and their validation (`types`)
//! - TCP and HTTP probes (`checkers`)
//! - the per-check worker that probes on an interval and reports
//!   status snapshots to a bounded queue (`worker`)
//!
//! # Example
//!
//! ```no_run
//! use healthcheck::types::{CheckStatus, Endpoint, HealthCheckDef, Operation, TaskMode, TcpEndpoint};
//! use healthcheck::ProbeWorker;
//! use tokio::sync::mpsc;
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() {
//! let def = HealthCheckDef {
//!     id: HealthCheckDef::make_id(0, "web.1"),
//!     origin_id: "web.1".to_string(),
//!     task_mode: TaskMode::Mesos,
//!     reporter_mode: TaskMode::Mesos.reporter_mode(),
//!     delay_seconds: 0,
//!     grace_period_seconds: 0,
//!     interval_seconds: 10,
//!     timeout_seconds: 2,
//!     consecutive_failures: 3,
//!     endpoint: Endpoint::Tcp(TcpEndpoint { ip: "10.0.0.5".to_string(), port: 6379 }),
//!     operation: Operation::Running,
//!     status: CheckStatus::Running,
//!     message: String::new(),
//! };
//!
//! let (report_tx, mut report_rx) = mpsc::channel(1024);
//! let mut worker = ProbeWorker::new(def, CancellationToken::new(), report_tx);
//! worker.start();
//!
//! while let Some(snapshot) = report_rx.recv().await {
//!     println!("{} is {}", snapshot.id, snapshot.status);
//! }
//! # }
//! ```

pub mod checkers;
pub mod types;
pub mod worker;

pub use checkers::{HealthChecker, HttpChecker, TcpChecker};
pub use types::{
    CheckKind, CheckStatus, Endpoint, HealthCheckDef, HealthCheckResult, HealthStatus, Operation,
    ReporterMode, TaskMode, ValidationError,
};
pub use worker::{Observed, ProbeWorker, WorkerState, check_endpoint};

//! Health check types and structures.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::net::Ipv4Addr;
use std::time::Duration;
use thiserror::Error;

/// Outcome of a single probe attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HealthStatus {
    /// Endpoint answered as expected
    Healthy,
    /// Endpoint answered, but not as expected
    Unhealthy,
    /// Probe timed out
    Timeout,
    /// Probe could not be executed
    Error,
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HealthStatus::Healthy => write!(f, "HEALTHY"),
            HealthStatus::Unhealthy => write!(f, "UNHEALTHY"),
            HealthStatus::Timeout => write!(f, "TIMEOUT"),
            HealthStatus::Error => write!(f, "ERROR"),
        }
    }
}

/// Health check result
#[derive(Debug, Clone)]
pub struct HealthCheckResult {
    /// Status of the health check
    pub status: HealthStatus,

    /// Duration of the health check
    pub duration: Duration,

    /// Optional error message
    pub message: Option<String>,

    /// Response code (for HTTP checks)
    pub response_code: Option<u16>,
}

impl HealthCheckResult {
    /// Create a healthy result
    pub fn healthy(duration: Duration) -> Self {
        Self {
            status: HealthStatus::Healthy,
            duration,
            message: None,
            response_code: None,
        }
    }

    /// Create an unhealthy result
    pub fn unhealthy(duration: Duration, message: impl Into<String>) -> Self {
        Self {
            status: HealthStatus::Unhealthy,
            duration,
            message: Some(message.into()),
            response_code: None,
        }
    }

    /// Create a timeout result
    pub fn timeout(duration: Duration) -> Self {
        Self {
            status: HealthStatus::Timeout,
            duration,
            message: Some("Health check timed out".to_string()),
            response_code: None,
        }
    }

    /// Create an error result
    pub fn error(duration: Duration, message: impl Into<String>) -> Self {
        Self {
            status: HealthStatus::Error,
            duration,
            message: Some(message.into()),
            response_code: None,
        }
    }

    /// Check if the result is healthy
    pub fn is_healthy(&self) -> bool {
        self.status == HealthStatus::Healthy
    }
}

/// Desired state of the task a health check belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Running,
    #[default]
    Stopped,
}

/// Observed state of a health check
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum CheckStatus {
    #[default]
    Running,
    Failed,
}

impl fmt::Display for CheckStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CheckStatus::Running => write!(f, "running"),
            CheckStatus::Failed => write!(f, "failed"),
        }
    }
}

/// Orchestrator the task came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TaskMode {
    #[default]
    Mesos,
    Kubernetes,
}

impl TaskMode {
    /// Where status changes for this kind of task are reported.
    ///
    /// Only mesos tasks have a reporter today.
    pub fn reporter_mode(self) -> Option<ReporterMode> {
        match self {
            TaskMode::Mesos => Some(ReporterMode::MesosScheduler),
            TaskMode::Kubernetes => None,
        }
    }
}

impl fmt::Display for TaskMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskMode::Mesos => write!(f, "mesos"),
            TaskMode::Kubernetes => write!(f, "kubernetes"),
        }
    }
}

/// Destination of status reports
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReporterMode {
    MesosScheduler,
}

/// Kind of remote check
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CheckKind {
    Http,
    Tcp,
}

impl CheckKind {
    /// Name used on the scheduler wire and in task payloads
    pub fn wire_name(self) -> &'static str {
        match self {
            CheckKind::Http => "REMOTE_HTTP",
            CheckKind::Tcp => "REMOTE_TCP",
        }
    }

    /// Short lowercase name for logs and metric labels
    pub fn label(self) -> &'static str {
        match self {
            CheckKind::Http => "http",
            CheckKind::Tcp => "tcp",
        }
    }
}

/// HTTP probe target
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpEndpoint {
    pub ip: String,
    pub port: i64,
    pub scheme: String,
    pub path: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
}

impl HttpEndpoint {
    /// Full probe URL
    pub fn url(&self) -> String {
        let scheme = if self.scheme.is_empty() {
            "http"
        } else {
            self.scheme.as_str()
        };
        let path = if self.path.starts_with('/') {
            self.path.clone()
        } else {
            format!("/{}", self.path)
        };
        format!("{}://{}:{}{}", scheme, self.ip, self.port, path)
    }
}

/// TCP probe target
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TcpEndpoint {
    pub ip: String,
    pub port: i64,
}

/// Probe target, exactly one of HTTP or TCP
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Endpoint {
    Http(HttpEndpoint),
    Tcp(TcpEndpoint),
}

impl Endpoint {
    pub fn kind(&self) -> CheckKind {
        match self {
            Endpoint::Http(_) => CheckKind::Http,
            Endpoint::Tcp(_) => CheckKind::Tcp,
        }
    }

    pub fn ip(&self) -> &str {
        match self {
            Endpoint::Http(http) => &http.ip,
            Endpoint::Tcp(tcp) => &tcp.ip,
        }
    }

    pub fn port(&self) -> i64 {
        match self {
            Endpoint::Http(http) => http.port,
            Endpoint::Tcp(tcp) => tcp.port,
        }
    }
}

/// Parameter errors found before a worker starts probing
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("interval {interval}s must be greater than timeout {timeout}s")]
    IntervalNotAboveTimeout { interval: u64, timeout: u64 },

    #[error("target ip {0:?} is not an IPv4 address")]
    InvalidIp(String),

    #[error("target port {0} is out of range")]
    InvalidPort(i64),

    #[error("failed to build checker: {0}")]
    Checker(String),
}

/// One health check derived from a task, owned by the dispatcher
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthCheckDef {
    /// `<index>.<origin_id>`, unique across the cluster
    pub id: String,
    /// ID of the task this check was declared on
    pub origin_id: String,
    #[serde(default)]
    pub task_mode: TaskMode,
    #[serde(default)]
    pub reporter_mode: Option<ReporterMode>,
    #[serde(default)]
    pub delay_seconds: u64,
    #[serde(default)]
    pub grace_period_seconds: u64,
    pub interval_seconds: u64,
    pub timeout_seconds: u64,
    #[serde(default)]
    pub consecutive_failures: u32,
    pub endpoint: Endpoint,
    pub operation: Operation,
    #[serde(default)]
    pub status: CheckStatus,
    #[serde(default)]
    pub message: String,
}

impl HealthCheckDef {
    /// Build the ID of the `index`-th check declared on task `origin_id`.
    pub fn make_id(index: usize, origin_id: &str) -> String {
        format!("{}.{}", index, origin_id)
    }

    pub fn kind(&self) -> CheckKind {
        self.endpoint.kind()
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_seconds)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_secs(self.grace_period_seconds)
    }

    /// Check probe parameters once, before the first probe.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.interval_seconds <= self.timeout_seconds {
            return Err(ValidationError::IntervalNotAboveTimeout {
                interval: self.interval_seconds,
                timeout: self.timeout_seconds,
            });
        }

        let ip = self.endpoint.ip();
        if ip.parse::<Ipv4Addr>().is_err() {
            return Err(ValidationError::InvalidIp(ip.to_string()));
        }

        let port = self.endpoint.port();
        if port <= 0 || port > 65535 {
            return Err(ValidationError::InvalidPort(port));
        }

        Ok(())
    }
}

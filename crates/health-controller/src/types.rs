//! Types shared by the health controller components and its wire contracts.

use healthcheck::types::{Endpoint, HealthCheckDef, TaskMode};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

/// Kind of change carried by a [`SyncEvent`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SyncAction {
    Add,
    Update,
    Delete,
}

impl SyncAction {
    pub fn as_str(self) -> &'static str {
        match self {
            SyncAction::Add => "add",
            SyncAction::Update => "update",
            SyncAction::Delete => "delete",
        }
    }
}

impl fmt::Display for SyncAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Diff record from the watch tree, consumed once by the dispatcher
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncEvent {
    pub action: SyncAction,
    pub def: HealthCheckDef,
}

impl SyncEvent {
    pub fn add(def: HealthCheckDef) -> Self {
        Self {
            action: SyncAction::Add,
            def,
        }
    }

    pub fn update(def: HealthCheckDef) -> Self {
        Self {
            action: SyncAction::Update,
            def,
        }
    }

    pub fn delete(def: HealthCheckDef) -> Self {
        Self {
            action: SyncAction::Delete,
            def,
        }
    }
}

/// HTTP part of a scheduler report
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpReport {
    pub port: i64,
    pub scheme: String,
    pub path: String,
}

/// TCP part of a scheduler report
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TcpReport {
    pub port: i64,
}

/// Body of `POST /v1/healthcheck` on the scheduler
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthCheckReport {
    /// Task the check belongs to
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    /// `true` while the check passes
    pub status: bool,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http: Option<HttpReport>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tcp: Option<TcpReport>,
}

impl HealthCheckReport {
    pub fn from_def(def: &HealthCheckDef) -> Self {
        let (http, tcp) = match &def.endpoint {
            Endpoint::Http(http) => (
                Some(HttpReport {
                    port: http.port,
                    scheme: http.scheme.clone(),
                    path: http.path.clone(),
                }),
                None,
            ),
            Endpoint::Tcp(tcp) => (None, Some(TcpReport { port: tcp.port })),
        };

        Self {
            id: def.origin_id.clone(),
            kind: def.kind().wire_name().to_string(),
            status: def.status == healthcheck::CheckStatus::Running,
            message: def.message.clone(),
            http,
            tcp,
        }
    }
}

/// Identity blob this process registers in the registry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerInfo {
    pub cluster: String,
    pub ip: String,
    pub hostname: String,
    pub pid: u32,
    pub version: String,
    pub metric_port: u16,
}

impl ServerInfo {
    /// Registration key suffix, `<addr>.<pid>`
    pub fn instance_name(&self) -> String {
        format!("{}.{}", self.ip, self.pid)
    }
}

/// Where a component keeps its data
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    #[default]
    Etcd,
    Memory,
}

/// TLS material for the scheduler client and the etcd connection
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TlsFiles {
    pub ca_cert: Option<PathBuf>,
    pub client_cert: Option<PathBuf>,
    pub client_key: Option<PathBuf>,
}

impl TlsFiles {
    pub fn is_empty(&self) -> bool {
        self.ca_cert.is_none() && self.client_cert.is_none() && self.client_key.is_none()
    }
}

/// Runtime configuration handed to every component
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Cluster this controller serves
    pub cluster_id: String,

    /// Orchestrator the watched tasks come from
    pub task_mode: TaskMode,

    /// Address registered for this instance
    pub local_ip: Option<String>,

    /// Version string in the registration blob
    pub version: String,

    pub store_backend: Backend,
    pub store_endpoints: Vec<String>,

    /// Path of the `application` node of the task tree
    pub task_root: String,

    /// Bound on a single store read
    pub store_timeout: Duration,

    pub discovery_backend: Backend,
    pub discovery_endpoints: Vec<String>,

    /// Prefix of every registration key
    pub base_path: String,

    /// Module this controller registers as
    pub module: String,

    /// Registry path where scheduler instances register
    pub scheduler_path: String,

    /// Scheme used to reach the scheduler when its registration has none
    pub scheduler_scheme: String,

    /// Lifetime of registrations without keep-alive
    pub lease_ttl: Duration,

    pub tls: TlsFiles,

    /// SyncEvent queue depth
    pub event_queue: usize,

    /// Status report queue depth
    pub report_queue: usize,

    pub metrics_enabled: bool,
    pub metrics_listen_addr: String,
}

impl ServerConfig {
    /// Module-scope registration path, `<base>/<module>`
    pub fn module_path(&self) -> String {
        join_path(&self.base_path, &self.module)
    }

    /// Cluster-scope registration path, `<base>/<module>/<cluster>`
    pub fn cluster_path(&self) -> String {
        join_path(&self.module_path(), &self.cluster_id)
    }

    /// Port announced as `metricPort`
    pub fn metric_port(&self) -> u16 {
        self.metrics_listen_addr
            .rsplit_once(':')
            .and_then(|(_, port)| port.parse().ok())
            .unwrap_or(0)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            cluster_id: String::new(),
            task_mode: TaskMode::Mesos,
            local_ip: None,
            version: env!("CARGO_PKG_VERSION").to_string(),
            store_backend: Backend::Etcd,
            store_endpoints: vec!["http://127.0.0.1:2379".to_string()],
            task_root: "/swan/application".to_string(),
            store_timeout: Duration::from_secs(10),
            discovery_backend: Backend::Etcd,
            discovery_endpoints: vec!["http://127.0.0.1:2379".to_string()],
            base_path: "/registry".to_string(),
            module: "health-controller".to_string(),
            scheduler_path: "/registry/scheduler".to_string(),
            scheduler_scheme: "http".to_string(),
            lease_ttl: Duration::from_secs(10),
            tls: TlsFiles::default(),
            event_queue: 1024,
            report_queue: 1024,
            metrics_enabled: true,
            metrics_listen_addr: "0.0.0.0:9100".to_string(),
        }
    }
}

/// Join a store path and one more segment
pub fn join_path(parent: &str, child: &str) -> String {
    format!(
        "{}/{}",
        parent.trim_end_matches('/'),
        child.trim_start_matches('/')
    )
}

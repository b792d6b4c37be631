//! Configuration loading and validation for the health controller

use crate::types::{Backend, ServerConfig, TlsFiles, join_path};
use healthcheck::types::TaskMode;
use serde::{Deserialize, Serialize};
use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use validator::{Validate, ValidationError};

/// Environment variable naming an explicit configuration file
pub const CONFIG_ENV: &str = "HEALTH_CONTROLLER_CONFIG";

/// Configuration error types
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read configuration file: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to parse YAML: {0}")]
    ParseError(#[from] serde_yaml::Error),

    #[error("Invalid configuration: {0}")]
    ValidationError(#[from] validator::ValidationErrors),

    #[error("cluster.id is required")]
    MissingClusterId,
}

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub cluster: ClusterSettings,

    #[serde(default)]
    pub store: StoreSettings,

    #[serde(default)]
    pub discovery: DiscoverySettings,

    #[serde(default)]
    pub dispatcher: DispatcherSettings,

    #[serde(default)]
    pub metrics: MetricsSettings,

    #[serde(default)]
    pub telemetry: TelemetrySettings,

    #[serde(default)]
    pub logging: LoggingSettings,
}

impl Validate for Config {
    fn validate(&self) -> Result<(), validator::ValidationErrors> {
        self.cluster.validate()?;
        self.store.validate()?;
        self.discovery.validate()?;
        self.dispatcher.validate()?;
        self.metrics.validate()?;
        Ok(())
    }
}

/// Identity of the served cluster
#[derive(Debug, Clone, Default, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct ClusterSettings {
    /// Required; empty means unset
    pub id: String,

    pub mode: TaskMode,

    /// Registered address; detected when unset
    #[validate(custom = "validate_ipv4")]
    pub local_ip: Option<String>,

    pub version: Option<String>,
}

/// Coordination store holding the task tree
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct StoreSettings {
    pub backend: Backend,

    #[validate(length(min = 1))]
    pub endpoints: Vec<String>,

    /// Path of the `application` node
    #[validate(custom = "validate_store_path")]
    pub root: String,

    #[serde(with = "humantime_serde")]
    #[validate(custom = "validate_store_timeout")]
    pub timeout: Duration,
}

/// Registry used for election and scheduler discovery
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct DiscoverySettings {
    pub backend: Backend,

    #[validate(length(min = 1))]
    pub endpoints: Vec<String>,

    #[validate(custom = "validate_store_path")]
    pub base_path: String,

    #[validate(length(min = 1))]
    pub module: String,

    /// Module the schedulers register under
    #[validate(length(min = 1))]
    pub scheduler_module: String,

    /// Used when a scheduler registration carries no scheme
    pub scheduler_scheme: String,

    #[serde(with = "humantime_serde")]
    #[validate(custom = "validate_lease_ttl")]
    pub lease_ttl: Duration,

    pub tls: TlsFiles,
}

/// Queue depths of the dispatcher
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct DispatcherSettings {
    #[validate(range(min = 1, max = 100000))]
    pub event_queue: usize,

    #[validate(range(min = 1, max = 100000))]
    pub report_queue: usize,
}

/// Prometheus and health endpoint
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct MetricsSettings {
    pub enabled: bool,

    #[validate(custom = "validate_listen_addr")]
    pub listen_addr: String,
}

/// OpenTelemetry span export
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetrySettings {
    pub enabled: bool,
    pub service_name: String,
    pub otlp_endpoint: String,
}

/// Logging settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    pub level: Option<String>,
    pub format: Option<String>,
}

// Default implementations

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            backend: Backend::Etcd,
            endpoints: vec!["http://127.0.0.1:2379".to_string()],
            root: "/swan/application".to_string(),
            timeout: Duration::from_secs(10),
        }
    }
}

impl Default for DiscoverySettings {
    fn default() -> Self {
        Self {
            backend: Backend::Etcd,
            endpoints: vec!["http://127.0.0.1:2379".to_string()],
            base_path: "/registry".to_string(),
            module: "health-controller".to_string(),
            scheduler_module: "scheduler".to_string(),
            scheduler_scheme: "http".to_string(),
            lease_ttl: Duration::from_secs(10),
            tls: TlsFiles::default(),
        }
    }
}

impl Default for DispatcherSettings {
    fn default() -> Self {
        Self {
            event_queue: 1024,
            report_queue: 1024,
        }
    }
}

impl Default for MetricsSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            listen_addr: "0.0.0.0:9100".to_string(),
        }
    }
}

impl Default for TelemetrySettings {
    fn default() -> Self {
        Self {
            enabled: false,
            service_name: "health-controller".to_string(),
            otlp_endpoint: "http://localhost:4317".to_string(),
        }
    }
}

// Custom validators

fn validate_ipv4(ip: &str) -> Result<(), ValidationError> {
    ip.parse::<Ipv4Addr>()
        .map(|_| ())
        .map_err(|_| ValidationError::new("local_ip_not_ipv4"))
}

fn validate_store_path(path: &str) -> Result<(), ValidationError> {
    if !path.starts_with('/') {
        return Err(ValidationError::new("path_not_absolute"));
    }
    if path.len() > 1 && path.ends_with('/') {
        return Err(ValidationError::new("path_trailing_slash"));
    }
    Ok(())
}

fn validate_store_timeout(timeout: &Duration) -> Result<(), ValidationError> {
    let secs = timeout.as_secs();
    if !(1..=60).contains(&secs) {
        return Err(ValidationError::new("store_timeout_out_of_range"));
    }
    Ok(())
}

fn validate_lease_ttl(ttl: &Duration) -> Result<(), ValidationError> {
    if ttl.as_secs() < 2 {
        return Err(ValidationError::new("lease_ttl_too_short"));
    }
    Ok(())
}

fn validate_listen_addr(addr: &str) -> Result<(), ValidationError> {
    addr.parse::<SocketAddr>()
        .map(|_| ())
        .map_err(|_| ValidationError::new("listen_addr_invalid"))
}

// Configuration loading implementation

impl Config {
    /// Load configuration from the default search paths
    pub fn load() -> Result<Self, ConfigError> {
        match Self::find_config_file() {
            Some(path) => {
                tracing::info!("Loading configuration from: {}", path.display());
                Self::load_from_file(&path)
            }
            None => {
                tracing::info!("No configuration file found, using defaults");
                Ok(Self::default())
            }
        }
    }

    /// Load configuration from a specific file
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path.as_ref())?;
        Self::from_yaml(&contents)
    }

    /// Parse and validate a YAML document
    pub fn from_yaml(contents: &str) -> Result<Self, ConfigError> {
        let config: Config = serde_yaml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Find the configuration file; an explicit `$HEALTH_CONTROLLER_CONFIG` always wins
    fn find_config_file() -> Option<PathBuf> {
        if let Some(explicit) = std::env::var_os(CONFIG_ENV) {
            return Some(PathBuf::from(explicit));
        }

        let mut paths = vec![PathBuf::from("/etc/health-controller/config.yaml")];
        if let Some(home_path) = Self::home_config_path() {
            paths.push(home_path);
        }
        paths.push(PathBuf::from("./health-controller.yaml"));

        paths.into_iter().find(|p| p.is_file())
    }

    fn home_config_path() -> Option<PathBuf> {
        dirs::home_dir().map(|home| home.join(".config/health-controller/config.yaml"))
    }

    /// Convert to the runtime configuration; fails without a cluster id
    pub fn to_server_config(&self) -> Result<ServerConfig, ConfigError> {
        let cluster_id = self.cluster.id.trim();
        if cluster_id.is_empty() {
            return Err(ConfigError::MissingClusterId);
        }

        let defaults = ServerConfig::default();
        Ok(ServerConfig {
            cluster_id: cluster_id.to_string(),
            task_mode: self.cluster.mode,
            local_ip: self.cluster.local_ip.clone(),
            version: self.cluster.version.clone().unwrap_or(defaults.version),
            store_backend: self.store.backend,
            store_endpoints: self.store.endpoints.clone(),
            task_root: self.store.root.clone(),
            store_timeout: self.store.timeout,
            discovery_backend: self.discovery.backend,
            discovery_endpoints: self.discovery.endpoints.clone(),
            base_path: self.discovery.base_path.clone(),
            module: self.discovery.module.clone(),
            scheduler_path: join_path(&self.discovery.base_path, &self.discovery.scheduler_module),
            scheduler_scheme: self.discovery.scheduler_scheme.clone(),
            lease_ttl: self.discovery.lease_ttl,
            tls: self.discovery.tls.clone(),
            event_queue: self.dispatcher.event_queue,
            report_queue: self.dispatcher.report_queue,
            metrics_enabled: self.metrics.enabled,
            metrics_listen_addr: self.metrics.listen_addr.clone(),
        })
    }
}

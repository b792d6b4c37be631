//! Translation of task payloads into health check definitions.

use healthcheck::types::{
    CheckStatus, Endpoint, HealthCheckDef, HttpEndpoint, Operation, TaskMode, TcpEndpoint,
};
use serde::{Deserialize, Deserializer};
use std::collections::BTreeMap;
use thiserror::Error;
use tracing::warn;

/// Task status that maps to a running operation
pub const RUNNING_STATUS: &str = "Running";

/// Task payload errors
#[derive(Debug, Error)]
pub enum TaskError {
    #[error("invalid task payload: {0}")]
    Payload(#[from] serde_json::Error),

    #[error("task {0} declares no health checks")]
    NoHealthChecks(String),
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct TaskPayload {
    #[serde(rename = "ID")]
    id: String,
    #[serde(default)]
    status: String,
    #[serde(default)]
    network: String,
    #[serde(default, deserialize_with = "embedded_json")]
    status_data: StatusData,
    #[serde(default)]
    port_mappings: Vec<PortMapping>,
    #[serde(default)]
    health_checks: Vec<HealthCheckSpec>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct StatusData {
    #[serde(default)]
    node_address: String,
    #[serde(default, rename = "IPAddress")]
    ip_address: String,
    #[serde(default)]
    ports: Vec<BoundPort>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct BoundPort {
    #[serde(default)]
    host_port: i64,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct PortMapping {
    #[serde(default)]
    name: String,
    #[serde(default)]
    container_port: i64,
    #[serde(default)]
    host_port: i64,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct HealthCheckSpec {
    #[serde(rename = "Type")]
    kind: String,
    #[serde(default)]
    scheme: String,
    #[serde(default)]
    path: String,
    #[serde(default)]
    port: i64,
    #[serde(default)]
    port_name: String,
    #[serde(default)]
    headers: BTreeMap<String, String>,
    #[serde(default)]
    delay_seconds: u64,
    #[serde(default)]
    grace_period_seconds: u64,
    #[serde(default)]
    interval_seconds: u64,
    #[serde(default)]
    timeout_seconds: u64,
    #[serde(default)]
    consecutive_failures: u32,
}

/// `StatusData` arrives either as an object or as a string holding JSON
fn embedded_json<'de, D>(deserializer: D) -> Result<StatusData, D::Error>
where
    D: Deserializer<'de>,
{
    use serde::de::Error;

    match serde_json::Value::deserialize(deserializer)? {
        serde_json::Value::Null => Ok(StatusData::default()),
        serde_json::Value::String(raw) if raw.trim().is_empty() => Ok(StatusData::default()),
        serde_json::Value::String(raw) => serde_json::from_str(&raw).map_err(D::Error::custom),
        value => serde_json::from_value(value).map_err(D::Error::custom),
    }
}

impl TaskPayload {
    /// Whether checks target the node address instead of the container
    fn targets_node(&self) -> bool {
        match self.network.to_ascii_lowercase().as_str() {
            "host" => true,
            "bridge" => self.status_data.ports.iter().any(|p| p.host_port > 0),
            _ => false,
        }
    }

    fn resolve_target(&self, check: &HealthCheckSpec) -> Result<(String, i64), String> {
        let on_node = self.targets_node();
        let ip = if on_node {
            &self.status_data.node_address
        } else {
            &self.status_data.ip_address
        };

        let port = if check.port > 0 {
            check.port
        } else if !check.port_name.is_empty() {
            let mapping = self
                .port_mappings
                .iter()
                .find(|m| m.name == check.port_name)
                .ok_or_else(|| format!("port name {:?} has no mapping", check.port_name))?;
            if on_node && mapping.host_port > 0 {
                mapping.host_port
            } else {
                mapping.container_port
            }
        } else {
            0
        };

        if ip.is_empty() || port <= 0 {
            return Err(format!("no usable target, ip {:?} port {}", ip, port));
        }
        Ok((ip.clone(), port))
    }

    fn endpoint(&self, check: &HealthCheckSpec) -> Result<Endpoint, String> {
        let (ip, port) = self.resolve_target(check)?;
        match check.kind.as_str() {
            "REMOTE_HTTP" => Ok(Endpoint::Http(HttpEndpoint {
                ip,
                port,
                scheme: check.scheme.clone(),
                path: check.path.clone(),
                headers: check.headers.clone(),
            })),
            "REMOTE_TCP" => Ok(Endpoint::Tcp(TcpEndpoint { ip, port })),
            other => Err(format!("unsupported health check type {:?}", other)),
        }
    }
}

/// Derive the health checks declared on a task.
///
/// Checks whose type is not remote or whose target cannot be resolved are
/// skipped with a warning; the rest keep their declaration index in the ID.
pub fn health_checks_from_task(payload: &[u8]) -> Result<Vec<HealthCheckDef>, TaskError> {
    let task: TaskPayload = serde_json::from_slice(payload)?;
    if task.health_checks.is_empty() {
        return Err(TaskError::NoHealthChecks(task.id));
    }

    let operation = if task.status == RUNNING_STATUS {
        Operation::Running
    } else {
        Operation::Stopped
    };

    let defs = task
        .health_checks
        .iter()
        .enumerate()
        .filter_map(|(index, check)| match task.endpoint(check) {
            Ok(endpoint) => Some(HealthCheckDef {
                id: HealthCheckDef::make_id(index, &task.id),
                origin_id: task.id.clone(),
                task_mode: TaskMode::default(),
                reporter_mode: None,
                delay_seconds: check.delay_seconds,
                grace_period_seconds: check.grace_period_seconds,
                interval_seconds: check.interval_seconds,
                timeout_seconds: check.timeout_seconds,
                consecutive_failures: check.consecutive_failures,
                endpoint,
                operation,
                status: CheckStatus::Running,
                message: String::new(),
            }),
            Err(reason) => {
                warn!(task = %task.id, index, reason = %reason, "Skipping health check");
                None
            }
        })
        .collect();

    Ok(defs)
}

//! Report sink: discovers the scheduler leader and posts status reports to it.

use crate::discovery::{DiscoveryError, Registry, RegistryEntry};
use crate::dispatcher::ReportTarget;
use crate::metrics::MetricsRegistry;
use crate::supervisor::{BackoffPolicy, Exit, Supervisor};
use crate::types::{HealthCheckReport, TlsFiles};
use async_trait::async_trait;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::{Instant, interval_at};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Delay before discovery restarts after an error
pub const DISCOVERY_RETRY_DELAY: Duration = Duration::from_secs(3);

/// Period of the discovery liveness log
pub const LIVENESS_INTERVAL: Duration = Duration::from_secs(180);

/// Scheduler endpoint receiving status reports
pub const REPORT_PATH: &str = "/v1/healthcheck";

/// Report delivery errors
#[derive(Debug, Error)]
pub enum SinkError {
    #[error("no scheduler leader known")]
    NoLeader,

    #[error("scheduler request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("scheduler rejected report with status {0}")]
    Rejected(u16),
}

/// Registration blob of a scheduler instance
#[derive(Debug, Deserialize)]
struct SchedulerEntry {
    ip: String,
    port: u16,
    #[serde(default)]
    scheme: Option<String>,
}

/// Base URL of the scheduler registered as `entry`
pub fn scheduler_url(entry: &RegistryEntry, default_scheme: &str) -> Result<String, DiscoveryError> {
    let decoded: SchedulerEntry =
        serde_json::from_slice(&entry.value).map_err(|e| DiscoveryError::Decode {
            key: entry.key.clone(),
            reason: e.to_string(),
        })?;
    let scheme = decoded
        .scheme
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| default_scheme.to_string());
    Ok(format!("{}://{}:{}", scheme, decoded.ip, decoded.port))
}

/// HTTP client for scheduler reports, with optional CA and client identity
pub async fn scheduler_client(tls: &TlsFiles, timeout: Duration) -> common::Result<reqwest::Client> {
    let mut builder = reqwest::Client::builder().timeout(timeout);

    if let Some(ref ca) = tls.ca_cert {
        let pem = tokio::fs::read(ca).await?;
        let cert = reqwest::Certificate::from_pem(&pem).map_err(common::Error::config)?;
        builder = builder.add_root_certificate(cert);
    }

    if let (Some(cert), Some(key)) = (&tls.client_cert, &tls.client_key) {
        let mut pem = tokio::fs::read(cert).await?;
        pem.extend_from_slice(&tokio::fs::read(key).await?);
        let identity = reqwest::Identity::from_pem(&pem).map_err(common::Error::config)?;
        builder = builder.identity(identity);
    }

    builder.build().map_err(common::Error::config)
}

/// Sends reports to whichever scheduler currently leads
pub struct ReportSink {
    registry: Arc<dyn Registry>,
    path: String,
    default_scheme: String,
    client: reqwest::Client,
    leader: watch::Sender<Option<String>>,
    metrics: Option<Arc<MetricsRegistry>>,
}

impl ReportSink {
    /// Discover schedulers registered under `path`
    pub fn new(
        registry: Arc<dyn Registry>,
        path: impl Into<String>,
        default_scheme: impl Into<String>,
        client: reqwest::Client,
        metrics: Option<Arc<MetricsRegistry>>,
    ) -> Self {
        let (leader, _) = watch::channel(None);
        Self {
            registry,
            path: path.into(),
            default_scheme: default_scheme.into(),
            client,
            leader,
            metrics,
        }
    }

    /// Current leader URL
    pub fn leader(&self) -> Option<String> {
        self.leader.borrow().clone()
    }

    /// True while a leader is known
    pub fn is_healthy(&self) -> bool {
        self.leader.borrow().is_some()
    }

    /// Leader changes
    pub fn subscribe(&self) -> watch::Receiver<Option<String>> {
        self.leader.subscribe()
    }

    /// Keep the leader current until `scope` ends, restarting discovery on errors
    pub async fn run(&self, scope: CancellationToken) {
        info!(path = %self.path, "Scheduler discovery started");
        let supervisor = Supervisor::new(
            "scheduler-discovery",
            BackoffPolicy::fixed(DISCOVERY_RETRY_DELAY),
            scope.clone(),
        )
        .with_metrics(self.metrics.clone());

        let outcome = supervisor
            .run(|| async {
                let result = self.discover(&scope).await;
                if result.is_err() {
                    self.set_leader(None);
                }
                result
            })
            .await;
        match outcome {
            Ok(()) => debug!(path = %self.path, "Scheduler discovery ended"),
            Err(Exit::Cancelled) => debug!(path = %self.path, "Scheduler discovery cancelled"),
            Err(Exit::Exhausted(e)) => warn!(path = %self.path, error = %e, "Scheduler discovery gave up"),
        }

        self.set_leader(None);
        info!(path = %self.path, "Scheduler discovery stopped");
    }

    /// One discovery session; returns `Ok` only when cancelled
    async fn discover(&self, scope: &CancellationToken) -> Result<(), DiscoveryError> {
        let mut entries = self.registry.watch(&self.path).await?;
        let mut liveness = interval_at(Instant::now() + LIVENESS_INTERVAL, LIVENESS_INTERVAL);

        loop {
            tokio::select! {
                _ = scope.cancelled() => return Ok(()),
                _ = liveness.tick() => {
                    info!(path = %self.path, leader = ?self.leader(), "Scheduler discovery alive");
                }
                update = entries.recv() => match update {
                    Some(Ok(list)) => self.apply(&list),
                    Some(Err(e)) => return Err(e),
                    None => return Err(DiscoveryError::Closed),
                },
            }
        }
    }

    fn apply(&self, entries: &[RegistryEntry]) {
        let leader = match entries.first() {
            Some(first) => match scheduler_url(first, &self.default_scheme) {
                Ok(url) => Some(url),
                Err(e) => {
                    warn!(error = %e, "Ignoring undecodable scheduler registration");
                    None
                }
            },
            None => None,
        };
        self.set_leader(leader);
    }

    fn set_leader(&self, leader: Option<String>) {
        let known = leader.is_some();
        let changed = self.leader.send_if_modified(|current| {
            if *current == leader {
                return false;
            }
            *current = leader.clone();
            true
        });
        if changed {
            match leader {
                Some(ref url) => info!(leader = %url, "Scheduler leader changed"),
                None => warn!(path = %self.path, "Scheduler leader unknown"),
            }
        }
        if let Some(ref m) = self.metrics {
            m.set_scheduler_leader_known(known);
        }
    }
}

#[async_trait]
impl ReportTarget for ReportSink {
    async fn send(&self, report: &HealthCheckReport) -> Result<(), SinkError> {
        let leader = self.leader().ok_or(SinkError::NoLeader)?;
        let url = format!("{}{}", leader, REPORT_PATH);

        let response = self.client.post(&url).json(report).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(SinkError::Rejected(status.as_u16()));
        }

        debug!(url = %url, id = %report.id, status = report.status, "Report accepted");
        Ok(())
    }
}

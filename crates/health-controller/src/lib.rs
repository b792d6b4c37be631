//! Health controller: remote health checking for orchestrated tasks.
//!
//! Instances of the controller register in a registry and elect a master.
//! The master mirrors the task tree of the coordination store into a set of
//! health checks, probes every running task's endpoints, and reports status
//! changes to the current scheduler leader.
//!
//! # Components
//!
//! - **TaskWatchTree**: recursive store watcher emitting add/update/delete events
//! - **ClusterAdapter**: tags events with the cluster's task mode
//! - **Dispatcher**: owns one probe worker per health check
//! - **ReportSink**: discovers the scheduler leader and posts reports
//! - **ElectedServer**: registration, election and the master term scope

pub mod adapter;
pub mod backend;
pub mod config;
pub mod discovery;
pub mod dispatcher;
pub mod election;
pub mod http_server;
pub mod metrics;
pub mod sink;
pub mod store;
pub mod supervisor;
pub mod task;
pub mod telemetry;
pub mod types;
pub mod watch_tree;

pub use adapter::ClusterAdapter;
pub use config::{Config, ConfigError};
pub use dispatcher::{DispatchError, Dispatcher, ReportTarget};
pub use election::{ElectedServer, Role};
pub use http_server::MetricsServer;
pub use metrics::MetricsRegistry;
pub use sink::{ReportSink, SinkError};
pub use telemetry::{TelemetryGuard, setup_tracing};
pub use types::{ServerConfig, ServerInfo, SyncAction, SyncEvent};
pub use watch_tree::{NodeKind, TaskWatchTree, WatchError};

use std::net::UdpSocket;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Bound on one scheduler report request
pub const REPORT_TIMEOUT: Duration = Duration::from_secs(10);

/// Address of the interface that routes outbound traffic. Sends nothing.
pub fn detect_local_ip() -> common::Result<String> {
    let socket = UdpSocket::bind("0.0.0.0:0")?;
    socket.connect("8.8.8.8:80")?;
    Ok(socket.local_addr()?.ip().to_string())
}

/// Identity registered by this process
pub fn server_info(config: &ServerConfig) -> common::Result<ServerInfo> {
    let ip = match config.local_ip {
        Some(ref ip) => ip.clone(),
        None => detect_local_ip()?,
    };
    let hostname = nix::unistd::gethostname()
        .map_err(common::Error::other)?
        .to_string_lossy()
        .into_owned();

    Ok(ServerInfo {
        cluster: config.cluster_id.clone(),
        ip,
        hostname,
        pid: std::process::id(),
        version: config.version.clone(),
        metric_port: config.metric_port(),
    })
}

/// Run the controller until `scope` is cancelled
pub async fn run(config: ServerConfig, scope: CancellationToken) -> common::Result<()> {
    let metrics = if config.metrics_enabled {
        info!("Metrics enabled on {}", config.metrics_listen_addr);
        Some(Arc::new(MetricsRegistry::new()))
    } else {
        info!("Metrics disabled");
        None
    };

    let info = server_info(&config)?;
    let store = backend::open_store(&config).await?;
    let registry = backend::open_registry(&config, scope.clone()).await?;
    let client = sink::scheduler_client(&config.tls, REPORT_TIMEOUT).await?;
    let sink = Arc::new(ReportSink::new(
        registry.clone(),
        config.scheduler_path.clone(),
        config.scheduler_scheme.clone(),
        client,
        metrics.clone(),
    ));

    let listen_addr = config.metrics_listen_addr.clone();
    let server = Arc::new(ElectedServer::new(
        config,
        info,
        store,
        registry,
        sink,
        metrics.clone(),
    ));

    let http = metrics.map(|registry| {
        let http_server = MetricsServer::new(registry, server.clone(), listen_addr);
        let http_scope = scope.clone();
        tokio::spawn(async move {
            if let Err(e) = http_server.run(http_scope).await {
                warn!(error = %e, "Metrics server error");
            }
        })
    });

    server.run(scope).await;

    if let Some(handle) = http {
        if let Err(e) = handle.await {
            warn!(error = %e, "Metrics server task failed");
        }
    }
    Ok(())
}

//! Health controller binary

use health_controller::{Config, setup_tracing};
use tokio::signal::unix::{SignalKind, signal};
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Tracing depends on the logging section, so report config errors on stderr
    let config = match Config::load() {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Configuration error: {}", e);
            return Err(e.into());
        }
    };

    let _telemetry_guard = setup_tracing(&config.telemetry, &config.logging)?;

    let server_config = match config.to_server_config() {
        Ok(cfg) => cfg,
        Err(e) => {
            tracing::error!(error = %e, "Refusing to start");
            return Err(e.into());
        }
    };

    tracing::info!(
        cluster = %server_config.cluster_id,
        version = %server_config.version,
        "Health controller starting"
    );

    let scope = CancellationToken::new();
    let mut terminate = signal(SignalKind::terminate())?;
    let shutdown = scope.clone();
    tokio::spawn(async move {
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                if let Err(e) = result {
                    tracing::warn!(error = %e, "Failed to listen for ctrl-c");
                    return;
                }
            }
            _ = terminate.recv() => {}
        }
        tracing::info!("Shutdown requested");
        shutdown.cancel();
    });

    health_controller::run(server_config, scope).await?;

    tracing::info!("Health controller stopped");
    Ok(())
}

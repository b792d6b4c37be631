//! Tracing bootstrap with optional OpenTelemetry span export.

use crate::config::{LoggingSettings, TelemetrySettings};
use common::logging::{self, LogFormat};
use opentelemetry::{KeyValue, trace::TracerProvider as _};
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::{
    Resource, runtime,
    trace::{RandomIdGenerator, Sampler, TracerProvider},
};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Default level when neither `RUST_LOG` nor the config sets one
pub const DEFAULT_LOG_LEVEL: &str = "info";

/// Flushes pending spans and shuts the tracer provider down when dropped
pub struct TelemetryGuard {
    provider: TracerProvider,
}

impl Drop for TelemetryGuard {
    fn drop(&mut self) {
        if let Err(e) = self.provider.shutdown() {
            eprintln!("Failed to shut down tracer provider: {}", e);
        }
    }
}

/// Build an OTLP/gRPC tracer provider for `service_name`
pub fn init_tracer_provider(
    service_name: &str,
    otlp_endpoint: &str,
) -> Result<TracerProvider, Box<dyn std::error::Error>> {
    let exporter = opentelemetry_otlp::SpanExporter::builder()
        .with_tonic()
        .with_endpoint(otlp_endpoint)
        .build()?;

    let resource = Resource::new(vec![
        KeyValue::new("service.name", service_name.to_string()),
        KeyValue::new("service.version", env!("CARGO_PKG_VERSION").to_string()),
    ]);

    Ok(TracerProvider::builder()
        .with_batch_exporter(exporter, runtime::Tokio)
        .with_config(
            opentelemetry_sdk::trace::Config::default()
                .with_sampler(Sampler::AlwaysOn)
                .with_id_generator(RandomIdGenerator::default())
                .with_resource(resource),
        )
        .build())
}

/// Install the global subscriber.
///
/// Without telemetry this is plain `common::logging`; with it, spans are also
/// exported over OTLP until the returned guard is dropped.
pub fn setup_tracing(
    telemetry: &TelemetrySettings,
    logging_settings: &LoggingSettings,
) -> Result<Option<TelemetryGuard>, Box<dyn std::error::Error>> {
    let level = logging_settings
        .level
        .as_deref()
        .unwrap_or(DEFAULT_LOG_LEVEL);
    let format = LogFormat::from_name(logging_settings.format.as_deref());

    if !telemetry.enabled {
        match format {
            LogFormat::Json => logging::init_json(level),
            LogFormat::Plain => logging::init(level),
        }
        tracing::info!("Tracing initialized without OpenTelemetry");
        return Ok(None);
    }

    let provider = init_tracer_provider(&telemetry.service_name, &telemetry.otlp_endpoint)?;
    let otel = tracing_opentelemetry::layer().with_tracer(provider.tracer("health-controller"));
    let registry = tracing_subscriber::registry()
        .with(logging::env_filter(level))
        .with(otel);

    match format {
        LogFormat::Json => registry.with(fmt::layer().json()).try_init()?,
        LogFormat::Plain => registry.with(fmt::layer()).try_init()?,
    }

    tracing::info!(
        service_name = %telemetry.service_name,
        otlp_endpoint = %telemetry.otlp_endpoint,
        "Tracing initialized with OpenTelemetry export"
    );
    Ok(Some(TelemetryGuard { provider }))
}

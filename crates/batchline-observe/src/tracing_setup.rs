//! Tracing subscriber initialization for processes hosting the batch engine.
//!
//! ```no_run
//! // Structured logging only
//! batchline_observe::tracing_setup::init_tracing(false).unwrap();
//!
//! // Also export job and step spans to stdout through OpenTelemetry
//! batchline_observe::tracing_setup::init_tracing(true).unwrap();
//! ```

use batchline_types::config::EngineConfig;
use opentelemetry::trace::TracerProvider as _;
use opentelemetry_sdk::trace::SdkTracerProvider;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use std::sync::OnceLock;

/// Directives used when `RUST_LOG` is unset: engine lifecycle at info,
/// everything else at warn.
pub const DEFAULT_FILTER: &str = "warn,batchline_core=info,batchline_infra=info";

static TRACER_PROVIDER: OnceLock<SdkTracerProvider> = OnceLock::new();

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER))
}

/// Install the global subscriber.
///
/// The `fmt` layer reports span close timing, so each job and step span logs
/// its duration. With `enable_otel` the same spans are bridged to an
/// OpenTelemetry stdout exporter under the tracer name `batchline`.
///
/// # Errors
///
/// Fails if a global subscriber is already installed.
pub fn init_tracing(enable_otel: bool) -> Result<(), Box<dyn std::error::Error>> {
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_span_events(FmtSpan::CLOSE);

    if enable_otel {
        let provider = SdkTracerProvider::builder()
            .with_simple_exporter(opentelemetry_stdout::SpanExporter::default())
            .build();
        let tracer = provider.tracer("batchline");
        let otel_layer = tracing_opentelemetry::layer().with_tracer(tracer);

        tracing_subscriber::registry()
            .with(env_filter())
            .with(fmt_layer)
            .with(otel_layer)
            .try_init()?;

        let _ = TRACER_PROVIDER.set(provider.clone());
        opentelemetry::global::set_tracer_provider(provider);
    } else {
        tracing_subscriber::registry()
            .with(env_filter())
            .with(fmt_layer)
            .try_init()?;
    }

    tracing::debug!(otel = enable_otel, "tracing initialized");
    Ok(())
}

/// [`init_tracing`] driven by the `enable_otel` flag of the engine config.
pub fn init_tracing_from_config(config: &EngineConfig) -> Result<(), Box<dyn std::error::Error>> {
    init_tracing(config.enable_otel)
}

/// Flush buffered spans and shut the tracer provider down. No-op when
/// OpenTelemetry was never enabled.
pub fn shutdown_tracing() {
    if let Some(provider) = TRACER_PROVIDER.get() {
        if let Err(e) = provider.shutdown() {
            eprintln!("Warning: OTel tracer provider shutdown error: {e}");
        }
    }
}

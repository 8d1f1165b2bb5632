//! Logging setup.
//!
//! `CONDUCTOR_LOG` is an `EnvFilter` directive (default `warn`); output goes
//! to stderr so stdout stays parseable. `CONDUCTOR_LOG_FORMAT=json` switches
//! to JSON lines. With the `otel` feature and `OTEL_EXPORTER_OTLP_ENDPOINT`
//! set, spans are also exported over OTLP/HTTP.

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

/// Flushes exported spans when dropped. Keep it alive for the whole run.
#[must_use]
pub struct TelemetryGuard {
    #[cfg(feature = "otel")]
    provider: Option<opentelemetry_sdk::trace::SdkTracerProvider>,
}

impl TelemetryGuard {
    #[cfg(feature = "otel")]
    fn flush(&mut self) {
        if let Some(provider) = self.provider.take() {
            let _ = provider.shutdown();
        }
    }

    #[cfg(not(feature = "otel"))]
    fn flush(&mut self) {}
}

impl Drop for TelemetryGuard {
    fn drop(&mut self) {
        self.flush();
    }
}

fn filter() -> EnvFilter {
    EnvFilter::try_from_env("CONDUCTOR_LOG").unwrap_or_else(|_| EnvFilter::new("warn"))
}

fn json_requested() -> bool {
    std::env::var("CONDUCTOR_LOG_FORMAT").is_ok_and(|v| v.eq_ignore_ascii_case("json"))
}

#[cfg(feature = "otel")]
pub fn init() -> TelemetryGuard {
    use opentelemetry::trace::TracerProvider as _;

    let json = json_requested();
    let provider = otlp_provider();
    let otel_layer = provider
        .as_ref()
        .map(|p| tracing_opentelemetry::layer().with_tracer(p.tracer("conductor")));

    let _ = tracing_subscriber::registry()
        .with(filter())
        .with(json.then(|| fmt::layer().json().with_writer(std::io::stderr)))
        .with((!json).then(|| fmt::layer().compact().with_writer(std::io::stderr)))
        .with(otel_layer)
        .try_init();

    TelemetryGuard { provider }
}

#[cfg(not(feature = "otel"))]
pub fn init() -> TelemetryGuard {
    let json = json_requested();
    let _ = tracing_subscriber::registry()
        .with(filter())
        .with(json.then(|| fmt::layer().json().with_writer(std::io::stderr)))
        .with((!json).then(|| fmt::layer().compact().with_writer(std::io::stderr)))
        .try_init();
    TelemetryGuard {}
}

/// The exporter reads `OTEL_EXPORTER_OTLP_ENDPOINT` itself and appends
/// `/v1/traces`.
#[cfg(feature = "otel")]
fn otlp_provider() -> Option<opentelemetry_sdk::trace::SdkTracerProvider> {
    use opentelemetry_sdk::Resource;
    use opentelemetry_sdk::trace::SdkTracerProvider;

    let endpoint = std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT").ok()?;
    if endpoint.trim().is_empty() {
        return None;
    }
    let exporter = match opentelemetry_otlp::SpanExporter::builder().with_http().build() {
        Ok(exporter) => exporter,
        Err(e) => {
            eprintln!("warning: OTLP export disabled: {e}");
            return None;
        }
    };
    Some(
        SdkTracerProvider::builder()
            .with_batch_exporter(exporter)
            .with_resource(Resource::builder().with_service_name("conductor").build())
            .build(),
    )
}

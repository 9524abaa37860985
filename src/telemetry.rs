//! Tracing initialization.
//!
//! Logs go to stderr, filtered by `HERD_LOG` (default `warn`). Set
//! `HERD_LOG_FORMAT=json` for machine-readable output. With the `otel`
//! feature and `OTEL_EXPORTER_OTLP_ENDPOINT` set, spans and logs are also
//! exported over OTLP.

use tracing_subscriber::layer::SubscriberExt as _;
use tracing_subscriber::util::SubscriberInitExt as _;
use tracing_subscriber::{EnvFilter, Layer, Registry};

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

/// Guard returned by [`init`]. Flushes exporters on drop.
pub struct Telemetry {
    #[cfg(feature = "otel")]
    tracer_provider: Option<opentelemetry_sdk::trace::SdkTracerProvider>,
    #[cfg(feature = "otel")]
    logger_provider: Option<opentelemetry_sdk::logs::SdkLoggerProvider>,
}

impl Drop for Telemetry {
    fn drop(&mut self) {
        #[cfg(feature = "otel")]
        {
            if let Some(provider) = self.tracer_provider.take() {
                let _ = provider.shutdown();
            }
            if let Some(provider) = self.logger_provider.take() {
                let _ = provider.shutdown();
            }
        }
    }
}

/// Install the global tracing subscriber.
pub fn init() -> Telemetry {
    let filter = EnvFilter::try_from_env("HERD_LOG").unwrap_or_else(|_| EnvFilter::new("warn"));
    let json = std::env::var("HERD_LOG_FORMAT").is_ok_and(|v| v == "json");

    let mut layers: Vec<BoxedLayer> = vec![filter.boxed()];

    if json {
        layers.push(
            tracing_subscriber::fmt::layer()
                .json()
                .with_writer(std::io::stderr)
                .boxed(),
        );
    } else {
        layers.push(
            tracing_subscriber::fmt::layer()
                .without_time()
                .with_target(false)
                .with_writer(std::io::stderr)
                .boxed(),
        );
    }

    #[cfg(not(feature = "otel"))]
    let telemetry = Telemetry {};

    #[cfg(feature = "otel")]
    let telemetry = {
        let (otel_layers, tracer_provider, logger_provider) = otel_layers();
        layers.extend(otel_layers);
        Telemetry {
            tracer_provider,
            logger_provider,
        }
    };

    let _ = tracing_subscriber::registry().with(layers).try_init();

    telemetry
}

#[cfg(feature = "otel")]
#[allow(clippy::type_complexity)]
fn otel_layers() -> (
    Vec<BoxedLayer>,
    Option<opentelemetry_sdk::trace::SdkTracerProvider>,
    Option<opentelemetry_sdk::logs::SdkLoggerProvider>,
) {
    use opentelemetry::trace::TracerProvider as _;

    if std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT").is_err() {
        return (Vec::new(), None, None);
    }

    let span_exporter = opentelemetry_otlp::SpanExporter::builder().with_http().build();
    let log_exporter = opentelemetry_otlp::LogExporter::builder().with_http().build();

    let (Ok(span_exporter), Ok(log_exporter)) = (span_exporter, log_exporter) else {
        eprintln!("warning: OTLP exporter setup failed; telemetry export disabled");
        return (Vec::new(), None, None);
    };

    let tracer_provider = opentelemetry_sdk::trace::SdkTracerProvider::builder()
        .with_batch_exporter(span_exporter)
        .build();
    let logger_provider = opentelemetry_sdk::logs::SdkLoggerProvider::builder()
        .with_batch_exporter(log_exporter)
        .build();

    let tracer = tracer_provider.tracer("herd");
    let layers: Vec<BoxedLayer> = vec![
        tracing_opentelemetry::layer().with_tracer(tracer).boxed(),
        opentelemetry_appender_tracing::layer::OpenTelemetryTracingBridge::new(&logger_provider)
            .boxed(),
    ];

    (layers, Some(tracer_provider), Some(logger_provider))
}

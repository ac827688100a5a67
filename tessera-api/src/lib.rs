use opentelemetry::{global, trace::TracerProvider, KeyValue};
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::Resource;
use opentelemetry_semantic_conventions::resource::SERVICE_NAME;

use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

mod server;

pub use server::{router, serve, AppState, ServeOptions, DEFAULT_BODY_LIMIT};

const DEFAULT_FILTER: &str =
    "tessera_api=debug,tessera_core=info,axum_tracing_opentelemetry=info,otel=debug";

/// Installs the global subscriber: stdout (pretty or JSON), plus OTLP span
/// export and Sentry events when configured.
pub fn init_tracing(
    otlp_endpoint: Option<&str>,
    otlp_service_name: String,
    json_output: bool,
    use_sentry: bool,
) -> anyhow::Result<()> {
    let otel_layer = match otlp_endpoint {
        Some(endpoint) => {
            let provider = opentelemetry_sdk::trace::TracerProvider::builder()
                .with_batch_exporter(
                    opentelemetry_otlp::SpanExporter::builder()
                        .with_tonic()
                        .with_endpoint(endpoint)
                        .build()?,
                    opentelemetry_sdk::runtime::Tokio,
                )
                .with_resource(Resource::new(vec![KeyValue::new(
                    SERVICE_NAME,
                    otlp_service_name,
                )]))
                .build();
            let tracer = provider.tracer("tessera");
            global::set_tracer_provider(provider);
            Some(tracing_opentelemetry::layer().with_tracer(tracer))
        }
        None => None,
    };

    let env_filter =
        EnvFilter::try_from_env("LOG_LEVEL").unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    let fmt_layer = if json_output {
        tracing_subscriber::fmt::layer()
            .json()
            .flatten_event(true)
            .with_line_number(true)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer()
            .pretty()
            .with_line_number(true)
            .with_thread_names(true)
            .with_span_events(FmtSpan::CLOSE)
            .with_timer(tracing_subscriber::fmt::time::uptime())
            .boxed()
    };

    tracing_subscriber::registry()
        .with(fmt_layer)
        .with(env_filter)
        .with(otel_layer)
        .with(use_sentry.then(sentry_tracing::layer))
        .try_init()?;
    Ok(())
}

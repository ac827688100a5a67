use std::{net::SocketAddr, path::PathBuf, sync::Arc};

use anyhow::Context;
use clap::Parser;
use mimalloc::MiMalloc;
use tessera_api::{init_tracing, serve, ServeOptions, DEFAULT_BODY_LIMIT};
use tessera_core::{config::default_config_path, ConfigLayers, Converter, Registry};

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// OpenTelemetry collector endpoint
    #[arg(long, env = "OTLP_ENDPOINT")]
    otlp_endpoint: Option<String>,

    /// Sentry DSN
    #[arg(long, env = "SENTRY_DSN")]
    sentry_dsn: Option<String>,

    /// Sentry environment
    #[arg(long, env = "SENTRY_ENVIRONMENT", default_value = "dev")]
    sentry_environment: String,

    /// API listen address
    #[arg(long, env = "API_LISTEN_ADDR", default_value = "0.0.0.0:3002")]
    listen_addr: SocketAddr,

    /// Maximum upload size in bytes
    #[arg(long, env = "API_BODY_LIMIT", default_value_t = DEFAULT_BODY_LIMIT)]
    body_limit: usize,

    /// Emit logs as JSON lines
    #[arg(long, env = "API_JSON_LOGS", default_value_t = false)]
    json_logs: bool,

    /// Config file (TOML, or JSON by extension)
    #[arg(long, short, env = "TESSERA_CONFIG")]
    config: Option<PathBuf>,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    // Set before any runtime thread exists.
    if std::env::var_os("TOKENIZERS_PARALLELISM").is_none() {
        std::env::set_var("TOKENIZERS_PARALLELISM", "false");
    }
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("can't build tokio runtime")?
        .block_on(run(args))
}

async fn run(args: Args) -> anyhow::Result<()> {

    let use_sentry = args.sentry_dsn.is_some();
    let _guard = args.sentry_dsn.map(|dsn| {
        sentry::init((
            dsn,
            sentry::ClientOptions {
                release: sentry::release_name!(),
                traces_sample_rate: 1f32,
                sample_rate: 1f32,
                environment: Some(args.sentry_environment.into()),
                ..Default::default()
            },
        ))
    });

    init_tracing(
        args.otlp_endpoint.as_deref(),
        "tessera-api".into(),
        args.json_logs,
        use_sentry,
    )
    .context("can't setup tracing for API")?;

    let mut layers = ConfigLayers::from_env();
    if let Some(path) = args.config.or_else(default_config_path) {
        layers = layers
            .with_file(&path)
            .with_context(|| format!("can't load config file {}", path.display()))?;
    }
    let registry = Registry::with_defaults().context("can't build component registry")?;
    let converter =
        Converter::new(Arc::new(registry), layers).context("invalid service settings")?;

    serve(
        Arc::new(converter),
        ServeOptions {
            listen_addr: args.listen_addr,
            body_limit: args.body_limit,
            otel: args.otlp_endpoint.is_some(),
        },
    )
    .await
}

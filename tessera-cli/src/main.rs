mod explore;

use std::{
    fmt::Write as _,
    net::{IpAddr, SocketAddr},
    path::{Path, PathBuf},
    process::ExitCode,
    sync::Arc,
    time::Duration,
};

use clap::{Args, Parser, Subcommand};
use colored::*;
use indicatif::{ProgressBar, ProgressState, ProgressStyle};
use tessera_api::{ServeOptions, DEFAULT_BODY_LIMIT};
use tessera_core::{
    batch::{convert_batch, BatchItem, BatchOptions},
    config::default_config_path,
    output::{results_dir, sanitize_doc_name, write_outputs},
    ConfigLayers, ConversionError, ConversionRequest, Converter, OutputFormat, Registry,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

const DEFAULT_FILTER: &str = "tessera=info,tessera_core=warn";

#[derive(Parser, Debug)]
#[command(
    version,
    about = "Tessera - staged, pluggable document conversion",
    long_about = "Tessera converts documents into a typed block tree and renders it as Markdown, JSON, HTML or retrieval chunks."
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Convert a single document
    Convert {
        file: PathBuf,
        #[command(flatten)]
        common: CommonArgs,
    },
    /// Convert every file in a directory on a worker pool
    Batch {
        dir: PathBuf,
        #[command(flatten)]
        common: CommonArgs,
        /// Documents converted in parallel (defaults to the `workers` setting)
        #[arg(long)]
        workers: Option<usize>,
        /// Per-document time limit in seconds
        #[arg(long)]
        timeout_secs: Option<u64>,
    },
    /// Run the HTTP conversion service
    Serve {
        #[arg(long, env = "TESSERA_PORT", default_value_t = 3002)]
        port: u16,
        #[arg(long, env = "TESSERA_HOST", default_value = "0.0.0.0")]
        host: IpAddr,
        #[command(flatten)]
        config: ConfigArgs,
    },
    /// Convert a document and explore its block tree interactively
    Explore {
        file: PathBuf,
        #[command(flatten)]
        config: ConfigArgs,
    },
}

#[derive(Args, Debug)]
struct ConfigArgs {
    /// Config file (TOML, or JSON by extension)
    #[arg(long, short, env = "TESSERA_CONFIG")]
    config: Option<PathBuf>,

    /// Option override, e.g. `--set use_llm=true`. Repeatable.
    #[arg(long = "set", value_name = "KEY=VALUE")]
    overrides: Vec<String>,
}

#[derive(Args, Debug)]
struct CommonArgs {
    /// Directory where `<name>-results/` folders are created
    #[arg(long)]
    output_dir: Option<PathBuf>,

    /// Output format (md, json, html, chunks). Repeatable, defaults to md.
    #[arg(long = "format", short = 'f')]
    formats: Vec<OutputFormat>,

    #[command(flatten)]
    config: ConfigArgs,
}

impl CommonArgs {
    fn formats(&self) -> Vec<OutputFormat> {
        if self.formats.is_empty() {
            vec![OutputFormat::Markdown]
        } else {
            self.formats.clone()
        }
    }

    fn output_dir(&self, converter: &Converter) -> anyhow::Result<PathBuf> {
        match self.output_dir.clone().or_else(|| converter.settings().output_dir.clone()) {
            Some(dir) => Ok(dir),
            None => Ok(std::env::current_dir()?),
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_env("LOG_LEVEL").unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn build_converter(args: &ConfigArgs) -> Result<Converter, ConversionError> {
    let mut layers = ConfigLayers::from_env();
    if let Some(path) = args.config.clone().or_else(default_config_path) {
        layers = layers.with_file(&path)?;
    }
    for raw in &args.overrides {
        let (key, value) = ConfigLayers::parse_override(raw)?;
        layers = layers.with_override(key, value);
    }
    Converter::new(Arc::new(Registry::with_defaults()?), layers)
}

/// Cancels the returned token on Ctrl-C.
fn cancel_on_interrupt() -> CancellationToken {
    let cancel = CancellationToken::new();
    let token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("{} interrupted, cancelling", "!".yellow().bold());
            token.cancel();
        }
    });
    cancel
}

fn report_failure(path: &Path, err: &ConversionError) -> ExitCode {
    debug!(path = %path.display(), stage = %err.stage(), error = ?err, "conversion failed");
    eprintln!(
        "{} {} failed during {}: {}",
        "✗".red().bold(),
        path.display(),
        err.stage(),
        err
    );
    exit_code(err.exit_code())
}

fn exit_code(code: i32) -> ExitCode {
    ExitCode::from(u8::try_from(code).unwrap_or(1))
}

fn spinner(message: String) -> anyhow::Result<ProgressBar> {
    let pb = ProgressBar::new_spinner();
    pb.set_style(ProgressStyle::with_template(
        "{spinner:.green} [{elapsed_precise}] {msg}",
    )?);
    pb.enable_steady_tick(Duration::from_millis(100));
    pb.set_message(message);
    Ok(pb)
}

fn batch_progress_bar(total: usize) -> anyhow::Result<ProgressBar> {
    let pb = ProgressBar::new(total as u64);
    pb.set_style(
        ProgressStyle::with_template(
            "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta}) {msg}",
        )?
        .with_key("eta", |state: &ProgressState, w: &mut dyn std::fmt::Write| {
            let _ = write!(w, "{:.1}s", state.eta().as_secs_f64());
        })
        .progress_chars("#>-"),
    );
    Ok(pb)
}

async fn convert(file: PathBuf, common: CommonArgs) -> anyhow::Result<ExitCode> {
    let converter = match build_converter(&common.config) {
        Ok(converter) => converter,
        Err(e) => return Ok(report_failure(&file, &e)),
    };
    let output_dir = common.output_dir(&converter)?;
    let request = ConversionRequest::new(&file).with_formats(common.formats());
    let cancel = cancel_on_interrupt();

    let pb = spinner(format!("Converting {}", file.display()))?;
    let outcome = converter
        .convert(&request, &cancel)
        .await
        .and_then(|result| write_outputs(&result, &output_dir).map(|_| result));
    pb.finish_and_clear();

    match outcome {
        Ok(result) => {
            for step in result.report.skipped() {
                eprintln!(
                    "{} {} skipped: {:?}",
                    "!".yellow().bold(),
                    step.component,
                    step.outcome
                );
            }
            let dir = results_dir(&output_dir, &sanitize_doc_name(&result.document.metadata.doc_name));
            println!(
                "{} Converted in {}ms. Results saved in: {}",
                "✓".green().bold(),
                result.document.metadata.conversion_duration.as_millis(),
                dir.display().to_string().cyan().underline()
            );
            Ok(ExitCode::SUCCESS)
        }
        Err(e) => Ok(report_failure(&file, &e)),
    }
}

/// Regular, non-hidden files directly under `dir`, sorted by name.
fn collect_inputs(dir: &Path) -> anyhow::Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        let hidden = path
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| n.starts_with('.'));
        if path.is_file() && !hidden {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

async fn batch(
    dir: PathBuf,
    common: CommonArgs,
    workers: Option<usize>,
    timeout_secs: Option<u64>,
) -> anyhow::Result<ExitCode> {
    let converter = match build_converter(&common.config) {
        Ok(converter) => converter,
        Err(e) => return Ok(report_failure(&dir, &e)),
    };
    let mut options = BatchOptions::from_settings(converter.settings());
    options.output_dir = Some(common.output_dir(&converter)?);
    if let Some(workers) = workers {
        options.workers = workers;
    }
    if let Some(secs) = timeout_secs {
        options.document_timeout = Some(Duration::from_secs(secs));
    }

    let formats = common.formats();
    let requests: Vec<_> = collect_inputs(&dir)?
        .into_iter()
        .map(|path| ConversionRequest::new(path).with_formats(formats.clone()))
        .collect();
    if requests.is_empty() {
        println!("{} nothing to convert in {}", "!".yellow().bold(), dir.display());
        return Ok(ExitCode::SUCCESS);
    }

    let pb = batch_progress_bar(requests.len())?;
    let cancel = cancel_on_interrupt();
    let report = convert_batch(Arc::new(converter), requests, options, &cancel, |item: &BatchItem| {
        if let Err(e) = &item.outcome {
            warn!(
                path = %item.path.display(),
                stage = %e.stage(),
                elapsed_ms = item.duration.as_millis() as u64,
                "batch document failed: {e}"
            );
            pb.println(format!(
                "{} {} failed during {}: {}",
                "✗".red().bold(),
                item.path.display(),
                e.stage(),
                e
            ));
        }
        pb.set_message(
            item.path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
        );
        pb.inc(1);
    })
    .await;
    pb.finish_and_clear();

    let failed = report.failed().count();
    info!(converted = report.succeeded(), failed, exit_code = report.exit_code(), "batch finished");
    let mark = if failed == 0 {
        "✓".green().bold()
    } else {
        "✗".red().bold()
    };
    println!(
        "{mark} {} converted, {} failed",
        report.succeeded(),
        failed
    );
    Ok(exit_code(report.exit_code()))
}

async fn serve(host: IpAddr, port: u16, config: ConfigArgs) -> anyhow::Result<ExitCode> {
    let converter = match build_converter(&config) {
        Ok(converter) => converter,
        Err(e) => return Ok(report_failure(Path::new("<serve>"), &e)),
    };
    tessera_api::serve(
        Arc::new(converter),
        ServeOptions {
            listen_addr: SocketAddr::new(host, port),
            body_limit: DEFAULT_BODY_LIMIT,
            otel: false,
        },
    )
    .await?;
    Ok(ExitCode::SUCCESS)
}

fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();
    // Set before any runtime thread exists.
    if std::env::var_os("TOKENIZERS_PARALLELISM").is_none() {
        std::env::set_var("TOKENIZERS_PARALLELISM", "false");
    }
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(run(cli))
}

async fn run(cli: Cli) -> anyhow::Result<ExitCode> {
    match cli.command {
        Command::Convert { file, common } => {
            init_tracing();
            convert(file, common).await
        }
        Command::Batch {
            dir,
            common,
            workers,
            timeout_secs,
        } => {
            init_tracing();
            batch(dir, common, workers, timeout_secs).await
        }
        Command::Serve { port, host, config } => {
            tessera_api::init_tracing(None, "tessera".into(), false, false)?;
            serve(host, port, config).await
        }
        Command::Explore { file, config } => {
            init_tracing();
            let converter = match build_converter(&config) {
                Ok(converter) => converter,
                Err(e) => return Ok(report_failure(&file, &e)),
            };
            let request = ConversionRequest::new(&file).with_formats(OutputFormat::ALL);
            let result = match converter.convert(&request, &cancel_on_interrupt()).await {
                Ok(result) => result,
                Err(e) => return Ok(report_failure(&file, &e)),
            };
            let stdin = std::io::stdin();
            explore::run(&result, stdin.lock(), std::io::stdout())?;
            Ok(ExitCode::SUCCESS)
        }
    }
}

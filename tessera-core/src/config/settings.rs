use std::{num::NonZeroUsize, path::PathBuf, time::Duration};

use serde::{Deserialize, Serialize};

use super::{Component, ComponentConfig, OptionSpec};
use crate::error::ConfigError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Device {
    Auto,
    Cpu,
    Cuda,
    Mps,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LlmBackend {
    Http,
    Cli,
}

/// Worker count used for accelerator devices when `workers = 0`.
const ACCELERATOR_WORKERS: usize = 2;

/// Run-wide settings, built once from the merged layers and passed down to
/// every stage.
#[derive(Debug, Clone)]
pub struct Settings {
    pub device: Device,
    pub output_dir: Option<PathBuf>,
    pub use_llm: bool,
    pub llm_backend: LlmBackend,
    pub llm_api_key: Option<String>,
    pub llm_base_url: String,
    pub llm_model: String,
    pub llm_cli_binary: String,
    pub llm_cli_model: String,
    pub layout_endpoint: Option<String>,
    pub ocr_endpoint: Option<String>,
    pub service_timeout: Duration,
    pub max_retries: u32,
    pub retry_backoff: Duration,
    pub max_backoff: Duration,
    pub retry_jitter: bool,
    pub circuit_failure_threshold: u32,
    pub circuit_cooldown: Duration,
    pub workers: usize,
    pub document_timeout: Option<Duration>,
}

pub(crate) struct SettingsOptions;

impl Component for SettingsOptions {
    fn name(&self) -> &'static str {
        "settings"
    }

    fn options(&self) -> Vec<OptionSpec> {
        vec![
            OptionSpec::choice(
                "device",
                "auto",
                &["auto", "cpu", "cuda", "mps"],
                "Device hint forwarded to inference services",
            ),
            OptionSpec::optional_string("output_dir", "Directory receiving <name>-results/"),
            OptionSpec::bool("use_llm", false, "Enable LLM enrichment processors"),
            OptionSpec::choice("llm_backend", "http", &["http", "cli"], "LLM transport"),
            OptionSpec::optional_string("llm_api_key", "API key for the HTTP LLM backend"),
            OptionSpec::string(
                "llm_base_url",
                "https://api.openai.com/v1",
                "Base URL of an OpenAI-compatible API",
            ),
            OptionSpec::string("llm_model", "gpt-4o-mini", "Model name sent to the LLM backend"),
            OptionSpec::string("llm_cli_binary", "claude", "Agent CLI used by the cli backend"),
            OptionSpec::string("llm_cli_model", "sonnet", "Model alias passed to the agent CLI"),
            OptionSpec::optional_string("layout_endpoint", "Layout detection service URL"),
            OptionSpec::optional_string("ocr_endpoint", "OCR service URL"),
            OptionSpec::duration_ms("service_timeout_ms", 120_000, "Per-call timeout"),
            OptionSpec::integer("max_retries", 2, 0, 10, "Retries after the first attempt"),
            OptionSpec::duration_ms("retry_backoff_ms", 500, "Base backoff between attempts"),
            OptionSpec::duration_ms("max_backoff_ms", 10_000, "Backoff cap"),
            OptionSpec::bool("retry_jitter", true, "Randomize backoff delays"),
            OptionSpec::integer(
                "circuit_failure_threshold",
                5,
                1,
                1000,
                "Consecutive failures before an endpoint's circuit opens",
            ),
            OptionSpec::duration_ms("circuit_cooldown_ms", 30_000, "Open-circuit cool-down"),
            OptionSpec::integer("workers", 0, 0, 1024, "Parallel documents, 0 picks one"),
            OptionSpec::duration_ms(
                "document_timeout_ms",
                0,
                "Per-document time limit in batch runs, 0 disables",
            ),
        ]
    }
}

impl Settings {
    pub(crate) fn from_config(config: &ComponentConfig) -> Result<Self, ConfigError> {
        let device: Device = config.get("device")?;
        let workers = match config.usize("workers")? {
            0 => default_workers(device),
            n => n,
        };
        let document_timeout = Some(config.duration("document_timeout_ms")?).filter(|d| !d.is_zero());
        Ok(Self {
            device,
            output_dir: config.optional_string("output_dir")?.map(PathBuf::from),
            use_llm: config.bool("use_llm")?,
            llm_backend: config.get("llm_backend")?,
            llm_api_key: config.optional_string("llm_api_key")?,
            llm_base_url: config.string("llm_base_url")?,
            llm_model: config.string("llm_model")?,
            llm_cli_binary: config.string("llm_cli_binary")?,
            llm_cli_model: config.string("llm_cli_model")?,
            layout_endpoint: config.optional_string("layout_endpoint")?,
            ocr_endpoint: config.optional_string("ocr_endpoint")?,
            service_timeout: config.duration("service_timeout_ms")?,
            max_retries: config.get("max_retries")?,
            retry_backoff: config.duration("retry_backoff_ms")?,
            max_backoff: config.duration("max_backoff_ms")?,
            retry_jitter: config.bool("retry_jitter")?,
            circuit_failure_threshold: config.get("circuit_failure_threshold")?,
            circuit_cooldown: config.duration("circuit_cooldown_ms")?,
            workers,
            document_timeout,
        })
    }

    /// Declared settings options, for listings and `--help` style output.
    pub fn options() -> Vec<OptionSpec> {
        SettingsOptions.options()
    }
}

fn default_workers(device: Device) -> usize {
    match device {
        Device::Cuda | Device::Mps => ACCELERATOR_WORKERS,
        Device::Auto | Device::Cpu => std::thread::available_parallelism()
            .map(NonZeroUsize::get)
            .unwrap_or(1),
    }
}

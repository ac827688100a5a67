use std::{io::Write, process::Stdio};

use async_trait::async_trait;
use serde_json::Value;
use tempfile::NamedTempFile;
use tokio::process::Command;
use tracing::debug;

use super::{CallError, LlmRequest, LlmResponse, LlmService, Raster};

/// Runs an agent CLI in print mode and reads its structured output.
///
/// Images are written to temporary files the agent reads with its `Read`
/// tool. The files are deleted when the call returns.
#[derive(Debug, Clone)]
pub struct CliLlmService {
    binary: String,
    model: String,
    endpoint: String,
}

impl CliLlmService {
    pub fn new(binary: &str, model: &str) -> Self {
        Self {
            binary: binary.to_owned(),
            model: model.to_owned(),
            endpoint: format!("cli:{binary}:{model}"),
        }
    }

    fn args(&self, prompt: &str, schema: &Value) -> Vec<String> {
        vec![
            "-p".into(),
            prompt.into(),
            "--output-format".into(),
            "json".into(),
            "--json-schema".into(),
            schema.to_string(),
            "--tools".into(),
            "Read".into(),
            "--permission-mode".into(),
            "bypassPermissions".into(),
            "--model".into(),
            self.model.clone(),
        ]
    }
}

fn write_images(images: &[Raster]) -> std::io::Result<Vec<NamedTempFile>> {
    images
        .iter()
        .map(|img| {
            let mut file = tempfile::Builder::new()
                .prefix("tessera_img_")
                .suffix(&format!(".{}", img.extension()))
                .tempfile()?;
            file.write_all(&img.bytes)?;
            file.flush()?;
            Ok(file)
        })
        .collect()
}

fn prompt_with_images(prompt: &str, files: &[NamedTempFile]) -> String {
    if files.is_empty() {
        return prompt.to_owned();
    }
    let refs = files
        .iter()
        .enumerate()
        .map(|(i, f)| format!("- Image {}: {}", i + 1, f.path().display()))
        .collect::<Vec<_>>()
        .join("\n");
    format!(
        "The following images are provided for analysis. Use the Read tool to view them:\n{refs}\n\n{prompt}"
    )
}

/// Parses the CLI's JSON envelope. A missing `structured_output` comes back
/// as `Null` so the tokens it cost are still counted.
fn parse_output(stdout: &str) -> Result<LlmResponse, CallError> {
    let envelope: Value = serde_json::from_str(stdout)
        .map_err(|e| CallError::Rejected(format!("unparseable CLI output: {e}")))?;
    let value = envelope
        .get("structured_output")
        .cloned()
        .unwrap_or(Value::Null);
    let usage = envelope.get("usage");
    let tokens_used = [
        "input_tokens",
        "cache_creation_input_tokens",
        "cache_read_input_tokens",
        "output_tokens",
    ]
    .iter()
    .filter_map(|k| usage.and_then(|u| u.get(k)).and_then(Value::as_u64))
    .sum();
    Ok(LlmResponse { value, tokens_used })
}

fn classify_exit(stderr: &str) -> CallError {
    let lower = stderr.to_lowercase();
    let msg = if stderr.trim().is_empty() {
        "unknown CLI error".to_owned()
    } else {
        stderr.trim().to_owned()
    };
    if lower.contains("rate") || lower.contains("limit") {
        CallError::Transient(msg)
    } else {
        CallError::Rejected(msg)
    }
}

#[async_trait]
impl LlmService for CliLlmService {
    fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn complete(&self, request: &LlmRequest) -> Result<LlmResponse, CallError> {
        let files = write_images(&request.images)
            .map_err(|e| CallError::Rejected(format!("can't stage images: {e}")))?;
        let prompt = prompt_with_images(&request.prompt, &files);

        debug!(model = %self.model, images = files.len(), "calling agent CLI");
        let output = Command::new(&self.binary)
            .args(self.args(&prompt, &request.schema))
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| CallError::Rejected(format!("can't run {}: {e}", self.binary)))?;

        if !output.status.success() {
            return Err(classify_exit(&String::from_utf8_lossy(&output.stderr)));
        }
        parse_output(&String::from_utf8_lossy(&output.stdout))
        // `files` dropped here, removing the images
    }
}

//! Clients for external inference and LLM services.
//!
//! Every call to one of these goes through the [`ServiceGate`]; clients only
//! classify each attempt's failure as transient or rejected.

mod cli_llm;
mod gate;
mod inference;
mod llm;

use std::sync::Arc;

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine};
use serde::{Deserialize, Serialize};

use crate::{
    config::{Device, LlmBackend, Settings},
    entities::PageID,
    provider::{LayoutRegion, Line},
};

pub use cli_llm::CliLlmService;
pub use gate::{CallError, GatePolicy, ServiceGate};
pub use inference::HttpInferenceService;
pub use llm::HttpLlmService;

/// Encoded image bytes with their mime type.
#[derive(Debug, Clone, PartialEq)]
pub struct Raster {
    pub bytes: Arc<Vec<u8>>,
    pub mime: &'static str,
}

impl Raster {
    pub fn new(bytes: Vec<u8>, mime: &'static str) -> Self {
        Self {
            bytes: Arc::new(bytes),
            mime,
        }
    }

    pub fn to_base64(&self) -> String {
        STANDARD.encode(self.bytes.as_slice())
    }

    pub fn data_url(&self) -> String {
        format!("data:{};base64,{}", self.mime, self.to_base64())
    }

    pub fn extension(&self) -> &'static str {
        match self.mime {
            "image/jpeg" => "jpg",
            "image/gif" => "gif",
            "image/tiff" => "tiff",
            _ => "png",
        }
    }
}

/// A structured completion request: the answer must match `schema`.
#[derive(Debug, Clone)]
pub struct LlmRequest {
    pub prompt: String,
    pub images: Vec<Raster>,
    pub schema: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LlmResponse {
    pub value: serde_json::Value,
    pub tokens_used: u64,
}

#[async_trait]
pub trait LlmService: Send + Sync {
    /// Breaker key for this service.
    fn endpoint(&self) -> &str;

    /// One attempt. Retries belong to the gate.
    async fn complete(&self, request: &LlmRequest) -> Result<LlmResponse, CallError>;
}

/// Payload sent to layout and OCR services.
#[derive(Debug, Clone, Serialize)]
pub struct PageImageRequest {
    pub page: PageID,
    pub width: f32,
    pub height: f32,
    pub device: Device,
    pub mime: &'static str,
    pub image_base64: String,
}

impl PageImageRequest {
    pub fn new(page: PageID, width: f32, height: f32, device: Device, raster: &Raster) -> Self {
        Self {
            page,
            width,
            height,
            device,
            mime: raster.mime,
            image_base64: raster.to_base64(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct LayoutReply {
    pub regions: Vec<LayoutRegion>,
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct OcrReply {
    pub lines: Vec<Line>,
}

#[async_trait]
pub trait LayoutService: Send + Sync {
    fn endpoint(&self) -> &str;
    async fn detect(&self, request: &PageImageRequest) -> Result<Vec<LayoutRegion>, CallError>;
}

#[async_trait]
pub trait OcrService: Send + Sync {
    fn endpoint(&self) -> &str;
    async fn recognize(&self, request: &PageImageRequest) -> Result<Vec<Line>, CallError>;
}

/// The external services configured for a run.
#[derive(Clone, Default)]
pub struct ServiceSet {
    pub llm: Option<Arc<dyn LlmService>>,
    pub layout: Option<Arc<dyn LayoutService>>,
    pub ocr: Option<Arc<dyn OcrService>>,
}

impl std::fmt::Debug for ServiceSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceSet")
            .field("llm", &self.llm.as_ref().map(|s| s.endpoint().to_owned()))
            .field("layout", &self.layout.as_ref().map(|s| s.endpoint().to_owned()))
            .field("ocr", &self.ocr.as_ref().map(|s| s.endpoint().to_owned()))
            .finish()
    }
}

impl ServiceSet {
    pub fn from_settings(settings: &Settings) -> Self {
        let llm: Option<Arc<dyn LlmService>> = settings.use_llm.then(|| match settings.llm_backend {
            LlmBackend::Http => Arc::new(HttpLlmService::new(
                &settings.llm_base_url,
                &settings.llm_model,
                settings.llm_api_key.clone(),
            )) as Arc<dyn LlmService>,
            LlmBackend::Cli => Arc::new(CliLlmService::new(
                &settings.llm_cli_binary,
                &settings.llm_cli_model,
            )) as Arc<dyn LlmService>,
        });
        let layout = settings
            .layout_endpoint
            .as_deref()
            .map(|url| Arc::new(HttpInferenceService::new(url)) as Arc<dyn LayoutService>);
        let ocr = settings
            .ocr_endpoint
            .as_deref()
            .map(|url| Arc::new(HttpInferenceService::new(url)) as Arc<dyn OcrService>);
        Self { llm, layout, ocr }
    }
}

/// Maps an HTTP status to an attempt outcome: 429 and 5xx are transient,
/// other errors are rejections.
pub(crate) fn classify_status(status: reqwest::StatusCode, body: &str) -> CallError {
    let msg = format!("{status}: {}", body.chars().take(200).collect::<String>());
    if status == reqwest::StatusCode::TOO_MANY_REQUESTS
        || status == reqwest::StatusCode::REQUEST_TIMEOUT
        || status.is_server_error()
    {
        CallError::Transient(msg)
    } else {
        CallError::Rejected(msg)
    }
}

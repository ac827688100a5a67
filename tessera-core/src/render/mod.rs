//! Renderers serialize a finished document to one output format.
//!
//! Every renderer walks pages in order, then each page's top-level blocks,
//! recursing into children. None of them iterate the block map directly, so
//! the same tree always renders to the same bytes.

mod chunks;
mod html;
mod json;
mod markdown;

use std::{fmt, str::FromStr, sync::Arc};

use serde::{Deserialize, Serialize};

use crate::{
    config::{Component, ComponentConfig},
    document::Document,
    error::ConversionError,
    registry::RendererFactory,
};

pub use chunks::{Chunk, ChunksRenderer};
pub use html::HtmlRenderer;
pub use json::JsonRenderer;
pub use markdown::MarkdownRenderer;

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    Markdown,
    Json,
    Html,
    Chunks,
}

impl OutputFormat {
    pub const ALL: [OutputFormat; 4] = [
        OutputFormat::Markdown,
        OutputFormat::Json,
        OutputFormat::Html,
        OutputFormat::Chunks,
    ];

    /// File suffix of the written artifact, without the leading dot.
    pub fn extension(self) -> &'static str {
        match self {
            OutputFormat::Markdown => "md",
            OutputFormat::Json => "json",
            OutputFormat::Html => "html",
            OutputFormat::Chunks => "chunks.json",
        }
    }

    pub fn mime_type(self) -> &'static str {
        match self {
            OutputFormat::Markdown => "text/markdown; charset=utf-8",
            OutputFormat::Json | OutputFormat::Chunks => "application/json",
            OutputFormat::Html => "text/html; charset=utf-8",
        }
    }

    /// Format for an `Accept` header value, first supported type wins.
    pub fn from_accept(accept: &str) -> Option<Self> {
        accept.split(',').find_map(|part| {
            let mime = part.split(';').next().unwrap_or_default().trim();
            match mime {
                "text/markdown" => Some(OutputFormat::Markdown),
                "application/json" => Some(OutputFormat::Json),
                "text/html" => Some(OutputFormat::Html),
                _ => None,
            }
        })
    }
}

impl fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            OutputFormat::Markdown => "markdown",
            OutputFormat::Json => "json",
            OutputFormat::Html => "html",
            OutputFormat::Chunks => "chunks",
        };
        f.write_str(name)
    }
}

#[derive(Debug, thiserror::Error)]
#[error("unknown output format '{0}', expected one of md, json, html, chunks")]
pub struct UnknownFormat(String);

impl FromStr for OutputFormat {
    type Err = UnknownFormat;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "md" | "markdown" => Ok(OutputFormat::Markdown),
            "json" => Ok(OutputFormat::Json),
            "html" => Ok(OutputFormat::Html),
            "chunks" => Ok(OutputFormat::Chunks),
            _ => Err(UnknownFormat(s.to_owned())),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RenderedOutput {
    pub format: OutputFormat,
    pub content: String,
    pub mime_type: &'static str,
}

impl RenderedOutput {
    fn new(format: OutputFormat, content: String) -> Self {
        Self {
            format,
            content,
            mime_type: format.mime_type(),
        }
    }
}

pub trait Renderer: Component {
    fn format(&self) -> OutputFormat;

    fn render(
        &self,
        doc: &Document,
        config: &ComponentConfig,
    ) -> Result<RenderedOutput, ConversionError>;
}

/// Built-in renderer for `format`.
pub fn default_renderer(format: OutputFormat) -> RendererFactory {
    match format {
        OutputFormat::Markdown => || Arc::new(MarkdownRenderer),
        OutputFormat::Json => || Arc::new(JsonRenderer),
        OutputFormat::Html => || Arc::new(HtmlRenderer),
        OutputFormat::Chunks => || Arc::new(ChunksRenderer),
    }
}

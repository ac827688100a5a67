//! Providers turn a source file into [`ProviderOutput`], the raw per-page
//! content builders assemble the document from.

mod image;
mod layout_json;
mod text;

use std::{path::Path, sync::LazyLock};

use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::{
    blocks::TextStyle,
    config::Component,
    entities::BBox,
    error::StageError,
    pipeline::StageContext,
    service::Raster,
};

pub use self::image::ImageProvider;
pub use layout_json::LayoutJsonProvider;
pub use text::{MarkdownProvider, TextProvider};

#[async_trait]
pub trait Provider: Component {
    async fn extract(&self, path: &Path, ctx: &StageContext) -> Result<ProviderOutput, StageError>;
}

/// Provider-neutral intermediate form.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ProviderOutput {
    #[serde(default)]
    pub title: Option<String>,
    pub pages: Vec<RawPage>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct RawPage {
    pub width: f32,
    pub height: f32,
    #[serde(default)]
    pub lines: Vec<Line>,
    #[serde(default)]
    pub images: Vec<RawImage>,
    #[serde(default)]
    pub tables: Vec<RawTable>,
    /// Layout regions, either provider hints or detected by a layout service.
    #[serde(default)]
    pub layout: Vec<LayoutRegion>,
    #[serde(skip)]
    pub raster: Option<Raster>,
    #[serde(skip)]
    pub ocr_applied: bool,
}

impl RawPage {
    pub fn new(width: f32, height: f32) -> Self {
        Self {
            width,
            height,
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct Line {
    pub text: String,
    pub bbox: BBox,
    #[serde(default)]
    pub style: TextStyle,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct RawImage {
    pub bbox: BBox,
    #[serde(default)]
    pub reference: Option<String>,
    #[serde(default)]
    pub alt: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct RawTable {
    pub bbox: BBox,
    pub cells: Vec<RawCell>,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct RawCell {
    pub row: usize,
    pub col: usize,
    pub text: String,
    #[serde(default = "one")]
    pub row_span: usize,
    #[serde(default = "one")]
    pub col_span: usize,
    #[serde(default)]
    pub header: bool,
    #[serde(default)]
    pub bbox: Option<BBox>,
}

fn one() -> usize {
    1
}

/// Largest row or column extent (index plus span) a table cell may reach.
pub const MAX_TABLE_EXTENT: usize = 1024;

impl RawTable {
    /// Rejects cells whose position or span falls outside
    /// [`MAX_TABLE_EXTENT`].
    pub fn check(&self) -> Result<(), String> {
        for cell in &self.cells {
            let rows = cell.row.checked_add(cell.row_span.max(1));
            let cols = cell.col.checked_add(cell.col_span.max(1));
            match (rows, cols) {
                (Some(rows), Some(cols)) if rows <= MAX_TABLE_EXTENT && cols <= MAX_TABLE_EXTENT => {}
                _ => {
                    return Err(format!(
                        "cell at row {} col {} (span {}x{}) exceeds the {MAX_TABLE_EXTENT} row/column limit",
                        cell.row, cell.col, cell.row_span, cell.col_span
                    ))
                }
            }
        }
        Ok(())
    }
}

static CAPTION_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(?:Figure|Fig\.|Table|Image)\s+\d+[.:]").expect("valid regex"));

/// "Figure 3:", "Table 1." and the like.
pub(crate) fn looks_like_caption(text: &str) -> bool {
    CAPTION_RE.is_match(text.trim_start())
}

/// DocLayNet-style region labels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub enum LayoutLabel {
    Caption,
    Footnote,
    Formula,
    #[serde(rename = "List-item")]
    ListItem,
    #[serde(rename = "Page-footer")]
    PageFooter,
    #[serde(rename = "Page-header")]
    PageHeader,
    Picture,
    #[serde(rename = "Section-header")]
    SectionHeader,
    Table,
    Text,
    Title,
    Code,
}

impl LayoutLabel {
    /// Regions whose content comes from text lines.
    pub fn is_text_block(self) -> bool {
        !matches!(self, LayoutLabel::Picture | LayoutLabel::Table)
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct LayoutRegion {
    #[serde(default)]
    pub id: i32,
    pub bbox: BBox,
    pub label: LayoutLabel,
    #[serde(default = "full_confidence")]
    pub proba: f32,
}

fn full_confidence() -> f32 {
    1.0
}

impl LayoutRegion {
    pub fn new(id: i32, bbox: BBox, label: LayoutLabel) -> Self {
        Self {
            id,
            bbox,
            label,
            proba: 1.0,
        }
    }
}

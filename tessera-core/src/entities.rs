use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, path::PathBuf, time::Duration};

use crate::detect::InputKind;

pub type PageID = usize;
pub type BlockID = usize;

pub const TESSERA_VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Debug, Default, Clone, Copy, PartialEq, Deserialize, Serialize)]
pub struct BBox {
    pub x0: f32,
    pub y0: f32,
    pub x1: f32,
    pub y1: f32,
}

impl BBox {
    pub fn new(x0: f32, y0: f32, x1: f32, y1: f32) -> Self {
        Self { x0, y0, x1, y1 }
    }

    #[inline(always)]
    pub fn center(&self) -> (f32, f32) {
        (
            self.x0 + self.width() / 2f32,
            self.y0 + self.height() / 2f32,
        )
    }

    #[inline(always)]
    pub fn height(&self) -> f32 {
        self.y1 - self.y0
    }
    #[inline(always)]
    pub fn width(&self) -> f32 {
        self.x1 - self.x0
    }
    #[inline(always)]
    pub fn area(&self) -> f32 {
        self.height() * self.width()
    }

    #[inline(always)]
    pub fn merge(&mut self, other: &Self) {
        self.x0 = self.x0.min(other.x0);
        self.y0 = self.y0.min(other.y0);
        self.x1 = self.x1.max(other.x1);
        self.y1 = self.y1.max(other.y1);
    }

    /// Smallest box covering every box in `boxes`, `None` when empty.
    pub fn enclosing<'a>(mut boxes: impl Iterator<Item = &'a BBox>) -> Option<BBox> {
        let mut acc = *boxes.next()?;
        for b in boxes {
            acc.merge(b);
        }
        Some(acc)
    }

    #[inline(always)]
    fn overlap_x(&self, other: &Self) -> f32 {
        f32::max(
            0f32,
            f32::min(self.x1, other.x1) - f32::max(self.x0, other.x0),
        )
    }
    #[inline(always)]
    fn overlap_y(&self, other: &Self) -> f32 {
        f32::max(
            0f32,
            f32::min(self.y1, other.y1) - f32::max(self.y0, other.y0),
        )
    }

    #[inline(always)]
    pub fn contains(&self, other: &Self) -> bool {
        other.x0 >= self.x0 && other.y0 >= self.y0 && other.x1 <= self.x1 && other.y1 <= self.y1
    }

    #[inline(always)]
    pub fn iou(&self, other: &Self) -> f32 {
        let union = self.union(other);
        if union <= 0f32 {
            return 0f32;
        }
        self.intersection(other) / union
    }

    #[inline(always)]
    pub fn intersection(&self, other: &Self) -> f32 {
        self.overlap_x(other) * self.overlap_y(other)
    }

    #[inline(always)]
    fn union(&self, other: &Self) -> f32 {
        other.area() + self.area() - self.intersection(other)
    }

    /// Weighted squared distance between the two centers.
    #[inline(always)]
    pub fn distance(&self, other: &Self, x_weight: f32, y_weight: f32) -> f32 {
        let point_a = self.center();
        let point_b = other.center();

        (point_a.0 - point_b.0).powi(2) * x_weight + (point_a.1 - point_b.1).powi(2) * y_weight
    }

    /// Empty space between `self` and a box below it, zero when they overlap.
    #[inline(always)]
    pub fn vertical_gap(&self, below: &Self) -> f32 {
        (below.y0 - self.y1).max(0f32)
    }
}

/// One page of a [`crate::document::Document`].
///
/// The ordered top-level block list is private: it only changes through the
/// document's mutation API.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Page {
    pub id: PageID,
    pub width: f32,
    pub height: f32,
    /// Set once text on this page came from OCR instead of the provider.
    pub ocr_applied: bool,
    pub(crate) blocks: Vec<BlockID>,
}

impl Page {
    pub(crate) fn new(id: PageID, width: f32, height: f32) -> Self {
        Self {
            id,
            width,
            height,
            ocr_applied: false,
            blocks: Vec::new(),
        }
    }

    pub fn blocks(&self) -> &[BlockID] {
        &self.blocks
    }

    pub fn bbox(&self) -> BBox {
        BBox::new(0f32, 0f32, self.width, self.height)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DocumentMetadata {
    pub doc_name: String,
    pub source_path: PathBuf,
    pub input_kind: InputKind,
    pub title: Option<String>,
    /// Effective configuration for this run, secrets redacted.
    pub options: BTreeMap<String, serde_json::Value>,
    #[serde(with = "serde_millis")]
    pub conversion_duration: Duration,
    pub tessera_version: String,
}

impl DocumentMetadata {
    pub fn new(doc_name: String, source_path: PathBuf, input_kind: InputKind) -> Self {
        Self {
            doc_name,
            source_path,
            input_kind,
            title: None,
            options: BTreeMap::new(),
            conversion_duration: Duration::ZERO,
            tessera_version: TESSERA_VERSION.to_owned(),
        }
    }
}

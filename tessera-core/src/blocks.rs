use std::fmt;

use serde::{Deserialize, Serialize};

use crate::entities::{BBox, BlockID, PageID};

/// Closed set of block kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Deserialize, Serialize)]
pub enum BlockKind {
    Text,
    Heading,
    List,
    ListItem,
    Table,
    TableCell,
    Figure,
    Caption,
    Equation,
    Code,
    TableOfContents,
    TocEntry,
    PageHeader,
    PageFooter,
    Footnote,
}

impl BlockKind {
    pub const ALL: [BlockKind; 15] = [
        BlockKind::Text,
        BlockKind::Heading,
        BlockKind::List,
        BlockKind::ListItem,
        BlockKind::Table,
        BlockKind::TableCell,
        BlockKind::Figure,
        BlockKind::Caption,
        BlockKind::Equation,
        BlockKind::Code,
        BlockKind::TableOfContents,
        BlockKind::TocEntry,
        BlockKind::PageHeader,
        BlockKind::PageFooter,
        BlockKind::Footnote,
    ];

    /// Whether a block of this kind may hold a `child` block.
    pub fn allows_child(self, child: BlockKind) -> bool {
        matches!(
            (self, child),
            (BlockKind::List, BlockKind::ListItem)
                | (BlockKind::ListItem, BlockKind::List)
                | (BlockKind::Table, BlockKind::TableCell)
                | (BlockKind::Figure, BlockKind::Caption)
                | (BlockKind::TableOfContents, BlockKind::TocEntry)
        )
    }

    /// Kinds that only exist inside a parent block, never at page level.
    pub fn is_child_only(self) -> bool {
        matches!(
            self,
            BlockKind::ListItem | BlockKind::TableCell | BlockKind::TocEntry
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            BlockKind::Text => "Text",
            BlockKind::Heading => "Heading",
            BlockKind::List => "List",
            BlockKind::ListItem => "ListItem",
            BlockKind::Table => "Table",
            BlockKind::TableCell => "TableCell",
            BlockKind::Figure => "Figure",
            BlockKind::Caption => "Caption",
            BlockKind::Equation => "Equation",
            BlockKind::Code => "Code",
            BlockKind::TableOfContents => "TableOfContents",
            BlockKind::TocEntry => "TocEntry",
            BlockKind::PageHeader => "PageHeader",
            BlockKind::PageFooter => "PageFooter",
            BlockKind::Footnote => "Footnote",
        }
    }
}

impl fmt::Display for BlockKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Deserialize, Serialize)]
pub struct TextStyle {
    pub font_size: f32,
    #[serde(default)]
    pub bold: bool,
    #[serde(default)]
    pub italic: bool,
}

impl TextStyle {
    /// Same emphasis and a font size within `tolerance` points.
    pub fn matches(&self, other: &TextStyle, tolerance: f32) -> bool {
        self.bold == other.bold
            && self.italic == other.italic
            && (self.font_size - other.font_size).abs() <= tolerance
    }
}

#[derive(Debug, Default, Clone, PartialEq, Deserialize, Serialize)]
pub struct TextBlock {
    pub text: String,
    #[serde(default)]
    pub style: TextStyle,
}

impl TextBlock {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            style: TextStyle::default(),
        }
    }

    pub fn styled(text: impl Into<String>, style: TextStyle) -> Self {
        Self {
            text: text.into(),
            style,
        }
    }
}

#[derive(Debug, Default, Clone, PartialEq, Deserialize, Serialize)]
pub struct Heading {
    pub text: String,
    /// 1 to 6. Zero until levels are assigned.
    pub level: u8,
    #[serde(default)]
    pub style: TextStyle,
}

#[derive(Debug, Default, Clone, PartialEq, Deserialize, Serialize)]
pub struct List {
    pub ordered: bool,
}

#[derive(Debug, Default, Clone, PartialEq, Deserialize, Serialize)]
pub struct Table {
    pub rows: usize,
    pub cols: usize,
}

#[derive(Debug, Default, Clone, PartialEq, Deserialize, Serialize)]
pub struct TableCell {
    pub text: String,
    pub row: usize,
    pub col: usize,
    pub row_span: usize,
    pub col_span: usize,
    pub header: bool,
}

#[derive(Debug, Default, Clone, PartialEq, Deserialize, Serialize)]
pub struct Figure {
    pub image_ref: Option<String>,
    pub description: Option<String>,
}

#[derive(Debug, Default, Clone, PartialEq, Deserialize, Serialize)]
pub struct Equation {
    pub text: String,
    pub latex: Option<String>,
}

#[derive(Debug, Default, Clone, PartialEq, Deserialize, Serialize)]
pub struct Code {
    pub text: String,
    pub language: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct TocEntry {
    pub text: String,
    pub level: u8,
    pub target: BlockID,
    pub page: PageID,
}

/// Kind-specific payload. The variant is the block's kind tag.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(tag = "block_type")]
pub enum BlockContent {
    Text(TextBlock),
    Heading(Heading),
    List(List),
    ListItem(TextBlock),
    Table(Table),
    TableCell(TableCell),
    Figure(Figure),
    Caption(TextBlock),
    Equation(Equation),
    Code(Code),
    TableOfContents,
    TocEntry(TocEntry),
    PageHeader(TextBlock),
    PageFooter(TextBlock),
    Footnote(TextBlock),
}

impl BlockContent {
    pub fn kind(&self) -> BlockKind {
        match self {
            BlockContent::Text(_) => BlockKind::Text,
            BlockContent::Heading(_) => BlockKind::Heading,
            BlockContent::List(_) => BlockKind::List,
            BlockContent::ListItem(_) => BlockKind::ListItem,
            BlockContent::Table(_) => BlockKind::Table,
            BlockContent::TableCell(_) => BlockKind::TableCell,
            BlockContent::Figure(_) => BlockKind::Figure,
            BlockContent::Caption(_) => BlockKind::Caption,
            BlockContent::Equation(_) => BlockKind::Equation,
            BlockContent::Code(_) => BlockKind::Code,
            BlockContent::TableOfContents => BlockKind::TableOfContents,
            BlockContent::TocEntry(_) => BlockKind::TocEntry,
            BlockContent::PageHeader(_) => BlockKind::PageHeader,
            BlockContent::PageFooter(_) => BlockKind::PageFooter,
            BlockContent::Footnote(_) => BlockKind::Footnote,
        }
    }

    /// Text carried directly by this payload, if any.
    pub fn text(&self) -> Option<&str> {
        match self {
            BlockContent::Text(t)
            | BlockContent::ListItem(t)
            | BlockContent::Caption(t)
            | BlockContent::PageHeader(t)
            | BlockContent::PageFooter(t)
            | BlockContent::Footnote(t) => Some(&t.text),
            BlockContent::Heading(h) => Some(&h.text),
            BlockContent::TableCell(c) => Some(&c.text),
            BlockContent::Equation(e) => Some(&e.text),
            BlockContent::Code(c) => Some(&c.text),
            BlockContent::TocEntry(e) => Some(&e.text),
            BlockContent::List(_)
            | BlockContent::Table(_)
            | BlockContent::Figure(_)
            | BlockContent::TableOfContents => None,
        }
    }

    pub fn text_mut(&mut self) -> Option<&mut String> {
        match self {
            BlockContent::Text(t)
            | BlockContent::ListItem(t)
            | BlockContent::Caption(t)
            | BlockContent::PageHeader(t)
            | BlockContent::PageFooter(t)
            | BlockContent::Footnote(t) => Some(&mut t.text),
            BlockContent::Heading(h) => Some(&mut h.text),
            BlockContent::TableCell(c) => Some(&mut c.text),
            BlockContent::Equation(e) => Some(&mut e.text),
            BlockContent::Code(c) => Some(&mut c.text),
            BlockContent::TocEntry(e) => Some(&mut e.text),
            BlockContent::List(_)
            | BlockContent::Table(_)
            | BlockContent::Figure(_)
            | BlockContent::TableOfContents => None,
        }
    }
}

/// Per-block bookkeeping from enrichment stages.
#[derive(Debug, Default, Clone, PartialEq, Deserialize, Serialize)]
pub struct BlockMetadata {
    pub llm_request_count: u32,
    pub llm_tokens_used: u64,
    pub failed_enrichment: bool,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Block {
    pub(crate) id: BlockID,
    pub(crate) page_id: PageID,
    pub(crate) parent: Option<BlockID>,
    pub(crate) children: Vec<BlockID>,
    pub bbox: BBox,
    pub(crate) content: BlockContent,
    pub metadata: BlockMetadata,
}

impl Block {
    pub fn id(&self) -> BlockID {
        self.id
    }

    pub fn page_id(&self) -> PageID {
        self.page_id
    }

    pub fn parent(&self) -> Option<BlockID> {
        self.parent
    }

    pub fn children(&self) -> &[BlockID] {
        &self.children
    }

    pub fn kind(&self) -> BlockKind {
        self.content.kind()
    }

    pub fn content(&self) -> &BlockContent {
        &self.content
    }

    /// In-place access to the payload. Switching the variant here is caught
    /// by [`crate::document::Document::validate`]; use
    /// [`crate::document::Document::replace_content`] to change kinds.
    pub fn content_mut(&mut self) -> &mut BlockContent {
        &mut self.content
    }

    pub fn text(&self) -> Option<&str> {
        self.content.text()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn child_only_kinds_have_a_legal_parent() {
        for child in BlockKind::ALL.iter().filter(|k| k.is_child_only()) {
            assert!(
                BlockKind::ALL.iter().any(|p| p.allows_child(*child)),
                "{child} has no legal parent"
            );
        }
    }

    #[test]
    fn table_only_holds_cells() {
        for kind in BlockKind::ALL {
            assert_eq!(
                BlockKind::Table.allows_child(kind),
                kind == BlockKind::TableCell
            );
        }
        assert!(!BlockKind::Text.allows_child(BlockKind::Text));
    }

    #[test]
    fn content_serializes_with_tag() {
        let content = BlockContent::Heading(Heading {
            text: "Intro".into(),
            level: 2,
            style: TextStyle::default(),
        });
        let json = serde_json::to_value(&content).unwrap();
        assert_eq!(json["block_type"], "Heading");
        assert_eq!(json["level"], 2);
        assert_eq!(content.kind(), BlockKind::Heading);
        assert_eq!(content.text(), Some("Intro"));
    }

    #[test]
    fn style_tolerance() {
        let a = TextStyle {
            font_size: 10.0,
            ..Default::default()
        };
        let b = TextStyle {
            font_size: 10.4,
            ..Default::default()
        };
        assert!(a.matches(&b, 0.5));
        assert!(!a.matches(&TextStyle { bold: true, ..b }, 0.5));
    }
}

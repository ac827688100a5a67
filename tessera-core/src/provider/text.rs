//! Plain-text and Markdown providers.
//!
//! Neither format has geometry, so lines are laid out on letter-sized pages
//! with a fixed line pitch. Plain text carries no layout hints: the layout
//! builder derives regions and `merge_text` rebuilds paragraphs. Markdown
//! emits a hint region per element.

use std::{path::Path, sync::LazyLock};

use async_trait::async_trait;
use regex::Regex;

use super::{looks_like_caption, LayoutLabel, LayoutRegion, Line, Provider, ProviderOutput, RawCell, RawImage, RawPage, RawTable};
use crate::{
    blocks::TextStyle,
    config::{Component, OptionSpec},
    entities::BBox,
    error::StageError,
    pipeline::StageContext,
};

const PAGE_WIDTH: f32 = 612.0;
const PAGE_HEIGHT: f32 = 792.0;
const MARGIN: f32 = 72.0;
const BODY_FONT_SIZE: f32 = 10.0;
const CODE_FONT_SIZE: f32 = 9.0;
/// Line box height and pitch relative to the font size.
const LINE_BOX: f32 = 1.2;
const LINE_PITCH: f32 = 1.4;
const CHAR_WIDTH: f32 = 0.5;
const FIGURE_HEIGHT: f32 = 160.0;
const FORM_FEED: char = '\x0c';

static HEADING_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(#{1,6})\s+(.+?)\s*#*\s*$").expect("valid regex"));
static LIST_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*(?:[-*+]|\d+[.)])\s+\S").expect("valid regex"));
static IMAGE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^!\[([^\]]*)\]\(([^)\s]+)[^)]*\)\s*$").expect("valid regex"));
static FOOTNOTE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\[\^[^\]]+\]:\s*").expect("valid regex"));
static TABLE_SEPARATOR_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\|?\s*:?-{2,}:?\s*(\|\s*:?-{2,}:?\s*)*\|?\s*$").expect("valid regex"));

fn body_style() -> TextStyle {
    TextStyle {
        font_size: BODY_FONT_SIZE,
        ..Default::default()
    }
}

fn lines_per_page_option() -> OptionSpec {
    OptionSpec::integer(
        "text_lines_per_page",
        0,
        0,
        10_000,
        "Force a page break every N lines for text inputs, 0 fills pages",
    )
}

/// Places lines top to bottom on synthetic pages.
struct PageWriter {
    pages: Vec<RawPage>,
    y: f32,
    lines_on_page: usize,
    max_lines: Option<usize>,
    next_region_id: i32,
}

impl PageWriter {
    fn new(max_lines: usize) -> Self {
        Self {
            pages: vec![RawPage::new(PAGE_WIDTH, PAGE_HEIGHT)],
            y: MARGIN,
            lines_on_page: 0,
            max_lines: (max_lines > 0).then_some(max_lines),
            next_region_id: 0,
        }
    }

    fn page_index(&self) -> usize {
        self.pages.len() - 1
    }

    fn page_mut(&mut self) -> &mut RawPage {
        let idx = self.page_index();
        &mut self.pages[idx]
    }

    fn break_page(&mut self) {
        self.pages.push(RawPage::new(PAGE_WIDTH, PAGE_HEIGHT));
        self.y = MARGIN;
        self.lines_on_page = 0;
    }

    fn ensure_room(&mut self, height: f32) {
        let full = self.y + height > PAGE_HEIGHT - MARGIN
            || self.max_lines.is_some_and(|max| self.lines_on_page >= max);
        if full && self.lines_on_page > 0 {
            self.break_page();
        }
    }

    /// Vertical space for a blank source line.
    fn gap(&mut self) {
        if self.lines_on_page > 0 {
            self.y += BODY_FONT_SIZE * LINE_PITCH;
        }
    }

    /// Reserves a box of `height` followed by `spacing`, returns `(page, bbox)`.
    fn reserve(&mut self, width: f32, height: f32, spacing: f32) -> (usize, BBox) {
        self.ensure_room(height);
        let bbox = BBox::new(MARGIN, self.y, MARGIN + width.max(1.0), self.y + height);
        self.y += height + spacing;
        self.lines_on_page += 1;
        (self.page_index(), bbox)
    }

    fn reserve_block(&mut self, height: f32) -> (usize, BBox) {
        self.reserve(PAGE_WIDTH - 2.0 * MARGIN, height, BODY_FONT_SIZE * (LINE_PITCH - LINE_BOX))
    }

    fn push_line(&mut self, text: &str, style: TextStyle) -> (usize, BBox) {
        let width = text.chars().count() as f32 * style.font_size * CHAR_WIDTH;
        let (page, bbox) = self.reserve(
            width,
            style.font_size * LINE_BOX,
            style.font_size * (LINE_PITCH - LINE_BOX),
        );
        self.page_mut().lines.push(Line {
            text: text.to_owned(),
            bbox,
            style,
        });
        (page, bbox)
    }

    /// Pushes `text` wrapped to the text column.
    fn push_wrapped(&mut self, text: &str, style: TextStyle) -> Vec<(usize, BBox)> {
        let max_chars = ((PAGE_WIDTH - 2.0 * MARGIN) / (style.font_size * CHAR_WIDTH)) as usize;
        wrap(text, max_chars)
            .iter()
            .map(|l| self.push_line(l, style))
            .collect()
    }

    fn add_region(&mut self, placed: &[(usize, BBox)], label: LayoutLabel) {
        let mut pages: Vec<usize> = placed.iter().map(|(p, _)| *p).collect();
        pages.dedup();
        for page in pages {
            if let Some(bbox) = BBox::enclosing(
                placed.iter().filter(|(p, _)| *p == page).map(|(_, b)| b),
            ) {
                let id = self.next_region_id;
                self.next_region_id += 1;
                self.pages[page].layout.push(LayoutRegion::new(id, bbox, label));
            }
        }
    }

    fn finish(mut self) -> Vec<RawPage> {
        if self.pages.len() > 1 && self.lines_on_page == 0 {
            self.pages.pop();
        }
        self.pages
    }
}

/// Greedy word wrap; words longer than `max_chars` are split.
fn wrap(text: &str, max_chars: usize) -> Vec<String> {
    let max_chars = max_chars.max(1);
    let mut out = Vec::new();
    let mut current = String::new();
    for word in text.split_whitespace() {
        let mut word: Vec<char> = word.chars().collect();
        while word.len() > max_chars {
            if !current.is_empty() {
                out.push(std::mem::take(&mut current));
            }
            out.push(word.drain(..max_chars).collect());
        }
        let word: String = word.into_iter().collect();
        if word.is_empty() {
            continue;
        }
        if !current.is_empty() && current.chars().count() + 1 + word.chars().count() > max_chars {
            out.push(std::mem::take(&mut current));
        }
        if !current.is_empty() {
            current.push(' ');
        }
        current.push_str(&word);
    }
    if !current.is_empty() {
        out.push(current);
    }
    out
}

async fn read_source(path: &Path) -> Result<String, StageError> {
    let bytes = tokio::fs::read(path).await?;
    String::from_utf8(bytes).map_err(|e| StageError::msg(format!("input is not valid UTF-8: {e}")))
}

#[derive(Debug, Default)]
pub struct TextProvider;

impl Component for TextProvider {
    fn name(&self) -> &'static str {
        "text"
    }

    fn options(&self) -> Vec<OptionSpec> {
        vec![lines_per_page_option()]
    }
}

impl TextProvider {
    fn layout(&self, source: &str, lines_per_page: usize) -> ProviderOutput {
        let mut writer = PageWriter::new(lines_per_page);
        for (idx, chunk) in source.split(FORM_FEED).enumerate() {
            if idx > 0 {
                writer.break_page();
            }
            for line in chunk.lines() {
                if line.trim().is_empty() {
                    writer.gap();
                } else {
                    writer.push_wrapped(line, body_style());
                }
            }
        }
        ProviderOutput {
            title: None,
            pages: writer.finish(),
        }
    }
}

#[async_trait]
impl Provider for TextProvider {
    async fn extract(&self, path: &Path, ctx: &StageContext) -> Result<ProviderOutput, StageError> {
        let source = read_source(path).await?;
        Ok(self.layout(&source, ctx.config.usize("text_lines_per_page")?))
    }
}

#[derive(Debug, Default)]
pub struct MarkdownProvider;

impl Component for MarkdownProvider {
    fn name(&self) -> &'static str {
        "markdown"
    }

    fn options(&self) -> Vec<OptionSpec> {
        vec![lines_per_page_option()]
    }
}

fn heading_style(level: usize) -> TextStyle {
    TextStyle {
        // each level under 0.7x the one above, so size bucketing recovers it
        font_size: match level {
            1 => 32.0,
            2 => 22.0,
            3 => 15.0,
            4 => 10.0,
            5 => 6.8,
            _ => 4.6,
        },
        bold: true,
        italic: false,
    }
}

fn split_row(row: &str) -> Vec<String> {
    let row = row.trim();
    let row = row.strip_prefix('|').unwrap_or(row);
    let row = row.strip_suffix('|').unwrap_or(row);
    row.split('|').map(|c| c.trim().to_owned()).collect()
}

impl MarkdownProvider {
    fn layout(&self, source: &str, lines_per_page: usize) -> ProviderOutput {
        let mut writer = PageWriter::new(lines_per_page);
        let mut title = None;
        let mut paragraph: Vec<(usize, BBox)> = Vec::new();
        let mut lines = source.lines().peekable();

        macro_rules! flush_paragraph {
            () => {
                if !paragraph.is_empty() {
                    writer.add_region(&paragraph, LayoutLabel::Text);
                    paragraph.clear();
                }
            };
        }

        while let Some(line) = lines.next() {
            let trimmed = line.trim();

            if line.contains(FORM_FEED) {
                flush_paragraph!();
                writer.break_page();
            } else if trimmed.is_empty() {
                flush_paragraph!();
                writer.gap();
            } else if trimmed.starts_with("```") {
                flush_paragraph!();
                let style = TextStyle {
                    font_size: CODE_FONT_SIZE,
                    ..Default::default()
                };
                let mut placed = Vec::new();
                for code in lines.by_ref() {
                    if code.trim_start().starts_with("```") {
                        break;
                    }
                    placed.push(writer.push_line(code, style));
                }
                writer.add_region(&placed, LayoutLabel::Code);
            } else if trimmed.starts_with("$$") {
                flush_paragraph!();
                let inner = trimmed.trim_start_matches("$$");
                let mut placed = Vec::new();
                if inner.trim_end().ends_with("$$") {
                    let formula = inner.trim_end().trim_end_matches("$$").trim();
                    placed.push(writer.push_line(formula, body_style()));
                } else {
                    if !inner.trim().is_empty() {
                        placed.push(writer.push_line(inner.trim(), body_style()));
                    }
                    for formula in lines.by_ref() {
                        let f = formula.trim();
                        if let Some(rest) = f.strip_suffix("$$") {
                            if !rest.trim().is_empty() {
                                placed.push(writer.push_line(rest.trim(), body_style()));
                            }
                            break;
                        }
                        placed.push(writer.push_line(f, body_style()));
                    }
                }
                writer.add_region(&placed, LayoutLabel::Formula);
            } else if let Some(caps) = HEADING_RE.captures(trimmed) {
                flush_paragraph!();
                let level = caps[1].len();
                let text = caps[2].to_owned();
                if level == 1 && title.is_none() {
                    title = Some(text.clone());
                }
                let placed = writer.push_wrapped(&text, heading_style(level));
                let label = if level == 1 {
                    LayoutLabel::Title
                } else {
                    LayoutLabel::SectionHeader
                };
                writer.add_region(&placed, label);
            } else if let Some(caps) = IMAGE_RE.captures(trimmed) {
                flush_paragraph!();
                let (page, bbox) = writer.reserve_block(FIGURE_HEIGHT);
                let alt = caps[1].trim();
                writer.pages[page].images.push(RawImage {
                    bbox,
                    reference: Some(caps[2].to_owned()),
                    alt: (!alt.is_empty()).then(|| alt.to_owned()),
                });
                writer.add_region(&[(page, bbox)], LayoutLabel::Picture);
            } else if trimmed.starts_with('|') {
                flush_paragraph!();
                let mut rows = vec![split_row(trimmed)];
                let mut has_header = false;
                while let Some(next) = lines.peek().map(|l| l.trim()) {
                    if !next.starts_with('|') {
                        break;
                    }
                    if TABLE_SEPARATOR_RE.is_match(next) {
                        has_header = rows.len() == 1;
                    } else {
                        rows.push(split_row(next));
                    }
                    lines.next();
                }
                let row_height = BODY_FONT_SIZE * LINE_BOX;
                let mut placed = Vec::new();
                let mut cells = Vec::new();
                for (r, row) in rows.iter().enumerate() {
                    let (page, bbox) = writer.reserve_block(row_height);
                    placed.push((page, bbox));
                    let col_width = bbox.width() / row.len().max(1) as f32;
                    for (c, text) in row.iter().enumerate() {
                        cells.push(RawCell {
                            row: r,
                            col: c,
                            text: text.clone(),
                            row_span: 1,
                            col_span: 1,
                            header: has_header && r == 0,
                            bbox: Some(BBox::new(
                                bbox.x0 + c as f32 * col_width,
                                bbox.y0,
                                bbox.x0 + (c + 1) as f32 * col_width,
                                bbox.y1,
                            )),
                        });
                    }
                }
                // a table split by a page break stays on its first page
                let first_page = placed.first().map(|(p, _)| *p).unwrap_or_default();
                if let Some(bbox) = BBox::enclosing(placed.iter().map(|(_, b)| b)) {
                    let bbox = if placed.iter().all(|(p, _)| *p == first_page) {
                        bbox
                    } else {
                        BBox::enclosing(
                            placed.iter().filter(|(p, _)| *p == first_page).map(|(_, b)| b),
                        )
                        .unwrap_or(bbox)
                    };
                    writer.pages[first_page].tables.push(RawTable { bbox, cells });
                    writer.add_region(&[(first_page, bbox)], LayoutLabel::Table);
                }
            } else if LIST_RE.is_match(line) {
                flush_paragraph!();
                let placed = writer.push_wrapped(trimmed, body_style());
                writer.add_region(&placed, LayoutLabel::ListItem);
            } else if looks_like_caption(trimmed) {
                flush_paragraph!();
                let placed = writer.push_wrapped(trimmed, body_style());
                writer.add_region(&placed, LayoutLabel::Caption);
            } else if FOOTNOTE_RE.is_match(trimmed) {
                flush_paragraph!();
                let text = FOOTNOTE_RE.replace(trimmed, "");
                let placed = writer.push_wrapped(&text, body_style());
                writer.add_region(&placed, LayoutLabel::Footnote);
            } else {
                paragraph.extend(writer.push_wrapped(trimmed, body_style()));
            }
        }
        flush_paragraph!();

        ProviderOutput {
            title,
            pages: writer.finish(),
        }
    }
}

#[async_trait]
impl Provider for MarkdownProvider {
    async fn extract(&self, path: &Path, ctx: &StageContext) -> Result<ProviderOutput, StageError> {
        let source = read_source(path).await?;
        Ok(self.layout(&source, ctx.config.usize("text_lines_per_page")?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wraps_on_words() {
        assert_eq!(wrap("aa bb cc", 5), vec!["aa bb", "cc"]);
        assert_eq!(wrap("abcdefgh", 3), vec!["abc", "def", "gh"]);
        assert!(wrap("   ", 10).is_empty());
    }

    #[test]
    fn text_paginates_and_keeps_line_gaps_small() {
        let source = (0..10).map(|i| format!("line {i}")).collect::<Vec<_>>().join("\n");
        let out = TextProvider.layout(&source, 4);
        assert_eq!(out.pages.len(), 3);
        assert_eq!(out.pages[2].lines.len(), 2);
        assert!(out.pages.iter().all(|p| p.layout.is_empty()));

        let lines = &out.pages[0].lines;
        let gap = lines[0].bbox.vertical_gap(&lines[1].bbox);
        assert!(gap > 0.0 && gap < 3.0, "gap {gap}");
    }

    #[test]
    fn blank_line_separates_paragraphs() {
        let out = TextProvider.layout("first\n\nsecond", 0);
        let lines = &out.pages[0].lines;
        assert!(lines[0].bbox.vertical_gap(&lines[1].bbox) > 10.0);
    }

    #[test]
    fn form_feed_breaks_pages() {
        let out = TextProvider.layout("one\x0ctwo\x0cthree", 0);
        assert_eq!(out.pages.len(), 3);
        assert_eq!(out.pages[1].lines[0].text, "two");
    }

    #[test]
    fn markdown_emits_hints() {
        let source = "# Report\n\nSome text\nmore text\n\n- item one\n- item two\n\n| a | b |\n|---|---|\n| 1 | 2 |\n\n![chart](chart.png)\nFigure 1: Sales\n\n```rust\nfn main() {}\n```\n\n$$ E = mc^2 $$\n";
        let out = MarkdownProvider.layout(source, 0);
        assert_eq!(out.title.as_deref(), Some("Report"));
        let page = &out.pages[0];
        let labels: Vec<_> = page.layout.iter().map(|r| r.label).collect();
        assert_eq!(
            labels,
            vec![
                LayoutLabel::Title,
                LayoutLabel::Text,
                LayoutLabel::ListItem,
                LayoutLabel::ListItem,
                LayoutLabel::Table,
                LayoutLabel::Picture,
                LayoutLabel::Caption,
                LayoutLabel::Code,
                LayoutLabel::Formula,
            ]
        );
        let table = &page.tables[0];
        assert_eq!(table.cells.len(), 4);
        assert!(table.cells[0].header && !table.cells[2].header);
        assert_eq!(table.cells[3].text, "2");
        assert_eq!(page.images[0].reference.as_deref(), Some("chart.png"));
        assert!(page.lines.iter().any(|l| l.text == "E = mc^2"));
        // table cell text is not duplicated as lines
        assert!(!page.lines.iter().any(|l| l.text.contains('|')));
    }
}

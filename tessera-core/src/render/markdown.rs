use std::collections::{BTreeMap, BTreeSet};

use crate::{
    blocks::{BlockContent, BlockKind, TableCell},
    config::{Component, ComponentConfig, OptionSpec},
    document::Document,
    entities::BlockID,
    error::ConversionError,
};

use super::{OutputFormat, RenderedOutput, Renderer};

#[derive(Debug, Clone, Copy, PartialEq)]
enum PageSeparator {
    None,
    Rule,
    Comment,
}

#[derive(Debug, Default)]
pub struct MarkdownRenderer;

impl Component for MarkdownRenderer {
    fn name(&self) -> &'static str {
        "markdown"
    }

    fn options(&self) -> Vec<OptionSpec> {
        vec![OptionSpec::choice(
            "page_separator",
            "none",
            &["none", "rule", "comment"],
            "What to put between pages in Markdown output",
        )]
    }
}

impl Renderer for MarkdownRenderer {
    fn format(&self) -> OutputFormat {
        OutputFormat::Markdown
    }

    #[tracing::instrument(skip_all)]
    fn render(
        &self,
        doc: &Document,
        config: &ComponentConfig,
    ) -> Result<RenderedOutput, ConversionError> {
        let separator = match config.string("page_separator")?.as_str() {
            "rule" => PageSeparator::Rule,
            "comment" => PageSeparator::Comment,
            _ => PageSeparator::None,
        };

        let mut parts: Vec<String> = Vec::new();
        for (index, page) in doc.pages().iter().enumerate() {
            match separator {
                PageSeparator::Rule if index > 0 => parts.push("---".to_owned()),
                PageSeparator::Comment => parts.push(format!("<!-- page {} -->", index + 1)),
                _ => {}
            }
            for id in page.blocks() {
                if let Some(part) = block(doc, *id, 0)? {
                    parts.push(part);
                }
            }
        }
        let mut content = parts.join("\n\n");
        content.push('\n');
        Ok(RenderedOutput::new(OutputFormat::Markdown, content))
    }
}

fn unsupported(kind: BlockKind) -> ConversionError {
    ConversionError::UnsupportedRenderTarget {
        format: OutputFormat::Markdown,
        kind,
    }
}

fn internal(e: impl std::fmt::Display) -> ConversionError {
    ConversionError::Render {
        format: OutputFormat::Markdown,
        reason: e.to_string(),
    }
}

/// Markdown for one block and its children, `None` for blocks left out.
fn block(doc: &Document, id: BlockID, depth: usize) -> Result<Option<String>, ConversionError> {
    let b = doc.block(id).map_err(internal)?;
    let out = match b.content() {
        BlockContent::Text(t) | BlockContent::Footnote(t) => t.text.clone(),
        BlockContent::Caption(t) => format!("*{}*", t.text),
        BlockContent::Heading(h) => {
            format!("{} {}", "#".repeat(h.level.clamp(1, 6) as usize), h.text)
        }
        BlockContent::List(list) => {
            let mut lines = Vec::new();
            for (n, item) in b.children().iter().enumerate() {
                let marker = if list.ordered {
                    format!("{}.", n + 1)
                } else {
                    "-".to_owned()
                };
                list_item(doc, *item, depth, &marker, &mut lines)?;
            }
            lines.join("\n")
        }
        BlockContent::Table(_) => table(doc, b.children())?,
        BlockContent::Figure(fig) => {
            let mut lines = Vec::new();
            let alt = fig.description.as_deref().unwrap_or("");
            match &fig.image_ref {
                Some(src) => lines.push(format!("![{}]({})", alt.replace('\n', " "), src)),
                None if !alt.is_empty() => lines.push(alt.to_owned()),
                None => {}
            }
            for child in b.children() {
                if let Some(caption) = block(doc, *child, depth)? {
                    lines.push(caption);
                }
            }
            if lines.is_empty() {
                return Ok(None);
            }
            lines.join("\n\n")
        }
        BlockContent::Equation(eq) => {
            format!("$$\n{}\n$$", eq.latex.as_deref().unwrap_or(&eq.text))
        }
        BlockContent::Code(code) => format!(
            "```{}\n{}\n```",
            code.language.as_deref().unwrap_or(""),
            code.text
        ),
        BlockContent::TableOfContents => {
            let mut lines = Vec::new();
            for entry in b.children() {
                let entry = doc.block(*entry).map_err(internal)?;
                match entry.content() {
                    BlockContent::TocEntry(e) => lines.push(format!(
                        "{}- [{}](#{})",
                        "  ".repeat(e.level.saturating_sub(1) as usize),
                        e.text,
                        slug(&e.text)
                    )),
                    _ => return Err(unsupported(entry.kind())),
                }
            }
            lines.join("\n")
        }
        BlockContent::PageHeader(_) | BlockContent::PageFooter(_) => return Ok(None),
        BlockContent::ListItem(_) | BlockContent::TableCell(_) | BlockContent::TocEntry(_) => {
            return Err(unsupported(b.kind()))
        }
    };
    Ok(Some(out))
}

fn list_item(
    doc: &Document,
    id: BlockID,
    depth: usize,
    marker: &str,
    lines: &mut Vec<String>,
) -> Result<(), ConversionError> {
    let item = doc.block(id).map_err(internal)?;
    let BlockContent::ListItem(text) = item.content() else {
        return Err(unsupported(item.kind()));
    };
    lines.push(format!("{}{} {}", "  ".repeat(depth), marker, text.text));
    for nested in item.children() {
        if let Some(sub) = block(doc, *nested, depth + 1)? {
            lines.push(sub);
        }
    }
    Ok(())
}

fn cell_text(cell: &TableCell) -> String {
    cell.text.replace('|', "\\|").replace('\n', " ")
}

/// GFM table. Spanned cells occupy their top-left slot only; rows and
/// columns holding no cell at all are left out.
fn table(doc: &Document, children: &[BlockID]) -> Result<String, ConversionError> {
    let mut rows: BTreeMap<usize, BTreeMap<usize, String>> = BTreeMap::new();
    for id in children {
        let child = doc.block(*id).map_err(internal)?;
        match child.content() {
            BlockContent::TableCell(cell) => {
                rows.entry(cell.row).or_default().insert(cell.col, cell_text(cell));
            }
            _ => return Err(unsupported(child.kind())),
        }
    }
    let cols: BTreeSet<usize> = rows.values().flat_map(|row| row.keys().copied()).collect();
    if cols.is_empty() {
        return Ok(String::new());
    }

    let line = |row: &BTreeMap<usize, String>| {
        let texts: Vec<&str> = cols
            .iter()
            .map(|c| row.get(c).map(String::as_str).unwrap_or_default())
            .collect();
        format!("| {} |", texts.join(" | "))
    };
    let mut out = Vec::with_capacity(rows.len() + 1);
    let mut rows = rows.values();
    if let Some(header) = rows.next() {
        out.push(line(header));
    }
    out.push(format!("|{}", "---|".repeat(cols.len())));
    out.extend(rows.map(line));
    Ok(out.join("\n"))
}

/// GitHub-style heading anchor.
fn slug(text: &str) -> String {
    text.trim()
        .to_lowercase()
        .chars()
        .filter_map(|c| match c {
            c if c.is_alphanumeric() || c == '-' || c == '_' => Some(c),
            ' ' => Some('-'),
            _ => None,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        blocks::{Equation, Heading, List, Table, TextBlock},
        entities::BBox,
        pipeline::testing,
    };
    use serde_json::json;

    fn sample() -> anyhow::Result<Document> {
        let mut doc = testing::document();
        let bbox = BBox::new(0.0, 0.0, 10.0, 10.0);
        let p0 = doc.add_page(100.0, 100.0);
        doc.push_block(
            p0,
            bbox,
            BlockContent::Heading(Heading {
                text: "Intro".into(),
                level: 2,
                ..Default::default()
            }),
        )?;
        let list = doc.push_block(p0, bbox, BlockContent::List(List { ordered: true }))?;
        doc.append_child(list, bbox, BlockContent::ListItem(TextBlock::new("one")))?;
        doc.append_child(list, bbox, BlockContent::ListItem(TextBlock::new("two")))?;
        doc.push_block(p0, bbox, BlockContent::PageFooter(TextBlock::new("page 1")))?;

        let p1 = doc.add_page(100.0, 100.0);
        let table = doc.push_block(p1, bbox, BlockContent::Table(Table { rows: 2, cols: 2 }))?;
        for (row, col, text) in [(0, 0, "a"), (0, 1, "b|c"), (1, 0, "1"), (1, 1, "2")] {
            doc.append_child(
                table,
                bbox,
                BlockContent::TableCell(TableCell {
                    text: text.into(),
                    row,
                    col,
                    row_span: 1,
                    col_span: 1,
                    header: row == 0,
                }),
            )?;
        }
        doc.push_block(
            p1,
            bbox,
            BlockContent::Equation(Equation {
                text: "x2".into(),
                latex: Some("x^2".into()),
            }),
        )?;
        Ok(doc)
    }

    #[test]
    fn renders_blocks_in_page_order() -> anyhow::Result<()> {
        let doc = sample()?;
        let renderer = MarkdownRenderer;
        let ctx = testing::context(&renderer, &[("page_separator", json!("rule"))]);
        let out = renderer.render(&doc, &ctx.config)?;
        assert_eq!(
            out.content,
            "## Intro\n\n1. one\n2. two\n\n---\n\n| a | b\\|c |\n|---|---|\n| 1 | 2 |\n\n$$\nx^2\n$$\n"
        );
        assert_eq!(out.format, OutputFormat::Markdown);
        Ok(())
    }

    #[test]
    fn sparse_cell_positions_do_not_size_the_grid() -> anyhow::Result<()> {
        let mut doc = testing::document();
        let bbox = BBox::new(0.0, 0.0, 10.0, 10.0);
        let page = doc.add_page(100.0, 100.0);
        let table = doc.push_block(page, bbox, BlockContent::Table(Table { rows: 2, cols: 2 }))?;
        for (row, col, text) in [(0, 0, "a"), (4_000_000_000_000, 5_000_000_000_000, "far")] {
            doc.append_child(
                table,
                bbox,
                BlockContent::TableCell(TableCell {
                    text: text.into(),
                    row,
                    col,
                    row_span: usize::MAX,
                    col_span: 1,
                    header: false,
                }),
            )?;
        }
        let renderer = MarkdownRenderer;
        let ctx = testing::context(&renderer, &[]);
        let out = renderer.render(&doc, &ctx.config)?;
        assert_eq!(out.content, "| a |  |\n|---|---|\n|  | far |\n");
        Ok(())
    }

    #[test]
    fn comment_separator_marks_every_page() -> anyhow::Result<()> {
        let doc = sample()?;
        let renderer = MarkdownRenderer;
        let ctx = testing::context(&renderer, &[("page_separator", json!("comment"))]);
        let out = renderer.render(&doc, &ctx.config)?;
        assert!(out.content.starts_with("<!-- page 1 -->\n\n## Intro"));
        assert!(out.content.contains("<!-- page 2 -->"));
        Ok(())
    }

    #[test]
    fn anchors() {
        assert_eq!(slug("Getting Started!"), "getting-started");
    }
}

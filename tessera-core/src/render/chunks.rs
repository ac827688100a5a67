//! Flat retrieval chunks.
//!
//! One chunk per top-level block, headings excluded: a heading only moves
//! the section path that the chunks after it carry. Chunk ids are derived
//! from page index and block id, so they are stable for a given tree.

use std::collections::BTreeMap;

use serde::Serialize;

use crate::{
    blocks::BlockContent,
    config::{Component, ComponentConfig, OptionSpec},
    document::Document,
    entities::{BlockID, PageID},
    error::ConversionError,
};

use super::{OutputFormat, RenderedOutput, Renderer};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Chunk {
    pub id: String,
    pub page: PageID,
    pub block_ids: Vec<BlockID>,
    /// Heading texts from the outermost section inward.
    pub section: Vec<String>,
    pub text: String,
}

#[derive(Debug, Default)]
pub struct ChunksRenderer;

impl Component for ChunksRenderer {
    fn name(&self) -> &'static str {
        "chunks"
    }

    fn options(&self) -> Vec<OptionSpec> {
        vec![OptionSpec::integer(
            "chunk_max_chars",
            2000,
            100,
            1_000_000,
            "Longest chunk before it is split on sentence boundaries",
        )]
    }
}

fn internal(e: impl std::fmt::Display) -> ConversionError {
    ConversionError::Render {
        format: OutputFormat::Chunks,
        reason: e.to_string(),
    }
}

/// Plain text of a block and every block under it, with the ids covered.
fn flatten(
    doc: &Document,
    id: BlockID,
    text: &mut Vec<String>,
    ids: &mut Vec<BlockID>,
) -> Result<(), ConversionError> {
    let block = doc.block(id).map_err(internal)?;
    ids.push(id);
    match block.content() {
        BlockContent::Table(_) => {
            let mut rows: BTreeMap<usize, Vec<&str>> = BTreeMap::new();
            for child in block.children() {
                let cell = doc.block(*child).map_err(internal)?;
                ids.push(*child);
                if let BlockContent::TableCell(cell) = cell.content() {
                    rows.entry(cell.row).or_default().push(&cell.text);
                }
            }
            text.extend(rows.values().map(|row| row.join(" | ")));
            return Ok(());
        }
        BlockContent::Figure(fig) => text.extend(fig.description.clone()),
        BlockContent::Equation(eq) => {
            text.push(eq.latex.clone().unwrap_or_else(|| eq.text.clone()))
        }
        BlockContent::ListItem(item) => text.push(format!("- {}", item.text)),
        other => text.extend(other.text().map(str::to_owned)),
    }
    for child in block.children() {
        flatten(doc, *child, text, ids)?;
    }
    Ok(())
}

/// Splits after `.`, `!` or `?` followed by whitespace.
fn sentences(text: &str) -> Vec<&str> {
    let mut out = Vec::new();
    let mut start = 0;
    let mut chars = text.char_indices().peekable();
    while let Some((_, c)) = chars.next() {
        if matches!(c, '.' | '!' | '?') {
            if let Some((next, ws)) = chars.peek().copied() {
                if ws.is_whitespace() {
                    out.push(&text[start..next]);
                    start = next;
                }
            }
        }
    }
    if start < text.len() {
        out.push(&text[start..]);
    }
    out
}

/// Packs sentences into pieces of at most `max` chars. A single sentence
/// longer than `max` is cut at char boundaries.
fn split(text: &str, max: usize) -> Vec<String> {
    if text.chars().count() <= max {
        return vec![text.to_owned()];
    }
    let mut pieces = Vec::new();
    let mut current = String::new();
    for sentence in sentences(text) {
        if current.chars().count() + sentence.chars().count() > max && !current.is_empty() {
            pieces.push(current.trim().to_owned());
            current.clear();
        }
        if sentence.chars().count() > max {
            let chars: Vec<char> = sentence.trim().chars().collect();
            for part in chars.chunks(max) {
                pieces.push(part.iter().collect());
            }
            continue;
        }
        current.push_str(sentence);
    }
    if !current.trim().is_empty() {
        pieces.push(current.trim().to_owned());
    }
    pieces
}

pub(crate) fn chunks(doc: &Document, max_chars: usize) -> Result<Vec<Chunk>, ConversionError> {
    let mut out = Vec::new();
    let mut section: Vec<(u8, String)> = Vec::new();

    for (page_index, page) in doc.pages().iter().enumerate() {
        for id in page.blocks() {
            let block = doc.block(*id).map_err(internal)?;
            match block.content() {
                BlockContent::Heading(h) => {
                    section.retain(|(level, _)| *level < h.level);
                    section.push((h.level, h.text.clone()));
                    continue;
                }
                BlockContent::PageHeader(_)
                | BlockContent::PageFooter(_)
                | BlockContent::TableOfContents => continue,
                _ => {}
            }

            let mut text = Vec::new();
            let mut ids = Vec::new();
            flatten(doc, *id, &mut text, &mut ids)?;
            let text = text.join("\n");
            if text.trim().is_empty() {
                continue;
            }
            let path: Vec<String> = section.iter().map(|(_, t)| t.clone()).collect();
            let base = format!("p{page_index}-b{id}");
            let pieces = split(&text, max_chars);
            let single = pieces.len() == 1;
            for (n, piece) in pieces.into_iter().enumerate() {
                out.push(Chunk {
                    id: if single {
                        base.clone()
                    } else {
                        format!("{base}-{n}")
                    },
                    page: page_index,
                    block_ids: ids.clone(),
                    section: path.clone(),
                    text: piece,
                });
            }
        }
    }
    Ok(out)
}

impl Renderer for ChunksRenderer {
    fn format(&self) -> OutputFormat {
        OutputFormat::Chunks
    }

    #[tracing::instrument(skip_all)]
    fn render(
        &self,
        doc: &Document,
        config: &ComponentConfig,
    ) -> Result<RenderedOutput, ConversionError> {
        let max_chars = config.usize("chunk_max_chars")?;
        let chunks = chunks(doc, max_chars)?;
        let content = serde_json::to_string_pretty(&chunks).map_err(internal)?;
        Ok(RenderedOutput::new(OutputFormat::Chunks, content))
    }
}

use async_trait::async_trait;
use tracing::debug;

use super::{Processor, ProcessorKind};
use crate::{
    blocks::{BlockContent, TextBlock},
    config::{Component, OptionSpec},
    document::Document,
    entities::BBox,
    error::StageError,
    pipeline::StageContext,
};

/// Joins consecutive top-level text blocks that read as one paragraph.
///
/// Two blocks merge when both are `Text`, their styles match within
/// `merge_style_tolerance` and the vertical gap between them is at most
/// `merge_max_gap`. The first block keeps its id and absorbs the second,
/// which is removed.
#[derive(Debug, Default)]
pub struct MergeTextProcessor;

impl Component for MergeTextProcessor {
    fn name(&self) -> &'static str {
        "merge_text"
    }

    fn options(&self) -> Vec<OptionSpec> {
        vec![
            OptionSpec::float(
                "merge_max_gap",
                6.0,
                0.0,
                1000.0,
                "Largest vertical gap, in points, between two text blocks that still merge",
            ),
            OptionSpec::float(
                "merge_style_tolerance",
                0.5,
                0.0,
                100.0,
                "Font size difference, in points, under which two blocks share a style",
            ),
        ]
    }
}

fn text_of(doc: &Document, id: usize) -> Option<(TextBlock, BBox)> {
    let block = doc.block(id).ok()?;
    match block.content() {
        BlockContent::Text(text) => Some((text.clone(), block.bbox)),
        _ => None,
    }
}

fn join(first: &str, second: &str) -> String {
    // words hyphenated across a line break
    match first.strip_suffix('-') {
        Some(head) if second.starts_with(|c: char| c.is_lowercase()) => format!("{head}{second}"),
        _ if first.is_empty() => second.to_owned(),
        _ => format!("{first} {second}"),
    }
}

#[async_trait]
impl Processor for MergeTextProcessor {
    fn kind(&self) -> ProcessorKind {
        ProcessorKind::Structural
    }

    async fn process(&self, doc: &mut Document, ctx: &StageContext) -> Result<(), StageError> {
        let max_gap = ctx.config.f32("merge_max_gap")?;
        let tolerance = ctx.config.f32("merge_style_tolerance")?;
        let mut merged = 0;

        for page in 0..doc.pages().len() {
            let top_level = doc.page(page)?.blocks().to_vec();
            let mut current: Option<usize> = None;
            for id in top_level {
                let Some((next, next_box)) = text_of(doc, id) else {
                    current = None;
                    continue;
                };
                let Some((head_id, (head, head_box))) =
                    current.and_then(|c| text_of(doc, c).map(|t| (c, t)))
                else {
                    current = Some(id);
                    continue;
                };
                let mergeable = head.style.matches(&next.style, tolerance)
                    && next_box.y0 >= head_box.y0
                    && head_box.vertical_gap(&next_box) <= max_gap;
                if !mergeable {
                    current = Some(id);
                    continue;
                }

                doc.remove_block(id)?;
                let block = doc.block_mut(head_id)?;
                block.bbox.merge(&next_box);
                if let BlockContent::Text(text) = block.content_mut() {
                    text.text = join(&text.text, &next.text);
                }
                merged += 1;
            }
        }
        debug!(merged, "merged text blocks");
        Ok(())
    }
}

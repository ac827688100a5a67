use async_trait::async_trait;
use itertools::Itertools;

use super::{Processor, ProcessorKind};
use crate::{
    blocks::{BlockContent, BlockKind},
    config::{Component, OptionSpec},
    document::Document,
    entities::BlockID,
    error::StageError,
    pipeline::StageContext,
};

/// A heading size below this share of the previous bucket opens a new level.
const TITLE_MERGE_THRESHOLD: f32 = 0.7;

/// Assigns heading levels from heading sizes, largest first.
#[derive(Debug, Default)]
pub struct HeadingLevelsProcessor;

impl Component for HeadingLevelsProcessor {
    fn name(&self) -> &'static str {
        "heading_levels"
    }

    fn options(&self) -> Vec<OptionSpec> {
        vec![OptionSpec::integer(
            "heading_max_level",
            6,
            1,
            6,
            "Deepest heading level assigned; smaller headings share it",
        )]
    }
}

/// Level per size: sizes sorted descending, a new level whenever a size
/// drops below [`TITLE_MERGE_THRESHOLD`] times the largest size of the
/// current level.
pub(crate) fn title_levels(sizes: &[f32], max_level: u8) -> Vec<u8> {
    let sorted: Vec<f32> = sizes
        .iter()
        .copied()
        .sorted_by(|a, b| b.total_cmp(a))
        .dedup()
        .collect();

    let mut buckets: Vec<(f32, u8)> = Vec::with_capacity(sorted.len());
    let mut level = 1u8;
    let mut lead = sorted.first().copied().unwrap_or_default();
    for size in sorted {
        if size < lead * TITLE_MERGE_THRESHOLD {
            level = (level + 1).min(max_level);
            lead = size;
        }
        buckets.push((size, level));
    }

    sizes
        .iter()
        .map(|size| {
            buckets
                .iter()
                .find(|(s, _)| s == size)
                .map(|(_, l)| *l)
                .unwrap_or(max_level)
        })
        .collect()
}

#[async_trait]
impl Processor for HeadingLevelsProcessor {
    fn kind(&self) -> ProcessorKind {
        ProcessorKind::Structural
    }

    async fn process(&self, doc: &mut Document, ctx: &StageContext) -> Result<(), StageError> {
        let max_level = ctx.config.usize("heading_max_level")? as u8;
        let headings: Vec<(BlockID, f32)> = doc
            .blocks_of_kind(BlockKind::Heading)
            .into_iter()
            .map(|id| -> Result<(BlockID, f32), StageError> {
                let block = doc.block(id)?;
                let size = match block.content() {
                    BlockContent::Heading(h) if h.style.font_size > 0.0 => h.style.font_size,
                    _ => block.bbox.height(),
                };
                Ok((id, size))
            })
            .collect::<Result<_, _>>()?;

        let sizes: Vec<f32> = headings.iter().map(|(_, s)| *s).collect();
        for ((id, _), level) in headings.iter().zip(title_levels(&sizes, max_level)) {
            if let BlockContent::Heading(h) = doc.block_mut(*id)?.content_mut() {
                h.level = level;
            }
        }
        Ok(())
    }
}

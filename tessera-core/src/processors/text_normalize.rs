use async_trait::async_trait;
use plsfix::fix_text;

use super::{Processor, ProcessorKind};
use crate::{
    blocks::BlockKind,
    config::{Component, OptionSpec},
    document::Document,
    error::StageError,
    pipeline::StageContext,
};

/// Repairs mojibake and ligatures, then collapses whitespace.
#[derive(Debug, Default)]
pub struct TextNormalizeProcessor;

fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn normalize(text: &str, kind: BlockKind, fix_unicode: bool) -> String {
    let text = if fix_unicode {
        fix_text(text, None)
    } else {
        text.to_owned()
    };
    match kind {
        // line structure is content here
        BlockKind::Code | BlockKind::Equation => text
            .lines()
            .map(str::trim_end)
            .collect::<Vec<_>>()
            .join("\n"),
        _ => collapse_whitespace(&text),
    }
}

impl Component for TextNormalizeProcessor {
    fn name(&self) -> &'static str {
        "text_normalize"
    }

    fn options(&self) -> Vec<OptionSpec> {
        vec![
            OptionSpec::bool(
                "text_normalize_strict",
                true,
                "Fail the conversion if normalization fails",
            ),
            OptionSpec::bool(
                "fix_unicode",
                true,
                "Repair mojibake, ligatures and other Unicode damage",
            ),
        ]
    }
}

#[async_trait]
impl Processor for TextNormalizeProcessor {
    fn kind(&self) -> ProcessorKind {
        ProcessorKind::Formatting
    }

    fn strict_option(&self) -> Option<&'static str> {
        Some("text_normalize_strict")
    }

    async fn process(&self, doc: &mut Document, ctx: &StageContext) -> Result<(), StageError> {
        let fix_unicode = ctx.config.bool("fix_unicode")?;
        for id in doc.block_ids() {
            let block = doc.block_mut(id)?;
            let kind = block.kind();
            if let Some(text) = block.content_mut().text_mut() {
                let normalized = normalize(text, kind, fix_unicode);
                *text = normalized;
            }
        }
        Ok(())
    }
}

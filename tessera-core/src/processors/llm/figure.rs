use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde_json::json;
use tracing::debug;

use super::{ask, string_field};
use crate::{
    blocks::{BlockContent, BlockKind},
    config::{Component, OptionSpec},
    detect::image_mime,
    document::Document,
    entities::BlockID,
    error::StageError,
    pipeline::StageContext,
    processors::{Processor, ProcessorKind},
    service::{LlmRequest, Raster},
};

const PROMPT: &str = "Describe this figure from a document in a few sentences, so that a \
reader who can't see it understands what it shows. Mention any data it conveys.";

#[derive(Debug, Default)]
pub struct LlmFigureProcessor;

impl Component for LlmFigureProcessor {
    fn name(&self) -> &'static str {
        "llm_figure"
    }

    fn options(&self) -> Vec<OptionSpec> {
        vec![OptionSpec::bool(
            "llm_figure_strict",
            false,
            "Fail the conversion when figure description fails",
        )]
    }
}

/// Image references are relative to the source document's directory.
fn resolve_image(source: &Path, reference: &str) -> PathBuf {
    let reference = Path::new(reference);
    if reference.is_absolute() {
        return reference.to_owned();
    }
    source
        .parent()
        .map(|dir| dir.join(reference))
        .unwrap_or_else(|| reference.to_owned())
}

fn caption_of(doc: &Document, figure: BlockID) -> Result<Option<String>, StageError> {
    for child in doc.block(figure)?.children() {
        if let BlockContent::Caption(caption) = doc.block(*child)?.content() {
            return Ok(Some(caption.text.clone()));
        }
    }
    Ok(None)
}

#[async_trait]
impl Processor for LlmFigureProcessor {
    fn kind(&self) -> ProcessorKind {
        ProcessorKind::Enrichment
    }

    fn strict_option(&self) -> Option<&'static str> {
        Some("llm_figure_strict")
    }

    fn targets(&self) -> &'static [BlockKind] {
        &[BlockKind::Figure]
    }

    async fn process(&self, doc: &mut Document, ctx: &StageContext) -> Result<(), StageError> {
        if ctx.services.llm.is_none() {
            return Ok(());
        }
        let schema = json!({
            "type": "object",
            "properties": { "description": { "type": "string" } },
            "required": ["description"]
        });

        for id in doc.blocks_of_kind(BlockKind::Figure) {
            ctx.check_cancelled()?;
            let reference = match doc.block(id)?.content() {
                BlockContent::Figure(fig) if fig.description.is_none() => fig.image_ref.clone(),
                _ => continue,
            };
            let Some(reference) = reference else {
                continue;
            };
            let path = resolve_image(&doc.metadata.source_path, &reference);
            let bytes = match tokio::fs::read(&path).await {
                Ok(bytes) => bytes,
                Err(e) => {
                    debug!(block = id, path = %path.display(), "figure image unreadable: {e}");
                    continue;
                }
            };
            let Some(mime) = image_mime(&bytes) else {
                debug!(block = id, path = %path.display(), "figure image format unknown");
                continue;
            };

            let mut prompt = PROMPT.to_owned();
            if let Some(caption) = caption_of(doc, id)? {
                prompt.push_str(&format!("\n\nThe figure's caption reads: {caption}"));
            }
            let request = LlmRequest {
                prompt,
                images: vec![Raster::new(bytes, mime)],
                schema: schema.clone(),
            };
            let Some(answer) = ask(doc, id, request, ctx).await? else {
                return Ok(());
            };
            let description = string_field(&answer, "description")?;
            if let BlockContent::Figure(fig) = doc.block_mut(id)?.content_mut() {
                fig.description = Some(description);
            }
        }
        Ok(())
    }
}

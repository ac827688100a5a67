use async_trait::async_trait;
use serde_json::json;

use super::{ask, string_field};
use crate::{
    blocks::{BlockContent, BlockKind},
    config::{Component, OptionSpec},
    document::Document,
    error::StageError,
    pipeline::StageContext,
    processors::{Processor, ProcessorKind},
    service::LlmRequest,
};

const PROMPT: &str = "Convert this equation, extracted from a document, to LaTeX. \
Answer with the LaTeX body only, without surrounding $ or \\[ delimiters.\n\nEquation:\n";

#[derive(Debug, Default)]
pub struct LlmEquationProcessor;

impl Component for LlmEquationProcessor {
    fn name(&self) -> &'static str {
        "llm_equation"
    }

    fn options(&self) -> Vec<OptionSpec> {
        vec![OptionSpec::bool(
            "llm_equation_strict",
            false,
            "Fail the conversion when equation conversion fails",
        )]
    }
}

#[async_trait]
impl Processor for LlmEquationProcessor {
    fn kind(&self) -> ProcessorKind {
        ProcessorKind::Enrichment
    }

    fn strict_option(&self) -> Option<&'static str> {
        Some("llm_equation_strict")
    }

    fn targets(&self) -> &'static [BlockKind] {
        &[BlockKind::Equation]
    }

    async fn process(&self, doc: &mut Document, ctx: &StageContext) -> Result<(), StageError> {
        if ctx.services.llm.is_none() {
            return Ok(());
        }
        let schema = json!({
            "type": "object",
            "properties": { "latex": { "type": "string" } },
            "required": ["latex"]
        });
        for id in doc.blocks_of_kind(BlockKind::Equation) {
            ctx.check_cancelled()?;
            let text = match doc.block(id)?.content() {
                BlockContent::Equation(eq) if eq.latex.is_none() && !eq.text.is_empty() => {
                    eq.text.clone()
                }
                _ => continue,
            };
            let request = LlmRequest {
                prompt: format!("{PROMPT}{text}"),
                images: vec![],
                schema: schema.clone(),
            };
            let Some(answer) = ask(doc, id, request, ctx).await? else {
                return Ok(());
            };
            let latex = string_field(&answer, "latex")?;
            if let BlockContent::Equation(eq) = doc.block_mut(id)?.content_mut() {
                eq.latex = Some(latex);
            }
        }
        Ok(())
    }
}

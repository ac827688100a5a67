//! Processors transform the assembled tree, one focused change each.
//!
//! They run strictly in declared order. What happens when one fails depends
//! on its [`ProcessorKind`]; the pipeline applies the policy and restores
//! the pre-step document for permissive failures.

mod heading_levels;
mod llm;
mod merge_text;
mod text_normalize;
mod toc;

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;

use crate::{
    blocks::BlockKind, config::Component, document::Document, error::StageError,
    pipeline::StageContext, registry::ProcessorFactory,
};

pub use heading_levels::HeadingLevelsProcessor;
pub use llm::{LlmEquationProcessor, LlmFigureProcessor, LlmTableProcessor};
pub use merge_text::MergeTextProcessor;
pub use text_normalize::TextNormalizeProcessor;
pub use toc::TableOfContentsProcessor;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessorKind {
    /// Always fatal on failure.
    Structural,
    /// Fatal unless its strict option is turned off.
    Formatting,
    /// Rolled back on failure unless its strict option is turned on.
    Enrichment,
}

#[async_trait]
pub trait Processor: Component {
    fn kind(&self) -> ProcessorKind;

    /// Boolean option that overrides the kind's default failure policy.
    fn strict_option(&self) -> Option<&'static str> {
        None
    }

    /// Block kinds flagged as failed when an enrichment step is rolled back.
    fn targets(&self) -> &'static [BlockKind] {
        &[]
    }

    async fn process(&self, doc: &mut Document, ctx: &StageContext) -> Result<(), StageError>;
}

pub fn default_processors() -> Vec<ProcessorFactory> {
    let factories: [ProcessorFactory; 7] = [
        || Arc::new(TextNormalizeProcessor),
        || Arc::new(MergeTextProcessor),
        || Arc::new(HeadingLevelsProcessor),
        || Arc::new(LlmTableProcessor),
        || Arc::new(LlmEquationProcessor),
        || Arc::new(LlmFigureProcessor),
        || Arc::new(TableOfContentsProcessor),
    ];
    factories.to_vec()
}

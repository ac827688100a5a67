//! Builders assemble the initial document tree from provider output.
//!
//! They run in declared order and each sees what earlier builders did to
//! both the raw pages and the document.

mod layout;
mod ocr;
mod page;
mod structure;

use std::sync::Arc;

use async_trait::async_trait;

use crate::{
    config::Component, document::Document, error::StageError, pipeline::StageContext,
    provider::ProviderOutput, registry::BuilderFactory,
};

pub use layout::LayoutBuilder;
pub use ocr::OcrBuilder;
pub use page::PageBuilder;
pub use structure::StructureBuilder;

#[async_trait]
pub trait Builder: Component {
    async fn build(
        &self,
        raw: &mut ProviderOutput,
        doc: &mut Document,
        ctx: &StageContext,
    ) -> Result<(), StageError>;
}

pub fn default_builders() -> Vec<BuilderFactory> {
    let factories: [BuilderFactory; 4] = [
        || Arc::new(PageBuilder),
        || Arc::new(OcrBuilder),
        || Arc::new(LayoutBuilder),
        || Arc::new(StructureBuilder),
    ];
    factories.to_vec()
}

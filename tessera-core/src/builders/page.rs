use async_trait::async_trait;

use super::Builder;
use crate::{
    config::Component, document::Document, error::StageError, pipeline::StageContext,
    provider::ProviderOutput,
};

/// One document page per provider page, same index and size.
#[derive(Debug, Default)]
pub struct PageBuilder;

impl Component for PageBuilder {
    fn name(&self) -> &'static str {
        "page"
    }
}

#[async_trait]
impl Builder for PageBuilder {
    async fn build(
        &self,
        raw: &mut ProviderOutput,
        doc: &mut Document,
        _ctx: &StageContext,
    ) -> Result<(), StageError> {
        if !doc.pages().is_empty() {
            return Err(StageError::msg("document already has pages"));
        }
        for (idx, page) in raw.pages.iter().enumerate() {
            if !(page.width > 0.0 && page.height > 0.0) {
                return Err(StageError::msg(format!(
                    "page {idx} has invalid size {}x{}",
                    page.width, page.height
                )));
            }
            doc.add_page(page.width, page.height);
        }
        Ok(())
    }
}

use std::path::Path;

use async_trait::async_trait;

use super::{Provider, ProviderOutput};
use crate::{config::Component, error::StageError, pipeline::StageContext};

/// Reads a pre-extracted document: the intermediate form serialized as JSON.
///
/// Used for inputs already processed by an external extractor, and by tests
/// that need exact geometry.
#[derive(Debug, Default)]
pub struct LayoutJsonProvider;

impl Component for LayoutJsonProvider {
    fn name(&self) -> &'static str {
        "layout_json"
    }
}

#[async_trait]
impl Provider for LayoutJsonProvider {
    async fn extract(&self, path: &Path, _ctx: &StageContext) -> Result<ProviderOutput, StageError> {
        let bytes = tokio::fs::read(path).await?;
        let output: ProviderOutput = serde_json::from_slice(&bytes)?;
        for (idx, page) in output.pages.iter().enumerate() {
            if page.width <= 0.0 || page.height <= 0.0 {
                return Err(StageError::msg(format!(
                    "page {idx} has invalid size {}x{}",
                    page.width, page.height
                )));
            }
            for (t, table) in page.tables.iter().enumerate() {
                table
                    .check()
                    .map_err(|reason| StageError::msg(format!("page {idx} table {t}: {reason}")))?;
            }
        }
        Ok(output)
    }
}

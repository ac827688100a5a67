use std::path::Path;

use async_trait::async_trait;

use super::{LayoutLabel, LayoutRegion, Provider, ProviderOutput, RawImage, RawPage};
use crate::{
    config::Component,
    detect::image_mime,
    entities::BBox,
    error::StageError,
    pipeline::StageContext,
    service::Raster,
};

/// Single-page provider for raster images.
///
/// The page carries the raster and no text, so content comes from the OCR
/// builder. Without OCR the page holds a single figure.
#[derive(Debug, Default)]
pub struct ImageProvider;

impl Component for ImageProvider {
    fn name(&self) -> &'static str {
        "image"
    }
}

#[async_trait]
impl Provider for ImageProvider {
    async fn extract(&self, path: &Path, _ctx: &StageContext) -> Result<ProviderOutput, StageError> {
        let bytes = tokio::fs::read(path).await?;
        let mime = image_mime(&bytes)
            .ok_or_else(|| StageError::msg("unrecognized image encoding"))?;
        let owned = path.to_owned();
        let (width, height) = tokio::task::spawn_blocking(move || ::image::image_dimensions(owned))
            .await
            .map_err(|e| StageError::msg(format!("image decode panicked: {e}")))?
            .map_err(|e| StageError::msg(format!("can't read image: {e}")))?;

        let mut page = RawPage::new(width as f32, height as f32);
        let bbox = BBox::new(0.0, 0.0, width as f32, height as f32);
        page.images.push(RawImage {
            bbox,
            reference: path.file_name().map(|n| n.to_string_lossy().into_owned()),
            alt: None,
        });
        page.layout.push(LayoutRegion::new(0, bbox, LayoutLabel::Picture));
        page.raster = Some(Raster::new(bytes, mime));

        Ok(ProviderOutput {
            title: None,
            pages: vec![page],
        })
    }
}

use async_trait::async_trait;
use tracing::{debug, warn};

use super::Builder;
use crate::{
    config::{Component, OptionSpec},
    document::Document,
    entities::BBox,
    error::{ServiceError, StageError},
    pipeline::StageContext,
    provider::{Line, ProviderOutput, RawPage},
    service::PageImageRequest,
};

/// Below this ratio of line area to text-region area a page is treated as
/// scanned and sent to OCR.
const MIN_LAYOUT_COVERAGE_THRESHOLD: f32 = 0.5;

/// An image covering this much of the page is the page scan itself.
const PAGE_SCAN_IOU: f32 = 0.9;

fn page_needs_ocr(page: &RawPage) -> bool {
    if page.raster.is_none() {
        return false;
    }
    let line_area: f32 = page.lines.iter().map(|l| l.bbox.area()).sum();
    let text_area: f32 = page
        .layout
        .iter()
        .filter(|r| r.label.is_text_block())
        .map(|r| r.bbox.area())
        .sum();

    if text_area > 0.0 {
        line_area / text_area < MIN_LAYOUT_COVERAGE_THRESHOLD
    } else {
        page.lines.is_empty()
    }
}

/// Replaces the text of scanned pages with recognised lines. Provider hints
/// were computed without that text and are dropped with the page scan image.
fn apply_ocr(page: &mut RawPage, lines: Vec<Line>) {
    let page_box = BBox::new(0.0, 0.0, page.width, page.height);
    page.lines = lines;
    page.layout.clear();
    page.images.retain(|img| img.bbox.iou(&page_box) < PAGE_SCAN_IOU);
    page.ocr_applied = true;
}

/// Recognises text on pages that have a raster but no usable text layer.
#[derive(Debug, Default)]
pub struct OcrBuilder;

impl Component for OcrBuilder {
    fn name(&self) -> &'static str {
        "ocr"
    }

    fn options(&self) -> Vec<OptionSpec> {
        vec![OptionSpec::bool(
            "ocr_strict",
            false,
            "Fail the conversion when OCR can't be obtained instead of leaving the page without text",
        )]
    }
}

#[async_trait]
impl Builder for OcrBuilder {
    #[tracing::instrument(skip_all)]
    async fn build(
        &self,
        raw: &mut ProviderOutput,
        doc: &mut Document,
        ctx: &StageContext,
    ) -> Result<(), StageError> {
        let strict = ctx.config.bool("ocr_strict")?;
        for (page_id, page) in raw.pages.iter_mut().enumerate() {
            if !page_needs_ocr(page) {
                continue;
            }
            let (Some(service), Some(raster)) = (&ctx.services.ocr, &page.raster) else {
                debug!(page_id, "page needs OCR but no OCR service is configured");
                continue;
            };
            let request =
                PageImageRequest::new(page_id, page.width, page.height, ctx.settings.device, raster);
            match ctx
                .gate
                .call(service.endpoint(), &ctx.cancel, || service.recognize(&request))
                .await
            {
                Ok(lines) => {
                    debug!(page_id, lines = lines.len(), "OCR applied");
                    apply_ocr(page, lines);
                    doc.page_mut(page_id)?.ocr_applied = true;
                }
                Err(err) if strict || matches!(err, ServiceError::Cancelled { .. }) => {
                    return Err(err.into())
                }
                Err(err) => warn!(page_id, "OCR unavailable, page left without text: {err}"),
            }
        }
        Ok(())
    }
}

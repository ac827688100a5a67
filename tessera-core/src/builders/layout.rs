use async_trait::async_trait;
use itertools::Itertools;
use tracing::{debug, warn};

use super::Builder;
use crate::{
    config::{Component, OptionSpec},
    document::Document,
    error::{ServiceError, StageError},
    pipeline::StageContext,
    provider::{looks_like_caption, LayoutLabel, LayoutRegion, ProviderOutput, RawPage},
    service::PageImageRequest,
};

/// A line at least this much larger than the page's median font is a heading.
const HEADING_FONT_RATIO: f32 = 1.15;
const MAX_HEADING_CHARS: usize = 120;
/// Share of a line's area that must fall inside a table to belong to it.
const MIN_TABLE_OVERLAP: f32 = 0.5;

/// Layout regions for every page: from the layout service when one is
/// configured and the page has a raster, else the provider's hints, else
/// derived from the lines themselves.
#[derive(Debug, Default)]
pub struct LayoutBuilder;

impl Component for LayoutBuilder {
    fn name(&self) -> &'static str {
        "layout"
    }

    fn options(&self) -> Vec<OptionSpec> {
        vec![
            OptionSpec::bool(
                "layout_strict",
                false,
                "Fail the conversion when the layout service can't be reached",
            ),
            OptionSpec::float(
                "layout_min_confidence",
                0.3,
                0.0,
                1.0,
                "Drop detected regions below this confidence",
            ),
            OptionSpec::float(
                "header_margin",
                0.05,
                0.0,
                0.5,
                "Share of the page height at the top and bottom treated as header and footer",
            ),
        ]
    }
}

fn median_font_size(page: &RawPage) -> Option<f32> {
    let sizes: Vec<f32> = page
        .lines
        .iter()
        .map(|l| l.style.font_size)
        .filter(|s| *s > 0.0)
        .sorted_by(|a, b| a.total_cmp(b))
        .collect();
    sizes.get(sizes.len() / 2).copied()
}

/// One region per line, image and table.
fn heuristic_layout(page: &RawPage, header_margin: f32) -> Vec<LayoutRegion> {
    let mut regions: Vec<LayoutRegion> = Vec::new();
    let mut push = |bbox, label| {
        let id = regions.len() as i32;
        regions.push(LayoutRegion::new(id, bbox, label));
    };

    for image in &page.images {
        push(image.bbox, LayoutLabel::Picture);
    }
    for table in &page.tables {
        push(table.bbox, LayoutLabel::Table);
    }

    let median = median_font_size(page);
    let header_limit = page.height * header_margin;
    let footer_limit = page.height * (1.0 - header_margin);
    for line in &page.lines {
        let in_table = page.tables.iter().any(|t| {
            line.bbox.area() > 0.0
                && t.bbox.intersection(&line.bbox) / line.bbox.area() > MIN_TABLE_OVERLAP
        });
        if in_table {
            continue;
        }
        let text = line.text.trim();
        let label = if line.bbox.y1 <= header_limit {
            LayoutLabel::PageHeader
        } else if line.bbox.y0 >= footer_limit {
            LayoutLabel::PageFooter
        } else if looks_like_caption(text) {
            LayoutLabel::Caption
        } else if median.is_some_and(|m| line.style.font_size >= m * HEADING_FONT_RATIO)
            && text.chars().count() <= MAX_HEADING_CHARS
        {
            LayoutLabel::SectionHeader
        } else {
            LayoutLabel::Text
        };
        push(line.bbox, label);
    }
    regions
}

#[async_trait]
impl Builder for LayoutBuilder {
    #[tracing::instrument(skip_all)]
    async fn build(
        &self,
        raw: &mut ProviderOutput,
        _doc: &mut Document,
        ctx: &StageContext,
    ) -> Result<(), StageError> {
        let strict = ctx.config.bool("layout_strict")?;
        let min_confidence = ctx.config.f32("layout_min_confidence")?;
        let header_margin = ctx.config.f32("header_margin")?;

        for (page_id, page) in raw.pages.iter_mut().enumerate() {
            if let (Some(service), Some(raster)) = (&ctx.services.layout, &page.raster) {
                let request = PageImageRequest::new(
                    page_id,
                    page.width,
                    page.height,
                    ctx.settings.device,
                    raster,
                );
                match ctx
                    .gate
                    .call(service.endpoint(), &ctx.cancel, || service.detect(&request))
                    .await
                {
                    Ok(regions) => {
                        page.layout = regions
                            .into_iter()
                            .filter(|r| r.proba >= min_confidence)
                            .collect();
                        debug!(page_id, regions = page.layout.len(), "layout detected");
                    }
                    Err(err) if strict || matches!(err, ServiceError::Cancelled { .. }) => {
                        return Err(err.into())
                    }
                    Err(err) => warn!(page_id, "layout service unavailable, using fallback: {err}"),
                }
            }

            if page.layout.is_empty() {
                page.layout = heuristic_layout(page, header_margin);
            }
        }
        Ok(())
    }
}

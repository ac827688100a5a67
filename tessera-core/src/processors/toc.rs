use async_trait::async_trait;

use super::{Processor, ProcessorKind};
use crate::{
    blocks::{BlockContent, BlockKind, TocEntry},
    config::{Component, OptionSpec},
    document::{Document, Parent},
    error::StageError,
    pipeline::StageContext,
};

/// Inserts a table of contents at the top of the first page, one entry per
/// heading. Off unless `build_toc` is set.
#[derive(Debug, Default)]
pub struct TableOfContentsProcessor;

impl Component for TableOfContentsProcessor {
    fn name(&self) -> &'static str {
        "table_of_contents"
    }

    fn options(&self) -> Vec<OptionSpec> {
        vec![OptionSpec::bool(
            "build_toc",
            false,
            "Insert a table of contents listing every heading",
        )]
    }
}

#[async_trait]
impl Processor for TableOfContentsProcessor {
    fn kind(&self) -> ProcessorKind {
        ProcessorKind::Structural
    }

    async fn process(&self, doc: &mut Document, ctx: &StageContext) -> Result<(), StageError> {
        if !ctx.config.bool("build_toc")? || doc.pages().is_empty() {
            return Ok(());
        }
        let mut entries = Vec::new();
        for id in doc.blocks_of_kind(BlockKind::Heading) {
            let block = doc.block(id)?;
            if let BlockContent::Heading(h) = block.content() {
                entries.push((
                    block.bbox,
                    BlockContent::TocEntry(TocEntry {
                        text: h.text.clone(),
                        level: h.level,
                        target: id,
                        page: block.page_id(),
                    }),
                ));
            }
        }
        if entries.is_empty() {
            return Ok(());
        }

        let toc = match doc.blocks_of_kind(BlockKind::TableOfContents).first() {
            Some(&existing) => existing,
            None => {
                let bbox = doc.page(0)?.bbox();
                doc.insert(Parent::Page(0), Some(0), bbox, BlockContent::TableOfContents)?
            }
        };
        doc.replace_children(toc, entries)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{blocks::Heading, entities::BBox, pipeline::testing};
    use serde_json::json;

    #[tokio::test]
    async fn lists_headings_first_on_page_zero() -> anyhow::Result<()> {
        let mut doc = testing::document();
        let p0 = doc.add_page(100.0, 100.0);
        let p1 = doc.add_page(100.0, 100.0);
        let heading = |text: &str, level| {
            BlockContent::Heading(Heading {
                text: text.into(),
                level,
                ..Default::default()
            })
        };
        let intro = doc.push_block(p0, BBox::new(0.0, 10.0, 50.0, 20.0), heading("Intro", 1))?;
        let details = doc.push_block(p1, BBox::new(0.0, 10.0, 50.0, 20.0), heading("Details", 2))?;

        let processor = TableOfContentsProcessor;
        processor
            .process(&mut doc, &testing::context(&processor, &[]))
            .await?;
        assert!(doc.blocks_of_kind(BlockKind::TableOfContents).is_empty());

        let ctx = testing::context(&processor, &[("build_toc", json!(true))]);
        processor.process(&mut doc, &ctx).await?;
        // running twice keeps a single table
        processor.process(&mut doc, &ctx).await?;
        doc.validate()?;

        let tocs = doc.blocks_of_kind(BlockKind::TableOfContents);
        assert_eq!(tocs.len(), 1);
        assert_eq!(doc.page(p0)?.blocks()[0], tocs[0]);
        let entries: Vec<_> = doc
            .block(tocs[0])?
            .children()
            .iter()
            .map(|id| doc.block(*id).map(|b| b.content().clone()))
            .collect::<Result<_, _>>()?;
        assert_eq!(
            entries,
            vec![
                BlockContent::TocEntry(TocEntry {
                    text: "Intro".into(),
                    level: 1,
                    target: intro,
                    page: p0
                }),
                BlockContent::TocEntry(TocEntry {
                    text: "Details".into(),
                    level: 2,
                    target: details,
                    page: p1
                }),
            ]
        );
        Ok(())
    }
}

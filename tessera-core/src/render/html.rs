use std::collections::BTreeMap;

use build_html::{Html, HtmlChild, HtmlContainer, HtmlElement, HtmlPage, HtmlTag};

use crate::{
    blocks::{BlockContent, BlockKind, TableCell},
    config::{Component, ComponentConfig},
    document::Document,
    entities::BlockID,
    error::ConversionError,
};

use super::{OutputFormat, RenderedOutput, Renderer};

#[derive(Debug, Default)]
pub struct HtmlRenderer;

impl Component for HtmlRenderer {
    fn name(&self) -> &'static str {
        "html"
    }
}

impl Renderer for HtmlRenderer {
    fn format(&self) -> OutputFormat {
        OutputFormat::Html
    }

    #[tracing::instrument(skip_all)]
    fn render(
        &self,
        doc: &Document,
        _config: &ComponentConfig,
    ) -> Result<RenderedOutput, ConversionError> {
        let mut root = HtmlElement::new(HtmlTag::Div);
        for page in doc.pages() {
            let mut section = HtmlElement::new(HtmlTag::Section)
                .with_attribute("data-page", page.id);
            for id in page.blocks() {
                section.add_child(element(doc, *id)?.into());
            }
            root.add_child(section.into());
        }

        let title = doc
            .metadata
            .title
            .as_deref()
            .unwrap_or(&doc.metadata.doc_name);
        let content = HtmlPage::new()
            .with_title(escape(title))
            .with_html(root)
            .to_html_string();
        Ok(RenderedOutput::new(OutputFormat::Html, content))
    }
}

fn escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            c => out.push(c),
        }
    }
    out
}

fn text(value: &str) -> HtmlChild {
    HtmlChild::Raw(escape(value))
}

fn unsupported(kind: BlockKind) -> ConversionError {
    ConversionError::UnsupportedRenderTarget {
        format: OutputFormat::Html,
        kind,
    }
}

fn internal(e: impl std::fmt::Display) -> ConversionError {
    ConversionError::Render {
        format: OutputFormat::Html,
        reason: e.to_string(),
    }
}

fn heading_tag(level: u8) -> HtmlTag {
    match level.clamp(1, 6) {
        1 => HtmlTag::Heading1,
        2 => HtmlTag::Heading2,
        3 => HtmlTag::Heading3,
        4 => HtmlTag::Heading4,
        5 => HtmlTag::Heading5,
        _ => HtmlTag::Heading6,
    }
}

fn element(doc: &Document, id: BlockID) -> Result<HtmlElement, ConversionError> {
    let block = doc.block(id).map_err(internal)?;
    let tagged = |tag: HtmlTag| HtmlElement::new(tag).with_attribute("data-block-id", id);

    let el = match block.content() {
        BlockContent::Text(t) => tagged(HtmlTag::ParagraphText).with_child(text(&t.text)),
        BlockContent::Footnote(t) => tagged(HtmlTag::ParagraphText)
            .with_attribute("class", "footnote")
            .with_child(text(&t.text)),
        BlockContent::Caption(t) => tagged(HtmlTag::Figcaption).with_child(text(&t.text)),
        BlockContent::PageHeader(t) => tagged(HtmlTag::Header).with_child(text(&t.text)),
        BlockContent::PageFooter(t) => tagged(HtmlTag::Footer).with_child(text(&t.text)),
        BlockContent::Heading(h) => tagged(heading_tag(h.level)).with_child(text(&h.text)),
        BlockContent::ListItem(t) => {
            let mut li = tagged(HtmlTag::ListElement).with_child(text(&t.text));
            for child in block.children() {
                li.add_child(element(doc, *child)?.into());
            }
            li
        }
        BlockContent::List(list) => {
            let tag = if list.ordered {
                HtmlTag::OrderedList
            } else {
                HtmlTag::UnorderedList
            };
            let mut el = tagged(tag);
            for child in block.children() {
                el.add_child(element(doc, *child)?.into());
            }
            el
        }
        BlockContent::Table(_) => table(doc, id, block.children())?,
        BlockContent::Figure(fig) => {
            let mut el = tagged(HtmlTag::Figure);
            if let Some(src) = &fig.image_ref {
                let img = HtmlElement::new(HtmlTag::Image)
                    .with_attribute("src", escape(src))
                    .with_attribute("alt", escape(fig.description.as_deref().unwrap_or("")));
                el.add_child(img.into());
            } else if let Some(description) = &fig.description {
                el.add_child(
                    HtmlElement::new(HtmlTag::ParagraphText)
                        .with_child(text(description))
                        .into(),
                );
            }
            for child in block.children() {
                el.add_child(element(doc, *child)?.into());
            }
            el
        }
        BlockContent::Equation(eq) => {
            let body = match &eq.latex {
                Some(latex) => format!("\\[{latex}\\]"),
                None => eq.text.clone(),
            };
            tagged(HtmlTag::Div)
                .with_attribute("class", "equation")
                .with_child(text(&body))
        }
        BlockContent::Code(code) => {
            let mut inner = HtmlElement::new(HtmlTag::CodeText);
            if let Some(lang) = &code.language {
                inner.add_attribute("class", format!("language-{}", escape(lang)));
            }
            tagged(HtmlTag::PreformattedText).with_child(inner.with_child(text(&code.text)).into())
        }
        BlockContent::TableOfContents => {
            let mut list = HtmlElement::new(HtmlTag::UnorderedList);
            for child in block.children() {
                list.add_child(element(doc, *child)?.into());
            }
            tagged(HtmlTag::Navigation).with_child(list.into())
        }
        BlockContent::TocEntry(entry) => tagged(HtmlTag::ListElement)
            .with_attribute("class", format!("toc-level-{}", entry.level))
            .with_child(
                HtmlElement::new(HtmlTag::Link)
                    .with_attribute("href", format!("#block-{}", entry.target))
                    .with_child(text(&entry.text))
                    .into(),
            ),
        BlockContent::TableCell(_) => return Err(unsupported(BlockKind::TableCell)),
    };
    // headings are link targets for the table of contents
    Ok(if block.kind() == BlockKind::Heading {
        el.with_attribute("id", format!("block-{id}"))
    } else {
        el
    })
}

fn table(doc: &Document, id: BlockID, children: &[BlockID]) -> Result<HtmlElement, ConversionError> {
    let mut rows: BTreeMap<usize, Vec<(BlockID, &TableCell)>> = BTreeMap::new();
    for child in children {
        let block = doc.block(*child).map_err(internal)?;
        let BlockContent::TableCell(cell) = block.content() else {
            return Err(unsupported(block.kind()));
        };
        rows.entry(cell.row).or_default().push((*child, cell));
    }

    let mut table = HtmlElement::new(HtmlTag::Table).with_attribute("data-block-id", id);
    for row in rows.into_values() {
        let mut tr = HtmlElement::new(HtmlTag::TableRow);
        for (cell_id, cell) in row {
            let tag = if cell.header {
                HtmlTag::TableHeaderCell
            } else {
                HtmlTag::TableCell
            };
            let mut td = HtmlElement::new(tag).with_attribute("data-block-id", cell_id);
            if cell.row_span > 1 {
                td.add_attribute("rowspan", cell.row_span);
            }
            if cell.col_span > 1 {
                td.add_attribute("colspan", cell.col_span);
            }
            tr.add_child(td.with_child(text(&cell.text)).into());
        }
        table.add_child(tr.into());
    }
    Ok(table)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        blocks::{Heading, Table, TextBlock},
        entities::BBox,
        pipeline::testing,
    };

    #[test]
    fn escapes_text_and_tags_blocks() -> anyhow::Result<()> {
        let mut doc = testing::document();
        let page = doc.add_page(100.0, 100.0);
        let bbox = BBox::new(0.0, 0.0, 10.0, 10.0);
        let heading = doc.push_block(
            page,
            bbox,
            BlockContent::Heading(Heading {
                text: "A & B".into(),
                level: 1,
                ..Default::default()
            }),
        )?;
        let para = doc.push_block(page, bbox, BlockContent::Text(TextBlock::new("<script>x</script>")))?;

        let renderer = HtmlRenderer;
        let ctx = testing::context(&renderer, &[]);
        let out = renderer.render(&doc, &ctx.config)?;
        assert!(out.content.contains("A &amp; B"));
        assert!(out.content.contains("&lt;script&gt;x&lt;/script&gt;"));
        assert!(!out.content.contains("<script>"));
        assert!(out.content.contains(&format!(r#"data-block-id="{heading}""#)));
        assert!(out.content.contains(&format!(r#"data-block-id="{para}""#)));
        assert_eq!(out.mime_type, "text/html; charset=utf-8");
        Ok(())
    }

    #[test]
    fn far_away_cells_keep_their_row_order() -> anyhow::Result<()> {
        let mut doc = testing::document();
        let page = doc.add_page(100.0, 100.0);
        let bbox = BBox::new(0.0, 0.0, 10.0, 10.0);
        let table = doc.push_block(page, bbox, BlockContent::Table(Table { rows: 1, cols: 1 }))?;
        for (row, text) in [(4_000_000_000_000, "last"), (0, "first")] {
            doc.append_child(
                table,
                bbox,
                BlockContent::TableCell(TableCell {
                    text: text.into(),
                    row,
                    col: 0,
                    row_span: 1,
                    col_span: 1,
                    header: false,
                }),
            )?;
        }
        let renderer = HtmlRenderer;
        let ctx = testing::context(&renderer, &[]);
        let out = renderer.render(&doc, &ctx.config)?;
        let first = out.content.find("first").unwrap_or(usize::MAX);
        let last = out.content.find("last").unwrap_or(0);
        assert!(first < last);
        assert_eq!(out.content.matches("<tr").count(), 2);
        Ok(())
    }
}

use serde::Serialize;

use crate::{
    blocks::{BlockContent, BlockMetadata},
    config::{Component, ComponentConfig, OptionSpec},
    document::Document,
    entities::{BBox, BlockID, DocumentMetadata, PageID},
    error::ConversionError,
};

use super::{OutputFormat, RenderedOutput, Renderer};

#[derive(Serialize)]
struct JsonDocument<'a> {
    metadata: &'a DocumentMetadata,
    pages: Vec<JsonPage>,
}

#[derive(Serialize)]
struct JsonPage {
    id: PageID,
    width: f32,
    height: f32,
    ocr_applied: bool,
    blocks: Vec<JsonBlock>,
}

#[derive(Serialize)]
struct JsonBlock {
    id: BlockID,
    bbox: BBox,
    #[serde(flatten)]
    content: BlockContent,
    #[serde(skip_serializing_if = "is_default")]
    metadata: BlockMetadata,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    children: Vec<JsonBlock>,
}

fn is_default(meta: &BlockMetadata) -> bool {
    *meta == BlockMetadata::default()
}

#[derive(Debug, Default)]
pub struct JsonRenderer;

impl Component for JsonRenderer {
    fn name(&self) -> &'static str {
        "json"
    }

    fn options(&self) -> Vec<OptionSpec> {
        vec![OptionSpec::bool("json_pretty", true, "Indent JSON output")]
    }
}

fn internal(e: impl std::fmt::Display) -> ConversionError {
    ConversionError::Render {
        format: OutputFormat::Json,
        reason: e.to_string(),
    }
}

fn tree(doc: &Document, id: BlockID) -> Result<JsonBlock, ConversionError> {
    let block = doc.block(id).map_err(internal)?;
    Ok(JsonBlock {
        id,
        bbox: block.bbox,
        content: block.content().clone(),
        metadata: block.metadata.clone(),
        children: block
            .children()
            .iter()
            .map(|child| tree(doc, *child))
            .collect::<Result<_, _>>()?,
    })
}

impl Renderer for JsonRenderer {
    fn format(&self) -> OutputFormat {
        OutputFormat::Json
    }

    #[tracing::instrument(skip_all)]
    fn render(
        &self,
        doc: &Document,
        config: &ComponentConfig,
    ) -> Result<RenderedOutput, ConversionError> {
        let pages = doc
            .pages()
            .iter()
            .map(|page| {
                Ok(JsonPage {
                    id: page.id,
                    width: page.width,
                    height: page.height,
                    ocr_applied: page.ocr_applied,
                    blocks: page
                        .blocks()
                        .iter()
                        .map(|id| tree(doc, *id))
                        .collect::<Result<_, ConversionError>>()?,
                })
            })
            .collect::<Result<Vec<_>, ConversionError>>()?;
        let out = JsonDocument {
            metadata: &doc.metadata,
            pages,
        };
        let content = if config.bool("json_pretty")? {
            serde_json::to_string_pretty(&out)
        } else {
            serde_json::to_string(&out)
        }
        .map_err(internal)?;
        Ok(RenderedOutput::new(OutputFormat::Json, content))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        blocks::{List, TextBlock},
        pipeline::testing,
    };
    use serde_json::{json, Value};

    #[test]
    fn nests_children_in_order() -> anyhow::Result<()> {
        let mut doc = testing::document();
        let page = doc.add_page(100.0, 200.0);
        let bbox = BBox::new(0.0, 0.0, 10.0, 10.0);
        let list = doc.push_block(page, bbox, BlockContent::List(List { ordered: false }))?;
        doc.append_child(list, bbox, BlockContent::ListItem(TextBlock::new("first")))?;
        doc.append_child(list, bbox, BlockContent::ListItem(TextBlock::new("second")))?;

        let renderer = JsonRenderer;
        let ctx = testing::context(&renderer, &[("json_pretty", json!(false))]);
        let out = renderer.render(&doc, &ctx.config)?;
        let value: Value = serde_json::from_str(&out.content)?;

        let block = &value["pages"][0]["blocks"][0];
        assert_eq!(block["block_type"], "List");
        assert_eq!(block["children"][0]["text"], "first");
        assert_eq!(block["children"][1]["text"], "second");
        assert_eq!(value["metadata"]["doc_name"], "test");
        assert_eq!(value["pages"][0]["height"], 200.0);
        Ok(())
    }
}

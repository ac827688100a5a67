use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;

use super::ask;
use crate::{
    blocks::{BlockContent, BlockKind, Table, TableCell},
    config::{Component, OptionSpec},
    document::Document,
    entities::{BBox, BlockID},
    error::StageError,
    pipeline::StageContext,
    processors::{Processor, ProcessorKind},
    service::LlmRequest,
};

const PROMPT: &str = "The following table was extracted from a document and its cells may be \
misaligned, split or merged. Return the corrected table as a list of rows, each a list of cell \
strings, and the number of header rows.\n\nTable cells as (row, col, text):\n";

#[derive(Debug, Deserialize)]
struct TableAnswer {
    rows: Vec<Vec<String>>,
    #[serde(default)]
    header_rows: usize,
}

#[derive(Debug, Default)]
pub struct LlmTableProcessor;

impl Component for LlmTableProcessor {
    fn name(&self) -> &'static str {
        "llm_table"
    }

    fn options(&self) -> Vec<OptionSpec> {
        vec![OptionSpec::bool(
            "llm_table_strict",
            false,
            "Fail the conversion when table correction fails",
        )]
    }
}

fn describe_cells(doc: &Document, table: BlockID) -> Result<String, StageError> {
    let mut out = String::new();
    for child in doc.block(table)?.children() {
        if let BlockContent::TableCell(cell) = doc.block(*child)?.content() {
            out.push_str(&format!("({}, {}, {:?})\n", cell.row, cell.col, cell.text));
        }
    }
    Ok(out)
}

/// Lays the answered grid out evenly over the table's box.
fn grid(bbox: BBox, answer: &TableAnswer) -> (Table, Vec<(BBox, BlockContent)>) {
    let rows = answer.rows.len();
    let cols = answer.rows.iter().map(Vec::len).max().unwrap_or(0);
    let row_h = bbox.height() / rows.max(1) as f32;
    let col_w = bbox.width() / cols.max(1) as f32;

    let cells = answer
        .rows
        .iter()
        .enumerate()
        .flat_map(|(r, row)| {
            row.iter().enumerate().map(move |(c, text)| {
                let cell_box = BBox::new(
                    bbox.x0 + c as f32 * col_w,
                    bbox.y0 + r as f32 * row_h,
                    bbox.x0 + (c + 1) as f32 * col_w,
                    bbox.y0 + (r + 1) as f32 * row_h,
                );
                let cell = TableCell {
                    text: text.trim().to_owned(),
                    row: r,
                    col: c,
                    row_span: 1,
                    col_span: 1,
                    header: r < answer.header_rows,
                };
                (cell_box, BlockContent::TableCell(cell))
            })
        })
        .collect();
    (Table { rows, cols }, cells)
}

#[async_trait]
impl Processor for LlmTableProcessor {
    fn kind(&self) -> ProcessorKind {
        ProcessorKind::Enrichment
    }

    fn strict_option(&self) -> Option<&'static str> {
        Some("llm_table_strict")
    }

    fn targets(&self) -> &'static [BlockKind] {
        &[BlockKind::Table]
    }

    async fn process(&self, doc: &mut Document, ctx: &StageContext) -> Result<(), StageError> {
        if ctx.services.llm.is_none() {
            return Ok(());
        }
        let schema = json!({
            "type": "object",
            "properties": {
                "rows": { "type": "array", "items": { "type": "array", "items": { "type": "string" } } },
                "header_rows": { "type": "integer", "minimum": 0 }
            },
            "required": ["rows"]
        });

        for id in doc.blocks_of_kind(BlockKind::Table) {
            ctx.check_cancelled()?;
            let cells = describe_cells(doc, id)?;
            if cells.is_empty() {
                continue;
            }
            let request = LlmRequest {
                prompt: format!("{PROMPT}{cells}"),
                images: vec![],
                schema: schema.clone(),
            };
            let Some(value) = ask(doc, id, request, ctx).await? else {
                return Ok(());
            };
            let answer: TableAnswer = serde_json::from_value(value)?;
            if answer.rows.iter().all(Vec::is_empty) {
                return Err(StageError::msg("table answer has no cells"));
            }
            let (table, cells) = grid(doc.block(id)?.bbox, &answer);
            doc.replace_children(id, cells)?;
            doc.replace_content(id, BlockContent::Table(table))?;
        }
        Ok(())
    }
}

//! Turns lines and layout regions into blocks.
//!
//! Lines are grouped into elements by the region they fall in, regions
//! without lines are slotted in next to their closest element, and the
//! element sequence is folded into blocks: list items under one list,
//! captions under the adjacent figure, provider tables into cell grids.

use std::sync::LazyLock;

use async_trait::async_trait;
use itertools::Itertools;
use regex::Regex;
use tracing::debug;

use super::Builder;
use crate::{
    blocks::{BlockContent, Code, Equation, Figure, Heading, List, Table, TableCell, TextBlock, TextStyle},
    config::Component,
    document::Document,
    entities::{BBox, BlockID, PageID},
    error::StageError,
    pipeline::StageContext,
    provider::{LayoutLabel, LayoutRegion, Line, ProviderOutput, RawPage, RawTable},
};

/// This constant defines the minimum required intersection ratio between the
/// bounding box of a text line and a layout region for the line to be
/// assigned to the region.
const MIN_INTERSECTION_LAYOUT: f32 = 0.5;

/// Weights used for distances between boxes. Horizontal misalignment costs
/// more than vertical distance.
const LAYOUT_DISTANCE_X_WEIGHT: f32 = 5.0;
const LAYOUT_DISTANCE_Y_WEIGHT: f32 = 1.0;

/// Lines farther than this (weighted) from every region stay unassigned.
const MAXIMUM_ASSIGNMENT_DISTANCE: f32 = 20.0;

static LIST_MARKER_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*(?:(?P<bullet>[-*+•◦▪‣·–])|(?P<num>\(?(?:\d{1,3}|[a-zA-Z])[.)]))\s+")
        .expect("valid regex")
});

/// A run of lines belonging to one layout region.
#[derive(Debug, Clone)]
struct Element {
    region_id: Option<i32>,
    label: LayoutLabel,
    bbox: BBox,
    lines: Vec<Line>,
}

impl Element {
    fn from_region(region: &LayoutRegion) -> Self {
        Self {
            region_id: Some(region.id),
            label: region.label,
            bbox: region.bbox,
            lines: Vec::new(),
        }
    }

    fn orphan(line: &Line) -> Self {
        Self {
            region_id: None,
            label: LayoutLabel::Text,
            bbox: line.bbox,
            lines: vec![line.clone()],
        }
    }

    fn push_line(&mut self, line: &Line) {
        self.bbox.merge(&line.bbox);
        self.lines.push(line.clone());
    }

    fn text(&self) -> String {
        let sep = match self.label {
            LayoutLabel::Code | LayoutLabel::Formula => "\n",
            _ => " ",
        };
        self.lines.iter().map(|l| l.text.trim_end()).join(sep).trim().to_owned()
    }

    /// Style of the largest line.
    fn style(&self) -> TextStyle {
        self.lines
            .iter()
            .map(|l| l.style)
            .max_by(|a, b| a.font_size.total_cmp(&b.font_size))
            .unwrap_or_default()
    }

    fn text_block(&self) -> TextBlock {
        TextBlock::styled(self.text(), self.style())
    }
}

fn distance(a: &BBox, b: &BBox) -> f32 {
    a.distance(b, LAYOUT_DISTANCE_X_WEIGHT, LAYOUT_DISTANCE_Y_WEIGHT)
}

fn matching_region<'a>(regions: &'a [LayoutRegion], line: &Line) -> Option<&'a LayoutRegion> {
    let line_area = line.bbox.area();
    let max_intersection = regions
        .iter()
        .max_by(|a, b| {
            a.bbox
                .intersection(&line.bbox)
                .total_cmp(&b.bbox.intersection(&line.bbox))
        })
        .filter(|r| line_area > 0.0 && r.bbox.intersection(&line.bbox) / line_area > MIN_INTERSECTION_LAYOUT);
    max_intersection.or_else(|| {
        regions
            .iter()
            .min_by(|a, b| distance(&a.bbox, &line.bbox).total_cmp(&distance(&b.bbox, &line.bbox)))
            .filter(|r| distance(&r.bbox, &line.bbox) < MAXIMUM_ASSIGNMENT_DISTANCE)
    })
}

fn merge_or_create(elements: &mut Vec<Element>, line: &Line, region: &LayoutRegion) {
    match elements.iter_mut().find(|e| e.region_id == Some(region.id)) {
        Some(el) => el.push_line(line),
        None => {
            let mut el = Element::from_region(region);
            el.push_line(line);
            elements.push(el);
        }
    }
}

/// Groups lines by region, keeping line order. Headers come first and
/// footers last; lines no region claims become their own text element.
fn merge_lines_layout(regions: &[LayoutRegion], lines: &[Line]) -> Vec<Element> {
    let mut headers = Vec::new();
    let mut elements = Vec::new();
    let mut footers = Vec::new();
    for line in lines.iter().filter(|l| !l.text.trim().is_empty()) {
        match matching_region(regions, line) {
            Some(region) => match region.label {
                LayoutLabel::PageHeader => merge_or_create(&mut headers, line, region),
                LayoutLabel::PageFooter => merge_or_create(&mut footers, line, region),
                _ => merge_or_create(&mut elements, line, region),
            },
            None => elements.push(Element::orphan(line)),
        }
    }
    headers.append(&mut elements);
    headers.append(&mut footers);
    headers
}

/// Slots regions that received no line (pictures, tables) next to their
/// closest body element, before or after it depending on vertical order.
fn merge_remaining(elements: &mut Vec<Element>, remaining: &[&LayoutRegion]) {
    for region in remaining {
        let closest = elements
            .iter()
            .enumerate()
            .filter(|(_, e)| !matches!(e.label, LayoutLabel::PageHeader | LayoutLabel::PageFooter))
            .min_by(|(_, a), (_, b)| {
                distance(&a.bbox, &region.bbox).total_cmp(&distance(&b.bbox, &region.bbox))
            })
            .map(|(idx, e)| {
                if region.bbox.center().1 < e.bbox.center().1 {
                    idx
                } else {
                    idx + 1
                }
            });
        let index = closest.unwrap_or_else(|| {
            elements
                .iter()
                .position(|e| e.label == LayoutLabel::PageFooter)
                .unwrap_or(elements.len())
        });
        elements.insert(index, Element::from_region(region));
    }
}

/// Regions for provider images and tables the layout doesn't already cover.
fn uncovered_provider_regions(page: &RawPage, regions: &[LayoutRegion]) -> Vec<LayoutRegion> {
    let covered = |bbox: &BBox, label: LayoutLabel| {
        regions
            .iter()
            .any(|r| r.label == label && r.bbox.intersection(bbox) > 0.0)
    };
    let mut next_id = regions.iter().map(|r| r.id).max().unwrap_or(-1) + 1;
    let mut extra = Vec::new();
    let boxes = page
        .images
        .iter()
        .map(|i| (i.bbox, LayoutLabel::Picture))
        .chain(page.tables.iter().map(|t| (t.bbox, LayoutLabel::Table)));
    for (bbox, label) in boxes {
        if !covered(&bbox, label) {
            extra.push(LayoutRegion::new(next_id, bbox, label));
            next_id += 1;
        }
    }
    extra
}

fn page_elements(page: &RawPage) -> Vec<Element> {
    // services don't always number their regions
    let mut regions = page.layout.clone();
    for (idx, region) in regions.iter_mut().enumerate() {
        region.id = idx as i32;
    }
    let extra = uncovered_provider_regions(page, &regions);
    regions.extend(extra);

    let mut elements = merge_lines_layout(&regions, &page.lines);
    let merged: Vec<i32> = elements.iter().filter_map(|e| e.region_id).collect();
    let remaining: Vec<&LayoutRegion> = regions
        .iter()
        .filter(|r| !merged.contains(&r.id))
        // empty text regions carry nothing
        .filter(|r| !r.label.is_text_block())
        .collect();
    merge_remaining(&mut elements, &remaining);
    elements
}

/// Strips a list marker, reporting whether it was an enumeration.
fn strip_list_marker(text: &str) -> (String, bool) {
    match LIST_MARKER_RE.captures(text) {
        Some(caps) => {
            let ordered = caps.name("num").is_some();
            (text[caps[0].len()..].trim().to_owned(), ordered)
        }
        None => (text.trim().to_owned(), false),
    }
}

fn best_overlap<'a, T>(bbox: &BBox, items: &'a [T], item_box: impl Fn(&T) -> BBox) -> Option<&'a T> {
    items
        .iter()
        .map(|item| (item, item_box(item).intersection(bbox)))
        .filter(|(_, overlap)| *overlap > 0.0)
        .max_by(|a, b| a.1.total_cmp(&b.1))
        .map(|(item, _)| item)
}

/// Cell grid for a table region, row-major: the provider's table when one
/// overlaps, otherwise one single-column row per line.
fn table_cells(element: &Element, tables: &[RawTable]) -> (Table, Vec<(BBox, BlockContent)>) {
    let mut cells: Vec<(BBox, TableCell)> = match best_overlap(&element.bbox, tables, |t| t.bbox) {
        Some(table) => table
            .cells
            .iter()
            .map(|c| {
                (
                    c.bbox.unwrap_or(table.bbox),
                    TableCell {
                        text: c.text.trim().to_owned(),
                        row: c.row,
                        col: c.col,
                        row_span: c.row_span.max(1),
                        col_span: c.col_span.max(1),
                        header: c.header,
                    },
                )
            })
            .collect(),
        None => element
            .lines
            .iter()
            .enumerate()
            .map(|(row, line)| {
                (
                    line.bbox,
                    TableCell {
                        text: line.text.trim().to_owned(),
                        row,
                        col: 0,
                        row_span: 1,
                        col_span: 1,
                        header: false,
                    },
                )
            })
            .collect(),
    };
    cells.sort_by_key(|(_, c)| (c.row, c.col));
    let table = Table {
        rows: cells.iter().map(|(_, c)| c.row.saturating_add(c.row_span)).max().unwrap_or(0),
        cols: cells.iter().map(|(_, c)| c.col.saturating_add(c.col_span)).max().unwrap_or(0),
    };
    let children = cells
        .into_iter()
        .map(|(bbox, cell)| (bbox, BlockContent::TableCell(cell)))
        .collect();
    (table, children)
}

/// A top-level block to create, with its children.
struct Planned {
    bbox: BBox,
    content: BlockContent,
    children: Vec<(BBox, BlockContent)>,
}

impl Planned {
    fn leaf(bbox: BBox, content: BlockContent) -> Self {
        Self {
            bbox,
            content,
            children: Vec::new(),
        }
    }
}

fn figure(element: &Element, page: &RawPage, caption: Option<&Element>) -> Planned {
    let image = best_overlap(&element.bbox, &page.images, |i| i.bbox);
    let mut bbox = element.bbox;
    let mut children = Vec::new();
    if let Some(caption) = caption {
        bbox.merge(&caption.bbox);
        children.push((caption.bbox, BlockContent::Caption(caption.text_block())));
    }
    Planned {
        bbox,
        content: BlockContent::Figure(Figure {
            image_ref: image.and_then(|i| i.reference.clone()),
            description: image.and_then(|i| i.alt.clone()),
        }),
        children,
    }
}

/// Same-label run folded into one block (page headers and footers).
fn merge_run(first: Element, it: &mut std::iter::Peekable<impl Iterator<Item = Element>>) -> Element {
    let mut merged = first;
    while let Some(next) = it.next_if(|n| n.label == merged.label) {
        merged.bbox.merge(&next.bbox);
        merged.lines.extend(next.lines);
    }
    merged
}

fn plan_blocks(elements: Vec<Element>, page: &RawPage) -> Vec<Planned> {
    let mut it = elements.into_iter().peekable();
    let mut planned = Vec::new();

    while let Some(el) = it.next() {
        match el.label {
            LayoutLabel::Text => {
                if !el.lines.is_empty() {
                    planned.push(Planned::leaf(el.bbox, BlockContent::Text(el.text_block())));
                }
            }
            LayoutLabel::Title | LayoutLabel::SectionHeader => {
                if !el.lines.is_empty() {
                    let style = el.style();
                    planned.push(Planned::leaf(
                        el.bbox,
                        BlockContent::Heading(Heading {
                            text: el.text(),
                            level: 0,
                            style,
                        }),
                    ));
                }
            }
            LayoutLabel::ListItem => {
                let mut items = vec![el];
                while let Some(next) = it.next_if(|n| n.label == LayoutLabel::ListItem) {
                    items.push(next);
                }
                let items: Vec<(BBox, String, bool, TextStyle)> = items
                    .iter()
                    .filter(|i| !i.lines.is_empty())
                    .map(|i| {
                        let (text, ordered) = strip_list_marker(&i.text());
                        (i.bbox, text, ordered, i.style())
                    })
                    .collect();
                let Some(bbox) = BBox::enclosing(items.iter().map(|(b, ..)| b)) else {
                    continue;
                };
                let ordered = items.first().is_some_and(|(_, _, o, _)| *o);
                planned.push(Planned {
                    bbox,
                    content: BlockContent::List(List { ordered }),
                    children: items
                        .into_iter()
                        .map(|(b, text, _, style)| {
                            (b, BlockContent::ListItem(TextBlock::styled(text, style)))
                        })
                        .collect(),
                });
            }
            LayoutLabel::Caption => {
                if el.lines.is_empty() {
                    continue;
                }
                // a caption right before a figure belongs to it
                match it.next_if(|n| n.label == LayoutLabel::Picture) {
                    Some(picture) => planned.push(figure(&picture, page, Some(&el))),
                    None => planned.push(Planned::leaf(el.bbox, BlockContent::Caption(el.text_block()))),
                }
            }
            LayoutLabel::Picture => {
                let caption = it.next_if(|n| n.label == LayoutLabel::Caption && !n.lines.is_empty());
                planned.push(figure(&el, page, caption.as_ref()));
            }
            LayoutLabel::Table => {
                let (table, children) = table_cells(&el, &page.tables);
                let bbox = BBox::enclosing(children.iter().map(|(b, _)| b))
                    .map(|mut b| {
                        b.merge(&el.bbox);
                        b
                    })
                    .unwrap_or(el.bbox);
                planned.push(Planned {
                    bbox,
                    content: BlockContent::Table(table),
                    children,
                });
            }
            LayoutLabel::Formula => {
                if !el.lines.is_empty() {
                    planned.push(Planned::leaf(
                        el.bbox,
                        BlockContent::Equation(Equation {
                            text: el.text(),
                            latex: None,
                        }),
                    ));
                }
            }
            LayoutLabel::Code => {
                if !el.lines.is_empty() {
                    planned.push(Planned::leaf(
                        el.bbox,
                        BlockContent::Code(Code {
                            text: el.text(),
                            language: None,
                        }),
                    ));
                }
            }
            LayoutLabel::Footnote => {
                if !el.lines.is_empty() {
                    planned.push(Planned::leaf(el.bbox, BlockContent::Footnote(el.text_block())));
                }
            }
            LayoutLabel::PageHeader => {
                let run = merge_run(el, &mut it);
                if !run.lines.is_empty() {
                    planned.push(Planned::leaf(run.bbox, BlockContent::PageHeader(run.text_block())));
                }
            }
            LayoutLabel::PageFooter => {
                let run = merge_run(el, &mut it);
                if !run.lines.is_empty() {
                    planned.push(Planned::leaf(run.bbox, BlockContent::PageFooter(run.text_block())));
                }
            }
        }
    }
    planned
}

fn insert_planned(
    doc: &mut Document,
    page: PageID,
    planned: Vec<Planned>,
) -> Result<Vec<BlockID>, StageError> {
    let mut ids = Vec::with_capacity(planned.len());
    for block in planned {
        let id = doc.push_block(page, block.bbox, block.content)?;
        for (bbox, content) in block.children {
            doc.append_child(id, bbox, content)?;
        }
        ids.push(id);
    }
    Ok(ids)
}

/// Assembles each page's blocks from its lines, regions, images and tables.
#[derive(Debug, Default)]
pub struct StructureBuilder;

impl Component for StructureBuilder {
    fn name(&self) -> &'static str {
        "structure"
    }
}

#[async_trait]
impl Builder for StructureBuilder {
    #[tracing::instrument(skip_all)]
    async fn build(
        &self,
        raw: &mut ProviderOutput,
        doc: &mut Document,
        ctx: &StageContext,
    ) -> Result<(), StageError> {
        for (page_id, page) in raw.pages.iter().enumerate() {
            ctx.check_cancelled()?;
            for table in &page.tables {
                table
                    .check()
                    .map_err(|reason| StageError::msg(format!("page {page_id}: {reason}")))?;
            }
            let elements = page_elements(page);
            let planned = plan_blocks(elements, page);
            let ids = insert_planned(doc, page_id, planned)?;
            debug!(page_id, blocks = ids.len(), "page assembled");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        blocks::BlockKind,
        detect::InputKind,
        entities::DocumentMetadata,
        provider::{RawCell, RawImage},
    };

    fn line(text: &str, bbox: BBox) -> Line {
        Line {
            text: text.into(),
            bbox,
            style: TextStyle {
                font_size: 10.0,
                ..Default::default()
            },
        }
    }

    fn region(id: i32, bbox: BBox, label: LayoutLabel) -> LayoutRegion {
        LayoutRegion::new(id, bbox, label)
    }

    fn document() -> Document {
        Document::new(DocumentMetadata::new(
            "test".into(),
            "test.json".into(),
            InputKind::LayoutJson,
        ))
    }

    #[test]
    fn lines_follow_their_regions() {
        let regions = vec![
            region(0, BBox::new(0.0, 0.0, 100.0, 30.0), LayoutLabel::Text),
            region(1, BBox::new(0.0, 0.0, 100.0, 5.0), LayoutLabel::PageHeader),
        ];
        let lines = vec![
            line("header", BBox::new(0.0, 0.0, 50.0, 4.0)),
            line("first", BBox::new(0.0, 10.0, 50.0, 18.0)),
            line("second", BBox::new(0.0, 20.0, 50.0, 28.0)),
            line("far away", BBox::new(0.0, 500.0, 50.0, 508.0)),
        ];
        let elements = merge_lines_layout(&regions, &lines);
        assert_eq!(elements.len(), 3);
        assert_eq!(elements[0].label, LayoutLabel::PageHeader);
        assert_eq!(elements[1].text(), "first second");
        assert_eq!(elements[2].region_id, None);
        assert_eq!(elements[2].text(), "far away");
    }

    #[test]
    fn list_markers() {
        assert_eq!(strip_list_marker("- milk"), ("milk".to_owned(), false));
        assert_eq!(strip_list_marker("• eggs"), ("eggs".to_owned(), false));
        assert_eq!(strip_list_marker("2. flour"), ("flour".to_owned(), true));
        assert_eq!(strip_list_marker("(a) sugar"), ("sugar".to_owned(), true));
        assert_eq!(strip_list_marker("butter"), ("butter".to_owned(), false));
    }

    #[tokio::test]
    async fn builds_lists_figures_and_tables() -> anyhow::Result<()> {
        let mut page = RawPage::new(200.0, 300.0);
        page.lines = vec![
            line("1. one", BBox::new(10.0, 10.0, 60.0, 18.0)),
            line("2. two", BBox::new(10.0, 20.0, 60.0, 28.0)),
            line("Figure 1: cat", BBox::new(10.0, 150.0, 90.0, 158.0)),
            line("Table 1: orphan caption", BBox::new(10.0, 280.0, 90.0, 288.0)),
        ];
        page.layout = vec![
            region(0, BBox::new(10.0, 10.0, 60.0, 18.0), LayoutLabel::ListItem),
            region(1, BBox::new(10.0, 20.0, 60.0, 28.0), LayoutLabel::ListItem),
            region(2, BBox::new(10.0, 40.0, 190.0, 140.0), LayoutLabel::Picture),
            region(3, BBox::new(10.0, 150.0, 90.0, 158.0), LayoutLabel::Caption),
            region(4, BBox::new(10.0, 280.0, 90.0, 288.0), LayoutLabel::Caption),
        ];
        page.images.push(RawImage {
            bbox: BBox::new(10.0, 40.0, 190.0, 140.0),
            reference: Some("cat.png".into()),
            alt: Some("a cat".into()),
        });
        page.tables.push(RawTable {
            bbox: BBox::new(10.0, 200.0, 190.0, 260.0),
            cells: [(1, 1, "d"), (0, 1, "b"), (1, 0, "c"), (0, 0, "a")]
                .into_iter()
                .map(|(row, col, text)| RawCell {
                    row,
                    col,
                    text: text.into(),
                    row_span: 1,
                    col_span: 1,
                    header: row == 0,
                    bbox: None,
                })
                .collect(),
        });

        let mut doc = document();
        let page_id = doc.add_page(page.width, page.height);
        let planned = plan_blocks(page_elements(&page), &page);
        insert_planned(&mut doc, page_id, planned)?;
        doc.validate()?;

        let top: Vec<_> = doc.page(0)?.blocks().to_vec();
        let kinds: Vec<_> = top.iter().map(|id| doc.block(*id).map(|b| b.kind())).collect::<Result<_, _>>()?;
        assert_eq!(
            kinds,
            vec![BlockKind::List, BlockKind::Figure, BlockKind::Table, BlockKind::Caption]
        );

        let list = doc.block(top[0])?;
        assert!(matches!(list.content(), BlockContent::List(List { ordered: true })));
        assert_eq!(doc.block(list.children()[1])?.text(), Some("two"));

        let figure = doc.block(top[1])?;
        match figure.content() {
            BlockContent::Figure(f) => assert_eq!(f.image_ref.as_deref(), Some("cat.png")),
            other => panic!("expected figure, got {other:?}"),
        }
        assert_eq!(doc.block(figure.children()[0])?.text(), Some("Figure 1: cat"));

        let table = doc.block(top[2])?;
        let cells: Vec<_> = table
            .children()
            .iter()
            .map(|c| doc.block(*c).map(|b| b.text().unwrap_or_default().to_owned()))
            .collect::<Result<_, _>>()?;
        assert_eq!(cells, vec!["a", "b", "c", "d"]);
        assert!(matches!(table.content(), BlockContent::Table(Table { rows: 2, cols: 2 })));
        Ok(())
    }
}

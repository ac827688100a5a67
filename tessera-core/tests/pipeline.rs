mod common;

use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};

use async_trait::async_trait;
use serde_json::json;
use tessera_core::{
    blocks::{BlockContent, BlockKind},
    config::{Component, ConfigDistributor},
    detect::InputKind,
    pipeline::StageContext,
    provider::{Provider, ProviderOutput, TextProvider},
    registry::{InputEntry, RegistryBuilder},
    ConfigLayers, ConversionError, ConversionRequest, Converter, OutputFormat,
};
use tokio_util::sync::CancellationToken;

#[tokio::test]
async fn three_page_document_keeps_table_on_second_page() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let path = common::write_json(dir.path(), "report.json", &common::three_page_layout());
    let converter = common::converter(ConfigLayers::new());

    let request = ConversionRequest::new(&path)
        .with_formats([OutputFormat::Markdown, OutputFormat::Json]);
    let result = converter.convert(&request, &CancellationToken::new()).await?;
    let doc = &result.document;
    doc.validate()?;

    assert_eq!(doc.pages().len(), 3);
    assert_eq!(doc.metadata.input_kind, InputKind::LayoutJson);
    assert_eq!(doc.metadata.title.as_deref(), Some("Quarterly report"));

    let tables = doc.blocks_of_kind(BlockKind::Table);
    assert_eq!(tables.len(), 1);
    let table = doc.block(tables[0])?;
    assert_eq!(table.page_id(), 1);
    assert_eq!(doc.pages()[1].blocks()[0], tables[0]);
    assert_eq!(table.children().len(), 4);
    for cell in table.children() {
        assert_eq!(doc.block(*cell)?.page_id(), 1);
    }

    let markdown = &result.outputs[0];
    assert_eq!(markdown.format, OutputFormat::Markdown);
    assert_eq!(
        markdown.content,
        "# Introduction\n\n\
         This is the first line of the introduction.\n\n\
         | Name | Qty |\n|---|---|\n| apple | 3 |\n\n\
         After the table.\n\n\
         Last page.\n"
    );

    let json: serde_json::Value = serde_json::from_str(&result.outputs[1].content)?;
    assert_eq!(json["pages"][1]["blocks"][0]["block_type"], "Table");
    assert_eq!(json["metadata"]["options"]["page_separator"], "none");
    Ok(())
}

#[tokio::test]
async fn wrapped_lines_merge_into_paragraphs() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let path = common::write(dir.path(), "notes.txt", "alpha beta\ngamma\n\ndelta\n");
    let converter = common::converter(ConfigLayers::new());

    let result = converter
        .convert(&ConversionRequest::new(&path), &CancellationToken::new())
        .await?;
    let texts: Vec<String> = result.document.pages()[0]
        .blocks()
        .iter()
        .filter_map(|id| Some(result.document.block(*id).ok()?.text()?.to_owned()))
        .collect();
    assert_eq!(texts, vec!["alpha beta gamma", "delta"]);
    Ok(())
}

#[tokio::test]
async fn rendering_twice_is_byte_identical() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let path = common::write_json(dir.path(), "report.json", &common::three_page_layout());
    let converter = common::converter(ConfigLayers::new());
    let result = converter
        .convert(&ConversionRequest::new(&path), &CancellationToken::new())
        .await?;

    let distributor = ConfigDistributor::default();
    for format in OutputFormat::ALL {
        let renderer = converter.registry().renderer(format)?;
        let config = distributor.distribute(renderer.as_ref())?;
        let first = renderer.render(&result.document, &config)?;
        let second = renderer.render(&result.document, &config)?;
        assert_eq!(first, second, "{format} output differs");
    }
    Ok(())
}

#[tokio::test]
async fn override_beats_file_beats_env() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let path = common::write_json(dir.path(), "report.json", &common::three_page_layout());
    let config = common::write(dir.path(), "tessera.toml", "page_separator = \"comment\"\n");

    let env = [("TESSERA_OPT_PAGE_SEPARATOR".to_owned(), "rule".to_owned())];
    let env_only = common::converter(ConfigLayers::new().with_env_vars(env.clone()));
    let with_file = common::converter(ConfigLayers::new().with_env_vars(env).with_file(&config)?);
    let cancel = CancellationToken::new();

    let out = env_only.convert(&ConversionRequest::new(&path), &cancel).await?;
    assert!(out.outputs[0].content.contains("\n---\n"));

    let out = with_file.convert(&ConversionRequest::new(&path), &cancel).await?;
    assert!(out.outputs[0].content.starts_with("<!-- page 1 -->"));

    let request = ConversionRequest::new(&path).with_override("page_separator", json!("none"));
    let out = with_file.convert(&request, &cancel).await?;
    assert!(!out.outputs[0].content.contains("<!--"));
    assert!(!out.outputs[0].content.contains("---\n"));
    assert_eq!(out.document.metadata.options["page_separator"], "none");
    Ok(())
}

#[tokio::test]
async fn invalid_option_fails_before_anything_runs() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let path = common::write(dir.path(), "notes.txt", "hello\n");
    let converter = common::converter(ConfigLayers::new());

    let request = ConversionRequest::new(&path).with_override("merge_max_gap", json!("wide"));
    let err = converter
        .convert(&request, &CancellationToken::new())
        .await
        .expect_err("invalid option");
    assert!(matches!(err, ConversionError::InvalidConfig(_)));
    assert_eq!(err.exit_code(), 3);
    Ok(())
}

#[tokio::test]
async fn out_of_range_table_cells_are_bad_input() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let converter = common::converter(ConfigLayers::new());
    let cells = [
        json!({"row": 4_000_000_000_000u64, "col": 0, "text": "far"}),
        json!({"row": 0, "col": 0, "text": "wide", "row_span": usize::MAX}),
    ];
    for (i, cell) in cells.into_iter().enumerate() {
        let mut layout = common::three_page_layout();
        layout["pages"][1]["tables"][0]["cells"][3] = cell;
        let path = common::write_json(dir.path(), &format!("table{i}.json"), &layout);
        let err = converter
            .convert(&ConversionRequest::new(&path), &CancellationToken::new())
            .await
            .expect_err("cell outside the table limit");
        assert!(matches!(err, ConversionError::Provider { .. }), "{err}");
        assert_eq!(err.exit_code(), 2);
    }
    Ok(())
}

static EXTRACTIONS: AtomicUsize = AtomicUsize::new(0);

#[derive(Debug, Default)]
struct CountingProvider;

impl Component for CountingProvider {
    fn name(&self) -> &'static str {
        "counting"
    }
}

#[async_trait]
impl Provider for CountingProvider {
    async fn extract(
        &self,
        _path: &std::path::Path,
        _ctx: &StageContext,
    ) -> Result<ProviderOutput, tessera_core::error::StageError> {
        EXTRACTIONS.fetch_add(1, Ordering::SeqCst);
        Ok(ProviderOutput::default())
    }
}

#[tokio::test]
async fn unregistered_kind_never_reaches_a_provider() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let path = common::write(dir.path(), "scan.pdf", b"%PDF-1.7\n%...\n");
    let registry = RegistryBuilder::new()
        .register_input(InputKind::Text, InputEntry::new(|| Arc::new(CountingProvider)))?
        .build()?;
    let converter = Converter::new(Arc::new(registry), ConfigLayers::new())?;

    let err = converter
        .convert(&ConversionRequest::new(&path), &CancellationToken::new())
        .await
        .expect_err("pdf has no entry");
    assert!(matches!(err, ConversionError::UnsupportedInputKind(InputKind::Pdf)));
    assert_eq!(err.exit_code(), 2);
    assert_eq!(EXTRACTIONS.load(Ordering::SeqCst), 0);
    Ok(())
}

#[tokio::test]
async fn missing_renderer_is_reported_before_extraction() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let path = common::write(dir.path(), "notes.txt", "hello\n");
    let registry = RegistryBuilder::new()
        .register_input(InputKind::Text, InputEntry::new(|| Arc::new(TextProvider)))?
        .build()?;
    let converter = Converter::new(Arc::new(registry), ConfigLayers::new())?;

    let err = converter
        .convert(&ConversionRequest::new(&path), &CancellationToken::new())
        .await
        .expect_err("no markdown renderer");
    assert!(matches!(
        err,
        ConversionError::Render {
            format: OutputFormat::Markdown,
            ..
        }
    ));
    Ok(())
}

#[tokio::test]
async fn cancelled_token_stops_the_run() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let path = common::write(dir.path(), "notes.txt", "hello\n");
    let converter = common::converter(ConfigLayers::new());
    let cancel = CancellationToken::new();
    cancel.cancel();

    let err = converter
        .convert(&ConversionRequest::new(&path), &cancel)
        .await
        .expect_err("cancelled");
    assert!(matches!(err, ConversionError::Cancelled(_)));
    Ok(())
}

#[tokio::test]
async fn markdown_input_round_trips_structure() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let path = common::write(
        dir.path(),
        "guide.md",
        "# Guide\n\nSome intro text.\n\n## Steps\n\n- first\n- second\n\n```\nlet x = 1;\n```\n",
    );
    let converter = common::converter(ConfigLayers::new());
    let result = converter
        .convert(&ConversionRequest::new(&path), &CancellationToken::new())
        .await?;

    let kinds: Vec<BlockKind> = result.document.pages()[0]
        .blocks()
        .iter()
        .map(|id| result.document.block(*id).map(|b| b.kind()))
        .collect::<Result<_, _>>()?;
    assert_eq!(
        kinds,
        vec![
            BlockKind::Heading,
            BlockKind::Text,
            BlockKind::Heading,
            BlockKind::List,
            BlockKind::Code
        ]
    );
    let levels: Vec<u8> = result
        .document
        .blocks_of_kind(BlockKind::Heading)
        .into_iter()
        .filter_map(|id| match result.document.block(id).ok()?.content() {
            BlockContent::Heading(h) => Some(h.level),
            _ => None,
        })
        .collect();
    assert_eq!(levels, vec![1, 2]);
    assert_eq!(result.document.metadata.title.as_deref(), Some("Guide"));
    Ok(())
}

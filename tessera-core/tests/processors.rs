mod common;

use std::sync::{
    atomic::{AtomicU32, Ordering},
    Arc,
};

use async_trait::async_trait;
use serde_json::{json, Value};
use tessera_core::{
    blocks::{BlockContent, BlockKind, Equation},
    config::{Component, OptionSpec},
    detect::InputKind,
    document::Document,
    error::{ExitCategory, ServiceError, StageError},
    pipeline::{StageContext, StepOutcome},
    processors::{Processor, ProcessorKind},
    provider::TextProvider,
    registry::{InputEntry, ProcessorFactory, RegistryBuilder},
    service::{CallError, LlmRequest, LlmResponse, LlmService, ServiceSet},
    ConfigLayers, ConversionError, ConversionRequest, ConversionResult, Converter,
};
use tokio_util::sync::CancellationToken;

fn first_text(doc: &Document) -> Option<String> {
    let id = *doc.blocks_of_kind(BlockKind::Text).first()?;
    Some(doc.block(id).ok()?.text()?.to_owned())
}

fn set_first_text(doc: &mut Document, text: &str) -> Result<(), StageError> {
    let id = *doc
        .blocks_of_kind(BlockKind::Text)
        .first()
        .ok_or_else(|| StageError::msg("no text block"))?;
    if let Some(current) = doc.block_mut(id)?.content_mut().text_mut() {
        *current = text.to_owned();
    }
    Ok(())
}

/// Writes "stamped" into the first paragraph.
#[derive(Debug, Default)]
struct Stamp;

impl Component for Stamp {
    fn name(&self) -> &'static str {
        "stamp"
    }
}

#[async_trait]
impl Processor for Stamp {
    fn kind(&self) -> ProcessorKind {
        ProcessorKind::Structural
    }

    async fn process(&self, doc: &mut Document, _ctx: &StageContext) -> Result<(), StageError> {
        set_first_text(doc, "stamped")
    }
}

/// Needs `Stamp` to have run first.
#[derive(Debug, Default)]
struct RequireStamp;

impl Component for RequireStamp {
    fn name(&self) -> &'static str {
        "require_stamp"
    }
}

#[async_trait]
impl Processor for RequireStamp {
    fn kind(&self) -> ProcessorKind {
        ProcessorKind::Structural
    }

    async fn process(&self, doc: &mut Document, _ctx: &StageContext) -> Result<(), StageError> {
        match first_text(doc).as_deref() {
            Some("stamped") => set_first_text(doc, "stamped and checked"),
            other => Err(StageError::msg(format!("expected a stamp, found {other:?}"))),
        }
    }
}

/// Mutates the tree, then fails.
#[derive(Debug)]
struct Failing {
    kind: ProcessorKind,
}

impl Component for Failing {
    fn name(&self) -> &'static str {
        "failing"
    }

    fn options(&self) -> Vec<OptionSpec> {
        vec![OptionSpec::bool(
            "failing_strict",
            self.kind == ProcessorKind::Formatting,
            "Abort on failure",
        )]
    }
}

#[async_trait]
impl Processor for Failing {
    fn kind(&self) -> ProcessorKind {
        self.kind
    }

    fn strict_option(&self) -> Option<&'static str> {
        Some("failing_strict")
    }

    fn targets(&self) -> &'static [BlockKind] {
        &[BlockKind::Text]
    }

    async fn process(&self, doc: &mut Document, _ctx: &StageContext) -> Result<(), StageError> {
        set_first_text(doc, "half done")?;
        Err(StageError::msg("boom"))
    }
}

fn converter_with(processors: Vec<ProcessorFactory>) -> anyhow::Result<Converter> {
    let entry = InputEntry::new(|| Arc::new(TextProvider)).with_processors(processors);
    // `.log` inputs have no entry of their own and take the fallback
    let registry = RegistryBuilder::defaults().fallback(entry)?.build()?;
    Ok(Converter::new(Arc::new(registry), ConfigLayers::new())?)
}

async fn run(
    converter: &Converter,
    request: ConversionRequest,
) -> Result<ConversionResult, ConversionError> {
    converter.convert(&request, &CancellationToken::new()).await
}

#[tokio::test]
async fn processors_run_in_declared_order() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let path = common::write(dir.path(), "notes.log", "hello\n");

    let ordered: [ProcessorFactory; 2] = [|| Arc::new(Stamp), || Arc::new(RequireStamp)];
    let converter = converter_with(ordered.to_vec())?;
    let result = run(&converter, ConversionRequest::new(&path)).await?;
    assert_eq!(first_text(&result.document).as_deref(), Some("stamped and checked"));

    let reversed: [ProcessorFactory; 2] = [|| Arc::new(RequireStamp), || Arc::new(Stamp)];
    let converter = converter_with(reversed.to_vec())?;
    let err = run(&converter, ConversionRequest::new(&path))
        .await
        .expect_err("check runs before stamp");
    assert!(matches!(
        &err,
        ConversionError::ProcessorFailure { processor, .. } if processor == "require_stamp"
    ));
    assert_eq!(err.exit_code(), 1);
    Ok(())
}

#[tokio::test]
async fn permissive_enrichment_is_rolled_back_and_flagged() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let path = common::write(dir.path(), "notes.log", "hello\n");
    let chain: [ProcessorFactory; 1] = [|| {
        Arc::new(Failing {
            kind: ProcessorKind::Enrichment,
        })
    }];
    let converter = converter_with(chain.to_vec())?;

    let result = run(&converter, ConversionRequest::new(&path)).await?;
    assert_eq!(first_text(&result.document).as_deref(), Some("hello"));
    let text = result.document.blocks_of_kind(BlockKind::Text)[0];
    assert!(result.document.block(text)?.metadata.failed_enrichment);
    let skipped: Vec<_> = result.report.skipped().map(|s| s.component.as_str()).collect();
    assert_eq!(skipped, vec!["failing"]);
    assert!(matches!(
        &result.report.skipped().next().map(|s| &s.outcome),
        Some(StepOutcome::Skipped { reason }) if reason.contains("boom")
    ));

    let strict = ConversionRequest::new(&path).with_override("failing_strict", json!(true));
    let err = run(&converter, strict).await.expect_err("strict enrichment");
    assert!(matches!(err, ConversionError::ProcessorFailure { .. }));
    Ok(())
}

#[tokio::test]
async fn formatting_is_strict_unless_relaxed() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let path = common::write(dir.path(), "notes.log", "hello\n");
    let chain: [ProcessorFactory; 1] = [|| {
        Arc::new(Failing {
            kind: ProcessorKind::Formatting,
        })
    }];
    let converter = converter_with(chain.to_vec())?;

    let err = run(&converter, ConversionRequest::new(&path))
        .await
        .expect_err("formatting defaults to strict");
    assert!(matches!(err, ConversionError::ProcessorFailure { .. }));

    let relaxed = ConversionRequest::new(&path).with_override("failing_strict", json!(false));
    let result = run(&converter, relaxed).await?;
    assert_eq!(first_text(&result.document).as_deref(), Some("hello"));
    let text = result.document.blocks_of_kind(BlockKind::Text)[0];
    // only enrichment failures flag their targets
    assert!(!result.document.block(text)?.metadata.failed_enrichment);
    Ok(())
}

/// Fails transiently `failures` times, then answers.
struct FlakyLlm {
    failures: u32,
    calls: AtomicU32,
    answer: Value,
}

#[async_trait]
impl LlmService for FlakyLlm {
    fn endpoint(&self) -> &str {
        "flaky-llm"
    }

    async fn complete(&self, _request: &LlmRequest) -> Result<LlmResponse, CallError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if call < self.failures {
            return Err(CallError::Transient("503 service unavailable".into()));
        }
        Ok(LlmResponse {
            value: self.answer.clone(),
            tokens_used: 42,
        })
    }
}

fn llm_converter(llm: Arc<FlakyLlm>) -> Converter {
    let layers = ConfigLayers::new()
        .with_override("use_llm", json!(true))
        .with_override("max_retries", json!(2))
        .with_override("retry_backoff_ms", json!(1))
        .with_override("retry_jitter", json!(false))
        .with_override("circuit_failure_threshold", json!(100));
    common::converter(layers).with_services(ServiceSet {
        llm: Some(llm),
        ..Default::default()
    })
}

fn equation(doc: &Document) -> Option<Equation> {
    let id = *doc.blocks_of_kind(BlockKind::Equation).first()?;
    match doc.block(id).ok()?.content() {
        BlockContent::Equation(eq) => Some(eq.clone()),
        _ => None,
    }
}

#[tokio::test]
async fn llm_calls_retry_through_the_gate() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let path = common::write(dir.path(), "physics.md", "Energy:\n\n$$ E = mc2 $$\n");
    let llm = Arc::new(FlakyLlm {
        failures: 2,
        calls: AtomicU32::new(0),
        answer: json!({"latex": "E = mc^2"}),
    });
    let converter = llm_converter(llm.clone());

    let result = run(&converter, ConversionRequest::new(&path)).await?;
    assert_eq!(llm.calls.load(Ordering::SeqCst), 3);
    let eq = equation(&result.document).expect("equation block");
    assert_eq!(eq.latex.as_deref(), Some("E = mc^2"));
    let id = result.document.blocks_of_kind(BlockKind::Equation)[0];
    let meta = &result.document.block(id)?.metadata;
    assert_eq!((meta.llm_request_count, meta.llm_tokens_used), (1, 42));
    Ok(())
}

#[tokio::test]
async fn exhausted_service_degrades_or_fails_when_strict() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let path = common::write(dir.path(), "physics.md", "$$ E = mc2 $$\n");
    let llm = Arc::new(FlakyLlm {
        failures: u32::MAX,
        calls: AtomicU32::new(0),
        answer: Value::Null,
    });
    let converter = llm_converter(llm.clone());

    let result = run(&converter, ConversionRequest::new(&path)).await?;
    // first attempt plus two retries
    assert_eq!(llm.calls.load(Ordering::SeqCst), 3);
    let eq = equation(&result.document).expect("equation block");
    assert_eq!(eq.latex, None);
    let id = result.document.blocks_of_kind(BlockKind::Equation)[0];
    assert!(result.document.block(id)?.metadata.failed_enrichment);

    let strict = ConversionRequest::new(&path).with_override("llm_equation_strict", json!(true));
    let err = run(&converter, strict).await.expect_err("strict equation");
    match &err {
        ConversionError::ProcessorFailure { processor, cause } => {
            assert_eq!(processor, "llm_equation");
            assert!(matches!(cause, StageError::Service(ServiceError::Exhausted { .. })));
        }
        other => panic!("unexpected error {other}"),
    }
    assert_eq!(err.category(), ExitCategory::ExternalService);
    assert_eq!(err.exit_code(), 4);
    Ok(())
}

#[test]
fn fallback_does_not_shadow_registered_kinds() -> anyhow::Result<()> {
    let chain: [ProcessorFactory; 1] = [|| Arc::new(Stamp)];
    let entry = InputEntry::new(|| Arc::new(TextProvider)).with_processors(chain.to_vec());
    let registry = RegistryBuilder::defaults().fallback(entry)?.build()?;
    let text = registry.resolve(&InputKind::Text)?;
    assert_eq!(text.processors[0].name(), "text_normalize");
    let other = registry.resolve(&InputKind::Unknown("log".into()))?;
    assert_eq!(other.processors[0].name(), "stamp");
    Ok(())
}

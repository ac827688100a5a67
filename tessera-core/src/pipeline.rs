//! One document conversion, start to finish.
//!
//! [`Converter::convert`] detects the input kind, resolves the component set,
//! checks every component's configuration, then runs the provider, the
//! builder chain, the processor chain and the requested renderers in that
//! order. The document is owned by the calling task for the whole run.

use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
    sync::Arc,
    time::{Duration, Instant},
};

use serde::Serialize;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    builders::Builder,
    config::{snapshot, ComponentConfig, ConfigDistributor, ConfigLayers, Settings},
    detect::detect_input_kind,
    document::Document,
    entities::DocumentMetadata,
    error::{ConversionError, ServiceError, Stage, StageError},
    processors::{Processor, ProcessorKind},
    registry::Registry,
    render::{OutputFormat, RenderedOutput},
    service::{GatePolicy, ServiceGate, ServiceSet},
};

/// What a stage sees besides the document: its own options, the global
/// settings, the shared service gate and the run's cancellation token.
#[derive(Debug, Clone)]
pub struct StageContext {
    pub config: ComponentConfig,
    pub settings: Arc<Settings>,
    pub gate: Arc<ServiceGate>,
    pub services: ServiceSet,
    pub cancel: CancellationToken,
}

impl StageContext {
    fn with_config(&self, config: ComponentConfig) -> Self {
        Self {
            config,
            ..self.clone()
        }
    }

    pub fn check_cancelled(&self) -> Result<(), StageError> {
        if self.cancel.is_cancelled() {
            Err(StageError::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// A single conversion job.
#[derive(Debug, Clone)]
pub struct ConversionRequest {
    pub path: PathBuf,
    pub formats: Vec<OutputFormat>,
    /// Run-time option overrides, the highest-precedence config layer.
    pub overrides: BTreeMap<String, Value>,
    /// Output name. Defaults to the input file stem.
    pub doc_name: Option<String>,
}

impl ConversionRequest {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            formats: vec![OutputFormat::Markdown],
            overrides: BTreeMap::new(),
            doc_name: None,
        }
    }

    pub fn with_formats(mut self, formats: impl IntoIterator<Item = OutputFormat>) -> Self {
        self.formats = formats.into_iter().collect();
        self
    }

    pub fn with_override(mut self, key: impl Into<String>, value: Value) -> Self {
        self.overrides.insert(key.into(), value);
        self
    }

    pub fn with_doc_name(mut self, name: impl Into<String>) -> Self {
        self.doc_name = Some(name.into());
        self
    }

    pub(crate) fn resolved_doc_name(&self) -> String {
        self.doc_name.clone().unwrap_or_else(|| {
            self.path
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_else(|| "document".to_owned())
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum StepOutcome {
    Completed,
    /// A permissive processor failed and its changes were rolled back.
    Skipped { reason: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct StepReport {
    pub stage: Stage,
    pub component: String,
    #[serde(with = "serde_millis")]
    pub duration: Duration,
    #[serde(flatten)]
    pub outcome: StepOutcome,
}

/// Per-step record of a conversion run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RunReport {
    pub steps: Vec<StepReport>,
}

impl RunReport {
    fn record(&mut self, stage: Stage, component: &str, started: Instant, outcome: StepOutcome) {
        self.steps.push(StepReport {
            stage,
            component: component.to_owned(),
            duration: started.elapsed(),
            outcome,
        });
    }

    /// Components whose changes were rolled back.
    pub fn skipped(&self) -> impl Iterator<Item = &StepReport> {
        self.steps
            .iter()
            .filter(|s| matches!(s.outcome, StepOutcome::Skipped { .. }))
    }
}

#[derive(Debug)]
pub struct ConversionResult {
    pub document: Document,
    pub outputs: Vec<RenderedOutput>,
    pub report: RunReport,
}

fn is_cancellation(cause: &StageError) -> bool {
    matches!(
        cause,
        StageError::Cancelled | StageError::Service(ServiceError::Cancelled { .. })
    )
}

/// Runs conversions against one registry and one set of configuration
/// layers.
///
/// A `Converter` is immutable and cheap to share behind an `Arc`; the batch
/// pool and the HTTP service run many conversions on one instance. The
/// service gate, and so every circuit breaker, is shared by all of them.
#[derive(Debug, Clone)]
pub struct Converter {
    registry: Arc<Registry>,
    distributor: ConfigDistributor,
    settings: Arc<Settings>,
    gate: Arc<ServiceGate>,
    services: ServiceSet,
    services_injected: bool,
}

impl Converter {
    /// Creates a converter and the services its settings configure.
    ///
    /// # Errors
    /// `InvalidConfig` if a global setting in `layers` is invalid.
    pub fn new(registry: Arc<Registry>, layers: ConfigLayers) -> Result<Self, ConversionError> {
        let distributor = ConfigDistributor::new(layers);
        let settings = distributor.settings()?;
        let gate = Arc::new(ServiceGate::new(GatePolicy::from_settings(&settings)));
        let services = ServiceSet::from_settings(&settings);
        info!(
            device = ?settings.device,
            llm = services.llm.is_some(),
            layout = services.layout.is_some(),
            ocr = services.ocr.is_some(),
            "converter ready"
        );
        Ok(Self {
            registry,
            distributor,
            settings: Arc::new(settings),
            gate,
            services,
            services_injected: false,
        })
    }

    /// Replaces the services built from settings, e.g. with local test doubles.
    pub fn with_services(mut self, services: ServiceSet) -> Self {
        self.services = services;
        self.services_injected = true;
        self
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn gate(&self) -> &Arc<ServiceGate> {
        &self.gate
    }

    fn run_services(&self, settings: &Settings, overridden: bool) -> ServiceSet {
        let mut services = if overridden && !self.services_injected {
            ServiceSet::from_settings(settings)
        } else {
            self.services.clone()
        };
        if !settings.use_llm {
            services.llm = None;
        }
        services
    }

    /// Converts one document and renders it to every requested format.
    ///
    /// Nothing is written to disk; see [`crate::output::write_outputs`].
    ///
    /// # Errors
    /// Fails with the first fatal error. Permissive processors that fail are
    /// rolled back and listed in the run report instead.
    #[tracing::instrument(skip_all, fields(path = %request.path.display()))]
    pub async fn convert(
        &self,
        request: &ConversionRequest,
        cancel: &CancellationToken,
    ) -> Result<ConversionResult, ConversionError> {
        let started = Instant::now();
        let path = request.path.as_path();

        let input_kind =
            detect_input_kind(path).map_err(|source| ConversionError::UnreadableInput {
                path: path.to_owned(),
                source,
            })?;
        let set = self.registry.resolve(&input_kind)?;
        let renderers = request
            .formats
            .iter()
            .map(|format| self.registry.renderer(*format))
            .collect::<Result<Vec<_>, _>>()?;
        debug!(%input_kind, provider = set.provider.name(), "resolved component set");

        // every component is checked before anything runs
        let distributor = self.distributor.with_overrides(&request.overrides);
        let settings = if request.overrides.is_empty() {
            self.settings.clone()
        } else {
            Arc::new(distributor.settings()?)
        };
        let provider_config = distributor.distribute(set.provider.as_ref())?;
        let builder_configs = set
            .builders
            .iter()
            .map(|b| distributor.distribute(b.as_ref()))
            .collect::<Result<Vec<_>, _>>()?;
        let processor_configs = set
            .processors
            .iter()
            .map(|p| distributor.distribute(p.as_ref()))
            .collect::<Result<Vec<_>, _>>()?;
        let renderer_configs = renderers
            .iter()
            .map(|r| distributor.distribute(r.as_ref()))
            .collect::<Result<Vec<_>, _>>()?;
        let settings_config = distributor.settings_config()?;

        let mut metadata =
            DocumentMetadata::new(request.resolved_doc_name(), path.to_owned(), input_kind);
        metadata.options = snapshot(
            std::iter::once(&settings_config)
                .chain(std::iter::once(&provider_config))
                .chain(&builder_configs)
                .chain(&processor_configs)
                .chain(&renderer_configs),
        );

        let ctx = StageContext {
            config: provider_config,
            services: self.run_services(&settings, !request.overrides.is_empty()),
            settings,
            gate: self.gate.clone(),
            cancel: cancel.clone(),
        };
        let mut report = RunReport::default();

        let mut document = self
            .build(path, &set.provider, &set.builders, builder_configs, metadata, &ctx, &mut report)
            .await?;

        for (processor, config) in set.processors.iter().zip(processor_configs) {
            if cancel.is_cancelled() {
                return Err(ConversionError::Cancelled(processor.name().to_owned()));
            }
            let step_ctx = ctx.with_config(config);
            run_processor(processor.as_ref(), &mut document, &step_ctx, &mut report).await?;
        }

        document.metadata.conversion_duration = started.elapsed();

        let mut outputs = Vec::with_capacity(renderers.len());
        for (renderer, config) in renderers.iter().zip(&renderer_configs) {
            let step = Instant::now();
            outputs.push(renderer.render(&document, config)?);
            report.record(Stage::Render, renderer.name(), step, StepOutcome::Completed);
        }

        info!(
            doc = %document.metadata.doc_name,
            pages = document.pages().len(),
            blocks = document.block_count(),
            skipped = report.skipped().count(),
            "converted in {}ms",
            started.elapsed().as_millis()
        );
        Ok(ConversionResult {
            document,
            outputs,
            report,
        })
    }

    #[allow(clippy::too_many_arguments)]
    async fn build(
        &self,
        path: &Path,
        provider: &Arc<dyn crate::provider::Provider>,
        builders: &[Arc<dyn Builder>],
        builder_configs: Vec<ComponentConfig>,
        metadata: DocumentMetadata,
        ctx: &StageContext,
        report: &mut RunReport,
    ) -> Result<Document, ConversionError> {
        let cancelled = |component: &str| ConversionError::Cancelled(component.to_owned());

        if ctx.cancel.is_cancelled() {
            return Err(cancelled(provider.name()));
        }
        let step = Instant::now();
        let mut raw = provider.extract(path, ctx).await.map_err(|cause| {
            if is_cancellation(&cause) {
                cancelled(provider.name())
            } else {
                error!(provider = provider.name(), "extraction failed: {cause}");
                ConversionError::Provider {
                    provider: provider.name().to_owned(),
                    cause,
                }
            }
        })?;
        report.record(Stage::Provide, provider.name(), step, StepOutcome::Completed);
        debug!(
            pages = raw.pages.len(),
            "{} extracted in {}ms",
            provider.name(),
            step.elapsed().as_millis()
        );

        let mut document = Document::new(metadata);
        document.metadata.title = raw.title.clone();

        for (builder, config) in builders.iter().zip(builder_configs) {
            if ctx.cancel.is_cancelled() {
                return Err(cancelled(builder.name()));
            }
            let step = Instant::now();
            let step_ctx = ctx.with_config(config);
            let outcome = match builder.build(&mut raw, &mut document, &step_ctx).await {
                Ok(()) => document.validate().map_err(StageError::from),
                Err(e) => Err(e),
            };
            if let Err(cause) = outcome {
                if is_cancellation(&cause) {
                    return Err(cancelled(builder.name()));
                }
                error!(builder = builder.name(), "build failed: {cause}");
                return Err(ConversionError::BuildFailure {
                    builder: builder.name().to_owned(),
                    cause,
                });
            }
            report.record(Stage::Build, builder.name(), step, StepOutcome::Completed);
            debug!("{} built in {}ms", builder.name(), step.elapsed().as_millis());
        }
        Ok(document)
    }
}

/// Runs one processor under its failure policy.
///
/// A strict processor's failure aborts the conversion. A permissive one is
/// rolled back to the document as it was before the step; enrichment
/// processors then flag the blocks they target.
async fn run_processor(
    processor: &dyn Processor,
    document: &mut Document,
    ctx: &StageContext,
    report: &mut RunReport,
) -> Result<(), ConversionError> {
    let strict = match (processor.kind(), processor.strict_option()) {
        (ProcessorKind::Structural, _) => true,
        (kind, Some(option)) => ctx
            .config
            .bool(option)
            .unwrap_or(kind == ProcessorKind::Formatting),
        (kind, None) => kind == ProcessorKind::Formatting,
    };

    let step = Instant::now();
    let before = (!strict).then(|| document.clone());
    let outcome = match processor.process(document, ctx).await {
        Ok(()) => document.validate().map_err(StageError::from),
        Err(e) => Err(e),
    };

    match outcome {
        Ok(()) => {
            report.record(Stage::Process, processor.name(), step, StepOutcome::Completed);
            debug!("{} ran in {}ms", processor.name(), step.elapsed().as_millis());
            Ok(())
        }
        Err(cause) if is_cancellation(&cause) => {
            Err(ConversionError::Cancelled(processor.name().to_owned()))
        }
        Err(cause) => match before {
            Some(before) => {
                warn!(
                    processor = processor.name(),
                    "rolled back after failure: {cause}"
                );
                *document = before;
                if processor.kind() == ProcessorKind::Enrichment {
                    for kind in processor.targets() {
                        for id in document.blocks_of_kind(*kind) {
                            if let Ok(block) = document.block_mut(id) {
                                block.metadata.failed_enrichment = true;
                            }
                        }
                    }
                }
                report.record(
                    Stage::Process,
                    processor.name(),
                    step,
                    StepOutcome::Skipped {
                        reason: cause.to_string(),
                    },
                );
                Ok(())
            }
            None => {
                error!(processor = processor.name(), "processor failed: {cause}");
                Err(ConversionError::ProcessorFailure {
                    processor: processor.name().to_owned(),
                    cause,
                })
            }
        },
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::config::Component;

    /// Context with default settings, no services and `overrides` applied.
    pub(crate) fn context<C: Component + ?Sized>(
        component: &C,
        overrides: &[(&str, Value)],
    ) -> StageContext {
        let overrides: BTreeMap<String, Value> = overrides
            .iter()
            .map(|(k, v)| ((*k).to_owned(), v.clone()))
            .collect();
        let distributor = ConfigDistributor::default().with_overrides(&overrides);
        let settings = distributor.settings().expect("default settings");
        StageContext {
            config: distributor.distribute(component).expect("valid options"),
            gate: Arc::new(ServiceGate::new(GatePolicy::from_settings(&settings))),
            settings: Arc::new(settings),
            services: ServiceSet::default(),
            cancel: CancellationToken::new(),
        }
    }

    pub(crate) fn document() -> Document {
        Document::new(DocumentMetadata::new(
            "test".into(),
            "test.json".into(),
            crate::detect::InputKind::LayoutJson,
        ))
    }
}

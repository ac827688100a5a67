//! Input kind and output format to component wiring.
//!
//! Entries hold constructor function pointers; [`Registry::resolve`] builds
//! fresh component instances for every run.

use std::{
    collections::{BTreeMap, HashSet},
    fmt,
    sync::Arc,
};

use crate::{
    builders::{self, Builder},
    config::OptionSpec,
    detect::InputKind,
    error::ConversionError,
    processors::{self, Processor},
    provider::{ImageProvider, LayoutJsonProvider, MarkdownProvider, Provider, TextProvider},
    render::{self, OutputFormat, Renderer},
};

pub type ProviderFactory = fn() -> Arc<dyn Provider>;
pub type BuilderFactory = fn() -> Arc<dyn Builder>;
pub type ProcessorFactory = fn() -> Arc<dyn Processor>;
pub type RendererFactory = fn() -> Arc<dyn Renderer>;

/// Constructors for one input kind.
#[derive(Clone)]
pub struct InputEntry {
    pub provider: ProviderFactory,
    pub builders: Vec<BuilderFactory>,
    pub processors: Vec<ProcessorFactory>,
}

impl InputEntry {
    /// An entry with the default builder and processor chains.
    pub fn new(provider: ProviderFactory) -> Self {
        Self {
            provider,
            builders: builders::default_builders(),
            processors: processors::default_processors(),
        }
    }

    pub fn with_builders(mut self, builders: Vec<BuilderFactory>) -> Self {
        self.builders = builders;
        self
    }

    pub fn with_processors(mut self, processors: Vec<ProcessorFactory>) -> Self {
        self.processors = processors;
        self
    }

    fn instantiate(&self) -> ComponentSet {
        ComponentSet {
            provider: (self.provider)(),
            builders: self.builders.iter().map(|f| f()).collect(),
            processors: self.processors.iter().map(|f| f()).collect(),
        }
    }
}

/// Components resolved for one run, in execution order.
pub struct ComponentSet {
    pub provider: Arc<dyn Provider>,
    pub builders: Vec<Arc<dyn Builder>>,
    pub processors: Vec<Arc<dyn Processor>>,
}

impl ComponentSet {
    /// Name and declared options of every component, provider first.
    fn declarations(&self) -> Vec<(&'static str, Vec<OptionSpec>)> {
        std::iter::once((self.provider.name(), self.provider.options()))
            .chain(self.builders.iter().map(|b| (b.name(), b.options())))
            .chain(self.processors.iter().map(|p| (p.name(), p.options())))
            .collect()
    }
}

#[derive(Default, Clone)]
pub struct RegistryBuilder {
    inputs: BTreeMap<InputKind, InputEntry>,
    renderers: BTreeMap<OutputFormat, RendererFactory>,
    fallback: Option<InputEntry>,
}

impl RegistryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// The built-in inputs and all four renderers, no fallback.
    pub fn defaults() -> Self {
        let mut builder = Self::new();
        let inputs: [(InputKind, ProviderFactory); 4] = [
            (InputKind::Text, || Arc::new(TextProvider)),
            (InputKind::Markdown, || Arc::new(MarkdownProvider)),
            (InputKind::LayoutJson, || Arc::new(LayoutJsonProvider)),
            (InputKind::Image, || Arc::new(ImageProvider)),
        ];
        for (kind, provider) in inputs {
            builder.inputs.insert(kind, InputEntry::new(provider));
        }
        for format in OutputFormat::ALL {
            builder.renderers.insert(format, render::default_renderer(format));
        }
        builder
    }

    pub fn register_input(
        mut self,
        kind: InputKind,
        entry: InputEntry,
    ) -> Result<Self, ConversionError> {
        if self.inputs.contains_key(&kind) {
            return Err(ConversionError::RegistrationConflict(format!(
                "input kind '{kind}'"
            )));
        }
        self.inputs.insert(kind, entry);
        Ok(self)
    }

    pub fn register_renderer(
        mut self,
        format: OutputFormat,
        renderer: RendererFactory,
    ) -> Result<Self, ConversionError> {
        if self.renderers.contains_key(&format) {
            return Err(ConversionError::RegistrationConflict(format!(
                "output format '{format}'"
            )));
        }
        self.renderers.insert(format, renderer);
        Ok(self)
    }

    /// Entry used for input kinds with no specific registration.
    pub fn fallback(mut self, entry: InputEntry) -> Result<Self, ConversionError> {
        if self.fallback.is_some() {
            return Err(ConversionError::RegistrationConflict(
                "fallback entry".to_owned(),
            ));
        }
        self.fallback = Some(entry);
        Ok(self)
    }

    /// Instantiates every entry once and checks it: component names are
    /// unique within a set and every declared default passes its own check.
    pub fn build(self) -> Result<Registry, ConversionError> {
        for entry in self.inputs.values().chain(self.fallback.as_ref()) {
            let set = entry.instantiate();
            let mut names = HashSet::new();
            for (name, options) in set.declarations() {
                if !names.insert(name) {
                    return Err(ConversionError::RegistrationConflict(format!(
                        "component '{name}' twice in the '{}' chain",
                        set.provider.name()
                    )));
                }
                check_defaults(name, &options)?;
            }
        }
        for factory in self.renderers.values() {
            let renderer = factory();
            check_defaults(renderer.name(), &renderer.options())?;
        }
        Ok(Registry {
            inputs: self.inputs,
            renderers: self.renderers,
            fallback: self.fallback,
        })
    }
}

fn check_defaults(component: &str, options: &[OptionSpec]) -> Result<(), ConversionError> {
    for spec in options {
        spec.check(component, &spec.default)?;
    }
    Ok(())
}

/// Immutable after [`RegistryBuilder::build`].
pub struct Registry {
    inputs: BTreeMap<InputKind, InputEntry>,
    renderers: BTreeMap<OutputFormat, RendererFactory>,
    fallback: Option<InputEntry>,
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry")
            .field("inputs", &self.inputs.keys().collect::<Vec<_>>())
            .field("renderers", &self.renderers.keys().collect::<Vec<_>>())
            .field("fallback", &self.fallback.is_some())
            .finish()
    }
}

impl Registry {
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::new()
    }

    pub fn with_defaults() -> Result<Self, ConversionError> {
        RegistryBuilder::defaults().build()
    }

    pub fn resolve(&self, kind: &InputKind) -> Result<ComponentSet, ConversionError> {
        self.inputs
            .get(kind)
            .or(self.fallback.as_ref())
            .map(InputEntry::instantiate)
            .ok_or_else(|| ConversionError::UnsupportedInputKind(kind.clone()))
    }

    pub fn renderer(&self, format: OutputFormat) -> Result<Arc<dyn Renderer>, ConversionError> {
        self.renderers
            .get(&format)
            .map(|factory| factory())
            .ok_or_else(|| ConversionError::Render {
                format,
                reason: "no renderer registered".to_owned(),
            })
    }

    pub fn input_kinds(&self) -> impl Iterator<Item = &InputKind> {
        self.inputs.keys()
    }

    pub fn formats(&self) -> impl Iterator<Item = OutputFormat> + '_ {
        self.renderers.keys().copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_cover_text_inputs_and_every_format() -> anyhow::Result<()> {
        let registry = Registry::with_defaults()?;
        let set = registry.resolve(&InputKind::Markdown)?;
        assert_eq!(set.provider.name(), "markdown");
        let builders: Vec<_> = set.builders.iter().map(|b| b.name()).collect();
        assert_eq!(builders, vec!["page", "ocr", "layout", "structure"]);
        assert_eq!(set.processors[0].name(), "text_normalize");
        for format in OutputFormat::ALL {
            assert_eq!(registry.renderer(format)?.format(), format);
        }
        Ok(())
    }

    #[test]
    fn no_entry_no_fallback_is_unsupported() -> anyhow::Result<()> {
        let registry = Registry::with_defaults()?;
        assert!(matches!(
            registry.resolve(&InputKind::Pdf),
            Err(ConversionError::UnsupportedInputKind(InputKind::Pdf))
        ));
        Ok(())
    }

    #[test]
    fn fallback_catches_unknown_kinds() -> anyhow::Result<()> {
        let registry = RegistryBuilder::defaults()
            .fallback(InputEntry::new(|| Arc::new(TextProvider)))?
            .build()?;
        let set = registry.resolve(&InputKind::Unknown("rtf".into()))?;
        assert_eq!(set.provider.name(), "text");
        Ok(())
    }

    #[test]
    fn duplicate_registration_conflicts() {
        let dup = RegistryBuilder::defaults()
            .register_input(InputKind::Text, InputEntry::new(|| Arc::new(TextProvider)));
        assert!(matches!(dup, Err(ConversionError::RegistrationConflict(_))));

        let dup = RegistryBuilder::defaults().register_renderer(
            OutputFormat::Json,
            render::default_renderer(OutputFormat::Json),
        );
        assert!(matches!(dup, Err(ConversionError::RegistrationConflict(_))));
    }

    #[test]
    fn duplicate_component_in_chain_conflicts() -> anyhow::Result<()> {
        let entry = InputEntry::new(|| Arc::new(TextProvider))
            .with_builders(vec![builders::default_builders()[0], builders::default_builders()[0]]);
        let out = RegistryBuilder::new()
            .register_input(InputKind::Text, entry)?
            .build();
        assert!(matches!(out, Err(ConversionError::RegistrationConflict(_))));
        Ok(())
    }
}

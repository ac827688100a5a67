use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
    sync::Arc,
};

use serde_json::Value;
use tracing::debug;

use super::{settings::SettingsOptions, Component, ComponentConfig, Settings};
use crate::error::ConfigError;

const ENV_OPTION_PREFIX: &str = "TESSERA_OPT_";
const ENV_ALIASES: &[(&str, &str)] = &[
    ("TESSERA_DEVICE", "device"),
    ("TESSERA_OUTPUT_DIR", "output_dir"),
    ("TESSERA_LLM_API_KEY", "llm_api_key"),
    ("TESSERA_LLM_BASE_URL", "llm_base_url"),
];
const REDACTED: &str = "<redacted>";

/// Configuration sources in increasing precedence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Layer {
    Default,
    Environment,
    File,
    Override,
}

/// Raw values per layer, keyed by flat option name.
///
/// Keys nobody declares are kept as-is and ignored by the distributor.
#[derive(Debug, Clone, Default)]
pub struct ConfigLayers {
    env: BTreeMap<String, Value>,
    file: BTreeMap<String, Value>,
    overrides: BTreeMap<String, Value>,
}

impl ConfigLayers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Layers seeded from the process environment.
    pub fn from_env() -> Self {
        Self::new().with_env_vars(std::env::vars())
    }

    pub fn with_env_vars(mut self, vars: impl IntoIterator<Item = (String, String)>) -> Self {
        for (key, value) in vars {
            let option = ENV_ALIASES
                .iter()
                .find(|(var, _)| *var == key)
                .map(|(_, opt)| opt.to_string())
                .or_else(|| {
                    key.strip_prefix(ENV_OPTION_PREFIX)
                        .filter(|rest| !rest.is_empty())
                        .map(str::to_lowercase)
                });
            if let Some(option) = option {
                self.env.insert(option, Value::String(value));
            }
        }
        self
    }

    /// Adds the file layer. `.json` files are read as JSON, anything else
    /// as TOML. Both must hold a flat table at the top level.
    pub fn with_file(mut self, path: &Path) -> Result<Self, ConfigError> {
        let origin = path.display().to_string();
        let contents = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::new("config_file", &origin, e.to_string()))?;
        let is_json = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| e.eq_ignore_ascii_case("json"));
        let table = if is_json {
            parse_json_table(&contents)
        } else {
            parse_toml_table(&contents)
        }
        .map_err(|reason| ConfigError::new("config_file", &origin, reason))?;
        debug!(path = %origin, keys = table.len(), "loaded config file");
        self.file.extend(table);
        Ok(self)
    }

    pub fn with_override(mut self, key: impl Into<String>, value: Value) -> Self {
        self.overrides.insert(key.into(), value);
        self
    }

    pub fn set(&mut self, layer: Layer, key: impl Into<String>, value: Value) {
        let key = key.into();
        match layer {
            Layer::Default => {}
            Layer::Environment => {
                self.env.insert(key, value);
            }
            Layer::File => {
                self.file.insert(key, value);
            }
            Layer::Override => {
                self.overrides.insert(key, value);
            }
        }
    }

    /// Parses a `key=value` override. Values that read as JSON keep their
    /// JSON type, everything else is a string.
    pub fn parse_override(raw: &str) -> Result<(String, Value), ConfigError> {
        let (key, value) = raw
            .split_once('=')
            .ok_or_else(|| ConfigError::new("override", raw, "expected key=value"))?;
        let key = key.trim();
        if key.is_empty() {
            return Err(ConfigError::new("override", raw, "empty key"));
        }
        let value = value.trim();
        let value = serde_json::from_str::<Value>(value)
            .ok()
            .filter(|v| !v.is_object() && !v.is_array())
            .unwrap_or_else(|| Value::String(value.to_owned()));
        Ok((key.to_owned(), value))
    }

    /// Highest-precedence value set for `key`, if any layer has one.
    pub fn lookup(&self, key: &str) -> Option<(Layer, &Value)> {
        self.overrides
            .get(key)
            .map(|v| (Layer::Override, v))
            .or_else(|| self.file.get(key).map(|v| (Layer::File, v)))
            .or_else(|| self.env.get(key).map(|v| (Layer::Environment, v)))
    }
}

fn parse_json_table(contents: &str) -> Result<BTreeMap<String, Value>, String> {
    match serde_json::from_str::<Value>(contents).map_err(|e| e.to_string())? {
        Value::Object(map) => Ok(map.into_iter().collect()),
        _ => Err("top level must be an object".to_owned()),
    }
}

fn parse_toml_table(contents: &str) -> Result<BTreeMap<String, Value>, String> {
    let table: toml::Table = toml::from_str(contents).map_err(|e| e.to_string())?;
    table
        .into_iter()
        .map(|(k, v)| {
            serde_json::to_value(v)
                .map(|v| (k, v))
                .map_err(|e| e.to_string())
        })
        .collect()
}

/// Location of the per-user config file, when one exists.
pub fn default_config_path() -> Option<PathBuf> {
    let path = dirs::config_dir()?.join("tessera").join("config.toml");
    path.is_file().then_some(path)
}

/// Resolves declared options against the layers.
///
/// Immutable once built; per-run overrides produce a new distributor.
#[derive(Debug, Clone, Default)]
pub struct ConfigDistributor {
    layers: Arc<ConfigLayers>,
}

impl ConfigDistributor {
    pub fn new(layers: ConfigLayers) -> Self {
        Self {
            layers: Arc::new(layers),
        }
    }

    pub fn layers(&self) -> &ConfigLayers {
        &self.layers
    }

    /// A distributor with `overrides` on top of the current layers.
    pub fn with_overrides(&self, overrides: &BTreeMap<String, Value>) -> Self {
        if overrides.is_empty() {
            return self.clone();
        }
        let mut layers = (*self.layers).clone();
        for (key, value) in overrides {
            layers.set(Layer::Override, key.clone(), value.clone());
        }
        Self::new(layers)
    }

    /// Values for exactly the options `component` declares, checked.
    pub fn distribute<C: Component + ?Sized>(
        &self,
        component: &C,
    ) -> Result<ComponentConfig, ConfigError> {
        let mut values = BTreeMap::new();
        for spec in component.options() {
            let raw = self
                .layers
                .lookup(spec.name)
                .map(|(_, v)| v)
                .unwrap_or(&spec.default);
            values.insert(spec.name, spec.check(component.name(), raw)?);
        }
        Ok(ComponentConfig::new(component.name(), values))
    }

    pub fn settings(&self) -> Result<Settings, ConfigError> {
        Settings::from_config(&self.settings_config()?)
    }

    /// The checked global options, for the run's options snapshot.
    pub fn settings_config(&self) -> Result<ComponentConfig, ConfigError> {
        self.distribute(&SettingsOptions)
    }
}

/// Flattens distributed configs into one snapshot, secrets redacted.
pub fn snapshot<'a>(configs: impl IntoIterator<Item = &'a ComponentConfig>) -> BTreeMap<String, Value> {
    let mut out = BTreeMap::new();
    for config in configs {
        for (key, value) in config.values() {
            let value = if key.contains("api_key") && !value.is_null() {
                Value::String(REDACTED.to_owned())
            } else {
                value.clone()
            };
            out.insert((*key).to_owned(), value);
        }
    }
    out
}

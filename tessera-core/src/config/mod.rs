//! Declared options, layered configuration and the per-component view of it.
//!
//! Every component lists the options it understands through
//! [`Component::options`]. The [`ConfigDistributor`] resolves each declared
//! option against the configuration layers, coerces and checks it, and hands
//! the component a [`ComponentConfig`] holding only those values.

mod layers;
mod settings;

use std::{collections::BTreeMap, time::Duration};

use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;

use crate::error::ConfigError;

pub use layers::{default_config_path, snapshot, ConfigDistributor, ConfigLayers, Layer};
pub use settings::{Device, LlmBackend, Settings};

/// Shared identity of providers, builders, processors and renderers.
pub trait Component: Send + Sync {
    fn name(&self) -> &'static str;

    fn options(&self) -> Vec<OptionSpec> {
        Vec::new()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OptionType {
    Bool,
    Integer { min: i64, max: i64 },
    Float { min: f64, max: f64 },
    String,
    OptionalString,
    Choice { choices: &'static [&'static str] },
    /// Milliseconds.
    Duration,
}

#[derive(Debug, Clone, Serialize)]
pub struct OptionSpec {
    pub name: &'static str,
    pub kind: OptionType,
    pub default: Value,
    pub description: &'static str,
}

impl OptionSpec {
    pub fn bool(name: &'static str, default: bool, description: &'static str) -> Self {
        Self {
            name,
            kind: OptionType::Bool,
            default: Value::Bool(default),
            description,
        }
    }

    pub fn integer(
        name: &'static str,
        default: i64,
        min: i64,
        max: i64,
        description: &'static str,
    ) -> Self {
        Self {
            name,
            kind: OptionType::Integer { min, max },
            default: Value::from(default),
            description,
        }
    }

    pub fn float(
        name: &'static str,
        default: f64,
        min: f64,
        max: f64,
        description: &'static str,
    ) -> Self {
        Self {
            name,
            kind: OptionType::Float { min, max },
            default: Value::from(default),
            description,
        }
    }

    pub fn string(name: &'static str, default: &str, description: &'static str) -> Self {
        Self {
            name,
            kind: OptionType::String,
            default: Value::String(default.to_owned()),
            description,
        }
    }

    pub fn optional_string(name: &'static str, description: &'static str) -> Self {
        Self {
            name,
            kind: OptionType::OptionalString,
            default: Value::Null,
            description,
        }
    }

    pub fn choice(
        name: &'static str,
        default: &'static str,
        choices: &'static [&'static str],
        description: &'static str,
    ) -> Self {
        Self {
            name,
            kind: OptionType::Choice { choices },
            default: Value::String(default.to_owned()),
            description,
        }
    }

    pub fn duration_ms(name: &'static str, default_ms: u64, description: &'static str) -> Self {
        Self {
            name,
            kind: OptionType::Duration,
            default: Value::from(default_ms),
            description,
        }
    }

    /// Coerces `raw` to this option's type and checks its range.
    ///
    /// Strings are accepted for every type since the environment and
    /// command-line layers only carry strings.
    pub fn check(&self, component: &str, raw: &Value) -> Result<Value, ConfigError> {
        let fail = |reason: String| ConfigError::new(component, self.name, reason);
        match &self.kind {
            OptionType::Bool => match raw {
                Value::Bool(b) => Ok(Value::Bool(*b)),
                Value::String(s) => match s.trim().to_lowercase().as_str() {
                    "true" | "1" | "yes" | "on" => Ok(Value::Bool(true)),
                    "false" | "0" | "no" | "off" => Ok(Value::Bool(false)),
                    _ => Err(fail(format!("'{s}' is not a boolean"))),
                },
                other => Err(fail(format!("expected a boolean, got {other}"))),
            },
            OptionType::Integer { min, max } => {
                let v = match raw {
                    Value::Number(n) => n
                        .as_i64()
                        .ok_or_else(|| fail(format!("{n} is not an integer")))?,
                    Value::String(s) => s
                        .trim()
                        .parse::<i64>()
                        .map_err(|_| fail(format!("'{s}' is not an integer")))?,
                    other => return Err(fail(format!("expected an integer, got {other}"))),
                };
                if v < *min || v > *max {
                    return Err(fail(format!("{v} is outside {min}..={max}")));
                }
                Ok(Value::from(v))
            }
            OptionType::Float { min, max } => {
                let v = match raw {
                    Value::Number(n) => n
                        .as_f64()
                        .ok_or_else(|| fail(format!("{n} is not a number")))?,
                    Value::String(s) => s
                        .trim()
                        .parse::<f64>()
                        .map_err(|_| fail(format!("'{s}' is not a number")))?,
                    other => return Err(fail(format!("expected a number, got {other}"))),
                };
                if !v.is_finite() || v < *min || v > *max {
                    return Err(fail(format!("{v} is outside {min}..={max}")));
                }
                Ok(Value::from(v))
            }
            OptionType::String => match raw {
                Value::String(s) => Ok(Value::String(s.clone())),
                Value::Number(n) => Ok(Value::String(n.to_string())),
                other => Err(fail(format!("expected a string, got {other}"))),
            },
            OptionType::OptionalString => match raw {
                Value::Null => Ok(Value::Null),
                Value::String(s) if s.is_empty() => Ok(Value::Null),
                Value::String(s) => Ok(Value::String(s.clone())),
                other => Err(fail(format!("expected a string, got {other}"))),
            },
            OptionType::Choice { choices } => match raw {
                Value::String(s) => {
                    let s = s.trim().to_lowercase();
                    if choices.contains(&s.as_str()) {
                        Ok(Value::String(s))
                    } else {
                        Err(fail(format!("'{s}' is not one of {}", choices.join(", "))))
                    }
                }
                other => Err(fail(format!("expected one of {}, got {other}", choices.join(", ")))),
            },
            OptionType::Duration => {
                let ms = match raw {
                    Value::Number(n) => n
                        .as_u64()
                        .ok_or_else(|| fail(format!("{n} is not a positive duration in ms")))?,
                    Value::String(s) => s
                        .trim()
                        .trim_end_matches("ms")
                        .parse::<u64>()
                        .map_err(|_| fail(format!("'{s}' is not a duration in ms")))?,
                    other => return Err(fail(format!("expected a duration in ms, got {other}"))),
                };
                Ok(Value::from(ms))
            }
        }
    }
}

/// Validated option values handed to one component.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ComponentConfig {
    component: String,
    values: BTreeMap<&'static str, Value>,
}

impl ComponentConfig {
    pub(crate) fn new(component: &str, values: BTreeMap<&'static str, Value>) -> Self {
        Self {
            component: component.to_owned(),
            values,
        }
    }

    pub fn component(&self) -> &str {
        &self.component
    }

    pub fn values(&self) -> &BTreeMap<&'static str, Value> {
        &self.values
    }

    pub fn get<T: DeserializeOwned>(&self, option: &str) -> Result<T, ConfigError> {
        let value = self.values.get(option).ok_or_else(|| {
            ConfigError::new(&self.component, option, "option is not declared by this component")
        })?;
        serde_json::from_value(value.clone())
            .map_err(|e| ConfigError::new(&self.component, option, e.to_string()))
    }

    pub fn bool(&self, option: &str) -> Result<bool, ConfigError> {
        self.get(option)
    }

    pub fn usize(&self, option: &str) -> Result<usize, ConfigError> {
        self.get(option)
    }

    pub fn f32(&self, option: &str) -> Result<f32, ConfigError> {
        self.get::<f64>(option).map(|v| v as f32)
    }

    pub fn string(&self, option: &str) -> Result<String, ConfigError> {
        self.get(option)
    }

    pub fn optional_string(&self, option: &str) -> Result<Option<String>, ConfigError> {
        self.get(option)
    }

    pub fn duration(&self, option: &str) -> Result<Duration, ConfigError> {
        self.get::<u64>(option).map(Duration::from_millis)
    }
}

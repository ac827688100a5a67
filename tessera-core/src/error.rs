//! Error taxonomy for the conversion pipeline.
//!
//! [`ConversionError`] is what a single document conversion fails with. Every
//! variant knows the [`Stage`] it came from and the [`ExitCategory`] the CLI
//! and the HTTP service report it under. Builders and processors fail with a
//! [`StageError`], which the pipeline wraps with the failing component's name.

use std::path::PathBuf;

use serde::Serialize;
use thiserror::Error;

use crate::{
    blocks::BlockKind,
    detect::InputKind,
    entities::{BlockID, PageID},
    render::OutputFormat,
};

/// Pipeline stage a failure is attributed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Setup,
    Config,
    Provide,
    Build,
    Process,
    Render,
    Output,
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Stage::Setup => "setup",
            Stage::Config => "config",
            Stage::Provide => "provide",
            Stage::Build => "build",
            Stage::Process => "process",
            Stage::Render => "render",
            Stage::Output => "output",
        };
        f.write_str(s)
    }
}

/// Coarse failure category, one per process exit code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitCategory {
    Internal,
    BadInput,
    Config,
    ExternalService,
}

impl ExitCategory {
    pub fn exit_code(self) -> i32 {
        match self {
            ExitCategory::Internal => 1,
            ExitCategory::BadInput => 2,
            ExitCategory::Config => 3,
            ExitCategory::ExternalService => 4,
        }
    }
}

/// Unrecovered failure of a call through the [`crate::service::ServiceGate`].
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ServiceError {
    #[error("call to '{endpoint}' timed out after {attempts} attempt(s) of {timeout_ms}ms")]
    Timeout {
        endpoint: String,
        attempts: u32,
        timeout_ms: u64,
    },

    #[error("'{endpoint}' rejected the request: {reason}")]
    Rejected { endpoint: String, reason: String },

    #[error("'{endpoint}' still failing after {attempts} attempt(s): {last_error}")]
    Exhausted {
        endpoint: String,
        attempts: u32,
        last_error: String,
    },

    #[error("circuit open for '{endpoint}', next attempt allowed in {retry_in_ms}ms")]
    CircuitOpen { endpoint: String, retry_in_ms: u64 },

    #[error("call to '{endpoint}' was cancelled")]
    Cancelled { endpoint: String },
}

/// A structural mutation that would break a document tree invariant.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ModelError {
    #[error("unknown block {0}")]
    UnknownBlock(BlockID),

    #[error("unknown page {0}")]
    UnknownPage(PageID),

    #[error("a {parent} block can't contain a {child} block")]
    IllegalChild { parent: BlockKind, child: BlockKind },

    #[error("a {0} block can't be placed at page level")]
    IllegalTopLevel(BlockKind),

    #[error("block {block} would become its own ancestor")]
    Cycle { block: BlockID },

    #[error("new ordering for {owner} is not a permutation of its current children")]
    NotAPermutation { owner: String },

    #[error("can't change block {block} from {from} to {to}")]
    KindChange {
        block: BlockID,
        from: BlockKind,
        to: BlockKind,
    },

    #[error("inconsistent tree: {0}")]
    Inconsistent(String),
}

/// A configuration value that failed its declared type or range check.
#[derive(Debug, Clone, Error, PartialEq)]
#[error("invalid value for option '{option}' of '{component}': {reason}")]
pub struct ConfigError {
    pub component: String,
    pub option: String,
    pub reason: String,
}

impl ConfigError {
    pub fn new(
        component: impl Into<String>,
        option: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            component: component.into(),
            option: option.into(),
            reason: reason.into(),
        }
    }
}

/// Failure raised by a provider, builder or processor.
#[derive(Debug, Error)]
pub enum StageError {
    #[error(transparent)]
    Service(#[from] ServiceError),

    #[error(transparent)]
    Model(#[from] ModelError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error("cancelled")]
    Cancelled,

    #[error("{0}")]
    Message(String),
}

impl StageError {
    pub fn msg(message: impl Into<String>) -> Self {
        StageError::Message(message.into())
    }

    fn category(&self) -> ExitCategory {
        match self {
            StageError::Service(ServiceError::Cancelled { .. }) | StageError::Cancelled => {
                ExitCategory::Internal
            }
            StageError::Service(_) => ExitCategory::ExternalService,
            StageError::Config(_) => ExitCategory::Config,
            _ => ExitCategory::Internal,
        }
    }
}

/// Why a single document conversion failed.
#[derive(Debug, Error)]
pub enum ConversionError {
    #[error("can't read input '{path}': {source}")]
    UnreadableInput {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("unsupported input kind: {0}")]
    UnsupportedInputKind(InputKind),

    #[error("registration conflict: {0} is already registered")]
    RegistrationConflict(String),

    #[error(transparent)]
    InvalidConfig(#[from] ConfigError),

    #[error("provider '{provider}' failed: {cause}")]
    Provider {
        provider: String,
        #[source]
        cause: StageError,
    },

    #[error("builder '{builder}' failed: {cause}")]
    BuildFailure {
        builder: String,
        #[source]
        cause: StageError,
    },

    #[error("processor '{processor}' failed: {cause}")]
    ProcessorFailure {
        processor: String,
        #[source]
        cause: StageError,
    },

    #[error("{format} renderer can't serialize {kind} blocks")]
    UnsupportedRenderTarget {
        format: OutputFormat,
        kind: BlockKind,
    },

    #[error("{format} rendering failed: {reason}")]
    Render {
        format: OutputFormat,
        reason: String,
    },

    #[error("can't write '{path}': {source}")]
    Output {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("conversion cancelled: {0}")]
    Cancelled(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl ConversionError {
    /// Stage the failure is attributed to.
    pub fn stage(&self) -> Stage {
        match self {
            ConversionError::UnreadableInput { .. } | ConversionError::Provider { .. } => {
                Stage::Provide
            }
            ConversionError::UnsupportedInputKind(_)
            | ConversionError::RegistrationConflict(_)
            | ConversionError::Internal(_) => Stage::Setup,
            ConversionError::InvalidConfig(_) => Stage::Config,
            ConversionError::BuildFailure { .. } => Stage::Build,
            ConversionError::ProcessorFailure { .. } | ConversionError::Cancelled(_) => {
                Stage::Process
            }
            ConversionError::UnsupportedRenderTarget { .. } | ConversionError::Render { .. } => {
                Stage::Render
            }
            ConversionError::Output { .. } => Stage::Output,
        }
    }

    /// Name of the component that failed, when one is known.
    pub fn component(&self) -> Option<&str> {
        match self {
            ConversionError::Provider { provider, .. } => Some(provider),
            ConversionError::BuildFailure { builder, .. } => Some(builder),
            ConversionError::ProcessorFailure { processor, .. } => Some(processor),
            ConversionError::InvalidConfig(e) => Some(&e.component),
            _ => None,
        }
    }

    pub fn category(&self) -> ExitCategory {
        match self {
            ConversionError::UnreadableInput { .. }
            | ConversionError::UnsupportedInputKind(_)
            | ConversionError::Provider { .. } => ExitCategory::BadInput,
            ConversionError::RegistrationConflict(_) | ConversionError::InvalidConfig(_) => {
                ExitCategory::Config
            }
            ConversionError::BuildFailure { cause, .. }
            | ConversionError::ProcessorFailure { cause, .. } => cause.category(),
            ConversionError::UnsupportedRenderTarget { .. }
            | ConversionError::Render { .. }
            | ConversionError::Output { .. }
            | ConversionError::Cancelled(_)
            | ConversionError::Internal(_) => ExitCategory::Internal,
        }
    }

    pub fn exit_code(&self) -> i32 {
        self.category().exit_code()
    }
}

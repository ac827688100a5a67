//! Staged, pluggable document conversion.
//!
//! A [`Converter`] runs one document through a provider, a builder chain, a
//! processor chain and one renderer per requested format, all resolved from
//! a [`Registry`] and configured through layered [`ConfigLayers`].
//! [`batch::convert_batch`] runs many documents on a bounded worker pool.

pub mod batch;
pub mod blocks;
pub mod builders;
pub mod config;
pub mod detect;
pub mod document;
pub mod entities;
pub mod error;
pub mod output;
pub mod pipeline;
pub mod processors;
pub mod provider;
pub mod registry;
pub mod render;
pub mod service;

pub use config::{ConfigLayers, Settings};
pub use document::Document;
pub use error::{ConversionError, ExitCategory, Stage};
pub use pipeline::{ConversionRequest, ConversionResult, Converter};
pub use registry::Registry;
pub use render::OutputFormat;

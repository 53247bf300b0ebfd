//! Error handling for the explorer engine
//!
//! This module defines the crate-level error type and a Result alias used
//! throughout the engine. Stage-level failures live in
//! [`crate::pipeline::PipelineError`] and convert into [`EngineError`].

use crate::pipeline::PipelineError;
use thiserror::Error;

/// Main error type for explorer engine operations
#[derive(Error, Debug)]
pub enum EngineError {
    /// Invalid or incomplete engine configuration (fatal, raised by `initialize()`)
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Failures while fetching the instructions set
    #[error("Instructions error: {0}")]
    Instructions(String),

    /// Durable storage read/write failures
    #[error("Storage error: {0}")]
    Storage(String),

    /// Query params or grouping specs that do not satisfy their schema
    #[error("Validation error: {0}")]
    Validation(String),

    /// Unknown custom state, visualization or grouping slot
    #[error("Unknown {kind}: {name}")]
    Unknown { kind: &'static str, name: String },

    /// Lifecycle misuse (e.g. initializing twice)
    #[error("Lifecycle error: {0}")]
    Lifecycle(String),

    /// Errors raised inside a pipeline stage
    #[error(transparent)]
    Pipeline(#[from] PipelineError),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Generic errors with context
    #[error("{context}: {source}")]
    WithContext {
        context: String,
        #[source]
        source: Box<EngineError>,
    },
}

impl EngineError {
    /// Add context to an error
    pub fn with_context(self, context: impl Into<String>) -> Self {
        EngineError::WithContext {
            context: context.into(),
            source: Box::new(self),
        }
    }

    /// Whether this error (or the error it wraps) is a configuration error
    pub fn is_configuration(&self) -> bool {
        match self {
            EngineError::Configuration(_) => true,
            EngineError::WithContext { source, .. } => source.is_configuration(),
            _ => false,
        }
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(err: serde_json::Error) -> Self {
        EngineError::Serialization(err.to_string())
    }
}

/// Result type alias for explorer engine operations
pub type Result<T> = std::result::Result<T, EngineError>;

/// Extension trait for adding context to Results
pub trait ResultExt<T> {
    /// Add context to an error result
    fn context(self, context: impl Into<String>) -> Result<T>;

    /// Add context lazily to an error result
    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String;
}

impl<T> ResultExt<T> for Result<T> {
    fn context(self, context: impl Into<String>) -> Result<T> {
        self.map_err(|e| e.with_context(context))
    }

    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String,
    {
        self.map_err(|e| e.with_context(f()))
    }
}

impl<T> ResultExt<T> for std::result::Result<T, PipelineError> {
    fn context(self, context: impl Into<String>) -> Result<T> {
        self.map_err(|e| EngineError::from(e).with_context(context))
    }

    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String,
    {
        self.map_err(|e| EngineError::from(e).with_context(f()))
    }
}

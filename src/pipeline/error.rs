//! Pipeline-specific error types.

use crate::pipeline::stage::StageKind;
use thiserror::Error;

/// Errors that can occur within the staged pipeline.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PipelineError {
    #[error("{stage} stage failed: {message}")]
    Stage { stage: StageKind, message: String },

    #[error("Invalid query at offset {offset}: {message}")]
    InvalidQuery { offset: usize, message: String },

    #[error("Invalid query ranges: {0}")]
    InvalidRanges(String),

    #[error("Invalid grouping: {0}")]
    InvalidGrouping(String),

    #[error("Script error: {0}")]
    Script(String),
}

impl PipelineError {
    pub fn stage(stage: StageKind, message: impl Into<String>) -> Self {
        PipelineError::Stage {
            stage,
            message: message.into(),
        }
    }

    /// Create a script error from a Rhai error
    pub fn from_rhai_error(err: Box<rhai::EvalAltResult>) -> Self {
        PipelineError::Script(err.to_string())
    }
}

pub type PipelineResult<T> = std::result::Result<T, PipelineError>;

//! Error types for stage and pipeline execution.

use std::io;
use std::sync::Arc;

use thiserror::Error;

/// Errors raised while building or running stages and pipelines.
///
/// Construction errors (`Empty`, `Pipe`) are returned directly. Everything
/// else is captured by the stage that hit it and only surfaces from
/// `wait`/`close`. The type is `Clone` so a finished stage can hand out its
/// frozen result any number of times.
#[derive(Debug, Clone, Error)]
pub enum PipelineError {
    #[error("pipeline has no stages")]
    Empty,

    #[error("failed to allocate pipe {index}: {source}")]
    Pipe {
        index: usize,
        source: Arc<io::Error>,
    },

    #[error("stage {stage}: failed to spawn worker: {source}")]
    Spawn {
        stage: String,
        source: Arc<io::Error>,
    },

    #[error("stage {stage}: read failed: {source}")]
    Read {
        stage: String,
        source: Arc<io::Error>,
    },

    #[error("stage {stage}: write failed: {source}")]
    Write {
        stage: String,
        source: Arc<io::Error>,
    },

    #[error("stage {stage}: worker panicked")]
    Panicked { stage: String },
}

impl PipelineError {
    pub(crate) fn read(stage: &str, source: io::Error) -> Self {
        Self::Read {
            stage: stage.to_string(),
            source: Arc::new(source),
        }
    }

    pub(crate) fn write(stage: &str, source: io::Error) -> Self {
        Self::Write {
            stage: stage.to_string(),
            source: Arc::new(source),
        }
    }

    /// Name of the stage that failed, if the error belongs to one.
    pub fn stage(&self) -> Option<&str> {
        match self {
            Self::Spawn { stage, .. }
            | Self::Read { stage, .. }
            | Self::Write { stage, .. }
            | Self::Panicked { stage } => Some(stage),
            Self::Empty | Self::Pipe { .. } => None,
        }
    }
}

//! Top-level error for the export pipeline.

use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::encoder::EncodingError;
use crate::graph::{RuntimeError, StructuralError};
use crate::model::ForwardError;
use crate::parity::ParityError;
use crate::quantize::QuantizeError;
use crate::vocab::VocabError;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Encoding(#[from] EncodingError),
    /// Recording the forward pass failed
    #[error(transparent)]
    Trace(#[from] ForwardError),
    /// Running the evaluator eagerly failed
    #[error("evaluator failed: {0}")]
    Evaluation(#[source] ForwardError),
    #[error(transparent)]
    Structural(#[from] StructuralError),
    #[error(transparent)]
    Parity(#[from] ParityError),
    #[error(transparent)]
    Quantize(#[from] QuantizeError),
    #[error(transparent)]
    Runtime(#[from] RuntimeError),
    #[error(transparent)]
    Vocabulary(#[from] VocabError),
    #[error("checkpoint {}: {reason}", path.display())]
    Checkpoint { path: PathBuf, reason: String },
    #[error("configuration: {reason}")]
    Config { reason: String },
    #[error("{}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl PipelineError {
    pub fn io(path: &Path, source: io::Error) -> Self {
        PipelineError::Io {
            path: path.to_path_buf(),
            source,
        }
    }

    pub fn checkpoint(path: &Path, reason: impl Into<String>) -> Self {
        PipelineError::Checkpoint {
            path: path.to_path_buf(),
            reason: reason.into(),
        }
    }

    pub fn config(reason: impl Into<String>) -> Self {
        PipelineError::Config {
            reason: reason.into(),
        }
    }

    /// Name of the pipeline stage that failed.
    #[must_use]
    pub fn stage(&self) -> &'static str {
        match self {
            PipelineError::Encoding(_) => "encoding",
            PipelineError::Trace(_) => "export",
            PipelineError::Evaluation(_) => "evaluation",
            PipelineError::Structural(_) => "validation",
            PipelineError::Parity(_) => "parity",
            PipelineError::Quantize(_) => "quantization",
            PipelineError::Runtime(_) => "inference",
            PipelineError::Vocabulary(_) => "vocabulary",
            PipelineError::Checkpoint { .. } => "checkpoint",
            PipelineError::Config { .. } => "config",
            PipelineError::Io { .. } => "io",
        }
    }
}

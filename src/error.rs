use std::io;
use std::path::PathBuf;

use ndarray_npy::{ReadNpzError, WriteNpzError};

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("{what} not found at {}", path.display())]
    NotFound { what: &'static str, path: PathBuf },

    #[error("generation failed: {0}")]
    GenerationFailure(String),

    #[error("scoring failed: {0}")]
    ScoringFailure(String),

    #[error("optimizer failed: {0}")]
    OptimizerFailure(String),

    #[error("operation not permitted in state {0:?}")]
    InvalidState(crate::annotation::AnnotationState),

    #[error("unrecognized verdict {0:?} (expected A, B, or T)")]
    InvalidVerdict(String),

    #[error("{identifier} has shape {found:?}, expected {expected:?}")]
    ShapeMismatch {
        identifier: String,
        expected: Vec<usize>,
        found: Vec<usize>,
    },

    #[error("dataset is empty: {0}")]
    EmptyDataset(&'static str),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("malformed JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("could not read weights: {0}")]
    ReadWeights(#[from] ReadNpzError),

    #[error("could not write weights: {0}")]
    WriteWeights(#[from] WriteNpzError),
}

impl PipelineError {
    pub fn not_found(what: &'static str, path: impl Into<PathBuf>) -> Self {
        PipelineError::NotFound {
            what,
            path: path.into(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, PipelineError::NotFound { .. })
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;

use std::fmt;
use std::io;

use thiserror::Error;

use crate::dataset::image_normalizer::NormalizeError;
use crate::dataset::inference::InferenceError;
use crate::dataset::post_fetcher::FetchError;
use crate::dataset::postprocess::PostprocessError;

/// Error raised while processing one item or one batch of a stage.
#[derive(Error, Debug)]
pub enum StageError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Fetch error: {0}")]
    Fetch(#[from] FetchError),

    #[error("Image error: {0}")]
    Normalize(#[from] NormalizeError),

    #[error("Inference error: {0}")]
    Inference(#[from] InferenceError),

    #[error("Post-processing error: {0}")]
    Postprocess(#[from] PostprocessError),
}

/// Result type for stage operations
pub type StageResult<T> = Result<T, StageError>;

/// Outcome counts for one stage run.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RunSummary {
    pub succeeded: usize,
    pub skipped: usize,
    pub failed: usize,
}

impl RunSummary {
    pub fn has_failures(&self) -> bool {
        self.failed > 0
    }
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} succeeded, {} skipped, {} failed",
            self.succeeded, self.skipped, self.failed
        )
    }
}

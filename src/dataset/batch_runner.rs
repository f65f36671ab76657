//! Fixed-size batching shared by the inference stages
//!
//! This module provides functionality for:
//! 1. Splitting a work queue into batches of a configured size
//! 2. Calling the model once per batch and mapping results back by position
//! 3. Skipping a whole batch when the model call fails
//! 4. Dropping each batch's image buffers before the next batch is loaded

use std::fs;
use std::io;
use std::path::PathBuf;

use tracing::{debug, error, warn};

use crate::dataset::inference::{InferenceError, InferenceInput, InferenceResult};
use crate::dataset::stage::{RunSummary, StageError, StageResult};

/// One discovered file queued for inference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkItem {
    /// The image to send.
    pub path: PathBuf,
    /// Where the derived artifact is written.
    pub output: PathBuf,
    /// Existing tag or caption text passed along as a hint.
    pub hint_path: Option<PathBuf>,
}

impl WorkItem {
    pub fn new(path: PathBuf, output: PathBuf) -> Self {
        Self {
            path,
            output,
            hint_path: None,
        }
    }

    pub fn with_hint(mut self, hint_path: PathBuf) -> Self {
        self.hint_path = Some(hint_path);
        self
    }

    /// Reads the image and hint into memory.
    ///
    /// A missing hint file gives an empty hint rather than an error.
    pub fn load(&self) -> StageResult<InferenceInput> {
        let image_bytes = fs::read(&self.path)?;
        let hint = match &self.hint_path {
            Some(hint_path) => match fs::read_to_string(hint_path) {
                Ok(text) => Some(text),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    warn!(path = %self.path.display(), "tags not exists for {}", self.path.display());
                    Some(String::new())
                }
                Err(e) => return Err(e.into()),
            },
            None => None,
        };
        Ok(InferenceInput {
            path: self.path.clone(),
            image_bytes,
            hint,
        })
    }
}

/// A model-backed stage the runner can drive.
pub trait BatchStage {
    type Output;

    /// One model call for the whole batch, results in input order.
    fn infer(&mut self, inputs: &[InferenceInput]) -> InferenceResult<Vec<Self::Output>>;

    /// Writes one item's result.
    fn persist(&mut self, item: &WorkItem, output: Self::Output) -> StageResult<()>;
}

/// A batch whose model call failed. Every item in it was skipped.
#[derive(Debug)]
pub struct BatchFailure<'a> {
    pub batch_index: usize,
    pub items: &'a [WorkItem],
    pub error: &'a StageError,
}

/// Default failure handler: log and move on.
pub fn log_batch_failure(failure: &BatchFailure<'_>) {
    let first = failure
        .items
        .first()
        .map(|item| item.path.display().to_string())
        .unwrap_or_default();
    error!(
        batch = failure.batch_index,
        items = failure.items.len(),
        first = %first,
        "batch failed, skipping all items: {}",
        failure.error
    );
}

/// Runs `stage` over `queue` in batches of `batch_size` (the last may be smaller).
///
/// A failed model call skips the entire batch: no retry and no per-item
/// fallback. Items that fail to load or persist are counted individually.
pub fn run_batches<S: BatchStage>(
    queue: &[WorkItem],
    batch_size: usize,
    stage: &mut S,
    on_failure: &mut dyn FnMut(&BatchFailure<'_>),
) -> RunSummary {
    let mut summary = RunSummary::default();

    for (batch_index, batch) in queue.chunks(batch_size.max(1)).enumerate() {
        let mut items = Vec::with_capacity(batch.len());
        let mut inputs = Vec::with_capacity(batch.len());
        for item in batch {
            match item.load() {
                Ok(input) => {
                    items.push(item.clone());
                    inputs.push(input);
                }
                Err(e) => {
                    error!(path = %item.path.display(), "failed to load {}: {}", item.path.display(), e);
                    summary.failed += 1;
                }
            }
        }
        if inputs.is_empty() {
            continue;
        }

        debug!(batch = batch_index, items = inputs.len(), "Dispatching batch");
        let result = stage.infer(&inputs);
        drop(inputs);

        let outputs = match result {
            Ok(outputs) => outputs,
            Err(e) => {
                let error = StageError::from(e);
                on_failure(&BatchFailure {
                    batch_index,
                    items: &items,
                    error: &error,
                });
                summary.failed += items.len();
                continue;
            }
        };

        if outputs.len() != items.len() {
            let error = StageError::from(InferenceError::LengthMismatch {
                expected: items.len(),
                actual: outputs.len(),
            });
            on_failure(&BatchFailure {
                batch_index,
                items: &items,
                error: &error,
            });
            summary.failed += items.len();
            continue;
        }

        for (item, output) in items.iter().zip(outputs) {
            match stage.persist(item, output) {
                Ok(()) => summary.succeeded += 1,
                Err(e) => {
                    error!(path = %item.output.display(), "failed to write {}: {}", item.output.display(), e);
                    summary.failed += 1;
                }
            }
        }
    }

    summary
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    /// Echoes the hint back, failing on chosen call numbers.
    struct EchoStage {
        calls: Vec<usize>,
        fail_on_call: Option<usize>,
        written: Vec<(PathBuf, String)>,
    }

    impl BatchStage for EchoStage {
        type Output = String;

        fn infer(&mut self, inputs: &[InferenceInput]) -> InferenceResult<Vec<String>> {
            self.calls.push(inputs.len());
            if self.fail_on_call == Some(self.calls.len()) {
                return Err(InferenceError::Service("out of memory".to_string()));
            }
            Ok(inputs
                .iter()
                .map(|input| format!("{}:{}", input.image_bytes.len(), input.hint.clone().unwrap_or_default()))
                .collect())
        }

        fn persist(&mut self, item: &WorkItem, output: String) -> StageResult<()> {
            self.written.push((item.path.clone(), output));
            Ok(())
        }
    }

    fn queue(dir: &std::path::Path, count: usize) -> Vec<WorkItem> {
        (0..count)
            .map(|i| {
                let path = dir.join(format!("{}.png", i));
                fs::write(&path, vec![0u8; i + 1]).unwrap();
                WorkItem::new(path, dir.join(format!("{}.out", i)))
            })
            .collect()
    }

    #[test]
    fn test_batches_are_fixed_size_with_short_tail() {
        let temp_dir = tempdir().unwrap();
        let items = queue(temp_dir.path(), 5);
        let mut stage = EchoStage { calls: Vec::new(), fail_on_call: None, written: Vec::new() };

        let summary = run_batches(&items, 2, &mut stage, &mut log_batch_failure);

        assert_eq!(stage.calls, vec![2, 2, 1]);
        assert_eq!(summary.succeeded, 5);
        // Results land on the item at the same position.
        assert_eq!(stage.written[3], (items[3].path.clone(), "4:".to_string()));
    }

    #[test]
    fn test_failed_call_skips_only_that_batch() {
        let temp_dir = tempdir().unwrap();
        let items = queue(temp_dir.path(), 5);
        let mut stage = EchoStage { calls: Vec::new(), fail_on_call: Some(2), written: Vec::new() };
        let mut failures = Vec::new();

        let summary = run_batches(&items, 2, &mut stage, &mut |failure: &BatchFailure<'_>| {
            failures.push((failure.batch_index, failure.items.len()));
        });

        // The second batch is dropped whole, with no per-item retry.
        assert_eq!(stage.calls, vec![2, 2, 1]);
        assert_eq!(failures, vec![(1, 2)]);
        assert_eq!(summary, RunSummary { succeeded: 3, skipped: 0, failed: 2 });
        let written: Vec<_> = stage.written.iter().map(|(path, _)| path.clone()).collect();
        assert_eq!(written, vec![items[0].path.clone(), items[1].path.clone(), items[4].path.clone()]);
    }

    #[test]
    fn test_unreadable_item_is_counted_and_left_out() {
        let temp_dir = tempdir().unwrap();
        let mut items = queue(temp_dir.path(), 2);
        items.insert(1, WorkItem::new(temp_dir.path().join("gone.png"), temp_dir.path().join("gone.out")));
        let mut stage = EchoStage { calls: Vec::new(), fail_on_call: None, written: Vec::new() };

        let summary = run_batches(&items, 3, &mut stage, &mut log_batch_failure);

        assert_eq!(stage.calls, vec![2]);
        assert_eq!(summary, RunSummary { succeeded: 2, skipped: 0, failed: 1 });
    }

    #[test]
    fn test_hint_is_loaded_and_missing_hint_is_empty() {
        let temp_dir = tempdir().unwrap();
        let image = temp_dir.path().join("a.png");
        fs::write(&image, b"img").unwrap();
        let hint = temp_dir.path().join("a.txt");
        fs::write(&hint, "cat,smile").unwrap();

        let loaded = WorkItem::new(image.clone(), PathBuf::new()).with_hint(hint).load().unwrap();
        assert_eq!(loaded.hint.as_deref(), Some("cat,smile"));

        let missing = WorkItem::new(image, PathBuf::new())
            .with_hint(temp_dir.path().join("b.txt"))
            .load()
            .unwrap();
        assert_eq!(missing.hint.as_deref(), Some(""));
    }
}

//! Aesthetic scoring: appends a quality tag to each image's tag file.

use std::path::Path;

use tracing::{info, instrument};

use crate::dataset::ScorerConfig;
use crate::dataset::batch_runner::{BatchFailure, BatchStage, WorkItem, log_batch_failure, run_batches};
use crate::dataset::directory_walker::{sibling_with_extension, walk_with_extensions};
use crate::dataset::inference::{InferenceInput, InferenceResult, QualityScorer};
use crate::dataset::postprocess::write_score;
use crate::dataset::stage::{RunSummary, StageResult};

pub struct ScoreStage<'a, Q> {
    config: &'a ScorerConfig,
    scorer: Q,
}

impl<'a, Q: QualityScorer> ScoreStage<'a, Q> {
    pub fn new(config: &'a ScorerConfig, scorer: Q) -> Self {
        Self { config, scorer }
    }

    /// Every matching image under `root`, each paired with its sibling tag file.
    pub fn build_queue(&self, root: &Path) -> Vec<WorkItem> {
        walk_with_extensions(root, &self.config.filter_format)
            .iter()
            .map(|path| {
                let tag_path = sibling_with_extension(&path, "txt");
                WorkItem::new(path, tag_path)
            })
            .collect()
    }

    pub fn process(&mut self, root: &Path) -> RunSummary {
        self.process_with(root, &mut log_batch_failure)
    }

    #[instrument(skip(self, on_failure), fields(root = %root.display()))]
    pub fn process_with(
        &mut self,
        root: &Path,
        on_failure: &mut dyn FnMut(&BatchFailure<'_>),
    ) -> RunSummary {
        let queue = self.build_queue(root);
        info!(queued = queue.len(), "Scoring images");

        let mut writer = ScoreWriter {
            scorer: &mut self.scorer,
        };
        let summary = run_batches(&queue, self.config.batch_size, &mut writer, on_failure);

        info!(%summary, "Scoring finished");
        summary
    }

    #[cfg(test)]
    pub fn into_scorer(self) -> Q {
        self.scorer
    }
}

struct ScoreWriter<'s, Q> {
    scorer: &'s mut Q,
}

impl<Q: QualityScorer> BatchStage for ScoreWriter<'_, Q> {
    type Output = f32;

    fn infer(&mut self, inputs: &[InferenceInput]) -> InferenceResult<Vec<f32>> {
        self.scorer.score_batch(inputs)
    }

    fn persist(&mut self, item: &WorkItem, score: f32) -> StageResult<()> {
        let tags = write_score(&item.output, score)?;
        info!(score, "{}: {}", item.path.display(), tags);
        Ok(())
    }
}

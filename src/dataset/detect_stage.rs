//! Subject-position tagging
//!
//! This module provides functionality for:
//! 1. Locating the main subject of each image and naming its 3x3 grid cell
//! 2. Captioning the image, using its existing tag file as a hint
//! 3. Predicting booru tags from the image and caption
//! 4. Writing the deduplicated tags with the grid label first
//!
//! The caption is written to an intermediate folder and removed once the final
//! tag file exists, unless it is asked to be kept.

use std::fs;
use std::path::{Path, PathBuf};

use image::GenericImageView;
use tracing::{debug, error, info, instrument, warn};

use crate::dataset::BBoxConfig;
use crate::dataset::batch_runner::WorkItem;
use crate::dataset::caption_stage::clean_caption;
use crate::dataset::directory_walker::{
    DirectoryWalker, ExtensionFilter, has_content, mirrored_path,
};
use crate::dataset::image_normalizer::decode;
use crate::dataset::inference::{
    CaptionService, InferenceError, InferenceInput, SubjectDetector, TagPredictor, expect_len,
};
use crate::dataset::postprocess::GridLabel;
use crate::dataset::stage::{RunSummary, StageResult};
use crate::dataset::tag_set::TagSet;

/// What happened to one image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DetectOutcome {
    Written { label: String, tags: PathBuf },
    NoSubject,
}

/// Models the stage needs, usually all served by one client.
pub trait DetectModels: SubjectDetector + CaptionService + TagPredictor {}

impl<T: SubjectDetector + CaptionService + TagPredictor> DetectModels for T {}

pub struct DetectStage<'a, M> {
    config: &'a BBoxConfig,
    models: M,
}

impl<'a, M: DetectModels> DetectStage<'a, M> {
    pub fn new(config: &'a BBoxConfig, models: M) -> Self {
        Self { config, models }
    }

    /// Images under `root` without a final tag file (or all of them when overwriting).
    pub fn build_queue(&self, root: &Path) -> (Vec<WorkItem>, usize) {
        let filter = ExtensionFilter::new(&self.config.filter_format);
        let mut queue = Vec::new();
        let mut skipped = 0;

        let walker = DirectoryWalker::new(root, |path: &Path| filter.matches(path));
        for path in walker.iter() {
            let output = mirrored_path(root, &path, &self.config.tag_out, "txt");
            if !self.config.overwrite && has_content(&output) {
                info!("skip existed: {}", output.display());
                skipped += 1;
                continue;
            }
            let hint = mirrored_path(root, &path, &self.config.txt_folder, "txt");
            queue.push(WorkItem::new(path, output).with_hint(hint));
        }

        (queue, skipped)
    }

    #[instrument(skip(self), fields(root = %root.display()))]
    pub fn process(&mut self, root: &Path) -> RunSummary {
        let (queue, skipped) = self.build_queue(root);
        let mut summary = RunSummary {
            skipped,
            ..RunSummary::default()
        };
        info!(queued = queue.len(), skipped, "Locating subjects");

        for item in &queue {
            match self.process_item(root, item) {
                Ok(DetectOutcome::Written { label, tags }) => {
                    info!(label = %label, "{} -> {}", item.path.display(), tags.display());
                    summary.succeeded += 1;
                }
                Ok(DetectOutcome::NoSubject) => {
                    warn!("no subject found in {}, skipping", item.path.display());
                    summary.skipped += 1;
                }
                Err(e) => {
                    error!(path = %item.path.display(), "{}: {}", item.path.display(), e);
                    summary.failed += 1;
                }
            }
        }

        info!(%summary, "Subject tagging finished");
        summary
    }

    /// Runs the full detect, caption and tag sequence for one image.
    pub fn process_item(&mut self, root: &Path, item: &WorkItem) -> StageResult<DetectOutcome> {
        let mut input = item.load()?;
        let dimensions = decode(&input.image_bytes)?.dimensions();

        let Some(bbox) = self.models.detect(&input)? else {
            return Ok(DetectOutcome::NoSubject);
        };
        let label = GridLabel::from_bbox(dimensions, &bbox)?.to_string();

        let caption = self.caption_one(&input)?;
        let intermediate = mirrored_path(root, &item.path, &self.config.nlp_out, "txt");
        write_creating_parent(&intermediate, &caption)?;

        input.hint = Some(caption);
        let predicted = self.models.predict_tags(&input)?;
        drop(input);

        let mut tags = TagSet::from_raw(&predicted);
        tags.insert_first(&label);
        debug!(count = tags.len(), "{}: {}", item.path.display(), tags);
        write_creating_parent(&item.output, &tags.to_tag_line())?;

        if !self.config.keep_intermediate {
            fs::remove_file(&intermediate)?;
        }

        Ok(DetectOutcome::Written {
            label,
            tags: item.output.clone(),
        })
    }

    #[cfg(test)]
    pub fn into_models(self) -> M {
        self.models
    }

    fn caption_one(&mut self, input: &InferenceInput) -> StageResult<String> {
        let captions = expect_len(self.models.caption_batch(std::slice::from_ref(input))?, 1)?;
        captions
            .into_iter()
            .next()
            .map(|caption| clean_caption(&caption))
            .ok_or_else(|| InferenceError::LengthMismatch { expected: 1, actual: 0 }.into())
    }
}

fn write_creating_parent(path: &Path, contents: &str) -> StageResult<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, contents)?;
    Ok(())
}

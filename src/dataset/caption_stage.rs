//! Natural-language captioning of a dataset tree
//!
//! Images under the image folder are captioned in batches; each caption is
//! written to the same relative path under the output folder with a `.txt`
//! extension. Images whose caption already exists are skipped unless
//! overwrite is set, which makes an interrupted run resumable.

use std::cell::Cell;
use std::fs;
use std::path::Path;

use tracing::{info, instrument};

use crate::dataset::TaggerConfig;
use crate::dataset::batch_runner::{BatchFailure, BatchStage, WorkItem, log_batch_failure, run_batches};
use crate::dataset::directory_walker::{
    DirectoryWalker, ExtensionFilter, has_content, mirrored_path, sibling_with_extension,
};
use crate::dataset::inference::{CaptionService, InferenceInput, InferenceResult};
use crate::dataset::stage::{RunSummary, StageResult};

/// Normalizes raw model output before it is written.
pub fn clean_caption(raw: &str) -> String {
    raw.replace('\r', " ").trim().to_string()
}

/// Captions every eligible image under a root.
pub struct CaptionStage<'a, C> {
    config: &'a TaggerConfig,
    service: C,
}

impl<'a, C: CaptionService> CaptionStage<'a, C> {
    pub fn new(config: &'a TaggerConfig, service: C) -> Self {
        Self { config, service }
    }

    /// Images under `root` still needing a caption, and how many were skipped.
    pub fn build_queue(&self, root: &Path) -> (Vec<WorkItem>, usize) {
        let filter = ExtensionFilter::new(&self.config.filter_format);
        let output_root = &self.config.output_folder;
        let overwrite = self.config.overwrite;
        let skipped = Cell::new(0usize);

        let walker = DirectoryWalker::new(root, |path: &Path| {
            if !filter.matches(path) {
                return false;
            }
            let caption_path = mirrored_path(root, path, output_root, "txt");
            if !overwrite && has_content(&caption_path) {
                info!("skip existed: {}", caption_path.display());
                skipped.set(skipped.get() + 1);
                return false;
            }
            true
        });

        let queue = walker
            .iter()
            .map(|path| {
                let output = mirrored_path(root, &path, output_root, "txt");
                let hint = sibling_with_extension(&path, "txt");
                WorkItem::new(path, output).with_hint(hint)
            })
            .collect();

        (queue, skipped.get())
    }

    /// Captions everything under `root`, logging failed batches.
    pub fn process(&mut self, root: &Path) -> RunSummary {
        self.process_with(root, &mut log_batch_failure)
    }

    /// Like [`process`](Self::process) with a caller-supplied batch failure handler.
    #[instrument(skip(self, on_failure), fields(root = %root.display()))]
    pub fn process_with(
        &mut self,
        root: &Path,
        on_failure: &mut dyn FnMut(&BatchFailure<'_>),
    ) -> RunSummary {
        let (queue, skipped) = self.build_queue(root);
        info!(queued = queue.len(), skipped, "Captioning images");

        let mut writer = CaptionWriter {
            service: &mut self.service,
        };
        let mut summary = run_batches(&queue, self.config.batch_size, &mut writer, on_failure);
        summary.skipped += skipped;

        info!(%summary, "all done");
        summary
    }

    #[cfg(test)]
    pub fn into_service(self) -> C {
        self.service
    }
}

struct CaptionWriter<'s, C> {
    service: &'s mut C,
}

impl<C: CaptionService> BatchStage for CaptionWriter<'_, C> {
    type Output = String;

    fn infer(&mut self, inputs: &[InferenceInput]) -> InferenceResult<Vec<String>> {
        self.service.caption_batch(inputs)
    }

    fn persist(&mut self, item: &WorkItem, caption: String) -> StageResult<()> {
        if let Some(parent) = item.output.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&item.output, clean_caption(&caption))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::inference::InferenceError;
    use std::path::PathBuf;
    use tempfile::tempdir;

    /// Records every batch it receives and captions with the hint text.
    #[derive(Default)]
    struct FakeCaptioner {
        batches: Vec<Vec<PathBuf>>,
        fail: bool,
    }

    impl CaptionService for FakeCaptioner {
        fn caption_batch(&mut self, inputs: &[InferenceInput]) -> InferenceResult<Vec<String>> {
            self.batches.push(inputs.iter().map(|input| input.path.clone()).collect());
            if self.fail {
                return Err(InferenceError::Service("CUDA out of memory".to_string()));
            }
            Ok(inputs
                .iter()
                .map(|input| format!("  a picture of {}\r\n", input.hint.clone().unwrap_or_default()))
                .collect())
        }
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        images: PathBuf,
        output: PathBuf,
    }

    fn fixture() -> Fixture {
        let dir = tempdir().unwrap();
        let images = dir.path().join("dataset");
        let output = dir.path().join("ntags");
        let artist = images.join("alice");
        fs::create_dir_all(&artist).unwrap();
        fs::write(artist.join("1.png"), b"one").unwrap();
        fs::write(artist.join("1.txt"), "cat,smile").unwrap();
        fs::write(artist.join("2.PNG"), b"two").unwrap();
        fs::write(artist.join("notes.md"), b"skip me").unwrap();
        fs::write(images.join("3.png"), b"three").unwrap();
        Fixture { _dir: dir, images, output }
    }

    fn config(fixture: &Fixture, overwrite: bool) -> TaggerConfig {
        TaggerConfig {
            image_folder: fixture.images.clone(),
            output_folder: fixture.output.clone(),
            batch_size: 2,
            overwrite,
            filter_format: vec!["png".to_string()],
        }
    }

    #[test]
    fn test_captions_are_written_to_mirrored_paths() {
        let fixture = fixture();
        let config = config(&fixture, false);
        let mut stage = CaptionStage::new(&config, FakeCaptioner::default());

        let summary = stage.process(&fixture.images);

        assert_eq!(summary, RunSummary { succeeded: 3, skipped: 0, failed: 0 });
        assert_eq!(
            fs::read_to_string(fixture.output.join("alice").join("1.txt")).unwrap(),
            "a picture of cat,smile"
        );
        // No sibling tag file means an empty hint.
        assert_eq!(
            fs::read_to_string(fixture.output.join("alice").join("2.txt")).unwrap(),
            "a picture of"
        );
        assert!(fixture.output.join("3.txt").exists());

        let batches = stage.into_service().batches;
        assert_eq!(batches.iter().map(Vec::len).collect::<Vec<_>>(), vec![2, 1]);
    }

    #[test]
    fn test_existing_output_is_not_sent_again() {
        let fixture = fixture();
        fs::create_dir_all(fixture.output.join("alice")).unwrap();
        fs::write(fixture.output.join("alice").join("1.txt"), "done before").unwrap();
        let config = config(&fixture, false);
        let mut stage = CaptionStage::new(&config, FakeCaptioner::default());

        let summary = stage.process(&fixture.images);

        assert_eq!(summary.skipped, 1);
        assert_eq!(summary.succeeded, 2);
        let sent: Vec<PathBuf> = stage.into_service().batches.concat();
        assert!(!sent.contains(&fixture.images.join("alice").join("1.png")));
        assert_eq!(
            fs::read_to_string(fixture.output.join("alice").join("1.txt")).unwrap(),
            "done before"
        );
    }

    #[test]
    fn test_empty_existing_output_is_sent_again() {
        let fixture = fixture();
        fs::create_dir_all(fixture.output.join("alice")).unwrap();
        fs::write(fixture.output.join("alice").join("1.txt"), "").unwrap();
        let config = config(&fixture, false);
        let mut stage = CaptionStage::new(&config, FakeCaptioner::default());

        let summary = stage.process(&fixture.images);

        assert_eq!(summary, RunSummary { succeeded: 3, skipped: 0, failed: 0 });
        let sent: Vec<PathBuf> = stage.into_service().batches.concat();
        assert!(sent.contains(&fixture.images.join("alice").join("1.png")));
        assert_eq!(
            fs::read_to_string(fixture.output.join("alice").join("1.txt")).unwrap(),
            "a picture of cat,smile"
        );
    }

    #[test]
    fn test_overwrite_sends_existing_output_again() {
        let fixture = fixture();
        fs::create_dir_all(fixture.output.join("alice")).unwrap();
        fs::write(fixture.output.join("alice").join("1.txt"), "done before").unwrap();
        let config = config(&fixture, true);
        let mut stage = CaptionStage::new(&config, FakeCaptioner::default());

        let summary = stage.process(&fixture.images);

        assert_eq!(summary, RunSummary { succeeded: 3, skipped: 0, failed: 0 });
        let sent: Vec<PathBuf> = stage.into_service().batches.concat();
        assert!(sent.contains(&fixture.images.join("alice").join("1.png")));
        assert_eq!(
            fs::read_to_string(fixture.output.join("alice").join("1.txt")).unwrap(),
            "a picture of cat,smile"
        );
    }

    #[test]
    fn test_failed_service_skips_whole_batches() {
        let fixture = fixture();
        let config = config(&fixture, false);
        let mut stage = CaptionStage::new(
            &config,
            FakeCaptioner {
                fail: true,
                ..FakeCaptioner::default()
            },
        );
        let mut failed_batches = 0;

        let summary = stage.process_with(&fixture.images, &mut |failure: &BatchFailure<'_>| {
            assert!(!failure.items.is_empty());
            failed_batches += 1;
        });

        assert_eq!(failed_batches, 2);
        assert_eq!(summary.failed, 3);
        assert!(!fixture.output.exists());
    }

    #[test]
    fn test_clean_caption() {
        assert_eq!(clean_caption("\r\n a\rb \n"), "a b");
        assert_eq!(clean_caption("word\rword"), "word word");
    }
}

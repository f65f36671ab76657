//! Sequential crawl over a range of post ids
//!
//! Posts are processed one at a time in ascending id order. A failing id is
//! logged and skipped; nothing is retried and no cursor is persisted, so a
//! re-run over the same range overwrites what was already written.

use std::fs;
use std::ops::Range;
use std::path::{Path, PathBuf};

use indicatif::{ProgressBar, ProgressStyle};
use tracing::{error, info, instrument};

use crate::dataset::image_normalizer::ImageNormalizer;
use crate::dataset::post_fetcher::{PostRecord, PostSource};
use crate::dataset::stage::{RunSummary, StageResult};

/// Files written for one post.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SavedPost {
    pub image_path: PathBuf,
    pub tag_path: PathBuf,
}

/// Drives a [`PostSource`] over an id range and saves each post to disk.
pub struct CrawlDriver<S> {
    source: S,
    normalizer: ImageNormalizer,
    save_location: PathBuf,
    show_progress: bool,
}

impl<S: PostSource> CrawlDriver<S> {
    pub fn new(source: S, normalizer: ImageNormalizer, save_location: impl Into<PathBuf>) -> Self {
        Self {
            source,
            normalizer,
            save_location: save_location.into(),
            show_progress: true,
        }
    }

    pub fn with_progress(mut self, show_progress: bool) -> Self {
        self.show_progress = show_progress;
        self
    }

    /// Crawls `ids` (end exclusive). Per-id failures never stop the run.
    #[instrument(skip(self), fields(save_location = %self.save_location.display()))]
    pub fn crawl(&mut self, ids: Range<u64>) -> RunSummary {
        let mut summary = RunSummary::default();
        let progress = self.progress_bar(ids.end.saturating_sub(ids.start));

        for id in ids {
            progress.set_message(format!("post {}", id));

            let record = match self.source.fetch_post(id) {
                Ok(record) => record,
                Err(e) => {
                    error!(post_id = id, "id: {} fetch error: {}", id, e);
                    summary.failed += 1;
                    progress.inc(1);
                    continue;
                }
            };

            info!(
                post_id = id,
                artist = ?record.artists,
                tags = record.tags.len(),
                link = %record.image_url,
                "Fetched post"
            );

            match self.save_post(&record) {
                Ok(saved) => {
                    info!(post_id = id, image = %saved.image_path.display(), "id: {} done", id);
                    summary.succeeded += 1;
                }
                Err(e) => {
                    error!(post_id = id, "id: {} save file error: {}", id, e);
                    summary.failed += 1;
                }
            }
            progress.inc(1);
        }

        progress.finish_with_message(format!("Crawl complete: {}", summary));
        info!(%summary, "Crawl finished");
        summary
    }

    /// Downloads, normalizes and writes one post. Partial writes are left in place on error.
    pub fn save_post(&mut self, record: &PostRecord) -> StageResult<SavedPost> {
        let folder = self.save_location.join(record.partition());
        fs::create_dir_all(&folder)?;

        let raw = self.source.fetch_image(&record.image_url)?;
        let encoded = self.normalizer.normalize_to_bytes(&raw)?;
        drop(raw);

        let saved = post_paths(&folder, record.id, self.normalizer.format().extension());
        fs::write(&saved.image_path, encoded)?;
        fs::write(&saved.tag_path, record.tag_line())?;
        Ok(saved)
    }

    #[cfg(test)]
    pub fn into_source(self) -> S {
        self.source
    }

    fn progress_bar(&self, len: u64) -> ProgressBar {
        if !self.show_progress {
            return ProgressBar::hidden();
        }
        let progress = ProgressBar::new(len);
        if let Ok(style) =
            ProgressStyle::with_template("{spinner} [{bar:40}] {pos}/{len} {msg}")
        {
            progress.set_style(style);
        }
        progress
    }
}

/// `<folder>/<id>.<ext>` and `<folder>/<id>.txt`.
pub fn post_paths(folder: &Path, id: u64, extension: &str) -> SavedPost {
    SavedPost {
        image_path: folder.join(format!("{}.{}", id, extension)),
        tag_path: folder.join(format!("{}.txt", id)),
    }
}

//! In-place metadata removal
//!
//! Every matching image is decoded, rebuilt from its raw samples and written
//! back over itself in the same lossless format. Files in formats without a
//! lossless encoder here are reported and left alone.

use std::fs;
use std::path::Path;

use tracing::{debug, error, info, instrument};

use crate::dataset::WasherConfig;
use crate::dataset::directory_walker::walk_with_extensions;
use crate::dataset::image_normalizer::{
    NormalizeError, TargetFormat, decode, encode_lossless, strip_metadata,
};
use crate::dataset::stage::{RunSummary, StageResult};

/// Re-encodes one file in place.
pub fn wash_file(path: &Path) -> StageResult<()> {
    let format = TargetFormat::from_path(path).ok_or_else(|| {
        NormalizeError::UnsupportedFormat(path.display().to_string())
    })?;

    let raw = fs::read(path)?;
    let image = decode(&raw)?;
    drop(raw);

    let clean = strip_metadata(&image)?;
    let encoded = encode_lossless(&clean, format)?;
    fs::write(path, encoded)?;
    Ok(())
}

/// Washes every image under `root` matching the configured extensions.
#[instrument(skip(config), fields(root = %root.display()))]
pub fn wash_tree(config: &WasherConfig, root: &Path) -> RunSummary {
    let mut summary = RunSummary::default();

    for path in walk_with_extensions(root, &config.filter_format).iter() {
        match wash_file(&path) {
            Ok(()) => {
                debug!("washed {}", path.display());
                summary.succeeded += 1;
            }
            Err(e) => {
                error!(path = %path.display(), "{}: {}", path.display(), e);
                summary.failed += 1;
            }
        }
    }

    info!(%summary, "Washing finished");
    summary
}

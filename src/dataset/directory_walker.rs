use std::fs;
use std::path::{Path, PathBuf};

use tracing::warn;
use walkdir::WalkDir;

/// Case-insensitive extension allow-list.
#[derive(Debug, Clone)]
pub struct ExtensionFilter {
    extensions: Vec<String>,
}

impl ExtensionFilter {
    pub fn new<I, S>(extensions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let extensions = extensions
            .into_iter()
            .map(|ext| ext.as_ref().trim().trim_start_matches('.').to_lowercase())
            .filter(|ext| !ext.is_empty())
            .collect();
        Self { extensions }
    }

    pub fn matches(&self, path: &Path) -> bool {
        path.extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| {
                let ext = ext.to_lowercase();
                self.extensions.iter().any(|allowed| *allowed == ext)
            })
            .unwrap_or(false)
    }
}

/// Recursively yields the files under a root that satisfy a predicate.
///
/// Traversal is depth-first and follows the filesystem's native entry order.
/// The walker can be iterated any number of times; each call to [`iter`]
/// starts a fresh traversal.
///
/// [`iter`]: DirectoryWalker::iter
pub struct DirectoryWalker<F> {
    root: PathBuf,
    predicate: F,
}

impl<F> DirectoryWalker<F>
where
    F: Fn(&Path) -> bool,
{
    pub fn new(root: impl Into<PathBuf>, predicate: F) -> Self {
        Self {
            root: root.into(),
            predicate,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn iter(&self) -> impl Iterator<Item = PathBuf> + '_ {
        WalkDir::new(&self.root)
            .follow_links(true)
            .into_iter()
            .filter_map(|entry| match entry {
                Ok(entry) => Some(entry),
                Err(err) => {
                    warn!("Error accessing path under {}: {}", self.root().display(), err);
                    None
                }
            })
            .filter(|entry| entry.file_type().is_file())
            .map(|entry| entry.into_path())
            .filter(|path| (self.predicate)(path))
    }
}

/// Walker over files whose extension is in `extensions`.
pub fn walk_with_extensions<S: AsRef<str>>(
    root: impl Into<PathBuf>,
    extensions: &[S],
) -> DirectoryWalker<impl Fn(&Path) -> bool> {
    let filter = ExtensionFilter::new(extensions);
    DirectoryWalker::new(root, move |path: &Path| filter.matches(path))
}

/// Path of a derived artifact: `path` relative to `root`, re-rooted under
/// `output_root`, with its extension replaced.
pub fn mirrored_path(root: &Path, path: &Path, output_root: &Path, extension: &str) -> PathBuf {
    let relative = path.strip_prefix(root).unwrap_or_else(|_| {
        Path::new(path.file_name().unwrap_or(path.as_os_str()))
    });
    output_root.join(relative).with_extension(extension)
}

/// Whether `path` is a file holding at least one byte.
///
/// An empty output file is never a finished result.
pub fn has_content(path: &Path) -> bool {
    fs::metadata(path)
        .map(|metadata| metadata.is_file() && metadata.len() > 0)
        .unwrap_or(false)
}

/// Sibling of `path` with the same base name and a different extension.
pub fn sibling_with_extension(path: &Path, extension: &str) -> PathBuf {
    path.with_extension(extension)
}

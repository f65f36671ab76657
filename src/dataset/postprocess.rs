//! Deterministic tag file post-processing: subject position and quality tags.

use std::fmt;
use std::fs;
use std::io;
use std::path::Path;

use thiserror::Error;

use crate::dataset::inference::BoundingBox;

/// Every quality tag this pipeline writes.
pub const QUALITY_TAGS: [&str; 4] = ["masterpiece", "best quality", "normal quality", "worst quality"];

const ROW_LABELS: [char; 3] = ['A', 'B', 'C'];

#[derive(Error, Debug)]
pub enum PostprocessError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Image has no area ({width}x{height})")]
    EmptyImage { width: u32, height: u32 },
}

pub type PostprocessResult<T> = Result<T, PostprocessError>;

/// Cell of a 3x3 grid: rows `A`-`C` top to bottom, columns `1`-`3` left to right.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GridLabel {
    row: u8,
    column: u8,
}

impl GridLabel {
    /// Cell holding `center` in an image of `image_size`.
    ///
    /// Uses floor division: `x = 100` of `300` is column `2`, `x = 99` is column `1`.
    pub fn from_center(image_size: (u32, u32), center: (u32, u32)) -> PostprocessResult<Self> {
        let (width, height) = image_size;
        if width == 0 || height == 0 {
            return Err(PostprocessError::EmptyImage { width, height });
        }
        let (cx, cy) = (center.0 as u64, center.1 as u64);
        let column = (cx * 3 / width as u64 + 1).min(3) as u8;
        let row = (cy * 3 / height as u64).min(2) as u8;
        Ok(Self { row, column })
    }

    pub fn from_bbox(image_size: (u32, u32), bbox: &BoundingBox) -> PostprocessResult<Self> {
        Self::from_center(image_size, bbox.center())
    }

    pub fn row_letter(&self) -> char {
        ROW_LABELS[self.row as usize]
    }

    pub fn column(&self) -> u8 {
        self.column
    }
}

impl fmt::Display for GridLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.row_letter(), self.column())
    }
}

/// Quality tag for a score.
pub fn quality_tag(score: f32) -> &'static str {
    if score >= 0.8 {
        "masterpiece"
    } else if score >= 0.5 {
        "best quality"
    } else if score >= 0.3 {
        "normal quality"
    } else {
        "worst quality"
    }
}

/// Drops any quality tag from a comma-joined tag line and appends the one for `score`.
pub fn rewrite_quality(existing: &str, score: f32) -> String {
    let mut tags: Vec<&str> = existing
        .split(',')
        .map(str::trim)
        .filter(|tag| !tag.is_empty() && !QUALITY_TAGS.contains(tag))
        .collect();
    tags.push(quality_tag(score));
    tags.join(",")
}

/// Rewrites the quality tag of the tag file at `path`, creating it if absent.
pub fn write_score(path: &Path, score: f32) -> PostprocessResult<String> {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == io::ErrorKind::NotFound => String::new(),
        Err(e) => return Err(e.into()),
    };
    let rewritten = rewrite_quality(content.trim(), score);
    fs::write(path, rewritten.trim())?;
    Ok(rewritten)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn label(size: (u32, u32), center: (u32, u32)) -> String {
        GridLabel::from_center(size, center).unwrap().to_string()
    }

    #[test]
    fn test_grid_label_corners_and_center() {
        assert_eq!(label((300, 300), (150, 150)), "B2");
        assert_eq!(label((300, 300), (0, 0)), "A1");
        assert_eq!(label((300, 300), (299, 299)), "C3");
    }

    #[test]
    fn test_grid_line_falls_to_later_cell() {
        assert_eq!(label((300, 300), (99, 99)), "A1");
        assert_eq!(label((300, 300), (100, 100)), "B2");
        assert_eq!(label((300, 300), (200, 0)), "A3");
    }

    #[test]
    fn test_center_on_far_edge_is_clamped() {
        assert_eq!(label((300, 300), (300, 300)), "C3");
        assert_eq!(label((300, 300), (450, 10)), "A3");
    }

    #[test]
    fn test_grid_label_from_bbox() {
        let bbox = BoundingBox::new(0, 200, 100, 300);
        assert_eq!(GridLabel::from_bbox((300, 300), &bbox).unwrap().to_string(), "C1");
    }

    #[test]
    fn test_zero_sized_image_is_an_error() {
        assert!(matches!(
            GridLabel::from_center((0, 10), (0, 0)),
            Err(PostprocessError::EmptyImage { .. })
        ));
    }

    #[test]
    fn test_quality_thresholds() {
        assert_eq!(quality_tag(0.8), "masterpiece");
        assert_eq!(quality_tag(0.79), "best quality");
        assert_eq!(quality_tag(0.5), "best quality");
        assert_eq!(quality_tag(0.3), "normal quality");
        assert_eq!(quality_tag(0.29), "worst quality");
        assert_eq!(quality_tag(-1.0), "worst quality");
    }

    #[test]
    fn test_quality_rewrite_moves_tag_to_end() {
        let once = rewrite_quality("masterpiece,cat", 0.9);
        assert_eq!(once, "cat,masterpiece");
        assert_eq!(rewrite_quality(&once, 0.9), once);
    }

    #[test]
    fn test_quality_rewrite_replaces_any_prior_quality() {
        assert_eq!(
            rewrite_quality("worst quality,cat,best quality,dog", 0.4),
            "cat,dog,normal quality"
        );
        assert_eq!(rewrite_quality("", 0.1), "worst quality");
    }

    #[test]
    fn test_write_score_updates_file() {
        let temp_dir = tempdir().unwrap();
        let path = temp_dir.path().join("1.txt");
        fs::write(&path, "cat,normal quality,smile\n").unwrap();

        write_score(&path, 0.95).unwrap();

        assert_eq!(fs::read_to_string(&path).unwrap(), "cat,smile,masterpiece");
    }

    #[test]
    fn test_write_score_creates_missing_file() {
        let temp_dir = tempdir().unwrap();
        let path = temp_dir.path().join("2.txt");

        write_score(&path, 0.6).unwrap();

        assert_eq!(fs::read_to_string(&path).unwrap(), "best quality");
    }
}

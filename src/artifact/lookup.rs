//! Tag-based artifact discovery.
//!
//! Stages never pass file handles to each other: a stage finds its inputs
//! by scanning a producer's directory for files whose stem carries the
//! required tags. Absence is a normal outcome (`None`), handled by falling
//! back to another directory role or reporting an unmet requirement.
//! When several files match, selection is deterministic (lexicographic on
//! stem) so repeated scans of an unchanged directory agree.

use std::path::{Path, PathBuf};

use walkdir::WalkDir;

use super::naming::{split_name, DEFAULT_EXTENSION};

/// Finds the best-matching artifact in `dir`.
///
/// A file matches when its extension equals `ext` (default
/// [`DEFAULT_EXTENSION`]) and its stem contains every tag in `tags`.
/// Returns `None` when nothing matches; never errors — an unreadable or
/// missing directory simply yields no candidates.
pub fn get_image(dir: &Path, tags: &[&str], ext: Option<&str>) -> Option<PathBuf> {
    let wanted_ext = ext.unwrap_or(DEFAULT_EXTENSION);

    let mut candidates: Vec<(String, PathBuf)> = WalkDir::new(dir)
        .min_depth(1)
        .max_depth(1)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file())
        .filter_map(|entry| {
            let file_name = entry.file_name().to_string_lossy().into_owned();
            let (stem, file_ext) = split_name(&file_name);
            let ext_matches = file_ext
                .map(|e| e.eq_ignore_ascii_case(wanted_ext))
                .unwrap_or(wanted_ext.is_empty());
            if ext_matches && tags.iter().all(|tag| stem.contains(tag)) {
                Some((stem.to_string(), entry.path().to_path_buf()))
            } else {
                None
            }
        })
        .collect();

    candidates.sort_by(|a, b| a.0.cmp(&b.0));
    candidates.into_iter().next().map(|(_, path)| path)
}

/// Lookup seam used by stages.
///
/// Stages resolve inputs through this trait rather than the filesystem
/// directly, so fallback chains can be exercised in tests without staging
/// files on disk.
pub trait ImageLookup: Send + Sync {
    /// Finds an artifact in `dir` carrying every tag in `tags`, with the
    /// default imaging extension unless `ext` overrides it.
    fn find(&self, dir: &Path, tags: &[&str], ext: Option<&str>) -> Option<PathBuf>;
}

/// Production lookup backed by directory scans.
#[derive(Debug, Default, Clone, Copy)]
pub struct FsLookup;

impl ImageLookup for FsLookup {
    fn find(&self, dir: &Path, tags: &[&str], ext: Option<&str>) -> Option<PathBuf> {
        get_image(dir, tags, ext)
    }
}

//! The pipeline-wide artifact naming convention.
//!
//! Derived artifacts are named `<stem>[_<tag1>[_<tag2>...]].<ext>`, tags
//! appended in caller order. The functions here are pure: they compute
//! names from strings and paths only and never touch the filesystem. Two
//! calls with the same base, tags and extension are byte-identical, which
//! is what lets a downstream stage reconstruct an upstream filename
//! without a lookup table.

use std::path::{Path, PathBuf};

/// Canonical imaging extension used when a caller does not override it.
pub const DEFAULT_EXTENSION: &str = "nii.gz";

/// Delimiter between the stem and each appended tag.
pub const TAG_DELIMITER: char = '_';

/// Compound extensions that must be treated as a single unit when
/// splitting a filename. `volume.nii.gz` has stem `volume`, not
/// `volume.nii`.
const COMPOUND_EXTENSIONS: [&str; 2] = ["nii.gz", "tar.gz"];

/// Splits a filename into `(stem, extension)`.
///
/// The extension is returned without a leading dot and may be `None` for
/// extension-less names. Compound imaging extensions are kept whole.
pub fn split_name(file_name: &str) -> (&str, Option<&str>) {
    for compound in COMPOUND_EXTENSIONS {
        let suffix_len = compound.len() + 1;
        let dotted = file_name.len() > suffix_len
            && file_name
                .to_ascii_lowercase()
                .ends_with(&format!(".{compound}"));
        if dotted {
            // The matched suffix is ASCII, so byte slicing is safe here.
            let split = file_name.len() - suffix_len;
            return (&file_name[..split], Some(&file_name[split + 1..]));
        }
    }

    match file_name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() && !ext.is_empty() => (stem, Some(ext)),
        _ => (file_name, None),
    }
}

/// Builds the canonical derived name for an artifact.
///
/// `base` supplies the stem (its parent directory is preserved); each
/// non-empty tag in `tags` is appended in order, separated by
/// [`TAG_DELIMITER`]. `ext` overrides the extension; when `None` the
/// base's own extension is kept.
///
/// ```
/// use std::path::Path;
/// use dwiforge::artifact::build_name;
///
/// let name = build_name(Path::new("/data/dwi.nii.gz"), &["denoise"], None);
/// assert_eq!(name, Path::new("/data/dwi_denoise.nii.gz"));
///
/// let qa = build_name(Path::new("/data/dwi.nii.gz"), &["sigma"], Some("png"));
/// assert_eq!(qa, Path::new("/data/dwi_sigma.png"));
/// ```
pub fn build_name(base: &Path, tags: &[&str], ext: Option<&str>) -> PathBuf {
    let file_name = base
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let (stem, base_ext) = split_name(&file_name);

    let mut name = String::from(stem);
    for tag in tags {
        if tag.is_empty() {
            continue;
        }
        name.push(TAG_DELIMITER);
        name.push_str(tag);
    }

    if let Some(ext) = ext.or(base_ext) {
        if !ext.is_empty() {
            name.push('.');
            name.push_str(ext);
        }
    }

    match base.parent() {
        Some(parent) => parent.join(name),
        None => PathBuf::from(name),
    }
}

//! Gzip plumbing around the external-tool path.
//!
//! The external tool reads and writes uncompressed volumes, while the
//! pipeline's canonical artifacts are gzip-compressed. Decompression keeps
//! the source file (the stage's cleanup flag decides when intermediates
//! are deleted); compression removes the uncompressed original, matching
//! gzip(1).

use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;

use crate::error::DispatchError;

/// Compresses `path` to `<path>.gz`, removing the original. Returns the
/// compressed path.
pub fn gzip_file(path: &Path) -> Result<PathBuf, DispatchError> {
    let target = PathBuf::from(format!("{}.gz", path.display()));

    let mut source = File::open(path)?;
    let mut encoder = GzEncoder::new(File::create(&target)?, Compression::default());
    io::copy(&mut source, &mut encoder)?;
    encoder.finish()?;

    std::fs::remove_file(path)?;
    Ok(target)
}

/// Decompresses `<stem>.gz` to `<stem>`, keeping the original. Returns the
/// decompressed path.
pub fn gunzip_file(path: &Path) -> Result<PathBuf, DispatchError> {
    let display = path.display().to_string();
    let target = match display.strip_suffix(".gz") {
        Some(stem) => PathBuf::from(stem),
        None => PathBuf::from(format!("{display}.out")),
    };

    let mut decoder = GzDecoder::new(File::open(path)?);
    let mut out = File::create(&target)?;
    io::copy(&mut decoder, &mut out)?;

    Ok(target)
}

//! Artifact conventions: tagged filenames, directory lookup, image sets.
//!
//! Every stage of the pipeline writes files named by the same pure
//! convention (`naming`) and rediscovers upstream files by scanning
//! directories for tag matches (`lookup`). There is no central registry:
//! the filename convention *is* the contract between stages. `images`
//! provides the ordered (path-or-absent, description) collections used by
//! requirement checks, dirty checks and QA reporting.

pub mod images;
pub mod lookup;
pub mod naming;

pub use images::Images;
pub use lookup::{get_image, FsLookup, ImageLookup};
pub use naming::{build_name, split_name, DEFAULT_EXTENSION, TAG_DELIMITER};

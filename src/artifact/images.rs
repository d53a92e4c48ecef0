//! Ordered image collections for requirement, dirty and QA checks.

use std::path::PathBuf;

use serde::Serialize;

/// One (artifact-or-absent, description) pair.
#[derive(Debug, Clone, Serialize)]
pub struct ImageEntry {
    /// Resolved path, or `None` when the artifact does not exist.
    pub path: Option<PathBuf>,
    /// Human-readable description used in requirement and QA reporting.
    pub description: String,
}

/// An ordered collection of (path-or-absent, description) pairs.
///
/// Presence is fixed at construction time: entries are built from lookups
/// against the current disk state and are never mutated afterwards, except
/// by appending through [`Images::extend`]. Two aggregate predicates drive
/// the lifecycle: [`any_present`](Images::any_present) for soft
/// requirements (any upstream producer is acceptable) and
/// [`all_present`](Images::all_present) for dirty checks and QA
/// completeness.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Images {
    entries: Vec<ImageEntry>,
    information: Option<String>,
}

impl Images {
    /// Creates an empty collection.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a collection from (path-or-absent, description) pairs,
    /// preserving order.
    pub fn from_pairs<I, D>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (Option<PathBuf>, D)>,
        D: Into<String>,
    {
        let entries = pairs
            .into_iter()
            .map(|(path, description)| ImageEntry {
                path,
                description: description.into(),
            })
            .collect();
        Self {
            entries,
            information: None,
        }
    }

    /// Appends one entry.
    pub fn push(&mut self, path: Option<PathBuf>, description: impl Into<String>) {
        self.entries.push(ImageEntry {
            path,
            description: description.into(),
        });
    }

    /// True iff at least one entry's artifact is present.
    pub fn any_present(&self) -> bool {
        self.entries.iter().any(|entry| entry.path.is_some())
    }

    /// True iff every entry's artifact is present.
    ///
    /// An empty collection is trivially all-present; a stage with no
    /// declared outputs is never dirty.
    pub fn all_present(&self) -> bool {
        self.entries.iter().all(|entry| entry.path.is_some())
    }

    /// Attaches the free-text annotation consumed by QA reporting.
    pub fn set_information(&mut self, information: impl Into<String>) {
        self.information = Some(information.into());
    }

    /// The attached annotation, if any.
    pub fn information(&self) -> Option<&str> {
        self.information.as_deref()
    }

    /// Concatenates `other`'s entries after this collection's, preserving
    /// order. `other`'s annotation is discarded.
    pub fn extend(&mut self, other: Images) {
        self.entries.extend(other.entries);
    }

    /// The entries, in construction order.
    pub fn entries(&self) -> &[ImageEntry] {
        &self.entries
    }

    /// Descriptions of the absent entries, for blocked-stage reporting.
    pub fn missing(&self) -> Vec<&str> {
        self.entries
            .iter()
            .filter(|entry| entry.path.is_none())
            .map(|entry| entry.description.as_str())
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

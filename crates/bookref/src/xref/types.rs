//
// xref/types.rs
//
// Type definitions for the cross-reference index
//

use serde::{Deserialize, Serialize};

/// Rendered index for one document
///
/// Entries are raw renderer output lines in document order. A `FileIndex`
/// is always replaced as a whole, never patched.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileIndex {
    /// Path relative to the book's build root (`/`-separated)
    pub file: String,
    /// Raw index entries, one per renderer output line
    pub entries: Vec<String>,
}

impl FileIndex {
    pub fn new(file: impl Into<String>, entries: Vec<String>) -> Self {
        Self {
            file: file.into(),
            entries,
        }
    }

    /// Pair every entry with this index's file
    pub fn index_entries(&self) -> impl Iterator<Item = IndexEntry> + '_ {
        self.entries
            .iter()
            .map(|entry| IndexEntry::new(self.file.clone(), entry.clone()))
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// A raw index entry together with the document that produced it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexEntry {
    pub file: String,
    pub entry: String,
}

impl IndexEntry {
    pub fn new(file: impl Into<String>, entry: impl Into<String>) -> Self {
        Self {
            file: file.into(),
            entry: entry.into(),
        }
    }
}

/// Structured cross-reference record sent to the client
///
/// Serializes as `{"file", "type", "id", "title"}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct XRef {
    pub file: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub id: String,
    pub title: String,
}

/// Kind of change reported for a watched document
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChangeKind {
    Added,
    Modified,
    Removed,
}

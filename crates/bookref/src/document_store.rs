//
// document_store.rs
//
// Open documents as reported by the client
//

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use ropey::Rope;
use tower_lsp::lsp_types::{TextDocumentContentChangeEvent, Url};

use crate::project::normalize_path;

/// An open document
#[derive(Debug, Clone)]
pub struct OpenDocument {
    pub uri: Url,
    /// Filesystem path, for `file:` URIs
    pub path: Option<PathBuf>,
    /// File content as a rope for efficient editing
    pub contents: Rope,
    pub version: Option<i32>,
    /// Whether the buffer has edits not yet saved to disk
    pub dirty: bool,
}

impl OpenDocument {
    pub fn new(uri: Url, text: &str, version: Option<i32>) -> Self {
        let path = uri.to_file_path().ok().map(|p| normalize_path(&p));
        Self {
            uri,
            path,
            contents: Rope::from_str(text),
            version,
            dirty: false,
        }
    }

    pub fn apply_change(&mut self, change: TextDocumentContentChangeEvent) {
        match change.range {
            Some(range) => {
                let start = self.position_to_char(range.start.line, range.start.character);
                let end = self.position_to_char(range.end.line, range.end.character);
                let (start, end) = (start.min(end), start.max(end));
                self.contents.remove(start..end);
                self.contents.insert(start, &change.text);
            }
            // Full document sync
            None => self.contents = Rope::from_str(&change.text),
        }
    }

    /// Char index for an LSP position (UTF-16 columns), clamped to the document.
    fn position_to_char(&self, line: u32, character: u32) -> usize {
        let line = line as usize;
        if line >= self.contents.len_lines() {
            return self.contents.len_chars();
        }
        let line_text = self.contents.line(line).to_string();
        let line_text = line_text.trim_end_matches(['\n', '\r']);
        self.contents.line_to_char(line) + utf16_offset_to_char_offset(line_text, character as usize)
    }

    pub fn text(&self) -> String {
        self.contents.to_string()
    }
}

fn utf16_offset_to_char_offset(line_text: &str, utf16_offset: usize) -> usize {
    let mut utf16_count = 0;
    let mut char_count = 0;

    for ch in line_text.chars() {
        if utf16_count >= utf16_offset {
            return char_count;
        }
        utf16_count += ch.len_utf16();
        char_count += 1;
    }
    char_count
}

/// Documents currently open in the client, keyed by URI
#[derive(Debug, Default)]
pub struct DocumentStore {
    documents: HashMap<Url, OpenDocument>,
}

impl DocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a newly opened document. Its buffer matches disk.
    pub fn open(&mut self, uri: Url, text: &str, version: Option<i32>) -> &OpenDocument {
        log::trace!("Opened {}", uri);
        let doc = OpenDocument::new(uri.clone(), text, version);
        match self.documents.entry(uri) {
            Entry::Occupied(mut entry) => {
                entry.insert(doc);
                entry.into_mut()
            }
            Entry::Vacant(entry) => entry.insert(doc),
        }
    }

    /// Apply edits and mark the document dirty.
    pub fn update(
        &mut self,
        uri: &Url,
        changes: Vec<TextDocumentContentChangeEvent>,
        version: Option<i32>,
    ) -> Option<&OpenDocument> {
        let doc = self.documents.get_mut(uri)?;
        for change in changes {
            doc.apply_change(change);
        }
        doc.version = version;
        doc.dirty = true;
        Some(doc)
    }

    /// Mark a document saved, refreshing its text when the client sent it.
    pub fn save(&mut self, uri: &Url, text: Option<&str>) -> Option<&OpenDocument> {
        let doc = self.documents.get_mut(uri)?;
        if let Some(text) = text {
            doc.contents = Rope::from_str(text);
        }
        doc.dirty = false;
        Some(doc)
    }

    pub fn close(&mut self, uri: &Url) -> Option<OpenDocument> {
        log::trace!("Closed {}", uri);
        self.documents.remove(uri)
    }

    pub fn clear(&mut self) {
        self.documents.clear();
    }

    pub fn get_by_id(&self, uri: &Url) -> Option<&OpenDocument> {
        self.documents.get(uri)
    }

    /// Find the open document backed by `path`, if any.
    pub fn resolve_id(&self, path: &Path) -> Option<Url> {
        let path = normalize_path(path);
        self.documents
            .values()
            .find(|doc| doc.path.as_deref() == Some(path.as_path()))
            .map(|doc| doc.uri.clone())
    }

    /// Documents with unsaved edits
    pub fn dirty_documents(&self) -> impl Iterator<Item = &OpenDocument> {
        self.documents.values().filter(|doc| doc.dirty)
    }

    pub fn len(&self) -> usize {
        self.documents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }
}

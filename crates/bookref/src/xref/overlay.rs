//
// xref/overlay.rs
//
// In-memory indexes for documents with unsaved edits
//

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use tokio_util::sync::CancellationToken;
use tower_lsp::lsp_types::Url;

use super::renderer::Renderer;
use super::types::FileIndex;

/// Indexes of dirty documents, keyed by relative path.
///
/// Every mutation takes a fresh generation for its path. A render that
/// finishes after a newer mutation for the same path was issued is dropped, so
/// a slow render can't bring back a removed or outdated entry.
pub struct UnsavedOverlay {
    renderer: Arc<dyn Renderer>,
    entries: RwLock<HashMap<String, FileIndex>>,
    /// Latest generation issued per path
    latest: Mutex<HashMap<String, u64>>,
    next_generation: AtomicU64,
}

impl UnsavedOverlay {
    pub fn new(renderer: Arc<dyn Renderer>) -> Self {
        Self {
            renderer,
            entries: RwLock::new(HashMap::new()),
            latest: Mutex::new(HashMap::new()),
            next_generation: AtomicU64::new(1),
        }
    }

    /// Claim a generation for a dirty document ahead of rendering it.
    ///
    /// Any later mutation for the same path supersedes the claim, so callers
    /// should reserve while the edit state they read is still current.
    pub fn reserve(&self, relative: &str) -> u64 {
        let generation = self.next_generation.fetch_add(1, Ordering::SeqCst);
        self.latest
            .lock()
            .unwrap()
            .insert(relative.to_string(), generation);
        generation
    }

    /// Record the edit state of a document.
    ///
    /// A clean document is removed; a dirty one is rendered and replaces any
    /// prior entry. Returns whether the overlay was changed by this call.
    pub async fn update(&self, relative: &str, content: &str, dirty: bool) -> bool {
        if !dirty {
            self.remove(relative);
            return true;
        }
        let generation = self.reserve(relative);
        self.render_reserved(relative, generation, content).await
    }

    /// Render content under a generation from [`reserve`](Self::reserve).
    ///
    /// The result is published only if no newer mutation for the path was
    /// issued in the meantime.
    pub async fn render_reserved(&self, relative: &str, generation: u64, content: &str) -> bool {
        let entries = self.renderer.index(content).await;

        // Hold `latest` while publishing so a concurrent mutation can't slip in
        // between the generation check and the insert.
        let latest = self.latest.lock().unwrap();
        if latest.get(relative) != Some(&generation) {
            log::trace!("Discarding superseded overlay render for {}", relative);
            return false;
        }
        self.entries
            .write()
            .unwrap()
            .insert(relative.to_string(), FileIndex::new(relative, entries));
        drop(latest);
        log::trace!("Updated unsaved index for {}", relative);
        true
    }

    /// Drop the entry for a document, if any.
    pub fn remove(&self, relative: &str) {
        let mut latest = self.latest.lock().unwrap();
        let generation = self.next_generation.fetch_add(1, Ordering::SeqCst);
        latest.insert(relative.to_string(), generation);
        if self.entries.write().unwrap().remove(relative).is_some() {
            log::trace!("Removed unsaved index for {}", relative);
        }
    }

    /// Drop every entry and supersede all renders in flight.
    pub fn clear(&self) {
        let mut latest = self.latest.lock().unwrap();
        latest.clear();
        self.entries.write().unwrap().clear();
    }

    pub fn get(&self, relative: &str) -> Option<FileIndex> {
        self.entries.read().unwrap().get(relative).cloned()
    }

    pub fn contains(&self, relative: &str) -> bool {
        self.entries.read().unwrap().contains_key(relative)
    }

    pub fn len(&self) -> usize {
        self.entries.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Debounced overlay updates waiting to run, one per document
#[derive(Debug, Default)]
pub struct PendingOverlayUpdates {
    pending: RwLock<HashMap<Url, (u64, CancellationToken)>>,
    next_id: AtomicU64,
}

impl PendingOverlayUpdates {
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedule an update for a document, cancelling any pending one.
    /// Returns the id to pass to [`complete`](Self::complete) and the new token.
    pub fn schedule(&self, uri: Url) -> (u64, CancellationToken) {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let token = CancellationToken::new();
        let mut pending = self.pending.write().unwrap();
        if let Some((_, old_token)) = pending.insert(uri, (id, token.clone())) {
            old_token.cancel();
        }
        (id, token)
    }

    /// Mark an update as finished; a newer schedule for the URI is left alone.
    pub fn complete(&self, uri: &Url, id: u64) {
        let mut pending = self.pending.write().unwrap();
        if pending.get(uri).is_some_and(|(current, _)| *current == id) {
            pending.remove(uri);
        }
    }

    pub fn cancel(&self, uri: &Url) {
        if let Some((_, token)) = self.pending.write().unwrap().remove(uri) {
            token.cancel();
        }
    }

    pub fn cancel_all(&self) {
        let mut pending = self.pending.write().unwrap();
        for (_, (_, token)) in pending.drain() {
            token.cancel();
        }
    }

    pub fn is_pending(&self, uri: &Url) -> bool {
        self.pending.read().unwrap().contains_key(uri)
    }
}

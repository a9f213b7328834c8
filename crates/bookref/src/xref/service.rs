//
// xref/service.rs
//
// Cross-reference index service: owns the store, overlay and monitor
//

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use super::config::XrefConfig;
use super::index_store::IndexStore;
use super::monitor::ChangeMonitor;
use super::overlay::UnsavedOverlay;
use super::records::entries_to_xrefs;
use super::renderer::Renderer;
use super::types::{ChangeKind, FileIndex, IndexEntry, XRef};
use crate::project::BookProject;

/// Lists a book's documents in build order, as paths relative to the build root.
#[async_trait]
pub trait SourceEnumerator: Send + Sync {
    async fn list_project_documents(&self, build_root: &Path) -> Vec<String>;
}

/// Fixed document list
#[derive(Debug, Clone, Default)]
pub struct StaticSources(pub Vec<String>);

#[async_trait]
impl SourceEnumerator for StaticSources {
    async fn list_project_documents(&self, _build_root: &Path) -> Vec<String> {
        self.0.clone()
    }
}

/// Remembers the last enumeration until the book's layout changes.
///
/// Asking bookdown for the source list starts an R process, so the result is
/// reused until [`invalidate`](Self::invalidate) is called for a document being
/// added or removed or for an edit to `_bookdown.yml`. Empty results are not
/// kept, so a failed enumeration is retried on the next query.
pub struct CachedSources {
    inner: Arc<dyn SourceEnumerator>,
    epoch: AtomicU64,
    cached: tokio::sync::Mutex<Option<(u64, Vec<String>)>>,
}

impl CachedSources {
    pub fn new(inner: Arc<dyn SourceEnumerator>) -> Self {
        Self {
            inner,
            epoch: AtomicU64::new(0),
            cached: tokio::sync::Mutex::new(None),
        }
    }

    /// Forget the cached list; the next query enumerates again.
    pub fn invalidate(&self) {
        self.epoch.fetch_add(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl SourceEnumerator for CachedSources {
    async fn list_project_documents(&self, build_root: &Path) -> Vec<String> {
        // Held across the enumeration so concurrent queries share one run
        let mut cached = self.cached.lock().await;
        let epoch = self.epoch.load(Ordering::SeqCst);
        if let Some((cached_epoch, documents)) = cached.as_ref() {
            if *cached_epoch == epoch {
                return documents.clone();
            }
        }

        let documents = self.inner.list_project_documents(build_root).await;
        // An invalidation during the run bumps the epoch past this one
        *cached = if documents.is_empty() {
            None
        } else {
            Some((epoch, documents.clone()))
        };
        documents
    }
}

/// Overlay generation claimed for a dirty document, see
/// [`XrefService::reserve_document_update`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReservedUpdate {
    relative: String,
    generation: u64,
}

/// Normalize a document path reported by an enumerator to store form.
pub fn normalize_relative(path: &str) -> Option<String> {
    let path = path.trim().replace('\\', "/");
    let parts: Vec<&str> = path
        .split('/')
        .filter(|part| !part.is_empty() && *part != ".")
        .collect();
    if parts.is_empty() {
        None
    } else {
        Some(parts.join("/"))
    }
}

pub struct XrefService {
    config: XrefConfig,
    project: Arc<BookProject>,
    renderer: Arc<dyn Renderer>,
    store: Arc<IndexStore>,
    overlay: UnsavedOverlay,
    sources: Arc<CachedSources>,
    /// Whether the workspace is a bookdown book with bookdown available
    book_context: bool,
    monitor: Mutex<Option<ChangeMonitor>>,
}

impl XrefService {
    pub fn new(
        config: XrefConfig,
        project: Arc<BookProject>,
        renderer: Arc<dyn Renderer>,
        sources: Arc<dyn SourceEnumerator>,
        book_context: bool,
    ) -> Self {
        let store = Arc::new(IndexStore::new(
            project.xref_index_dir(),
            renderer.clone(),
        ));
        let overlay = UnsavedOverlay::new(renderer.clone());
        Self {
            config,
            project,
            renderer,
            store,
            overlay,
            sources: Arc::new(CachedSources::new(sources)),
            book_context,
            monitor: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &XrefConfig {
        &self.config
    }

    pub fn project(&self) -> &BookProject {
        &self.project
    }

    pub fn store(&self) -> &IndexStore {
        &self.store
    }

    pub fn overlay(&self) -> &UnsavedOverlay {
        &self.overlay
    }

    pub fn is_book_context(&self) -> bool {
        self.book_context
    }

    /// Start keeping the store up to date. Only books get a monitor.
    pub fn start_monitor(&self, watch_fs: bool) -> bool {
        if !self.book_context {
            log::info!("Not a bookdown project; cross-reference monitor not started");
            return false;
        }
        let mut monitor = self.monitor.lock().unwrap();
        if monitor.is_none() {
            *monitor = Some(ChangeMonitor::start(
                self.project.clone(),
                self.store.clone(),
                &self.config,
                watch_fs,
                Some(self.sources.clone()),
            ));
        }
        true
    }

    pub async fn stop_monitor(&self) {
        let monitor = self.monitor.lock().unwrap().take();
        if let Some(monitor) = monitor {
            monitor.shutdown().await;
        }
    }

    pub fn is_monitoring(&self) -> bool {
        self.monitor
            .lock()
            .unwrap()
            .as_ref()
            .is_some_and(ChangeMonitor::is_running)
    }

    /// Forward a change reported by the client's file watcher.
    pub fn notify_file_change(&self, path: PathBuf, kind: ChangeKind) {
        if let Some(monitor) = self.monitor.lock().unwrap().as_ref() {
            monitor.submit(path, kind);
        }
    }

    /// Track the edit state of an open document.
    pub async fn on_document_updated(&self, path: &Path, contents: &str, dirty: bool) {
        if !self.book_context {
            return;
        }
        if let Some(relative) = self.book_document_path(path) {
            self.overlay.update(&relative, contents, dirty).await;
        }
    }

    /// Claim an overlay update for a dirty document.
    ///
    /// Call this while the edit state that says the document is dirty is
    /// still current; a save or close after that point supersedes the claim
    /// and [`apply_reserved_update`](Self::apply_reserved_update) discards its render.
    pub fn reserve_document_update(&self, path: &Path) -> Option<ReservedUpdate> {
        if !self.book_context {
            return None;
        }
        let relative = self.book_document_path(path)?;
        let generation = self.overlay.reserve(&relative);
        Some(ReservedUpdate {
            relative,
            generation,
        })
    }

    /// Render a reserved update. Returns whether the overlay took it.
    pub async fn apply_reserved_update(&self, reserved: ReservedUpdate, contents: &str) -> bool {
        self.overlay
            .render_reserved(&reserved.relative, reserved.generation, contents)
            .await
    }

    pub fn on_document_removed(&self, path: &Path) {
        if let Some(relative) = self.book_document_path(path) {
            self.overlay.remove(&relative);
        }
    }

    pub fn on_all_documents_removed(&self) {
        self.overlay.clear();
    }

    fn book_document_path(&self, path: &Path) -> Option<String> {
        if self.project.is_book_document(path) {
            self.project.relative_path(path)
        } else {
            None
        }
    }

    /// Collect the entries of every book document, in build order.
    ///
    /// Unsaved edits win over the persisted index; documents with neither
    /// contribute nothing.
    pub async fn project_entries(&self) -> Vec<IndexEntry> {
        let documents = self
            .sources
            .list_project_documents(self.project.build_root())
            .await;

        let mut entries = Vec::new();
        for document in documents.iter().filter_map(|d| normalize_relative(d)) {
            let index = match self.overlay.get(&document) {
                Some(index) => Some(index),
                None => self.store.lookup(&document).await,
            };
            if let Some(index) = index {
                entries.extend(index.index_entries());
            }
        }
        entries
    }

    /// Cross-references visible from a document.
    ///
    /// Inside a book this is the whole book's index. Otherwise the document is
    /// rendered on its own from `open_contents`; a document that isn't open has
    /// no references.
    pub async fn xref_index_for_file(
        &self,
        path: &Path,
        open_contents: Option<&str>,
    ) -> Vec<XRef> {
        if self.book_context && self.project.contains(path) {
            let entries = self.project_entries().await;
            log::trace!(
                "Project cross-reference query for {} ({} entries)",
                path.display(),
                entries.len()
            );
            return entries_to_xrefs(&entries);
        }

        let contents = match open_contents {
            Some(contents) => contents,
            None => {
                log::trace!("{} is not open; no cross-references", path.display());
                return Vec::new();
            }
        };
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let index = FileIndex::new(file_name, self.renderer.index(contents).await);
        let entries: Vec<IndexEntry> = index.index_entries().collect();
        entries_to_xrefs(&entries)
    }

    pub async fn shutdown(&self) {
        self.overlay.clear();
        self.stop_monitor().await;
    }
}

//
// xref/monitor.rs
//
// Keeps persisted indexes in step with book documents on disk
//

use std::path::{Path, PathBuf};
use std::sync::Arc;

use notify::event::{EventKind, ModifyKind, RenameMode};
use notify::{Event, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use walkdir::WalkDir;

use super::config::XrefConfig;
use super::debounce::ChangeCoalescer;
use super::index_store::IndexStore;
use super::service::CachedSources;
use super::types::ChangeKind;
use crate::project::BookProject;

type ChangeEvent = (PathBuf, ChangeKind);

/// Subscription that watches the build root and updates the index store.
///
/// Dropping the monitor stops its watcher and worker.
pub struct ChangeMonitor {
    sender: mpsc::UnboundedSender<ChangeEvent>,
    cancellation_token: CancellationToken,
    worker_handle: Option<JoinHandle<()>>,
    _watcher: Option<RecommendedWatcher>,
}

impl ChangeMonitor {
    /// Start the worker, scan the build root, and optionally watch it.
    ///
    /// Every document found by the scan is submitted as added, so indexes
    /// that are missing or older than their document get rebuilt. `sources`
    /// is invalidated whenever documents come or go or `_bookdown.yml` changes.
    pub fn start(
        project: Arc<BookProject>,
        store: Arc<IndexStore>,
        config: &XrefConfig,
        watch_fs: bool,
        sources: Option<Arc<CachedSources>>,
    ) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        let cancellation_token = CancellationToken::new();

        let worker_handle = tokio::spawn(run_worker(
            project.clone(),
            store,
            sources,
            receiver,
            cancellation_token.clone(),
            ChangeCoalescer::new(
                config.settle_delay(),
                config.initial_scan_grace(),
                Instant::now(),
            ),
        ));

        let watcher = if watch_fs {
            match create_watcher(project.build_root(), sender.clone()) {
                Ok(watcher) => Some(watcher),
                Err(e) => {
                    log::warn!(
                        "Failed to watch {}: {}",
                        project.build_root().display(),
                        e
                    );
                    None
                }
            }
        } else {
            None
        };

        let scan_root = project.build_root().to_path_buf();
        let scan_sender = sender.clone();
        tokio::task::spawn_blocking(move || {
            let found = scan_documents(&scan_root);
            log::info!(
                "Found {} book documents under {}",
                found.len(),
                scan_root.display()
            );
            for path in found {
                if scan_sender.send((path, ChangeKind::Added)).is_err() {
                    break;
                }
            }
        });

        Self {
            sender,
            cancellation_token,
            worker_handle: Some(worker_handle),
            _watcher: watcher,
        }
    }

    /// Feed an externally observed change (e.g. from the editor) into the monitor.
    pub fn submit(&self, path: PathBuf, kind: ChangeKind) {
        if self.sender.send((path, kind)).is_err() {
            log::trace!("Change monitor stopped, dropping event");
        }
    }

    pub fn is_running(&self) -> bool {
        !self.cancellation_token.is_cancelled()
    }

    /// Stop watching and wait for the worker to exit.
    pub async fn shutdown(mut self) {
        self.cancellation_token.cancel();
        if let Some(handle) = self.worker_handle.take() {
            let _ = handle.await;
        }
    }
}

impl Drop for ChangeMonitor {
    fn drop(&mut self) {
        self.cancellation_token.cancel();
    }
}

async fn run_worker(
    project: Arc<BookProject>,
    store: Arc<IndexStore>,
    sources: Option<Arc<CachedSources>>,
    mut receiver: mpsc::UnboundedReceiver<ChangeEvent>,
    token: CancellationToken,
    mut coalescer: ChangeCoalescer,
) {
    log::info!(
        "Change monitor started for {}",
        project.build_root().display()
    );
    let mut in_flight = JoinSet::new();

    loop {
        let deadline = coalescer.next_deadline();
        tokio::select! {
            _ = token.cancelled() => {
                break;
            }
            event = receiver.recv() => {
                match event {
                    Some((path, kind)) => {
                        if project.is_book_document(&path) {
                            log::trace!("Change {:?} for {}", kind, path.display());
                            if kind != ChangeKind::Modified {
                                invalidate_sources(&sources);
                            }
                            coalescer.push(path, kind, Instant::now());
                        } else if project.is_book_config(&path) {
                            log::trace!("Book configuration changed");
                            invalidate_sources(&sources);
                        } else if project.contains(&path) && kind != ChangeKind::Modified {
                            let changes = expand_directory_change(
                                project.clone(),
                                store.clone(),
                                path,
                                kind,
                            )
                            .await;
                            if !changes.is_empty() {
                                invalidate_sources(&sources);
                            }
                            let now = Instant::now();
                            for (path, kind) in changes {
                                coalescer.push(path, kind, now);
                            }
                        }
                    }
                    None => break,
                }
            }
            _ = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                let ready = coalescer.take_ready(Instant::now());
                if !ready.is_empty() {
                    log::trace!("Dispatching {} settled changes", ready.len());
                }
                for (path, kind) in ready {
                    let project = project.clone();
                    let store = store.clone();
                    in_flight.spawn(async move {
                        dispatch_change(&project, &store, &path, kind).await;
                    });
                }
            }
            Some(result) = in_flight.join_next(), if !in_flight.is_empty() => {
                if let Err(e) = result {
                    log::warn!("Index update task failed: {}", e);
                }
            }
        }
    }

    in_flight.abort_all();
    log::info!("Change monitor stopped");
}

fn invalidate_sources(sources: &Option<Arc<CachedSources>>) {
    if let Some(sources) = sources {
        sources.invalidate();
    }
}

/// Apply one settled change to the store.
///
/// Added documents are only reindexed when their index is missing or stale;
/// modified documents always are; removed documents lose their index.
pub async fn dispatch_change(
    project: &BookProject,
    store: &IndexStore,
    path: &Path,
    kind: ChangeKind,
) {
    let relative = match project.relative_path(path) {
        Some(relative) => relative,
        None => return,
    };
    match kind {
        ChangeKind::Added => {
            store.reindex_if_stale(&relative, path).await;
        }
        ChangeKind::Modified => {
            store.reindex(&relative, path).await;
        }
        ChangeKind::Removed => store.evict(&relative).await,
    }
}

async fn expand_directory_change(
    project: Arc<BookProject>,
    store: Arc<IndexStore>,
    path: PathBuf,
    kind: ChangeKind,
) -> Vec<ChangeEvent> {
    tokio::task::spawn_blocking(move || directory_changes(&project, &store, &path, kind))
        .await
        .unwrap_or_default()
}

/// Per-document changes implied by a change to a directory.
///
/// A directory that appeared contributes every document found under it; one
/// that went away contributes every document that still has a stored index
/// beneath it. Anything else yields nothing.
pub fn directory_changes(
    project: &BookProject,
    store: &IndexStore,
    path: &Path,
    kind: ChangeKind,
) -> Vec<ChangeEvent> {
    match kind {
        ChangeKind::Added if path.is_dir() => {
            let found = scan_documents(path);
            log::trace!(
                "Directory {} added with {} documents",
                path.display(),
                found.len()
            );
            found
                .into_iter()
                .map(|doc| (doc, ChangeKind::Added))
                .collect()
        }
        ChangeKind::Removed if !path.exists() => {
            let relative = match project.relative_path(path) {
                Some(relative) => relative,
                None => return Vec::new(),
            };
            let stored = store.stored_documents_under(&relative);
            if !stored.is_empty() {
                log::trace!(
                    "Directory {} removed with {} indexed documents",
                    path.display(),
                    stored.len()
                );
            }
            stored
                .iter()
                .map(|doc| (project.absolute_path(doc), ChangeKind::Removed))
                .collect()
        }
        _ => Vec::new(),
    }
}

/// Map a filesystem notification onto document changes.
pub fn classify_event(event: &Event) -> Vec<ChangeEvent> {
    let all = |kind: ChangeKind| -> Vec<ChangeEvent> {
        event.paths.iter().map(|p| (p.clone(), kind)).collect()
    };

    match &event.kind {
        EventKind::Create(_) => all(ChangeKind::Added),
        EventKind::Remove(_) => all(ChangeKind::Removed),
        EventKind::Modify(ModifyKind::Name(RenameMode::From)) => all(ChangeKind::Removed),
        EventKind::Modify(ModifyKind::Name(RenameMode::To)) => all(ChangeKind::Added),
        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) => {
            let mut changes = Vec::with_capacity(2);
            if let Some(from) = event.paths.first() {
                changes.push((from.clone(), ChangeKind::Removed));
            }
            if let Some(to) = event.paths.get(1) {
                changes.push((to.clone(), ChangeKind::Added));
            }
            changes
        }
        // Direction unknown: decide by whether the path is still there
        EventKind::Modify(ModifyKind::Name(_)) => event
            .paths
            .iter()
            .map(|p| {
                let kind = if p.exists() {
                    ChangeKind::Added
                } else {
                    ChangeKind::Removed
                };
                (p.clone(), kind)
            })
            .collect(),
        EventKind::Modify(_) => all(ChangeKind::Modified),
        EventKind::Access(_) | EventKind::Any | EventKind::Other => Vec::new(),
    }
}

fn create_watcher(
    root: &Path,
    sender: mpsc::UnboundedSender<ChangeEvent>,
) -> notify::Result<RecommendedWatcher> {
    let mut watcher = notify::recommended_watcher(move |result: notify::Result<Event>| {
        match result {
            Ok(event) => {
                for change in classify_event(&event) {
                    let _ = sender.send(change);
                }
            }
            Err(e) => log::warn!("File watcher error: {}", e),
        }
    })?;
    watcher.watch(root, RecursiveMode::Recursive)?;
    log::info!("Watching {} for document changes", root.display());
    Ok(watcher)
}

/// Find every `.Rmd` file under `root`, skipping hidden directories.
pub fn scan_documents(root: &Path) -> Vec<PathBuf> {
    WalkDir::new(root)
        .follow_links(false)
        .into_iter()
        .filter_entry(|entry| {
            entry.depth() == 0
                || !entry.file_name().to_string_lossy().starts_with('.')
        })
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file())
        .filter(|entry| crate::project::has_rmd_extension(entry.path()))
        .map(|entry| entry.into_path())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::EchoRenderer;
    use notify::event::{CreateKind, DataChange, RemoveKind};
    use std::time::Duration;

    fn fast_config() -> XrefConfig {
        XrefConfig {
            settle_delay_ms: 20,
            initial_scan_grace_ms: 50,
            ..XrefConfig::default()
        }
    }

    fn setup(dir: &Path) -> (Arc<BookProject>, Arc<IndexStore>, Arc<EchoRenderer>) {
        let project = Arc::new(BookProject::new(dir.join("book"), dir.join("cache")));
        std::fs::create_dir_all(project.build_root()).unwrap();
        let renderer = Arc::new(EchoRenderer::new());
        let store = Arc::new(IndexStore::new(project.xref_index_dir(), renderer.clone()));
        (project, store, renderer)
    }

    async fn wait_for<F, Fut>(mut check: F) -> bool
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = bool>,
    {
        for _ in 0..200 {
            if check().await {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        false
    }

    #[test]
    fn test_classify_event() {
        let p = PathBuf::from("/b/ch1.Rmd");
        let q = PathBuf::from("/b/ch2.Rmd");

        let create = Event::new(EventKind::Create(CreateKind::File)).add_path(p.clone());
        assert_eq!(classify_event(&create), vec![(p.clone(), ChangeKind::Added)]);

        let remove = Event::new(EventKind::Remove(RemoveKind::File)).add_path(p.clone());
        assert_eq!(classify_event(&remove), vec![(p.clone(), ChangeKind::Removed)]);

        let write = Event::new(EventKind::Modify(ModifyKind::Data(DataChange::Content)))
            .add_path(p.clone());
        assert_eq!(classify_event(&write), vec![(p.clone(), ChangeKind::Modified)]);

        let from = Event::new(EventKind::Modify(ModifyKind::Name(RenameMode::From)))
            .add_path(p.clone());
        assert_eq!(classify_event(&from), vec![(p.clone(), ChangeKind::Removed)]);

        let to = Event::new(EventKind::Modify(ModifyKind::Name(RenameMode::To)))
            .add_path(q.clone());
        assert_eq!(classify_event(&to), vec![(q.clone(), ChangeKind::Added)]);

        let both = Event::new(EventKind::Modify(ModifyKind::Name(RenameMode::Both)))
            .add_path(p.clone())
            .add_path(q.clone());
        assert_eq!(
            classify_event(&both),
            vec![(p.clone(), ChangeKind::Removed), (q, ChangeKind::Added)]
        );

        let access = Event::new(EventKind::Access(notify::event::AccessKind::Any)).add_path(p);
        assert!(classify_event(&access).is_empty());
    }

    #[test]
    fn test_scan_documents() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        std::fs::create_dir_all(root.join("parts")).unwrap();
        std::fs::create_dir_all(root.join(".git")).unwrap();
        std::fs::write(root.join("index.Rmd"), "").unwrap();
        std::fs::write(root.join("parts/ch1.rmd"), "").unwrap();
        std::fs::write(root.join("notes.md"), "").unwrap();
        std::fs::write(root.join(".git/stash.Rmd"), "").unwrap();

        let mut found = scan_documents(root);
        found.sort();
        assert_eq!(found, vec![root.join("index.Rmd"), root.join("parts/ch1.rmd")]);
    }

    #[tokio::test]
    async fn test_dispatch_change() {
        let dir = tempfile::tempdir().unwrap();
        let (project, store, renderer) = setup(dir.path());
        let doc = project.build_root().join("ch1.Rmd");
        std::fs::write(&doc, "fig:a A\n").unwrap();

        dispatch_change(&project, &store, &doc, ChangeKind::Added).await;
        assert_eq!(renderer.calls(), 1);

        // Index is newer than the document: an add is skipped, a modify is not
        let later = std::time::SystemTime::now() + Duration::from_secs(60);
        std::fs::OpenOptions::new()
            .write(true)
            .open(store.index_file_path("ch1.Rmd"))
            .unwrap()
            .set_modified(later)
            .unwrap();
        dispatch_change(&project, &store, &doc, ChangeKind::Added).await;
        assert_eq!(renderer.calls(), 1);
        dispatch_change(&project, &store, &doc, ChangeKind::Modified).await;
        assert_eq!(renderer.calls(), 2);

        dispatch_change(&project, &store, &doc, ChangeKind::Removed).await;
        assert!(store.lookup("ch1.Rmd").await.is_none());

        // Outside the build root: ignored
        let outside = dir.path().join("elsewhere.Rmd");
        std::fs::write(&outside, "x").unwrap();
        dispatch_change(&project, &store, &outside, ChangeKind::Modified).await;
        assert_eq!(renderer.calls(), 2);
    }

    #[tokio::test]
    async fn test_initial_scan_indexes_documents() {
        let dir = tempfile::tempdir().unwrap();
        let (project, store, _) = setup(dir.path());
        std::fs::write(project.build_root().join("intro.Rmd"), "h1:intro Intro\n").unwrap();
        std::fs::write(project.build_root().join("README.md"), "h1:x X\n").unwrap();

        let monitor =
            ChangeMonitor::start(project.clone(), store.clone(), &fast_config(), false, None);
        assert!(
            wait_for(|| {
                let store = store.clone();
                async move { store.lookup("intro.Rmd").await.is_some() }
            })
            .await
        );
        assert_eq!(
            store.lookup("intro.Rmd").await.unwrap().entries,
            vec!["h1:intro Intro"]
        );
        assert!(store.lookup("README.md").await.is_none());
        monitor.shutdown().await;
    }

    #[tokio::test]
    async fn test_submitted_changes_are_coalesced() {
        let dir = tempfile::tempdir().unwrap();
        let (project, store, renderer) = setup(dir.path());
        let monitor =
            ChangeMonitor::start(project.clone(), store.clone(), &fast_config(), false, None);

        let doc = project.build_root().join("ch1.Rmd");
        std::fs::write(&doc, "fig:a A\n").unwrap();
        for _ in 0..5 {
            monitor.submit(doc.clone(), ChangeKind::Modified);
        }
        assert!(
            wait_for(|| {
                let store = store.clone();
                async move { store.lookup("ch1.Rmd").await.is_some() }
            })
            .await
        );
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(renderer.calls(), 1);

        monitor.submit(doc.clone(), ChangeKind::Removed);
        assert!(
            wait_for(|| {
                let store = store.clone();
                async move { store.lookup("ch1.Rmd").await.is_none() }
            })
            .await
        );
        monitor.shutdown().await;
    }

    #[tokio::test]
    async fn test_directory_changes() {
        let dir = tempfile::tempdir().unwrap();
        let (project, store, _) = setup(dir.path());
        let parts = project.build_root().join("parts");
        std::fs::create_dir_all(parts.join("deep")).unwrap();
        std::fs::write(parts.join("ch1.Rmd"), "").unwrap();
        std::fs::write(parts.join("deep/ch2.Rmd"), "").unwrap();
        std::fs::write(parts.join("data.csv"), "").unwrap();

        let mut added = directory_changes(&project, &store, &parts, ChangeKind::Added);
        added.sort_by(|a, b| a.0.cmp(&b.0));
        assert_eq!(
            added,
            vec![
                (parts.join("ch1.Rmd"), ChangeKind::Added),
                (parts.join("deep/ch2.Rmd"), ChangeKind::Added),
            ]
        );
        // A directory that still exists is not removed
        assert!(directory_changes(&project, &store, &parts, ChangeKind::Removed).is_empty());

        store.write("gone/ch3.Rmd", &["fig:a A".into()]).await.unwrap();
        store.write("gone/sub/ch4.Rmd", &["fig:b B".into()]).await.unwrap();
        store.write("kept/ch5.Rmd", &["fig:c C".into()]).await.unwrap();
        let gone = project.build_root().join("gone");
        let mut removed = directory_changes(&project, &store, &gone, ChangeKind::Removed);
        removed.sort_by(|a, b| a.0.cmp(&b.0));
        assert_eq!(
            removed,
            vec![
                (gone.join("ch3.Rmd"), ChangeKind::Removed),
                (gone.join("sub").join("ch4.Rmd"), ChangeKind::Removed),
            ]
        );

        // Plain files and modifications expand to nothing
        let csv = parts.join("data.csv");
        assert!(directory_changes(&project, &store, &csv, ChangeKind::Added).is_empty());
        assert!(directory_changes(&project, &store, &parts, ChangeKind::Modified).is_empty());
    }

    #[tokio::test]
    async fn test_directory_rename_moves_indexes() {
        let dir = tempfile::tempdir().unwrap();
        let (project, store, _) = setup(dir.path());
        let old_dir = project.build_root().join("parts");
        std::fs::create_dir_all(&old_dir).unwrap();
        std::fs::write(old_dir.join("ch1.Rmd"), "fig:a A\n").unwrap();

        let monitor =
            ChangeMonitor::start(project.clone(), store.clone(), &fast_config(), false, None);
        assert!(
            wait_for(|| {
                let store = store.clone();
                async move { store.lookup("parts/ch1.Rmd").await.is_some() }
            })
            .await
        );

        // What a watcher reports for `mv parts chapters`
        let new_dir = project.build_root().join("chapters");
        std::fs::rename(&old_dir, &new_dir).unwrap();
        let rename = Event::new(EventKind::Modify(ModifyKind::Name(RenameMode::Both)))
            .add_path(old_dir.clone())
            .add_path(new_dir.clone());
        for (path, kind) in classify_event(&rename) {
            monitor.submit(path, kind);
        }

        assert!(
            wait_for(|| {
                let store = store.clone();
                async move {
                    store.lookup("chapters/ch1.Rmd").await.is_some()
                        && store.lookup("parts/ch1.Rmd").await.is_none()
                }
            })
            .await,
            "documents under a renamed directory should follow it"
        );
        assert_eq!(
            store.lookup("chapters/ch1.Rmd").await.unwrap().entries,
            vec!["fig:a A"]
        );
        monitor.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_stops_processing() {
        let dir = tempfile::tempdir().unwrap();
        let (project, store, renderer) = setup(dir.path());
        let monitor =
            ChangeMonitor::start(project.clone(), store.clone(), &fast_config(), false, None);
        assert!(monitor.is_running());
        monitor.shutdown().await;

        // The scan may still be running, but nothing reaches the store
        std::fs::write(project.build_root().join("late.Rmd"), "x\n").unwrap();
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(renderer.calls(), 0);
    }
}

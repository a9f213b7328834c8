//
// xref/index_store.rs
//
// On-disk per-document index files
//

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use anyhow::{Context, Result};
use dashmap::DashMap;
use tokio::sync::Mutex;
use walkdir::WalkDir;

use super::renderer::Renderer;
use super::types::FileIndex;

/// Extension appended to a document's relative path to name its index file
pub const INDEX_FILE_EXTENSION: &str = "xref";

/// Serialize entries: each entry followed by a newline.
pub fn encode_entries(entries: &[String]) -> String {
    let mut out = String::with_capacity(entries.iter().map(|e| e.len() + 1).sum());
    for entry in entries {
        out.push_str(entry);
        out.push('\n');
    }
    out
}

/// Parse an index file body written by [`encode_entries`].
///
/// One trailing newline is stripped before splitting, so an empty file is an
/// empty index and blank entries survive the round trip.
pub fn decode_entries(body: &str) -> Vec<String> {
    if body.is_empty() {
        return Vec::new();
    }
    // A file holding a single "\n" is one blank entry
    let body = body.strip_suffix('\n').unwrap_or(body);
    body.split('\n').map(str::to_string).collect()
}

/// Persisted index files, one per document, under the project's index directory
pub struct IndexStore {
    dir: PathBuf,
    renderer: Arc<dyn Renderer>,
    /// Per-document write locks so concurrent reindexes don't interleave
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl IndexStore {
    pub fn new(dir: PathBuf, renderer: Arc<dyn Renderer>) -> Self {
        Self {
            dir,
            renderer,
            locks: DashMap::new(),
        }
    }

    /// Index file location for a document's relative path
    pub fn index_file_path(&self, relative: &str) -> PathBuf {
        let file_name = format!("{}.{}", relative, INDEX_FILE_EXTENSION);
        file_name
            .split('/')
            .filter(|part| !part.is_empty())
            .fold(self.dir.clone(), |acc, part| acc.join(part))
    }

    /// Relative paths of every stored index under a directory of the book.
    ///
    /// Used when a whole directory disappears and its documents can no longer
    /// be listed from the source tree.
    pub fn stored_documents_under(&self, relative_dir: &str) -> Vec<String> {
        let base = relative_dir
            .split('/')
            .filter(|part| !part.is_empty())
            .fold(self.dir.clone(), |acc, part| acc.join(part));
        if !base.is_dir() {
            return Vec::new();
        }
        let suffix = format!(".{}", INDEX_FILE_EXTENSION);
        WalkDir::new(&base)
            .into_iter()
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_type().is_file())
            .filter_map(|entry| {
                let relative = entry.path().strip_prefix(&self.dir).ok()?;
                let relative: Vec<String> = relative
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy().into_owned())
                    .collect();
                relative.join("/").strip_suffix(&suffix).map(str::to_string)
            })
            .collect()
    }

    fn lock_for(&self, relative: &str) -> Arc<Mutex<()>> {
        self.locks
            .entry(relative.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Render `source` and replace the stored index for `relative`.
    ///
    /// An unreadable source is logged and leaves the stored index untouched.
    pub async fn reindex(&self, relative: &str, source: &Path) -> bool {
        let lock = self.lock_for(relative);
        let _guard = lock.lock().await;

        let content = match tokio::fs::read(source).await {
            Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
            Err(e) => {
                log::warn!("Failed to read {}: {}", source.display(), e);
                return false;
            }
        };

        let entries = self.renderer.index(&content).await;
        match self.write(relative, &entries).await {
            Ok(()) => {
                log::trace!("Indexed {} ({} entries)", relative, entries.len());
                true
            }
            Err(e) => {
                log::warn!("Failed to write index for {}: {:#}", relative, e);
                false
            }
        }
    }

    /// Reindex only when the stored index is missing or older than `source`.
    pub async fn reindex_if_stale(&self, relative: &str, source: &Path) -> bool {
        if self.is_fresh(relative, source).await {
            log::trace!("Index for {} is up to date", relative);
            return false;
        }
        self.reindex(relative, source).await
    }

    /// An index is fresh when it exists and is strictly newer than its source.
    pub async fn is_fresh(&self, relative: &str, source: &Path) -> bool {
        let index_time = modified_time(&self.index_file_path(relative)).await;
        let source_time = modified_time(source).await;
        match (index_time, source_time) {
            (Some(index_time), Some(source_time)) => index_time > source_time,
            _ => false,
        }
    }

    /// Delete the stored index for a document (a missing file is not an error).
    pub async fn evict(&self, relative: &str) {
        let lock = self.lock_for(relative);
        let _guard = lock.lock().await;

        let path = self.index_file_path(relative);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => log::trace!("Removed index for {}", relative),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => log::warn!("Failed to remove {}: {}", path.display(), e),
        }
        drop(_guard);
        drop(lock);
        // Keep the lock while anyone else holds or waits on it; the count is
        // checked under the shard lock, which `lock_for` also takes.
        self.locks
            .remove_if(relative, |_, lock| Arc::strong_count(lock) == 1);
    }

    /// Read the stored index for a document, if any.
    pub async fn lookup(&self, relative: &str) -> Option<FileIndex> {
        let path = self.index_file_path(relative);
        match tokio::fs::read(&path).await {
            Ok(bytes) => {
                let body = String::from_utf8_lossy(&bytes);
                Some(FileIndex::new(relative, decode_entries(&body)))
            }
            Err(e) => {
                if e.kind() != std::io::ErrorKind::NotFound {
                    log::warn!("Failed to read {}: {}", path.display(), e);
                }
                None
            }
        }
    }

    /// Write entries through a temporary file so readers never see a partial index.
    pub async fn write(&self, relative: &str, entries: &[String]) -> Result<()> {
        let path = self.index_file_path(relative);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }

        let tmp = path.with_extension(format!("{}.tmp", INDEX_FILE_EXTENSION));
        tokio::fs::write(&tmp, encode_entries(entries))
            .await
            .with_context(|| format!("Failed to write {}", tmp.display()))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .with_context(|| format!("Failed to move index into place at {}", path.display()))?;
        Ok(())
    }
}

async fn modified_time(path: &Path) -> Option<SystemTime> {
    tokio::fs::metadata(path).await.ok()?.modified().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::EchoRenderer;
    use std::time::Duration;

    fn set_mtime(path: &Path, time: SystemTime) {
        let file = std::fs::OpenOptions::new().write(true).open(path).unwrap();
        file.set_modified(time).unwrap();
    }

    fn store(dir: &Path) -> (IndexStore, Arc<EchoRenderer>) {
        let renderer = Arc::new(EchoRenderer::new());
        (IndexStore::new(dir.join("idx"), renderer.clone()), renderer)
    }

    #[test]
    fn test_encode_decode() {
        assert_eq!(encode_entries(&[]), "");
        assert_eq!(encode_entries(&["a".into(), "b".into()]), "a\nb\n");
        assert!(decode_entries("").is_empty());
        assert_eq!(decode_entries("a\nb\n"), vec!["a", "b"]);
        assert_eq!(decode_entries("a\n\nb\n"), vec!["a", "", "b"]);
        assert_eq!(decode_entries("\n"), vec![""]);
        assert_eq!(decode_entries(&encode_entries(&["".into()])), vec![""]);
        // A file written without the final newline still reads back
        assert_eq!(decode_entries("a\nb"), vec!["a", "b"]);
    }

    #[test]
    fn test_index_file_path() {
        let s = IndexStore::new(PathBuf::from("/cache/bookdown-xrefs"), Arc::new(EchoRenderer::new()));
        assert_eq!(
            s.index_file_path("parts/ch1.Rmd"),
            PathBuf::from("/cache/bookdown-xrefs/parts/ch1.Rmd.xref")
        );
    }

    #[tokio::test]
    async fn test_reindex_and_lookup() {
        let dir = tempfile::tempdir().unwrap();
        let (store, _) = store(dir.path());
        let source = dir.path().join("ch1.Rmd");
        std::fs::write(&source, "h1:ch1 Chapter One\nfig:plot A plot\n").unwrap();

        assert!(store.lookup("ch1.Rmd").await.is_none());
        assert!(store.reindex("ch1.Rmd", &source).await);

        let index = store.lookup("ch1.Rmd").await.unwrap();
        assert_eq!(index.file, "ch1.Rmd");
        assert_eq!(index.entries, vec!["h1:ch1 Chapter One", "fig:plot A plot"]);
    }

    #[tokio::test]
    async fn test_empty_render_is_stored() {
        let dir = tempfile::tempdir().unwrap();
        let (store, _) = store(dir.path());
        let source = dir.path().join("empty.Rmd");
        std::fs::write(&source, "").unwrap();

        assert!(store.reindex("empty.Rmd", &source).await);
        let index = store.lookup("empty.Rmd").await.unwrap();
        assert!(index.is_empty());
    }

    #[tokio::test]
    async fn test_unreadable_source_keeps_old_index() {
        let dir = tempfile::tempdir().unwrap();
        let (store, _) = store(dir.path());
        store.write("gone.Rmd", &["fig:a A".into()]).await.unwrap();

        assert!(!store.reindex("gone.Rmd", &dir.path().join("gone.Rmd")).await);
        assert_eq!(
            store.lookup("gone.Rmd").await.unwrap().entries,
            vec!["fig:a A"]
        );
    }

    #[tokio::test]
    async fn test_freshness() {
        let dir = tempfile::tempdir().unwrap();
        let (store, renderer) = store(dir.path());
        let source = dir.path().join("ch1.Rmd");
        std::fs::write(&source, "fig:a A\n").unwrap();

        // No index yet
        assert!(!store.is_fresh("ch1.Rmd", &source).await);
        assert!(store.reindex_if_stale("ch1.Rmd", &source).await);
        assert_eq!(renderer.calls(), 1);

        let now = SystemTime::now();
        set_mtime(&source, now - Duration::from_secs(60));
        set_mtime(&store.index_file_path("ch1.Rmd"), now);
        assert!(store.is_fresh("ch1.Rmd", &source).await);
        assert!(!store.reindex_if_stale("ch1.Rmd", &source).await);
        assert_eq!(renderer.calls(), 1);

        // Equal timestamps are not fresh
        set_mtime(&source, now);
        assert!(!store.is_fresh("ch1.Rmd", &source).await);

        set_mtime(&source, now + Duration::from_secs(60));
        assert!(store.reindex_if_stale("ch1.Rmd", &source).await);
        assert_eq!(renderer.calls(), 2);
    }

    /// Renderer that records how many renders overlap
    #[derive(Default)]
    struct OverlapRenderer {
        active: std::sync::atomic::AtomicUsize,
        max_active: std::sync::atomic::AtomicUsize,
    }

    #[async_trait::async_trait]
    impl Renderer for OverlapRenderer {
        async fn index(&self, content: &str) -> Vec<String> {
            use std::sync::atomic::Ordering;
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_active.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(100)).await;
            self.active.fetch_sub(1, Ordering::SeqCst);
            content.lines().map(str::to_string).collect()
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_evict_keeps_reindexes_serialized() {
        let dir = tempfile::tempdir().unwrap();
        let renderer = Arc::new(OverlapRenderer::default());
        let store = Arc::new(IndexStore::new(dir.path().join("idx"), renderer.clone()));
        let source = dir.path().join("ch1.Rmd");
        std::fs::write(&source, "fig:a A\n").unwrap();

        let reindex = |store: &Arc<IndexStore>| {
            let store = store.clone();
            let source = source.clone();
            tokio::spawn(async move { store.reindex("ch1.Rmd", &source).await })
        };

        let first = reindex(&store);
        tokio::time::sleep(Duration::from_millis(20)).await;
        let evict = {
            let store = store.clone();
            tokio::spawn(async move { store.evict("ch1.Rmd").await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        // Queued behind the evict on the same lock
        let second = reindex(&store);
        evict.await.unwrap();
        // Arrives after the evict finished
        let third = reindex(&store);

        assert!(first.await.unwrap());
        assert!(second.await.unwrap());
        assert!(third.await.unwrap());
        assert_eq!(
            renderer.max_active.load(std::sync::atomic::Ordering::SeqCst),
            1,
            "renders for one document must not overlap"
        );
        assert_eq!(store.lookup("ch1.Rmd").await.unwrap().entries, vec!["fig:a A"]);

        // With nobody waiting, evicting releases the lock entry
        store.evict("ch1.Rmd").await;
        assert!(store.locks.is_empty());
    }

    #[tokio::test]
    async fn test_evict() {
        let dir = tempfile::tempdir().unwrap();
        let (store, _) = store(dir.path());
        store.write("sub/ch2.Rmd", &["tab:t T".into()]).await.unwrap();
        assert!(store.index_file_path("sub/ch2.Rmd").exists());

        store.evict("sub/ch2.Rmd").await;
        assert!(store.lookup("sub/ch2.Rmd").await.is_none());
        // Evicting again is a no-op
        store.evict("sub/ch2.Rmd").await;
    }

    #[tokio::test]
    async fn test_stored_documents_under() {
        let dir = tempfile::tempdir().unwrap();
        let (store, _) = store(dir.path());
        store.write("ch1.Rmd", &["fig:a A".into()]).await.unwrap();
        store.write("parts/ch2.Rmd", &["fig:b B".into()]).await.unwrap();
        store.write("parts/deep/ch3.Rmd", &["fig:c C".into()]).await.unwrap();
        std::fs::write(
            store.index_file_path("parts/ch4.Rmd").with_extension("xref.tmp"),
            "",
        )
        .unwrap();

        let mut stored = store.stored_documents_under("parts");
        stored.sort();
        assert_eq!(stored, vec!["parts/ch2.Rmd", "parts/deep/ch3.Rmd"]);
        assert!(store.stored_documents_under("missing").is_empty());
    }
}

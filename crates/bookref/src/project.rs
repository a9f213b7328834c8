//
// project.rs
//
// Book project model: build root, document identity and cache location
//

use std::hash::Hasher;
use std::path::{Component, Path, PathBuf};

use fnv::FnvHasher;
use url::Url;

use crate::xref::XrefConfig;

/// Name of the directory holding per-document index files
pub const XREF_INDEX_DIR: &str = "bookdown-xrefs";

/// Book configuration file at the build root
pub const BOOKDOWN_CONFIG_FILE: &str = "_bookdown.yml";

/// A bookdown project rooted at a build directory
#[derive(Debug, Clone)]
pub struct BookProject {
    /// Build root as configured (lexically normalized)
    build_root: PathBuf,
    /// Build root with symlinks resolved, when it differs
    canonical_root: Option<PathBuf>,
    /// Project-scoped scratch directory
    cache_dir: PathBuf,
}

impl BookProject {
    pub fn new(build_root: PathBuf, cache_dir: PathBuf) -> Self {
        let build_root = normalize_path(&build_root);
        let canonical_root = std::fs::canonicalize(&build_root)
            .ok()
            .filter(|c| *c != build_root);
        Self {
            build_root,
            canonical_root,
            cache_dir,
        }
    }

    /// Derive the project for a workspace root and configuration.
    pub fn from_workspace(workspace_root: &Path, config: &XrefConfig) -> Self {
        let build_root = match &config.build_target {
            Some(target) => workspace_root.join(target),
            None => workspace_root.to_path_buf(),
        };
        let build_root = normalize_path(&build_root);
        let cache_root = config
            .cache_dir
            .clone()
            .unwrap_or_else(default_cache_root);
        let cache_dir = cache_root.join(project_cache_name(&build_root));
        Self::new(build_root, cache_dir)
    }

    pub fn build_root(&self) -> &Path {
        &self.build_root
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    /// Directory holding one `.xref` file per indexed document
    pub fn xref_index_dir(&self) -> PathBuf {
        self.cache_dir.join(XREF_INDEX_DIR)
    }

    /// Path relative to the build root, `/`-separated, if `path` lies within it.
    ///
    /// The comparison is lexical so deleted files still resolve.
    pub fn relative_path(&self, path: &Path) -> Option<String> {
        let path = normalize_path(path);
        let relative = path.strip_prefix(&self.build_root).ok().or_else(|| {
            self.canonical_root
                .as_ref()
                .and_then(|root| path.strip_prefix(root).ok())
        })?;

        let parts: Vec<_> = relative
            .components()
            .filter_map(|c| match c {
                Component::Normal(part) => Some(part.to_string_lossy()),
                _ => None,
            })
            .collect();
        if parts.is_empty() {
            return None;
        }
        Some(parts.join("/"))
    }

    /// Whether `path` lies within the build root (the root itself included)
    pub fn contains(&self, path: &Path) -> bool {
        let path = normalize_path(path);
        path.starts_with(&self.build_root)
            || self
                .canonical_root
                .as_ref()
                .is_some_and(|root| path.starts_with(root))
    }

    /// Whether `path` is an R Markdown document inside the build root
    pub fn is_book_document(&self, path: &Path) -> bool {
        has_rmd_extension(path) && self.relative_path(path).is_some()
    }

    /// Whether `path` is the book's `_bookdown.yml`
    pub fn is_book_config(&self, path: &Path) -> bool {
        self.relative_path(path).as_deref() == Some(BOOKDOWN_CONFIG_FILE)
    }

    /// Absolute path for a document's relative path
    pub fn absolute_path(&self, relative: &str) -> PathBuf {
        relative
            .split('/')
            .filter(|part| !part.is_empty() && *part != ".")
            .fold(self.build_root.clone(), |acc, part| acc.join(part))
    }

    /// Check whether the build root holds a bookdown book.
    ///
    /// A book has a `_bookdown.yml`, or an `index.Rmd` whose YAML front matter
    /// names a `bookdown::` output or site generator.
    pub fn is_bookdown_book(&self) -> bool {
        if self.build_root.join(BOOKDOWN_CONFIG_FILE).is_file() {
            return true;
        }
        match std::fs::read_to_string(self.build_root.join("index.Rmd")) {
            Ok(content) => front_matter_mentions_bookdown(&content),
            Err(_) => false,
        }
    }
}

/// Case-insensitive `.Rmd` extension check
pub fn has_rmd_extension(path: &Path) -> bool {
    path.extension()
        .map(|ext| ext.to_string_lossy().eq_ignore_ascii_case("rmd"))
        .unwrap_or(false)
}

fn front_matter_mentions_bookdown(content: &str) -> bool {
    let mut lines = content.lines();
    if lines.next().map(str::trim_end) != Some("---") {
        return false;
    }
    lines
        .take_while(|line| {
            let line = line.trim_end();
            line != "---" && line != "..."
        })
        .any(|line| line.contains("bookdown::"))
}

/// Fold `.` and `..` components without touching the filesystem.
pub fn normalize_path(path: &Path) -> PathBuf {
    let mut normalized = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !normalized.pop() {
                    normalized.push(component);
                }
            }
            other => normalized.push(other),
        }
    }
    normalized
}

/// Resolve a client-supplied document path.
///
/// Accepts `file://` URIs, `~`-prefixed paths and absolute paths; relative
/// paths are taken relative to `workspace_root`.
pub fn resolve_document_path(document_path: &str, workspace_root: Option<&Path>) -> Option<PathBuf> {
    let document_path = document_path.trim();
    if document_path.is_empty() {
        return None;
    }

    if document_path.starts_with("file:") {
        let url = Url::parse(document_path).ok()?;
        return url.to_file_path().ok().map(|p| normalize_path(&p));
    }

    let expanded = if document_path == "~" || document_path.starts_with("~/") {
        let home = home_dir()?;
        home.join(document_path.trim_start_matches('~').trim_start_matches('/'))
    } else {
        PathBuf::from(document_path)
    };

    if expanded.is_absolute() {
        Some(normalize_path(&expanded))
    } else {
        workspace_root.map(|root| normalize_path(&root.join(expanded)))
    }
}

fn home_dir() -> Option<PathBuf> {
    std::env::var_os("HOME")
        .or_else(|| std::env::var_os("USERPROFILE"))
        .map(PathBuf::from)
}

/// Root of the per-user cache, shared by all projects
pub fn default_cache_root() -> PathBuf {
    #[cfg(unix)]
    {
        if let Ok(dirs) = xdg::BaseDirectories::with_prefix("bookref") {
            return dirs.get_cache_home();
        }
    }
    std::env::temp_dir().join("bookref")
}

/// Directory name that scopes a cache to one build root
///
/// FNV-1a over the path text, so the name is the same across toolchains.
fn project_cache_name(build_root: &Path) -> String {
    let mut hasher = FnvHasher::default();
    hasher.write(build_root.to_string_lossy().as_bytes());
    let stem = build_root
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "root".to_string());
    format!("{}-{:016x}", stem, hasher.finish())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn project(root: &str) -> BookProject {
        BookProject::new(PathBuf::from(root), PathBuf::from("/tmp/cache"))
    }

    #[test]
    fn test_relative_path() {
        let p = project("/work/book");
        assert_eq!(
            p.relative_path(Path::new("/work/book/intro.Rmd")),
            Some("intro.Rmd".to_string())
        );
        assert_eq!(
            p.relative_path(Path::new("/work/book/parts/ch1.Rmd")),
            Some("parts/ch1.Rmd".to_string())
        );
        assert_eq!(
            p.relative_path(Path::new("/work/book/parts/../ch2.Rmd")),
            Some("ch2.Rmd".to_string())
        );
        assert_eq!(p.relative_path(Path::new("/work/other/ch1.Rmd")), None);
        assert_eq!(p.relative_path(Path::new("/work/book")), None);
        // A sibling directory sharing the prefix is not inside the book
        assert_eq!(p.relative_path(Path::new("/work/book2/ch1.Rmd")), None);
    }

    #[test]
    fn test_same_document_same_key() {
        let p = project("/work/book");
        let on_disk = Path::new("/work/book/./ch1.Rmd");
        let uri = Url::parse("file:///work/book/ch1.Rmd").unwrap();
        let from_editor = uri.to_file_path().unwrap();
        assert_eq!(p.relative_path(on_disk), p.relative_path(&from_editor));
    }

    #[test]
    fn test_is_book_document() {
        let p = project("/work/book");
        assert!(p.is_book_document(Path::new("/work/book/ch1.Rmd")));
        assert!(p.is_book_document(Path::new("/work/book/ch1.rmd")));
        assert!(p.is_book_document(Path::new("/work/book/sub/ch1.RMD")));
        assert!(!p.is_book_document(Path::new("/work/book/ch1.md")));
        assert!(!p.is_book_document(Path::new("/work/book/script.R")));
        assert!(!p.is_book_document(Path::new("/elsewhere/ch1.Rmd")));
    }

    #[test]
    fn test_is_book_config() {
        let p = project("/work/book");
        assert!(p.is_book_config(Path::new("/work/book/_bookdown.yml")));
        assert!(!p.is_book_config(Path::new("/work/book/parts/_bookdown.yml")));
        assert!(!p.is_book_config(Path::new("/work/_bookdown.yml")));
    }

    #[test]
    fn test_absolute_path_round_trip() {
        let p = project("/work/book");
        let abs = p.absolute_path("parts/ch1.Rmd");
        assert_eq!(abs, PathBuf::from("/work/book/parts/ch1.Rmd"));
        assert_eq!(p.relative_path(&abs), Some("parts/ch1.Rmd".to_string()));
    }

    #[test]
    fn test_contains() {
        let p = project("/work/book");
        assert!(p.contains(Path::new("/work/book")));
        assert!(p.contains(Path::new("/work/book/ch1.Rmd")));
        assert!(!p.contains(Path::new("/work")));
    }

    #[test]
    fn test_normalize_path() {
        assert_eq!(
            normalize_path(Path::new("/a/./b/../c")),
            PathBuf::from("/a/c")
        );
        assert_eq!(normalize_path(Path::new("a/../../b")), PathBuf::from("../b"));
    }

    #[test]
    fn test_front_matter_detection() {
        assert!(front_matter_mentions_bookdown(
            "---\ntitle: A Book\nsite: bookdown::bookdown_site\n---\n# Preface\n"
        ));
        assert!(!front_matter_mentions_bookdown(
            "---\ntitle: Not a book\n---\nbookdown::gitbook is mentioned later\n"
        ));
        assert!(!front_matter_mentions_bookdown("# No front matter\n"));
    }

    #[test]
    fn test_is_bookdown_book() {
        let dir = tempfile::tempdir().unwrap();
        let p = BookProject::new(dir.path().to_path_buf(), dir.path().join(".cache"));
        assert!(!p.is_bookdown_book());

        std::fs::write(
            dir.path().join("index.Rmd"),
            "---\nsite: bookdown::bookdown_site\n---\n",
        )
        .unwrap();
        assert!(p.is_bookdown_book());

        std::fs::write(dir.path().join("index.Rmd"), "# Plain\n").unwrap();
        assert!(!p.is_bookdown_book());

        std::fs::write(dir.path().join("_bookdown.yml"), "book_filename: x\n").unwrap();
        assert!(p.is_bookdown_book());
    }

    #[test]
    fn test_from_workspace_scopes_cache() {
        let config = XrefConfig {
            build_target: Some(PathBuf::from("book")),
            cache_dir: Some(PathBuf::from("/cache")),
            ..XrefConfig::default()
        };
        let a = BookProject::from_workspace(Path::new("/work/a"), &config);
        let b = BookProject::from_workspace(Path::new("/work/b"), &config);
        assert_eq!(a.build_root(), Path::new("/work/a/book"));
        assert!(a.cache_dir().starts_with("/cache"));
        assert_ne!(a.cache_dir(), b.cache_dir());
        assert_eq!(a.xref_index_dir(), a.cache_dir().join("bookdown-xrefs"));
    }

    #[test]
    fn test_project_cache_name_is_stable() {
        assert_eq!(
            project_cache_name(Path::new("/work/book")),
            "book-a83a2dfef886c909"
        );
        assert_eq!(
            project_cache_name(Path::new("/work/book")),
            project_cache_name(Path::new("/work/book"))
        );
        assert_ne!(
            project_cache_name(Path::new("/work/book")),
            project_cache_name(Path::new("/other/book"))
        );
    }

    #[test]
    fn test_resolve_document_path() {
        let root = Path::new("/work/book");
        assert_eq!(
            resolve_document_path("file:///work/book/ch1.Rmd", None),
            Some(PathBuf::from("/work/book/ch1.Rmd"))
        );
        assert_eq!(
            resolve_document_path("/work/book/./ch1.Rmd", None),
            Some(PathBuf::from("/work/book/ch1.Rmd"))
        );
        assert_eq!(
            resolve_document_path("ch1.Rmd", Some(root)),
            Some(PathBuf::from("/work/book/ch1.Rmd"))
        );
        assert_eq!(resolve_document_path("ch1.Rmd", None), None);
        assert_eq!(resolve_document_path("  ", Some(root)), None);
    }

    #[test]
    fn test_resolve_tilde_path() {
        if let Some(home) = home_dir() {
            assert_eq!(
                resolve_document_path("~/book/ch1.Rmd", None),
                Some(normalize_path(&home.join("book/ch1.Rmd")))
            );
        }
    }
}

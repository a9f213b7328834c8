//
// xref/config.rs
//
// Configuration for the cross-reference index
//

use std::path::PathBuf;
use std::time::Duration;

/// Pandoc input format used when indexing chapters
pub const DEFAULT_INPUT_FORMAT: &str = "markdown-auto_identifiers";

/// Cross-reference index configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct XrefConfig {
    /// Path to the pandoc executable (discovered when unset)
    pub pandoc_path: Option<PathBuf>,
    /// Path to the R executable (discovered when unset)
    pub r_path: Option<PathBuf>,
    /// Book directory relative to the workspace root (the root itself when unset)
    pub build_target: Option<PathBuf>,
    /// Cache directory override
    pub cache_dir: Option<PathBuf>,
    /// Pandoc `--from` format
    pub input_format: String,
    /// Lua writer override (the bundled writer is used when unset)
    pub filter_path: Option<PathBuf>,
    /// Quiet period before a burst of file events is dispatched
    pub settle_delay_ms: u64,
    /// Hold-off after the watcher starts, covering the initial scan
    pub initial_scan_grace_ms: u64,
    /// Maximum time a single pandoc run may take
    pub renderer_timeout_ms: u64,
    /// Maximum number of concurrent pandoc processes
    pub max_concurrent_renders: usize,
    /// Delay before an edited document's unsaved index is recomputed
    pub overlay_debounce_ms: u64,
    /// Whether the book directory is watched for changes
    pub watch_enabled: bool,
}

impl Default for XrefConfig {
    fn default() -> Self {
        Self {
            pandoc_path: None,
            r_path: None,
            build_target: None,
            cache_dir: None,
            input_format: DEFAULT_INPUT_FORMAT.to_string(),
            filter_path: None,
            settle_delay_ms: 500,
            initial_scan_grace_ms: 3000,
            renderer_timeout_ms: 30_000,
            max_concurrent_renders: 4,
            overlay_debounce_ms: 300,
            watch_enabled: true,
        }
    }
}

impl XrefConfig {
    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    pub fn initial_scan_grace(&self) -> Duration {
        Duration::from_millis(self.initial_scan_grace_ms)
    }

    pub fn renderer_timeout(&self) -> Duration {
        Duration::from_millis(self.renderer_timeout_ms)
    }

    pub fn overlay_debounce(&self) -> Duration {
        Duration::from_millis(self.overlay_debounce_ms)
    }

    /// Check if settings that shape the index itself changed.
    ///
    /// When this returns true the index service has to be rebuilt; the overlay
    /// debounce alone can change without touching it.
    pub fn index_settings_changed(&self, other: &Self) -> bool {
        let mut a = self.clone();
        a.overlay_debounce_ms = other.overlay_debounce_ms;
        a != *other
    }
}

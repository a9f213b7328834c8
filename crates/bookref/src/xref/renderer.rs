//
// xref/renderer.rs
//
// Pandoc adapter that extracts raw cross-reference entries from document text
//

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::sync::Semaphore;

use super::config::XrefConfig;

/// Lua writer that prints one index entry per line
pub const XREF_WRITER: &str = include_str!("../../resources/xref.lua");

/// File name used when the bundled writer is installed on disk
pub const XREF_WRITER_FILE_NAME: &str = "xref.lua";

/// Something that turns document text into raw index entries.
///
/// Implementations never fail: problems are logged and reported as an empty
/// entry list, so indexing can never break a query.
#[async_trait]
pub trait Renderer: Send + Sync {
    async fn index(&self, content: &str) -> Vec<String>;
}

/// Renderer used when no pandoc executable could be found
#[derive(Debug, Default)]
pub struct NullRenderer;

#[async_trait]
impl Renderer for NullRenderer {
    async fn index(&self, _content: &str) -> Vec<String> {
        log::trace!("No renderer available, returning empty index");
        Vec::new()
    }
}

/// Runs `pandoc --from <format> --to <writer>` with document text on stdin
pub struct PandocRenderer {
    pandoc_path: PathBuf,
    input_format: String,
    writer_path: PathBuf,
    timeout: Duration,
    permits: Arc<Semaphore>,
}

impl PandocRenderer {
    /// Create a renderer for a known pandoc executable (not validated).
    pub fn new(pandoc_path: PathBuf, writer_path: PathBuf, config: &XrefConfig) -> Self {
        Self {
            pandoc_path,
            input_format: config.input_format.clone(),
            writer_path,
            timeout: config.renderer_timeout(),
            permits: Arc::new(Semaphore::new(config.max_concurrent_renders.max(1))),
        }
    }

    /// Create a renderer when a pandoc executable can be validated or discovered.
    ///
    /// `config.pandoc_path` is used when set and valid; otherwise pandoc is looked up
    /// via `RSTUDIO_PANDOC`, the `PATH`, and common install locations.
    pub fn discover(config: &XrefConfig, writer_path: PathBuf) -> Option<Self> {
        let path = match &config.pandoc_path {
            Some(p) => {
                if is_valid_pandoc_executable(p) {
                    Some(p.clone())
                } else {
                    log::warn!("Configured pandoc path is not valid: {:?}", p);
                    None
                }
            }
            None => discover_pandoc_path(),
        };

        path.map(|pandoc_path| {
            log::info!("Using pandoc executable at: {:?}", pandoc_path);
            Self::new(pandoc_path, writer_path, config)
        })
    }

    /// Run pandoc and return its stdout.
    ///
    /// The child is killed if it does not finish within the configured timeout.
    async fn run(&self, content: &str) -> Result<String> {
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|e| anyhow!("Renderer pool closed: {e}"))?;
        let start = Instant::now();

        let mut cmd = Command::new(&self.pandoc_path);
        cmd.arg("--from")
            .arg(&self.input_format)
            .arg("--to")
            .arg(&self.writer_path)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd
            .spawn()
            .map_err(|e| anyhow!("Failed to spawn pandoc: {e}"))?;

        // Feed stdin from a separate task so a large document can't deadlock
        // against a full stdout pipe.
        let stdin_task = child.stdin.take().map(|mut stdin| {
            let input = content.to_owned();
            tokio::spawn(async move {
                let result = stdin.write_all(input.as_bytes()).await;
                drop(stdin);
                result
            })
        });

        let output = match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(result) => result.context("Failed to wait for pandoc")?,
            Err(_) => {
                return Err(anyhow!("pandoc timed out after {:?}", self.timeout));
            }
        };

        if let Some(task) = stdin_task {
            match task.await {
                Ok(Err(e)) if e.kind() != std::io::ErrorKind::BrokenPipe => {
                    log::trace!("Failed to write document to pandoc stdin: {}", e);
                }
                _ => {}
            }
        }

        log::trace!(
            "pandoc finished in {:?} ({} bytes in)",
            start.elapsed(),
            content.len()
        );

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(anyhow!(
                "pandoc failed with status {}: {}",
                output.status,
                stderr.trim()
            ));
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

#[async_trait]
impl Renderer for PandocRenderer {
    async fn index(&self, content: &str) -> Vec<String> {
        match self.run(content).await {
            Ok(stdout) => parse_entries_output(&stdout),
            Err(e) => {
                log::warn!("Cross-reference indexing failed: {:#}", e);
                Vec::new()
            }
        }
    }
}

/// Split renderer output into raw entries, one per line.
///
/// Line terminators (`\n` or `\r\n`) are removed; blank lines are kept.
pub fn parse_entries_output(output: &str) -> Vec<String> {
    output.lines().map(str::to_string).collect()
}

/// Write the bundled Lua writer into `dir` and return its path.
///
/// The file is only rewritten when its contents differ.
pub fn install_writer(dir: &Path) -> Result<PathBuf> {
    std::fs::create_dir_all(dir)
        .with_context(|| format!("Failed to create {}", dir.display()))?;
    let path = dir.join(XREF_WRITER_FILE_NAME);
    let current = std::fs::read_to_string(&path).ok();
    if current.as_deref() != Some(XREF_WRITER) {
        std::fs::write(&path, XREF_WRITER)
            .with_context(|| format!("Failed to write {}", path.display()))?;
        log::trace!("Installed xref writer at {}", path.display());
    }
    Ok(path)
}

/// Locate pandoc: `RSTUDIO_PANDOC`, then the `PATH`, then common locations.
fn discover_pandoc_path() -> Option<PathBuf> {
    if let Some(dir) = std::env::var_os("RSTUDIO_PANDOC") {
        let candidate = PathBuf::from(dir).join(pandoc_binary_name());
        if is_valid_pandoc_executable(&candidate) {
            return Some(candidate);
        }
    }

    if let Some(path) = find_pandoc_in_path() {
        return Some(path);
    }

    common_pandoc_paths()
        .into_iter()
        .find(|p| is_valid_pandoc_executable(p))
}

fn pandoc_binary_name() -> &'static str {
    if cfg!(windows) {
        "pandoc.exe"
    } else {
        "pandoc"
    }
}

fn find_pandoc_in_path() -> Option<PathBuf> {
    let finder = if cfg!(windows) { "where" } else { "which" };
    let output = std::process::Command::new(finder)
        .arg("pandoc")
        .output()
        .ok()?;
    if !output.status.success() {
        return None;
    }

    // `where` may return several lines; take the first one
    let stdout = String::from_utf8_lossy(&output.stdout);
    let first = stdout.lines().next()?.trim();
    let path = PathBuf::from(first);
    is_valid_pandoc_executable(&path).then_some(path)
}

fn common_pandoc_paths() -> Vec<PathBuf> {
    let mut paths = Vec::new();

    #[cfg(target_os = "macos")]
    {
        paths.push(PathBuf::from("/opt/homebrew/bin/pandoc"));
        paths.push(PathBuf::from("/usr/local/bin/pandoc"));
        paths.push(PathBuf::from(
            "/Applications/RStudio.app/Contents/Resources/app/quarto/bin/tools/pandoc",
        ));
    }

    #[cfg(target_os = "linux")]
    {
        paths.push(PathBuf::from("/usr/bin/pandoc"));
        paths.push(PathBuf::from("/usr/local/bin/pandoc"));
        paths.push(PathBuf::from(
            "/usr/lib/rstudio/resources/app/bin/quarto/bin/tools/pandoc",
        ));
        paths.push(PathBuf::from("/opt/quarto/bin/tools/pandoc"));
    }

    #[cfg(target_os = "windows")]
    {
        paths.push(PathBuf::from("C:\\Program Files\\Pandoc\\pandoc.exe"));
        paths.push(PathBuf::from(
            "C:\\Program Files\\RStudio\\resources\\app\\bin\\quarto\\bin\\tools\\pandoc.exe",
        ));
    }

    paths
}

/// A path is a usable pandoc if it exists and `--version` reports pandoc.
fn is_valid_pandoc_executable(path: &Path) -> bool {
    if !path.exists() {
        return false;
    }
    match std::process::Command::new(path).arg("--version").output() {
        Ok(output) => {
            let stdout = String::from_utf8_lossy(&output.stdout);
            output.status.success() && stdout.to_lowercase().starts_with("pandoc")
        }
        Err(_) => false,
    }
}

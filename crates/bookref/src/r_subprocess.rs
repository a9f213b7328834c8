// r_subprocess.rs - R subprocess interface for bookdown queries
//
// Asks R whether bookdown is installed and which source files make up a
// book, in the order bookdown builds them.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::process::Command;

use crate::xref::SourceEnumerator;

/// R subprocess interface
#[derive(Debug, Clone)]
pub struct RSubprocess {
    /// Path to R executable
    r_path: PathBuf,
    /// Working directory for R subprocess
    working_dir: Option<PathBuf>,
    timeout: Duration,
}

impl RSubprocess {
    /// Default timeout for R subprocess calls
    pub const SUBPROCESS_TIMEOUT: Duration = Duration::from_secs(30);

    /// Creates an RSubprocess when an R executable can be validated or discovered.
    ///
    /// A provided path is validated and used on success; without one, R is
    /// looked up on the `PATH` and then in common install locations.
    pub fn new(r_path: Option<PathBuf>) -> Option<Self> {
        let path = match r_path {
            Some(p) => {
                if Self::is_valid_r_executable(&p) {
                    Some(p)
                } else {
                    log::warn!("Configured R path is not valid: {:?}", p);
                    None
                }
            }
            None => Self::discover_r_path(),
        };

        path.map(|r_path| {
            log::trace!("Using R executable at: {:?}", r_path);
            Self::with_executable(r_path)
        })
    }

    /// Use `r_path` as-is, without validation.
    pub fn with_executable(r_path: PathBuf) -> Self {
        Self {
            r_path,
            working_dir: None,
            timeout: Self::SUBPROCESS_TIMEOUT,
        }
    }

    /// Set the working directory for the R subprocess
    pub fn with_working_dir(mut self, path: PathBuf) -> Self {
        self.working_dir = Some(path);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Get the path to the R executable
    pub fn r_path(&self) -> &Path {
        &self.r_path
    }

    fn discover_r_path() -> Option<PathBuf> {
        if let Some(path) = Self::find_r_in_path() {
            return Some(path);
        }
        Self::get_common_r_paths()
            .into_iter()
            .find(|p| Self::is_valid_r_executable(p))
    }

    fn find_r_in_path() -> Option<PathBuf> {
        let finder = if cfg!(windows) { "where" } else { "which" };
        let output = std::process::Command::new(finder).arg("R").output().ok()?;
        if !output.status.success() {
            return None;
        }

        // `where` may return multiple lines; take the first one
        let stdout = String::from_utf8_lossy(&output.stdout);
        let path = PathBuf::from(stdout.lines().next()?.trim());
        Self::is_valid_r_executable(&path).then_some(path)
    }

    fn get_common_r_paths() -> Vec<PathBuf> {
        let mut paths = Vec::new();

        #[cfg(target_os = "macos")]
        {
            paths.push(PathBuf::from("/opt/homebrew/bin/R"));
            paths.push(PathBuf::from("/usr/local/bin/R"));
            paths.push(PathBuf::from(
                "/Library/Frameworks/R.framework/Resources/bin/R",
            ));
        }

        #[cfg(target_os = "linux")]
        {
            paths.push(PathBuf::from("/usr/bin/R"));
            paths.push(PathBuf::from("/usr/local/bin/R"));
            if let Ok(home) = std::env::var("HOME") {
                paths.push(PathBuf::from(format!("{}/miniconda3/bin/R", home)));
                paths.push(PathBuf::from(format!("{}/.local/bin/R", home)));
            }
        }

        #[cfg(target_os = "windows")]
        {
            if let Ok(entries) = std::fs::read_dir("C:\\Program Files\\R") {
                for entry in entries.flatten() {
                    paths.push(entry.path().join("bin").join("R.exe"));
                }
            }
        }

        paths
    }

    /// A path is a working R if `--version` succeeds or reports an R version.
    fn is_valid_r_executable(path: &Path) -> bool {
        if !path.exists() {
            return false;
        }

        match std::process::Command::new(path).arg("--version").output() {
            Ok(output) => {
                // R --version writes to stderr on some platforms
                let version_output = String::from_utf8_lossy(&output.stderr);
                output.status.success() || version_output.contains("R version")
            }
            Err(_) => false,
        }
    }

    /// Run an R expression and return its stdout.
    ///
    /// The process is killed if it outlives the configured timeout.
    pub async fn execute_r_code(&self, r_code: &str) -> Result<String> {
        let start = std::time::Instant::now();

        let mut cmd = Command::new(&self.r_path);
        cmd.args(["--vanilla", "--slave", "-e", r_code]);

        if let Some(wd) = &self.working_dir {
            cmd.current_dir(wd);
        }

        cmd.stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true);
        let child = cmd
            .spawn()
            .map_err(|e| anyhow!("Failed to spawn R subprocess: {e}"))?;
        let output = match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(result) => result.map_err(|e| anyhow!("Failed to execute R subprocess: {e}"))?,
            Err(_) => {
                return Err(anyhow!("R subprocess timed out after {:?}", self.timeout));
            }
        };

        log::trace!("R subprocess call took {:?}", start.elapsed());

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(anyhow!(
                "R subprocess failed with status {}: {}",
                output.status,
                stderr.trim()
            ));
        }

        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    /// Check whether an R package can be loaded.
    pub async fn is_package_installed(&self, package: &str) -> bool {
        if !is_valid_package_name(package) {
            log::warn!("Refusing to query invalid package name: {:?}", package);
            return false;
        }

        let r_code = format!(
            r#"cat(if (requireNamespace("{}", quietly = TRUE)) "TRUE" else "FALSE")"#,
            package
        );
        match self.execute_r_code(&r_code).await {
            Ok(output) => parse_logical_output(&output),
            Err(e) => {
                log::trace!("Failed to check for package {}: {}", package, e);
                false
            }
        }
    }

    /// List a book's source files in build order, relative to `build_root`.
    pub async fn bookdown_source_files(&self, build_root: &Path) -> Result<Vec<String>> {
        let r = self.clone().with_working_dir(build_root.to_path_buf());
        let output = r
            .execute_r_code(r#"cat(bookdown:::source_files(), sep = "\n")"#)
            .await?;
        Ok(parse_source_files_output(&output))
    }
}

#[async_trait]
impl SourceEnumerator for RSubprocess {
    async fn list_project_documents(&self, build_root: &Path) -> Vec<String> {
        match self.bookdown_source_files(build_root).await {
            Ok(files) => {
                log::trace!("bookdown lists {} source files", files.len());
                files
            }
            Err(e) => {
                log::warn!("Failed to list bookdown source files: {:#}", e);
                Vec::new()
            }
        }
    }
}

/// Parse a `TRUE`/`FALSE` printed with `cat()`.
fn parse_logical_output(output: &str) -> bool {
    output.trim() == "TRUE"
}

/// Parse one relative path per line, dropping blanks and a leading `./`.
fn parse_source_files_output(output: &str) -> Vec<String> {
    output
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(|line| line.strip_prefix("./").unwrap_or(line).replace('\\', "/"))
        .collect()
}

/// Validate an R package name before it is spliced into R code.
///
/// Names are ASCII letters, digits, dots and underscores, starting with a
/// letter, or with a dot followed by a letter.
fn is_valid_package_name(name: &str) -> bool {
    let mut chars = name.chars();
    let valid_start = match chars.next() {
        Some('.') => chars.next().is_some_and(|c| c.is_ascii_alphabetic()),
        Some(c) => c.is_ascii_alphabetic(),
        None => false,
    };
    valid_start
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '_')
}

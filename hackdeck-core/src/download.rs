//! Repository fetcher: validates repository URLs and clones them into per-job snapshots.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::Url;
use tokio::io::AsyncReadExt;
use tokio::process::Command;

use crate::config::PipelineSettings;
use crate::contract::RepositoryFetcher;
use crate::error::{PipelineError, Result};

/// Name prefix of every snapshot directory; the reaper touches nothing else.
pub const SNAPSHOT_PREFIX: &str = "hackdeck-";

static PATH_SEGMENT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[A-Za-z0-9_.-]+$").unwrap_or_else(|e| panic!("static regex: {e}"))
});

/// A validated repository reference of the form `<scheme>://<host>/.../<owner>/<repo>[.git]`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RepositoryUrl {
    raw: String,
    normalized: String,
    owner: String,
    name: String,
}

impl RepositoryUrl {
    /// Parse with the default policy: `https`/`http`, any host.
    pub fn parse(raw: &str) -> Result<Self> {
        Self::parse_with(raw, &["https".to_string(), "http".to_string()], &[])
    }

    /// Parse against an explicit scheme and host allow-list (empty `hosts` accepts any host).
    pub fn parse_with(raw: &str, schemes: &[String], hosts: &[String]) -> Result<Self> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(PipelineError::invalid_repository(raw, "URL cannot be empty"));
        }
        let url = Url::parse(raw)
            .map_err(|e| PipelineError::invalid_repository(raw, format!("Invalid URL format: {e}")))?;

        if !schemes.iter().any(|s| s.eq_ignore_ascii_case(url.scheme())) {
            return Err(PipelineError::invalid_repository(
                raw,
                format!("unsupported scheme '{}'", url.scheme()),
            ));
        }
        let host = url.host_str().unwrap_or_default().to_ascii_lowercase();
        if host.is_empty() && url.scheme() != "file" {
            return Err(PipelineError::invalid_repository(raw, "URL has no host"));
        }
        if !hosts.is_empty() && !hosts.iter().any(|h| h.eq_ignore_ascii_case(&host)) {
            return Err(PipelineError::invalid_repository(
                raw,
                format!("host '{host}' is not allowed"),
            ));
        }
        if url.query().is_some() || url.fragment().is_some() {
            return Err(PipelineError::invalid_repository(
                raw,
                "repository URL must not carry a query or fragment",
            ));
        }

        let segments: Vec<&str> = url.path().split('/').filter(|s| !s.is_empty()).collect();
        if segments.len() < 2 {
            return Err(PipelineError::invalid_repository(
                raw,
                "expected a repository path like /owner/repository",
            ));
        }
        if let Some(bad) = segments.iter().find(|s| !PATH_SEGMENT.is_match(s)) {
            return Err(PipelineError::invalid_repository(
                raw,
                format!("invalid path segment '{bad}'"),
            ));
        }
        let owner = segments[segments.len() - 2].to_string();
        let name = segments[segments.len() - 1]
            .trim_end_matches(".git")
            .to_string();
        if name.is_empty() {
            return Err(PipelineError::invalid_repository(raw, "repository name is empty"));
        }

        let mut path = segments[..segments.len() - 1].join("/");
        path.push('/');
        path.push_str(&name);
        let normalized = match url.port() {
            Some(port) => format!("{}://{host}:{port}/{path}", url.scheme()),
            None => format!("{}://{host}/{path}", url.scheme()),
        };

        Ok(Self {
            raw: raw.to_string(),
            normalized,
            owner,
            name,
        })
    }

    /// The URL handed to `git`.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Scheme, lower-cased host and path without trailing slash or `.git`; used as cache key.
    #[must_use]
    pub fn normalized(&self) -> &str {
        &self.normalized
    }

    #[must_use]
    pub fn owner(&self) -> &str {
        &self.owner
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Filesystem-safe `<owner>_<repo>` used as the snapshot directory prefix.
    #[must_use]
    pub fn slug(&self) -> String {
        format!("{}_{}", self.owner, self.name)
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect()
    }
}

impl std::fmt::Display for RepositoryUrl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.raw)
    }
}

/// A local, per-job clone of a repository.
///
/// The directory is removed when the snapshot is cleaned up or dropped, unless it was
/// explicitly [`persist`](Self::persist)ed.
#[derive(Debug)]
pub struct RepositorySnapshot {
    path: PathBuf,
    size_bytes: u64,
    file_count: usize,
    commit: Option<String>,
    released: bool,
}

impl RepositorySnapshot {
    #[must_use]
    pub fn new(path: PathBuf, size_bytes: u64, file_count: usize, commit: Option<String>) -> Self {
        Self {
            path,
            size_bytes,
            file_count,
            commit,
            released: false,
        }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[must_use]
    pub const fn size_bytes(&self) -> u64 {
        self.size_bytes
    }

    #[must_use]
    pub const fn file_count(&self) -> usize {
        self.file_count
    }

    #[must_use]
    pub fn commit(&self) -> Option<&str> {
        self.commit.as_deref()
    }

    /// Delete the snapshot directory. A missing directory is not an error.
    pub fn cleanup(mut self) -> io::Result<()> {
        self.released = true;
        remove_dir_if_present(&self.path)
    }

    /// Keep the directory on disk for inspection; the caller (or the reaper) owns it now.
    pub fn persist(mut self) -> PathBuf {
        self.released = true;
        self.path.clone()
    }
}

impl Drop for RepositorySnapshot {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let Err(e) = remove_dir_if_present(&self.path) {
            tracing::error!(error = ?e, path = %self.path.display(), "Failed to remove dropped snapshot");
        } else {
            tracing::debug!(path = %self.path.display(), "Removed dropped snapshot");
        }
    }
}

fn remove_dir_if_present(path: &Path) -> io::Result<()> {
    match fs::remove_dir_all(path) {
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}

/// Settings the git fetcher needs, extracted from [`PipelineSettings`].
#[derive(Debug, Clone)]
pub struct FetchSettings {
    pub temp_repo_dir: PathBuf,
    pub max_repo_size_bytes: u64,
    pub clone_timeout: Duration,
    /// How often the clone directory is measured while `git` runs.
    pub poll_interval: Duration,
}

impl From<&PipelineSettings> for FetchSettings {
    fn from(settings: &PipelineSettings) -> Self {
        Self {
            temp_repo_dir: settings.temp_repo_dir.clone(),
            max_repo_size_bytes: settings.max_repo_size_bytes(),
            clone_timeout: settings.clone_timeout(),
            poll_interval: Duration::from_millis(500),
        }
    }
}

/// Fetcher backed by the `git` command line client.
pub struct GitFetcher {
    settings: FetchSettings,
    git: PathBuf,
}

impl GitFetcher {
    pub fn new(settings: FetchSettings) -> Self {
        Self {
            settings,
            git: PathBuf::from("git"),
        }
    }

    /// Use a specific `git` executable.
    #[must_use]
    pub fn with_git_binary(mut self, git: impl Into<PathBuf>) -> Self {
        self.git = git.into();
        self
    }

    fn git_command(&self) -> Command {
        let mut cmd = Command::new(&self.git);
        cmd.env("GIT_TERMINAL_PROMPT", "0")
            .stdin(Stdio::null())
            .kill_on_drop(true);
        cmd
    }

    async fn head_commit(&self, path: &Path) -> Option<String> {
        let output = self
            .git_command()
            .arg("-C")
            .arg(path)
            .args(["rev-parse", "HEAD"])
            .stderr(Stdio::null())
            .output()
            .await
            .ok()?;
        output
            .status
            .success()
            .then(|| String::from_utf8_lossy(&output.stdout).trim().to_string())
            .filter(|s| !s.is_empty())
    }
}

#[async_trait::async_trait]
impl RepositoryFetcher for GitFetcher {
    async fn resolve_reference(&self, url: &RepositoryUrl) -> Result<String> {
        tracing::debug!(repo_url = %url, "Resolving remote HEAD");
        let output = self
            .git_command()
            .args(["ls-remote", url.as_str(), "HEAD"])
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output();
        let output = tokio::time::timeout(self.settings.clone_timeout, output)
            .await
            .map_err(|_| PipelineError::clone_failed("git ls-remote timed out"))?
            .map_err(|e| PipelineError::clone_failed(format!("Failed to launch git: {e}")))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            tracing::error!(repo_url = %url, status = ?output.status, stderr = %stderr.trim(), "git ls-remote failed");
            return Err(classify_git_failure(url, &stderr));
        }
        let stdout = String::from_utf8_lossy(&output.stdout);
        stdout
            .lines()
            .find_map(|line| line.split_whitespace().next())
            .map(str::to_string)
            .ok_or_else(|| PipelineError::invalid_repository(url.as_str(), "remote has no HEAD reference"))
    }

    async fn fetch(&self, url: &RepositoryUrl) -> Result<RepositorySnapshot> {
        let limit = self.settings.max_repo_size_bytes;
        tokio::fs::create_dir_all(&self.settings.temp_repo_dir)
            .await
            .map_err(|e| {
                tracing::error!(error = ?e, path = %self.settings.temp_repo_dir.display(), "Failed to create temp repo directory");
                PipelineError::clone_failed(format!("cannot create temp directory: {e}"))
            })?;
        let dir = tempfile::Builder::new()
            .prefix(&format!("{SNAPSHOT_PREFIX}{}-", url.slug()))
            .tempdir_in(&self.settings.temp_repo_dir)
            .map_err(|e| PipelineError::clone_failed(format!("cannot create snapshot directory: {e}")))?;

        tracing::info!(repo_url = %url, path = %dir.path().display(), "Cloning repository");

        let mut child = self
            .git_command()
            .args(["clone", "--depth", "1", "--single-branch", "--no-tags", "--quiet"])
            .arg(url.as_str())
            .arg(dir.path())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| {
                tracing::error!(error = ?e, repo_url = %url, "Failed to launch git process");
                PipelineError::clone_failed(format!("Failed to launch git: {e}"))
            })?;

        let stderr = child.stderr.take();
        let stderr_task = tokio::spawn(async move {
            let mut buf = String::new();
            if let Some(mut stderr) = stderr {
                let _ = stderr.read_to_string(&mut buf).await;
            }
            buf
        });

        let deadline = tokio::time::Instant::now() + self.settings.clone_timeout;
        let mut ticker = tokio::time::interval(self.settings.poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        let status = loop {
            tokio::select! {
                status = child.wait() => {
                    break status.map_err(|e| PipelineError::clone_failed(format!("git process failed: {e}")))?;
                }
                _ = ticker.tick() => {
                    let (size, _) = measure(dir.path()).await;
                    if size > limit {
                        let _ = child.kill().await;
                        tracing::warn!(repo_url = %url, size, limit, "Clone exceeded size ceiling, aborted");
                        return Err(PipelineError::RepositoryTooLarge { size_bytes: size, limit_bytes: limit });
                    }
                }
                _ = tokio::time::sleep_until(deadline) => {
                    let _ = child.kill().await;
                    tracing::error!(repo_url = %url, timeout_secs = self.settings.clone_timeout.as_secs(), "git clone timed out");
                    return Err(PipelineError::clone_failed(format!(
                        "git clone timed out after {}s",
                        self.settings.clone_timeout.as_secs()
                    )));
                }
            }
        };

        let stderr = stderr_task.await.unwrap_or_default();
        if !status.success() {
            tracing::error!(repo_url = %url, status = ?status, stderr = %stderr.trim(), "Git exited with non-zero code");
            return Err(classify_git_failure(url, &stderr));
        }

        let (size, file_count) = measure(dir.path()).await;
        if size > limit {
            tracing::warn!(repo_url = %url, size, limit, "Cloned repository exceeds size ceiling");
            return Err(PipelineError::RepositoryTooLarge {
                size_bytes: size,
                limit_bytes: limit,
            });
        }
        let commit = self.head_commit(dir.path()).await;
        let path = dir.keep();
        tracing::info!(
            repo_url = %url,
            path = %path.display(),
            size,
            file_count,
            commit = commit.as_deref().unwrap_or("unknown"),
            "Successfully cloned git repository"
        );
        Ok(RepositorySnapshot::new(path, size, file_count, commit))
    }
}

/// Map git's stderr to the error taxonomy: missing repositories are invalid references,
/// everything else (auth, network) is a clone failure.
fn classify_git_failure(url: &RepositoryUrl, stderr: &str) -> PipelineError {
    let lower = stderr.to_ascii_lowercase();
    let not_found = ["not found", "does not exist", "does not appear to be a git repository"]
        .iter()
        .any(|needle| lower.contains(needle));
    let detail = stderr.trim().lines().last().unwrap_or("git exited with an error");
    if not_found {
        PipelineError::invalid_repository(
            url.as_str(),
            format!("repository may be private or does not exist: {detail}"),
        )
    } else {
        PipelineError::clone_failed(detail.to_string())
    }
}

async fn measure(path: &Path) -> (u64, usize) {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || measure_dir(&path))
        .await
        .unwrap_or((0, 0))
}

/// Total bytes under `path` and the number of files outside `.git`. Unreadable entries are skipped.
fn measure_dir(path: &Path) -> (u64, usize) {
    fn visit(dir: &Path, in_git: bool, bytes: &mut u64, files: &mut usize) {
        let Ok(entries) = fs::read_dir(dir) else {
            return;
        };
        for entry in entries.flatten() {
            let Ok(meta) = entry.path().symlink_metadata() else {
                continue;
            };
            if meta.is_dir() {
                let git = in_git || entry.file_name() == ".git";
                visit(&entry.path(), git, bytes, files);
            } else {
                *bytes += meta.len();
                if !in_git && meta.is_file() {
                    *files += 1;
                }
            }
        }
    }
    let mut bytes = 0;
    let mut files = 0;
    visit(path, false, &mut bytes, &mut files);
    (bytes, files)
}

/// Remove snapshot directories under `dir` last modified more than `max_age` ago.
/// Only directories named with [`SNAPSHOT_PREFIX`] are considered. Returns how many were
/// removed.
pub fn reap_stale_snapshots(dir: &Path, max_age: Duration) -> io::Result<usize> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e),
    };
    let mut removed = 0;
    for entry in entries.flatten() {
        let path = entry.path();
        let Ok(meta) = entry.metadata() else {
            continue;
        };
        let is_snapshot = entry
            .file_name()
            .to_str()
            .is_some_and(|name| name.starts_with(SNAPSHOT_PREFIX));
        if !meta.is_dir() || !is_snapshot {
            continue;
        }
        let age = meta
            .modified()
            .ok()
            .and_then(|m| m.elapsed().ok())
            .unwrap_or_default();
        if age < max_age {
            continue;
        }
        match fs::remove_dir_all(&path) {
            Ok(()) => {
                tracing::info!(path = %path.display(), age_secs = age.as_secs(), "Reaped stale snapshot");
                removed += 1;
            }
            Err(e) => {
                tracing::error!(error = ?e, path = %path.display(), "Failed to reap stale snapshot");
            }
        }
    }
    Ok(removed)
}

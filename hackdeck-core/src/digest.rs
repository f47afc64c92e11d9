//! Digest builder: turns a repository snapshot into a bounded, deterministic text document
//! (header, directory tree, then file contents sorted by path).
//!
//! Traversal uses `ignore::WalkBuilder` and honours the repository's own `.gitignore`.
//! On top of that, every entry whose name or repository-relative path matches one of the
//! policy's `ignore_patterns` is pruned before it is read. Binary files are listed with a
//! size summary instead of their bytes.

use std::collections::HashSet;
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use globset::{Glob, GlobSet, GlobSetBuilder};
use ignore::WalkBuilder;
use once_cell::sync::Lazy;
use tracing::{debug, info, warn};

use crate::config::{DigestFormat, DigestPolicy};
use crate::error::{PipelineError, Result};

/// Appended when the aggregate size limit cuts the digest short.
pub const TRUNCATION_MARKER: &str = "\n\n... [Content truncated due to size limits] ...\n";

/// Bytes inspected for NUL when sniffing binary content.
const SNIFF_BYTES: usize = 8 * 1024;

static BINARY_EXTENSIONS: Lazy<HashSet<&'static str>> = Lazy::new(|| {
    [
        "exe", "dll", "so", "dylib", "a", "o", "obj", "lib", "bin", "png", "jpg", "jpeg", "gif",
        "bmp", "ico", "webp", "tiff", "psd", "mp3", "mp4", "avi", "mkv", "mov", "wav", "flac",
        "ogg", "pdf", "doc", "docx", "xls", "xlsx", "ppt", "pptx", "zip", "tar", "gz", "bz2",
        "xz", "7z", "rar", "jar", "war", "wasm", "pyc", "class", "ttf", "otf", "woff", "woff2",
        "eot", "sqlite", "db",
    ]
    .into_iter()
    .collect()
});

/// What the digest says about one file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryContent {
    Text { content: String, truncated: bool },
    Binary { size_bytes: u64 },
}

impl EntryContent {
    fn render(&self) -> String {
        match self {
            Self::Text { content, .. } => content.clone(),
            Self::Binary { size_bytes } => format!("[binary file omitted, {size_bytes} bytes]"),
        }
    }
}

/// One (path, content-or-summary) pair, path relative to the repository root with `/` separators.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DigestEntry {
    pub path: String,
    pub content: EntryContent,
}

/// An immutable, bounded summary of a codebase. Shared between jobs as `Arc<Digest>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Digest {
    title: String,
    tree: String,
    entries: Vec<DigestEntry>,
    text: String,
    truncated: bool,
}

impl Digest {
    #[must_use]
    pub fn title(&self) -> &str {
        &self.title
    }

    /// The rendered document handed to the language model.
    #[must_use]
    pub fn text(&self) -> &str {
        &self.text
    }

    #[must_use]
    pub fn tree(&self) -> &str {
        &self.tree
    }

    /// Entries that made it into [`text`](Self::text), in path order.
    #[must_use]
    pub fn entries(&self) -> &[DigestEntry] {
        &self.entries
    }

    /// Whether the aggregate size limit cut the document short.
    #[must_use]
    pub const fn truncated(&self) -> bool {
        self.truncated
    }

    #[must_use]
    pub fn file_count(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.text.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.text.is_empty()
    }
}

/// Compiled ignore set, matched against both the entry name and its relative path.
#[derive(Debug, Clone)]
struct IgnoreMatcher {
    set: GlobSet,
}

impl IgnoreMatcher {
    fn new(patterns: &[String]) -> Result<Self> {
        let mut builder = GlobSetBuilder::new();
        for pattern in patterns {
            let glob = Glob::new(pattern).map_err(|e| {
                PipelineError::config(format!("Invalid ignore pattern '{pattern}': {e}"))
            })?;
            builder.add(glob);
        }
        let set = builder
            .build()
            .map_err(|e| PipelineError::config(format!("Failed to build ignore set: {e}")))?;
        Ok(Self { set })
    }

    fn is_ignored(&self, name: &str, relative: &str) -> bool {
        name == ".git" || self.set.is_match(name) || self.set.is_match(relative)
    }
}

/// Builds digests for one policy. Glob patterns are compiled once in [`DigestBuilder::new`].
#[derive(Debug, Clone)]
pub struct DigestBuilder {
    policy: DigestPolicy,
    matcher: IgnoreMatcher,
}

impl DigestBuilder {
    pub fn new(policy: DigestPolicy) -> Result<Self> {
        policy.validate()?;
        let matcher = IgnoreMatcher::new(&policy.ignore_patterns)?;
        Ok(Self { policy, matcher })
    }

    #[must_use]
    pub fn policy(&self) -> &DigestPolicy {
        &self.policy
    }

    /// Walk `root` and render the digest. Blocking; see [`build_in_background`](Self::build_in_background).
    pub fn build(&self, root: &Path, title: &str) -> Result<Digest> {
        if !root.is_dir() {
            return Err(PipelineError::digest(format!(
                "snapshot path {} is not a directory",
                root.display()
            )));
        }
        info!(path = %root.display(), max_depth = self.policy.max_depth, "Building digest");

        let (tree_lines, files) = self.walk(root);
        let mut entries = Vec::with_capacity(files.len());
        for (relative, path) in files {
            match self.read_entry(&path) {
                Ok(content) => entries.push(DigestEntry {
                    path: relative,
                    content,
                }),
                Err(e) => warn!(error = ?e, path = %path.display(), "Skipping unreadable file"),
            }
        }
        if !entries
            .iter()
            .any(|e| matches!(e.content, EntryContent::Text { .. }))
        {
            return Err(PipelineError::digest(format!(
                "no processable files found in {}",
                root.display()
            )));
        }

        let tree = tree_lines.join("\n");
        let digest = self.render(title, tree, entries);
        info!(
            title,
            files = digest.file_count(),
            bytes = digest.len(),
            truncated = digest.truncated(),
            "Digest built"
        );
        Ok(digest)
    }

    /// Run [`build`](Self::build) on the blocking pool, bounded by `timeout`.
    pub async fn build_in_background(
        self: Arc<Self>,
        root: PathBuf,
        title: String,
        timeout: Duration,
    ) -> Result<Arc<Digest>> {
        let task = tokio::task::spawn_blocking(move || self.build(&root, &title));
        match tokio::time::timeout(timeout, task).await {
            Ok(Ok(result)) => result.map(Arc::new),
            Ok(Err(join)) => Err(PipelineError::digest(format!("digest task failed: {join}"))),
            Err(_) => Err(PipelineError::digest(format!(
                "digest generation took longer than {}s",
                timeout.as_secs()
            ))),
        }
    }

    /// Sorted pre-order walk. Returns the tree view lines and the (relative, absolute) file list.
    fn walk(&self, root: &Path) -> (Vec<String>, Vec<(String, PathBuf)>) {
        let matcher = self.matcher.clone();
        let filter_root = root.to_path_buf();
        let walker = WalkBuilder::new(root)
            .hidden(false)
            .parents(false)
            .git_global(false)
            .git_exclude(false)
            .follow_links(false)
            .max_depth(Some(self.policy.max_depth))
            .sort_by_file_path(|a, b| a.cmp(b))
            .filter_entry(move |entry| {
                if entry.depth() == 0 {
                    return true;
                }
                let name = entry.file_name().to_string_lossy();
                let relative = relative_path(&filter_root, entry.path());
                !matcher.is_ignored(&name, &relative)
            })
            .build();

        let mut tree = Vec::new();
        let mut files = Vec::new();
        for result in walker {
            let entry = match result {
                Ok(entry) => entry,
                Err(e) => {
                    warn!(error = %e, "Walk error");
                    continue;
                }
            };
            if entry.depth() == 0 {
                continue;
            }
            let is_dir = entry.file_type().is_some_and(|ft| ft.is_dir());
            let is_file = entry.file_type().is_some_and(|ft| ft.is_file());
            let indent = "  ".repeat(entry.depth() - 1);
            let name = entry.file_name().to_string_lossy();
            if is_dir {
                tree.push(format!("{indent}{name}/"));
            } else if is_file {
                tree.push(format!("{indent}{name}"));
                files.push((relative_path(root, entry.path()), entry.into_path()));
            }
        }
        debug!(files = files.len(), "Walk complete");
        (tree, files)
    }

    fn read_entry(&self, path: &Path) -> std::io::Result<EntryContent> {
        let size_bytes = path.metadata()?.len();
        if has_binary_extension(path) {
            return Ok(EntryContent::Binary { size_bytes });
        }
        let limit = self.policy.max_file_bytes;
        let mut buf = Vec::new();
        File::open(path)?
            .take(limit.max(SNIFF_BYTES) as u64 + 1)
            .read_to_end(&mut buf)?;
        if buf[..buf.len().min(SNIFF_BYTES)].contains(&0) {
            return Ok(EntryContent::Binary { size_bytes });
        }
        let truncated = buf.len() > limit;
        buf.truncate(limit);
        let mut content = String::from_utf8_lossy(&buf).into_owned();
        if truncated {
            content.push_str(&format!("\n... [file truncated at {limit} bytes] ..."));
        }
        Ok(EntryContent::Text { content, truncated })
    }

    fn render(&self, title: &str, tree: String, entries: Vec<DigestEntry>) -> Digest {
        let limit = self.policy.max_total_bytes.saturating_sub(TRUNCATION_MARKER.len());
        let mut out = BoundedText::new(limit);
        let total: u64 = entries
            .iter()
            .map(|e| match &e.content {
                EntryContent::Text { content, .. } => content.len() as u64,
                EntryContent::Binary { size_bytes } => *size_bytes,
            })
            .sum();

        match self.policy.output_format {
            DigestFormat::Markdown => {
                out.push(&format!(
                    "# Codebase digest: {title}\n\nFiles: {} | Size: {total} bytes\n\n## Directory structure\n\n```\n{tree}\n```\n\n## Files\n",
                    entries.len()
                ));
            }
            DigestFormat::Text => {
                out.push(&format!(
                    "Codebase digest: {title}\nFiles: {} | Size: {total} bytes\n\nDirectory structure:\n{tree}\n",
                    entries.len()
                ));
            }
        }

        let mut kept = Vec::with_capacity(entries.len());
        for entry in entries {
            let (heading, body) = match self.policy.output_format {
                DigestFormat::Markdown => (
                    format!("\n### `{}`\n\n", entry.path),
                    format!(
                        "```{}\n{}\n```\n",
                        fence_language(&entry.path),
                        entry.content.render()
                    ),
                ),
                DigestFormat::Text => (
                    format!("\n==== {} ====\n", entry.path),
                    format!("{}\n", entry.content.render()),
                ),
            };
            // An entry counts as included only once its heading is in the text.
            if !out.push(&heading) {
                break;
            }
            kept.push(entry);
            if !out.push(&body) {
                break;
            }
        }

        let truncated = out.truncated;
        Digest {
            title: title.to_string(),
            tree,
            entries: kept,
            text: out.finish(),
            truncated,
        }
    }
}

/// String builder that refuses to grow past `limit`, then appends [`TRUNCATION_MARKER`].
struct BoundedText {
    text: String,
    limit: usize,
    truncated: bool,
}

impl BoundedText {
    fn new(limit: usize) -> Self {
        Self {
            text: String::new(),
            limit,
            truncated: false,
        }
    }

    /// Returns false once the limit was hit.
    fn push(&mut self, s: &str) -> bool {
        if self.truncated {
            return false;
        }
        let remaining = self.limit.saturating_sub(self.text.len());
        if s.len() <= remaining {
            self.text.push_str(s);
            return true;
        }
        self.text.push_str(&s[..floor_char_boundary(s, remaining)]);
        self.truncated = true;
        false
    }

    fn finish(mut self) -> String {
        if self.truncated {
            self.text.push_str(TRUNCATION_MARKER);
        }
        self.text
    }
}

fn floor_char_boundary(s: &str, mut idx: usize) -> usize {
    if idx >= s.len() {
        return s.len();
    }
    while !s.is_char_boundary(idx) {
        idx -= 1;
    }
    idx
}

fn relative_path(root: &Path, path: &Path) -> String {
    path.strip_prefix(root)
        .unwrap_or(path)
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

fn has_binary_extension(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| BINARY_EXTENSIONS.contains(ext.to_ascii_lowercase().as_str()))
}

fn fence_language(path: &str) -> &str {
    Path::new(path)
        .extension()
        .and_then(|ext| ext.to_str())
        .unwrap_or("")
}

//! Artifact fetching for the investigation loop.
//!
//! When the reasoning backend asks for more context, the session satisfies
//! the request through this boundary: repository files, failure-log
//! excerpts, and recent commit history. Fetching has no side effects; every
//! result is rendered to text and appended to the transcript.

use crate::reasoning::ArtifactRequest;
use anyhow::{Context, Result};
use git2::Repository;
use std::path::{Path, PathBuf};

/// Maximum commits returned for a history request.
const HISTORY_LIMIT: usize = 10;
/// Context lines around a log-excerpt match.
const LOG_CONTEXT_LINES: usize = 20;

/// Satisfies backend context requests. Implementations must be read-only.
pub trait ArtifactFetcher: Send + Sync {
    /// Fetch one artifact, rendered to prompt-ready text.
    fn fetch(&self, request: &ArtifactRequest) -> Result<String>;
}

/// Default fetcher backed by the local checkout and the current failure log.
pub struct RepoFetcher {
    repo_root: PathBuf,
    /// Raw failure log content, if a log was supplied this run.
    failure_log: Option<String>,
    max_file_bytes: u64,
}

impl RepoFetcher {
    pub fn new(repo_root: PathBuf, failure_log: Option<String>, max_file_bytes: u64) -> Self {
        Self {
            repo_root,
            failure_log,
            max_file_bytes,
        }
    }

    fn fetch_file(&self, path: &str, reason: &str) -> Result<String> {
        let resolved = self.resolve_inside_repo(path)?;
        let meta = std::fs::metadata(&resolved)
            .with_context(|| format!("File not found: {}", path))?;
        if !meta.is_file() {
            anyhow::bail!("Not a regular file: {}", path);
        }
        if meta.len() > self.max_file_bytes {
            anyhow::bail!(
                "File too large to fetch: {} ({} bytes, limit {})",
                path,
                meta.len(),
                self.max_file_bytes
            );
        }
        let content = std::fs::read_to_string(&resolved)
            .with_context(|| format!("Failed to read {}", path))?;
        Ok(format!(
            "### File: {} (requested because: {})\n```\n{}\n```",
            path, reason, content
        ))
    }

    /// Reject any path that escapes the repository root. Requests come from
    /// an external model and are untrusted input.
    fn resolve_inside_repo(&self, path: &str) -> Result<PathBuf> {
        let candidate = Path::new(path);
        if candidate.is_absolute() {
            anyhow::bail!("Absolute paths are not allowed: {}", path);
        }
        if candidate
            .components()
            .any(|c| matches!(c, std::path::Component::ParentDir))
        {
            anyhow::bail!("Path escapes repository root: {}", path);
        }
        Ok(self.repo_root.join(candidate))
    }

    fn fetch_log_excerpt(&self, search: &str, reason: &str) -> Result<String> {
        let log = self
            .failure_log
            .as_deref()
            .context("No failure log available this run")?;
        let lines: Vec<&str> = log.lines().collect();
        let hit = lines
            .iter()
            .position(|line| line.contains(search))
            .with_context(|| format!("Search term not found in failure log: {}", search))?;

        let start = hit.saturating_sub(LOG_CONTEXT_LINES);
        let end = (hit + LOG_CONTEXT_LINES + 1).min(lines.len());
        Ok(format!(
            "### Log excerpt around '{}' (requested because: {})\n```\n{}\n```",
            search,
            reason,
            lines[start..end].join("\n")
        ))
    }

    fn fetch_history(&self, path_filter: Option<&str>, reason: &str) -> Result<String> {
        let repo = Repository::open(&self.repo_root)
            .context("Failed to open git repository for history request")?;
        let mut walk = repo.revwalk().context("Failed to start revwalk")?;
        walk.push_head().context("Failed to resolve HEAD")?;

        let mut entries = Vec::new();
        for oid in walk {
            if entries.len() >= HISTORY_LIMIT {
                break;
            }
            let oid = oid?;
            let commit = repo.find_commit(oid)?;
            if let Some(filter) = path_filter
                && !commit_touches_path(&repo, &commit, filter)?
            {
                continue;
            }
            let summary = commit.summary().unwrap_or("<no summary>");
            let author = commit.author().name().unwrap_or("<unknown>").to_string();
            entries.push(format!("{:.8} {} ({})", oid.to_string(), summary, author));
        }

        let target = path_filter.unwrap_or("repository");
        Ok(format!(
            "### Recent history for {} (requested because: {})\n{}",
            target,
            reason,
            if entries.is_empty() {
                "No matching commits".to_string()
            } else {
                entries.join("\n")
            }
        ))
    }
}

/// Whether a commit's diff against its first parent touches `path`.
fn commit_touches_path(repo: &Repository, commit: &git2::Commit, path: &str) -> Result<bool> {
    let tree = commit.tree()?;
    let parent_tree = match commit.parent(0) {
        Ok(parent) => Some(parent.tree()?),
        Err(_) => None, // root commit: everything is new
    };
    let diff = repo.diff_tree_to_tree(parent_tree.as_ref(), Some(&tree), None)?;
    let mut touched = false;
    diff.foreach(
        &mut |delta, _| {
            if let Some(p) = delta.new_file().path()
                && p.to_string_lossy() == path
            {
                touched = true;
            }
            true
        },
        None,
        None,
        None,
    )?;
    Ok(touched)
}

impl ArtifactFetcher for RepoFetcher {
    fn fetch(&self, request: &ArtifactRequest) -> Result<String> {
        match request {
            ArtifactRequest::File { path, reason } => self.fetch_file(path, reason),
            ArtifactRequest::LogExcerpt { search, reason } => self.fetch_log_excerpt(search, reason),
            ArtifactRequest::History { path, reason } => {
                self.fetch_history(path.as_deref(), reason)
            }
        }
    }
}

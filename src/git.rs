//! Version-control collaborator.
//!
//! The fix branch is both the workspace and the database: proposed changes
//! are applied to the working tree, committed with a structured message, and
//! later read back to reconstruct attempt history. All operations here are
//! local except `push`.

use crate::history::AGENT_AUTHOR;
use crate::reasoning::{ChangeAction, FileChange};
use anyhow::{Context, Result};
use git2::{Repository, Signature};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

const AGENT_EMAIL: &str = "mender@localhost";

/// Branch name for a remediation effort.
pub fn branch_for_fix(fix_id: &str) -> String {
    format!("mender/fix-{}", fix_id)
}

/// The fix id embedded in a remediation branch name, if this is one.
pub fn fix_id_from_branch(branch: &str) -> Option<&str> {
    branch.strip_prefix("mender/fix-").filter(|id| !id.is_empty())
}

#[derive(Debug, Clone, PartialEq)]
pub struct CommitInfo {
    pub id: String,
    pub author: String,
    pub message: String,
}

/// Abstract VCS operations the orchestrator needs. Mocked in tests.
pub trait Vcs: Send + Sync {
    fn current_branch(&self) -> Result<String>;
    fn head_sha(&self) -> Result<String>;
    /// Create `name` at HEAD and check it out.
    fn create_branch(&self, name: &str) -> Result<()>;
    /// Apply the proposed file changes, stage everything, and commit.
    fn commit_changes(&self, message: &str, changes: &[FileChange]) -> Result<String>;
    fn push(&self, branch: &str) -> Result<()>;
    /// Commits reachable from `branch`, newest first.
    fn list_commits(&self, branch: &str, limit: usize) -> Result<Vec<CommitInfo>>;
    /// Unified diff of `branch` against `base`.
    fn diff(&self, branch: &str, base: &str) -> Result<String>;
}

/// `Vcs` over a local checkout via libgit2.
///
/// `git2::Repository` is not `Sync`, so it sits behind a mutex; every
/// operation takes the lock for its duration.
pub struct GitWorkspace {
    repo: Mutex<Repository>,
    root: PathBuf,
}

fn head_commit(repo: &Repository) -> Result<git2::Commit<'_>> {
    repo.head()
        .context("Repository has no HEAD")?
        .peel_to_commit()
        .context("HEAD does not point at a commit")
}

fn branch_commit<'r>(repo: &'r Repository, branch: &str) -> Result<git2::Commit<'r>> {
    let reference = repo
        .find_branch(branch, git2::BranchType::Local)
        .with_context(|| format!("Branch not found: {}", branch))?;
    reference
        .get()
        .peel_to_commit()
        .with_context(|| format!("Branch {} does not point at a commit", branch))
}

impl GitWorkspace {
    pub fn open(project_dir: &Path) -> Result<Self> {
        let repo = Repository::open(project_dir).context("Failed to open git repository")?;
        Ok(Self {
            repo: Mutex::new(repo),
            root: project_dir.to_path_buf(),
        })
    }

    fn repo(&self) -> Result<MutexGuard<'_, Repository>> {
        self.repo
            .lock()
            .map_err(|_| anyhow::anyhow!("Git workspace lock poisoned"))
    }

    fn signature(&self) -> Result<Signature<'static>> {
        Ok(Signature::now(AGENT_AUTHOR, AGENT_EMAIL)?)
    }

    fn apply_change(&self, change: &FileChange) -> Result<()> {
        let path = self.root.join(&change.path);
        match change.action {
            ChangeAction::Create | ChangeAction::Edit => {
                if let Some(parent) = path.parent() {
                    std::fs::create_dir_all(parent)
                        .with_context(|| format!("Failed to create directory for {}", change.path))?;
                }
                std::fs::write(&path, &change.content)
                    .with_context(|| format!("Failed to write {}", change.path))?;
            }
            ChangeAction::Delete => {
                std::fs::remove_file(&path)
                    .with_context(|| format!("Failed to delete {}", change.path))?;
            }
        }
        Ok(())
    }
}

impl Vcs for GitWorkspace {
    fn current_branch(&self) -> Result<String> {
        let repo = self.repo()?;
        let head = repo.head().context("Repository has no HEAD")?;
        head.shorthand()
            .map(String::from)
            .context("HEAD is not a named branch")
    }

    fn head_sha(&self) -> Result<String> {
        let repo = self.repo()?;
        Ok(head_commit(&repo)?.id().to_string())
    }

    fn create_branch(&self, name: &str) -> Result<()> {
        let repo = self.repo()?;
        let head = head_commit(&repo)?;
        repo.branch(name, &head, false)
            .with_context(|| format!("Failed to create branch {}", name))?;
        repo.set_head(&format!("refs/heads/{}", name))
            .with_context(|| format!("Failed to switch to branch {}", name))?;
        repo.checkout_head(Some(git2::build::CheckoutBuilder::new().safe()))
            .context("Failed to check out new branch")?;
        Ok(())
    }

    fn commit_changes(&self, message: &str, changes: &[FileChange]) -> Result<String> {
        for change in changes {
            self.apply_change(change)?;
        }

        let repo = self.repo()?;
        let mut index = repo.index()?;
        index.add_all(["*"].iter(), git2::IndexAddOption::DEFAULT, None)?;
        index.write()?;
        let tree_id = index.write_tree()?;
        let tree = repo.find_tree(tree_id)?;

        let sig = self.signature()?;
        let parent = head_commit(&repo)?;
        let commit_id = repo.commit(Some("HEAD"), &sig, &sig, message, &tree, &[&parent])?;
        Ok(commit_id.to_string())
    }

    fn push(&self, branch: &str) -> Result<()> {
        let repo = self.repo()?;
        let mut remote = repo
            .find_remote("origin")
            .context("Remote 'origin' not configured")?;

        let mut callbacks = git2::RemoteCallbacks::new();
        callbacks.credentials(|_url, username, _allowed| {
            if let Ok(token) = std::env::var("GITHUB_TOKEN") {
                git2::Cred::userpass_plaintext("x-access-token", &token)
            } else {
                git2::Cred::default()
            }
            .or_else(|_| git2::Cred::username(username.unwrap_or("git")))
        });
        let mut opts = git2::PushOptions::new();
        opts.remote_callbacks(callbacks);

        let refspec = format!("refs/heads/{branch}:refs/heads/{branch}");
        remote
            .push(&[refspec.as_str()], Some(&mut opts))
            .with_context(|| format!("Failed to push branch {}", branch))
    }

    fn list_commits(&self, branch: &str, limit: usize) -> Result<Vec<CommitInfo>> {
        let repo = self.repo()?;
        let tip = branch_commit(&repo, branch)?;
        let mut walk = repo.revwalk()?;
        walk.push(tip.id())?;

        let mut commits = Vec::new();
        for oid in walk.take(limit) {
            let commit = repo.find_commit(oid?)?;
            commits.push(CommitInfo {
                id: commit.id().to_string(),
                author: commit.author().name().unwrap_or("<unknown>").to_string(),
                message: commit.message().unwrap_or("").to_string(),
            });
        }
        Ok(commits)
    }

    fn diff(&self, branch: &str, base: &str) -> Result<String> {
        let repo = self.repo()?;
        let branch_tree = branch_commit(&repo, branch)?.tree()?;
        let base_tree = branch_commit(&repo, base)?.tree()?;
        let diff = repo.diff_tree_to_tree(Some(&base_tree), Some(&branch_tree), None)?;

        let mut buf = Vec::new();
        diff.print(git2::DiffFormat::Patch, |_delta, _hunk, line| {
            match line.origin() {
                '+' | '-' | ' ' => buf.push(line.origin() as u8),
                _ => {}
            }
            buf.extend_from_slice(line.content());
            true
        })?;
        Ok(String::from_utf8_lossy(&buf).to_string())
    }
}

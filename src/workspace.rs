//! Per-task workspace management.
//!
//! Each task runs in its own git worktree, providing filesystem isolation
//! without full repository clones. Worktrees share the object store of the
//! base repository but have independent working directories and index files.
//!
//! Git does not support concurrent worktree operations on the same
//! repository (it takes a lock file on the shared object store), so all
//! mutating git invocations are serialised through an internal mutex.

use std::path::{Path, PathBuf};
use std::process::Output;
use std::sync::Arc;

use tokio::process::Command;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::error::{Error, Result};

/// A provisioned workspace: branch name, working directory, and the
/// repository the branch lives in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Workspace {
    pub branch: String,
    pub path: PathBuf,
    pub repo: PathBuf,
}

pub struct WorkspaceManager {
    base_repo: PathBuf,
    worktrees_base: PathBuf,
    git_lock: Arc<Mutex<()>>,
}

impl Clone for WorkspaceManager {
    fn clone(&self) -> Self {
        Self {
            base_repo: self.base_repo.clone(),
            worktrees_base: self.worktrees_base.clone(),
            git_lock: Arc::clone(&self.git_lock),
        }
    }
}

impl WorkspaceManager {
    /// Create a manager rooted at `base_repo`. Worktrees land under
    /// `worktrees_base`, defaulting to a sibling directory of the base
    /// repository named `<repo-name>-worktrees`.
    pub fn new(base_repo: PathBuf, worktrees_base: Option<PathBuf>) -> Self {
        let worktrees_base = worktrees_base.unwrap_or_else(|| {
            let repo_name = base_repo
                .file_name()
                .and_then(|n| n.to_str())
                .unwrap_or("repo");
            let base_name = format!("{repo_name}-worktrees");
            base_repo
                .parent()
                .map(|p| p.join(&base_name))
                .unwrap_or_else(|| PathBuf::from(base_name))
        });

        Self {
            base_repo,
            worktrees_base,
            git_lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn worktrees_base(&self) -> &Path {
        &self.worktrees_base
    }

    /// Branch naming convention: `task-{id}-{slug(title)}`.
    pub fn branch_name(task_id: i64, title: &str) -> String {
        format!("task-{}-{}", task_id, slug(title))
    }

    /// Provision an isolated worktree for a task.
    ///
    /// If the branch already exists (a stale leftover from a retried task),
    /// it is force-removed first: stale worktree references are pruned, any
    /// registered worktree at the target path is removed, and the branch is
    /// deleted.
    pub async fn create_workspace(
        &self,
        task_id: i64,
        title: &str,
        repo_override: Option<&Path>,
    ) -> Result<Workspace> {
        let repo = repo_override.unwrap_or(&self.base_repo).to_path_buf();
        let branch = Self::branch_name(task_id, title);
        let path = self.worktrees_base.join(&branch);

        let _lock = self.git_lock.lock().await;

        let probe = self.git(&repo, &["rev-parse", "--git-dir"]).await?;
        if !probe.status.success() {
            return Err(Error::Workspace(format!(
                "not a git repository: {}",
                repo.display()
            )));
        }

        if self.branch_exists(&repo, &branch).await? {
            info!(branch = %branch, "removing stale task branch before re-create");
            self.remove_locked(&repo, &path, &branch, true).await?;
        }

        tokio::fs::create_dir_all(&self.worktrees_base)
            .await
            .map_err(|e| Error::Workspace(format!("create worktrees dir: {}", e)))?;

        let path_arg = path.to_string_lossy().to_string();
        let out = self
            .git(&repo, &["worktree", "add", "-b", &branch, &path_arg])
            .await?;
        if !out.status.success() {
            let stderr = String::from_utf8_lossy(&out.stderr).to_string();
            // Clean up partial state if a directory was created.
            if path.exists() {
                let _ = tokio::fs::remove_dir_all(&path).await;
            }
            let _ = self.git(&repo, &["worktree", "prune"]).await;
            return Err(Error::Workspace(stderr));
        }

        info!(branch = %branch, path = %path.display(), "workspace created");
        Ok(Workspace { branch, path, repo })
    }

    /// Remove a worktree and its branch. Removing a nonexistent workspace
    /// or branch is not an error.
    ///
    /// A plain `git worktree remove` refuses when untracked or modified
    /// files are present; with `force` set the removal is retried with
    /// `--force`.
    pub async fn remove_workspace(&self, workspace: &Workspace, force: bool) -> Result<()> {
        let _lock = self.git_lock.lock().await;
        self.remove_locked(&workspace.repo, &workspace.path, &workspace.branch, force)
            .await
    }

    /// Discard references to worktree directories that vanished externally.
    pub async fn prune_workspaces(&self) -> Result<()> {
        let repo = self.base_repo.clone();
        let _lock = self.git_lock.lock().await;
        let out = self.git(&repo, &["worktree", "prune"]).await?;
        if !out.status.success() {
            return Err(Error::Workspace(
                String::from_utf8_lossy(&out.stderr).to_string(),
            ));
        }
        Ok(())
    }

    async fn remove_locked(
        &self,
        repo: &Path,
        path: &Path,
        branch: &str,
        force: bool,
    ) -> Result<()> {
        let _ = self.git(repo, &["worktree", "prune"]).await;

        if path.exists() {
            let path_arg = path.to_string_lossy().to_string();
            let out = self.git(repo, &["worktree", "remove", &path_arg]).await?;
            if !out.status.success() {
                let stderr = String::from_utf8_lossy(&out.stderr).to_string();
                if force {
                    let out = self
                        .git(repo, &["worktree", "remove", "--force", &path_arg])
                        .await?;
                    if !out.status.success() {
                        let stderr = String::from_utf8_lossy(&out.stderr).to_string();
                        if !stderr.contains("is not a working tree") {
                            return Err(Error::Workspace(stderr));
                        }
                        // Not registered with git; take the directory down directly.
                        let _ = tokio::fs::remove_dir_all(path).await;
                    }
                } else if stderr.contains("is not a working tree") {
                    warn!(path = %path.display(), "directory not registered as worktree");
                } else {
                    return Err(Error::Workspace(stderr));
                }
            }
        }

        let out = self.git(repo, &["branch", "-D", branch]).await?;
        if !out.status.success() {
            let stderr = String::from_utf8_lossy(&out.stderr).to_string();
            if !stderr.contains("not found") {
                return Err(Error::Workspace(stderr));
            }
        }

        Ok(())
    }

    async fn branch_exists(&self, repo: &Path, branch: &str) -> Result<bool> {
        let refname = format!("refs/heads/{branch}");
        let out = self.git(repo, &["rev-parse", "--verify", &refname]).await?;
        Ok(out.status.success())
    }

    async fn git(&self, repo: &Path, args: &[&str]) -> Result<Output> {
        Command::new("git")
            .args(args)
            .current_dir(repo)
            .output()
            .await
            .map_err(|e| Error::Workspace(format!("failed to run git {}: {}", args.join(" "), e)))
    }
}

/// Branch slug: lowercase, keep alphanumerics and hyphens, collapse runs
/// of everything else into single hyphens, truncate to 20 characters.
pub fn slug(title: &str) -> String {
    let mut out = String::new();
    let mut pending_hyphen = false;
    for ch in title.chars().flat_map(|c| c.to_lowercase()) {
        if ch.is_ascii_alphanumeric() {
            if pending_hyphen && !out.is_empty() {
                out.push('-');
            }
            pending_hyphen = false;
            out.push(ch);
        } else {
            pending_hyphen = true;
        }
    }

    let mut out: String = out.chars().take(20).collect();
    while out.ends_with('-') {
        out.pop();
    }
    if out.is_empty() {
        "task".to_string()
    } else {
        out
    }
}

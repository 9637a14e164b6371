// ABOUTME: Best-effort cleanup of the git worktrees terminals were created in
// Runs when a terminal is destroyed; failures are reported but never block the destroy

use async_trait::async_trait;
use git2::{BranchType, Repository, StatusOptions, Worktree, WorktreeLockStatus, WorktreePruneOptions};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::DaemonConfig;

/// Why a worktree was left in place.
#[derive(Error, Debug)]
pub enum CleanupError {
    #[error("Git repository error: {0}")]
    Git(#[from] git2::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Worktree not found: {0}")]
    NotFound(PathBuf),
    #[error("{0} is not a linked worktree")]
    NotAWorktree(PathBuf),
    #[error("Worktree {path} has {changes} uncommitted change(s)")]
    Dirty { path: PathBuf, changes: usize },
    #[error("Worktree {path} is locked: {}", .reason.as_deref().unwrap_or("no reason given"))]
    Locked { path: PathBuf, reason: Option<String> },
    #[error("Failed to delete branch {branch}: {source}")]
    BranchDelete {
        branch: String,
        #[source]
        source: git2::Error,
    },
    #[error("Cleanup task failed: {0}")]
    TaskFailed(String),
}

/// What cleanup did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CleanupOutcome {
    /// Working directory is outside the managed worktree root; left alone.
    NotManaged,
    Removed {
        path: PathBuf,
        branch: Option<String>,
        branch_deleted: bool,
    },
}

/// Invoked with a terminal's working directory after its backend session is gone.
#[async_trait]
pub trait WorkspaceHook: Send + Sync {
    /// Errors are reported, never propagated into the destroy.
    async fn on_destroy(&self, working_directory: &Path) -> Result<CleanupOutcome, CleanupError>;
}

/// Cleans up worktrees under one managed root.
#[derive(Debug, Clone)]
pub struct WorktreeManager {
    base_worktree_dir: PathBuf,
}

impl WorktreeManager {
    pub fn with_base_dir(base_dir: PathBuf) -> Self {
        Self {
            base_worktree_dir: base_dir,
        }
    }

    /// Manage the configured `worktree_root`.
    pub fn from_config(config: &DaemonConfig) -> Self {
        Self::with_base_dir(config.worktree_root.clone())
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_worktree_dir
    }

    /// Whether `path` lies strictly inside the managed root.
    pub fn is_managed(&self, path: &Path) -> bool {
        if path != self.base_worktree_dir && path.starts_with(&self.base_worktree_dir) {
            return true;
        }

        // Symlinked temp dirs and relative components
        match (path.canonicalize(), self.base_worktree_dir.canonicalize()) {
            (Ok(path), Ok(base)) => path != base && path.starts_with(&base),
            _ => false,
        }
    }

    /// Remove the worktree at `path` and, when its branch is already held by a
    /// remote-tracking branch, the branch too. Refuses dirty or locked worktrees.
    pub fn remove_worktree(&self, path: &Path) -> Result<CleanupOutcome, CleanupError> {
        if !self.is_managed(path) {
            debug!("{} is outside {}, skipping cleanup", path.display(), self.base_worktree_dir.display());
            return Ok(CleanupOutcome::NotManaged);
        }

        if !path.exists() {
            return Err(CleanupError::NotFound(path.to_path_buf()));
        }

        info!("Removing worktree {}", path.display());

        let repo = Repository::open(path)?;
        if !repo.is_worktree() {
            return Err(CleanupError::NotAWorktree(path.to_path_buf()));
        }

        let changes = Self::count_changes(&repo)?;
        if changes > 0 {
            return Err(CleanupError::Dirty {
                path: path.to_path_buf(),
                changes,
            });
        }

        let branch = match repo.head() {
            Ok(head) if head.is_branch() => head.shorthand().map(str::to_string),
            _ => None,
        };
        let common_dir = Self::common_dir(&repo)
            .ok_or_else(|| CleanupError::NotAWorktree(path.to_path_buf()))?;

        let worktree = Worktree::open_from_repository(&repo)?;
        if let WorktreeLockStatus::Locked(reason) = worktree.is_locked()? {
            return Err(CleanupError::Locked {
                path: path.to_path_buf(),
                reason,
            });
        }
        drop(repo);

        let mut prune_opts = WorktreePruneOptions::new();
        prune_opts.valid(true).working_tree(true);
        worktree.prune(Some(&mut prune_opts))?;

        if path.exists() {
            std::fs::remove_dir_all(path)?;
        }

        let branch_deleted = match &branch {
            Some(name) => match Self::delete_branch_if_pushed(&common_dir, name) {
                Ok(deleted) => deleted,
                Err(e) => {
                    warn!("Worktree {} removed but {}", path.display(), e);
                    false
                }
            },
            None => false,
        };

        info!(
            "Removed worktree {} (branch {:?}, deleted: {})",
            path.display(),
            branch,
            branch_deleted
        );
        Ok(CleanupOutcome::Removed {
            path: path.to_path_buf(),
            branch,
            branch_deleted,
        })
    }

    /// The main repository's git dir. A linked worktree's own git dir is
    /// `<common>/worktrees/<name>`.
    fn common_dir(repo: &Repository) -> Option<PathBuf> {
        let worktrees = repo.path().parent()?;
        if worktrees.file_name()? != "worktrees" {
            return None;
        }
        worktrees.parent().map(Path::to_path_buf)
    }

    /// Modified, staged and untracked entries. Ignored files don't count.
    fn count_changes(repo: &Repository) -> Result<usize, CleanupError> {
        let mut opts = StatusOptions::new();
        opts.include_untracked(true)
            .recurse_untracked_dirs(true)
            .include_ignored(false);
        let statuses = repo.statuses(Some(&mut opts))?;
        Ok(statuses.len())
    }

    /// Delete `branch` from the main repository when a remote-tracking branch
    /// already contains its tip. Returns whether it was deleted.
    fn delete_branch_if_pushed(common_dir: &Path, branch_name: &str) -> Result<bool, CleanupError> {
        let main = Repository::open(common_dir)?;
        let mut branch = match main.find_branch(branch_name, BranchType::Local) {
            Ok(branch) => branch,
            Err(e) if e.code() == git2::ErrorCode::NotFound => return Ok(false),
            Err(e) => return Err(e.into()),
        };

        let tip = branch.get().peel_to_commit()?.id();
        if !Self::is_held_by_remote(&main, &branch, tip)? {
            debug!("Branch {} has commits no remote holds, keeping it", branch_name);
            return Ok(false);
        }

        branch.delete().map_err(|source| CleanupError::BranchDelete {
            branch: branch_name.to_string(),
            source,
        })?;
        info!("Deleted branch {}", branch_name);
        Ok(true)
    }

    fn is_held_by_remote(
        repo: &Repository,
        branch: &git2::Branch<'_>,
        tip: git2::Oid,
    ) -> Result<bool, CleanupError> {
        if let Ok(upstream) = branch.upstream() {
            if let Some(upstream_tip) = upstream.get().target() {
                let (ahead, _behind) = repo.graph_ahead_behind(tip, upstream_tip)?;
                if ahead == 0 {
                    return Ok(true);
                }
            }
        }

        for entry in repo.branches(Some(BranchType::Remote))? {
            let (remote, _) = entry?;
            let Some(remote_tip) = remote.get().target() else {
                continue;
            };
            if remote_tip == tip || repo.graph_descendant_of(remote_tip, tip)? {
                return Ok(true);
            }
        }
        Ok(false)
    }
}

#[async_trait]
impl WorkspaceHook for WorktreeManager {
    async fn on_destroy(&self, working_directory: &Path) -> Result<CleanupOutcome, CleanupError> {
        if !self.is_managed(working_directory) {
            return Ok(CleanupOutcome::NotManaged);
        }

        let manager = self.clone();
        let path = working_directory.to_path_buf();
        tokio::task::spawn_blocking(move || manager.remove_worktree(&path))
            .await
            .map_err(|e| CleanupError::TaskFailed(e.to_string()))?
    }
}

// ABOUTME: Git integration for cleaning up terminal worktrees

/// git2-based worktree removal.
pub mod worktree_manager;

pub use worktree_manager::{CleanupError, CleanupOutcome, WorkspaceHook, WorktreeManager};

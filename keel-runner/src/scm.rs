//! Source control seam
//!
//! The engine needs only a handful of operations from version control:
//! clone a branch, commit everything, push, and rebase onto the remote after
//! a rejected push.

use std::path::Path;

use async_trait::async_trait;
use keel_core::Result;

/// Result of pushing the current branch
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PushOutcome {
    Pushed,
    /// The remote moved ahead of us (non-fast-forward)
    Rejected { details: String },
}

/// Result of replaying local commits on top of the remote branch
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RebaseOutcome {
    Clean,
    /// The rebase stopped on a conflict and was aborted
    Conflict { details: String },
}

#[async_trait]
pub trait SourceControl: Send + Sync {
    /// Clones `branch` of `repository` into `dest`, replacing anything there
    async fn checkout(&self, repository: &str, branch: &str, dest: &Path) -> Result<()>;

    /// Stages every change in the worktree and commits it, returning the new SHA
    async fn commit_all(&self, worktree: &Path, message: &str) -> Result<String>;

    /// Pushes HEAD to `branch` on the origin remote
    async fn push(&self, worktree: &Path, branch: &str) -> Result<PushOutcome>;

    /// Fetches `branch` and rebases local commits onto it
    async fn rebase_onto_remote(&self, worktree: &Path, branch: &str) -> Result<RebaseOutcome>;

    /// SHA of the current HEAD
    async fn head(&self, worktree: &Path) -> Result<String>;
}

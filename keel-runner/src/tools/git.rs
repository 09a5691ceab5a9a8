//! The git CLI as source control
//!
//! Every command runs non-interactively (no credential prompts) and carries
//! the committer identity as `-c` flags, so nothing is written to the
//! repository's config.

use std::path::Path;

use async_trait::async_trait;
use keel_core::{ReleaseError, Result};
use tokio::process::Command;
use tracing::{debug, info, instrument, warn};

use super::{run, run_checked};
use crate::scm::{PushOutcome, RebaseOutcome, SourceControl};

const GIT: &str = "git";

/// Author and committer of manifest commits
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitIdentity {
    pub name: String,
    pub email: String,
}

pub struct GitCli {
    identity: CommitIdentity,
}

impl GitCli {
    pub fn new(identity: CommitIdentity) -> Self {
        Self { identity }
    }

    fn command(&self, workdir: Option<&Path>) -> Command {
        let mut command = Command::new(GIT);
        if let Some(dir) = workdir {
            command.current_dir(dir);
        }
        command
            .env("GIT_TERMINAL_PROMPT", "0")
            .arg("-c")
            .arg(format!("user.name={}", self.identity.name))
            .arg("-c")
            .arg(format!("user.email={}", self.identity.email));
        command
    }
}

/// Classifies a failed push: a moved remote is a rejection, anything else an error
fn classify_push(stderr: &str) -> Option<PushOutcome> {
    if stderr.contains("non-fast-forward")
        || stderr.contains("[rejected]")
        || stderr.contains("fetch first")
    {
        return Some(PushOutcome::Rejected {
            details: stderr.trim().to_string(),
        });
    }
    None
}

#[async_trait]
impl SourceControl for GitCli {
    #[instrument(skip(self))]
    async fn checkout(&self, repository: &str, branch: &str, dest: &Path) -> Result<()> {
        let failed = |reason: String| ReleaseError::CheckoutFailed {
            repository: repository.to_string(),
            branch: branch.to_string(),
            reason,
        };

        if tokio::fs::try_exists(dest).await.unwrap_or(false) {
            debug!("Removing previous checkout at {}", dest.display());
            tokio::fs::remove_dir_all(dest)
                .await
                .map_err(|e| failed(format!("cannot clear {}: {}", dest.display(), e)))?;
        }
        if let Some(parent) = dest.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| failed(format!("cannot create {}: {}", parent.display(), e)))?;
        }

        let output = run(
            GIT,
            self.command(None)
                .args(["clone", "--single-branch", "--branch", branch, repository])
                .arg(dest),
            None,
        )
        .await?;
        if !output.success {
            return Err(failed(output.failure_summary()));
        }

        info!("Checked out {} ({}) into {}", repository, branch, dest.display());
        Ok(())
    }

    async fn commit_all(&self, worktree: &Path, message: &str) -> Result<String> {
        run_checked(GIT, self.command(Some(worktree)).args(["add", "--all"])).await?;
        run_checked(GIT, self.command(Some(worktree)).args(["commit", "--quiet", "-m", message])).await?;
        let sha = self.head(worktree).await?;
        debug!("Committed {} in {}", sha, worktree.display());
        Ok(sha)
    }

    async fn push(&self, worktree: &Path, branch: &str) -> Result<PushOutcome> {
        let refspec = format!("HEAD:refs/heads/{}", branch);
        let output = run(
            GIT,
            self.command(Some(worktree)).args(["push", "origin", &refspec]),
            None,
        )
        .await?;

        if output.success {
            return Ok(PushOutcome::Pushed);
        }
        match classify_push(&output.stderr) {
            Some(rejected) => {
                warn!("Push to {} rejected", branch);
                Ok(rejected)
            }
            None => Err(ReleaseError::tool(GIT, output.failure_summary())),
        }
    }

    async fn rebase_onto_remote(&self, worktree: &Path, branch: &str) -> Result<RebaseOutcome> {
        run_checked(GIT, self.command(Some(worktree)).args(["fetch", "origin", branch])).await?;

        let upstream = format!("origin/{}", branch);
        let output = run(
            GIT,
            self.command(Some(worktree)).args(["rebase", &upstream]),
            None,
        )
        .await?;
        if output.success {
            debug!("Rebased onto {}", upstream);
            return Ok(RebaseOutcome::Clean);
        }

        let details = output.failure_summary();
        if let Err(e) = run_checked(GIT, self.command(Some(worktree)).args(["rebase", "--abort"])).await {
            warn!("Failed to abort rebase in {}: {}", worktree.display(), e);
        }
        Ok(RebaseOutcome::Conflict { details })
    }

    async fn head(&self, worktree: &Path) -> Result<String> {
        let output = run_checked(GIT, self.command(Some(worktree)).args(["rev-parse", "HEAD"])).await?;
        Ok(output.stdout.trim().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::ManifestPatcher;
    use crate::retry::RetryConfig;
    use std::path::PathBuf;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn test_classify_push() {
        let rejected = " ! [rejected]        HEAD -> main (fetch first)\nerror: failed to push some refs";
        assert!(matches!(classify_push(rejected), Some(PushOutcome::Rejected { .. })));
        assert!(classify_push("fatal: could not read Username").is_none());
    }

    fn git_available() -> bool {
        std::process::Command::new(GIT)
            .arg("--version")
            .output()
            .map(|o| o.status.success())
            .unwrap_or(false)
    }

    fn git(dir: &Path, args: &[&str]) {
        let status = std::process::Command::new(GIT)
            .current_dir(dir)
            .args(["-c", "user.name=seed", "-c", "user.email=seed@localhost"])
            .args(args)
            .output()
            .unwrap();
        assert!(status.status.success(), "git {:?}: {}", args, String::from_utf8_lossy(&status.stderr));
    }

    /// A bare remote whose `main` holds `deployment.yaml` referencing orders:40
    fn seeded_remote(root: &Path) -> String {
        let seed = root.join("seed");
        let remote = root.join("remote.git");
        std::fs::create_dir_all(&seed).unwrap();
        std::fs::create_dir_all(&remote).unwrap();
        git(&remote, &["init", "--quiet", "--bare"]);
        git(&seed, &["init", "--quiet"]);
        std::fs::write(
            seed.join("deployment.yaml"),
            "spec:\n  containers:\n    - name: orders\n      image: registry.example.com/orders:40\n",
        )
        .unwrap();
        std::fs::write(seed.join("README.md"), "manifests\n").unwrap();
        git(&seed, &["add", "--all"]);
        git(&seed, &["commit", "--quiet", "-m", "seed"]);
        git(&seed, &["push", "--quiet", remote.to_str().unwrap(), "HEAD:refs/heads/main"]);
        remote.to_str().unwrap().to_string()
    }

    fn cli() -> Arc<GitCli> {
        Arc::new(GitCli::new(CommitIdentity {
            name: "keel".to_string(),
            email: "keel@localhost".to_string(),
        }))
    }

    fn remote_manifest(root: &Path, remote: &str) -> String {
        let verify: PathBuf = root.join("verify");
        git(root, &["clone", "--quiet", "--branch", "main", remote, verify.to_str().unwrap()]);
        std::fs::read_to_string(verify.join("deployment.yaml")).unwrap()
    }

    #[tokio::test]
    async fn test_concurrent_tag_bumps_conflict_once() {
        if !git_available() {
            return;
        }
        let root = tempfile::tempdir().unwrap();
        let remote = seeded_remote(root.path());
        let scm = cli();
        let first = root.path().join("first");
        let second = root.path().join("second");
        scm.checkout(&remote, "main", &first).await.unwrap();
        scm.checkout(&remote, "main", &second).await.unwrap();

        let patcher = ManifestPatcher::new(scm.clone())
            .with_push_retry(RetryConfig::new(1, Duration::from_millis(1)));
        let manifest = Path::new("deployment.yaml");

        let winner = patcher
            .patch_and_commit(&first, manifest, "orders", "41", "main")
            .await
            .unwrap();
        assert!(winner.created);

        let err = patcher
            .patch_and_commit(&second, manifest, "orders", "42", "main")
            .await
            .unwrap_err();
        assert!(matches!(err, ReleaseError::ManifestPushConflict { .. }));

        assert!(remote_manifest(root.path(), &remote).contains("orders:41"));
        let head = scm.head(&second).await.unwrap();
        assert_ne!(head, winner.sha);
    }

    #[tokio::test]
    async fn test_unrelated_concurrent_change_rebases_cleanly() {
        if !git_available() {
            return;
        }
        let root = tempfile::tempdir().unwrap();
        let remote = seeded_remote(root.path());
        let scm = cli();
        let other = root.path().join("other");
        let ours = root.path().join("ours");
        scm.checkout(&remote, "main", &other).await.unwrap();
        scm.checkout(&remote, "main", &ours).await.unwrap();

        std::fs::write(other.join("README.md"), "manifests for the shop\n").unwrap();
        scm.commit_all(&other, "docs").await.unwrap();
        assert_eq!(scm.push(&other, "main").await.unwrap(), PushOutcome::Pushed);

        let patcher = ManifestPatcher::new(scm.clone())
            .with_push_retry(RetryConfig::new(1, Duration::from_millis(1)));
        let commit = patcher
            .patch_and_commit(&ours, Path::new("deployment.yaml"), "orders", "42", "main")
            .await
            .unwrap();

        assert!(commit.created);
        assert_eq!(commit.sha, scm.head(&ours).await.unwrap());
        assert!(remote_manifest(root.path(), &remote).contains("orders:42"));
    }

    #[tokio::test]
    async fn test_checkout_of_missing_repository() {
        if !git_available() {
            return;
        }
        let root = tempfile::tempdir().unwrap();
        let err = cli()
            .checkout(
                root.path().join("nope.git").to_str().unwrap(),
                "main",
                &root.path().join("dest"),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ReleaseError::CheckoutFailed { .. }));
    }
}

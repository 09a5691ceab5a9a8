//! Manifest patching
//!
//! Rewrites the tag of the service's image reference inside a deployment
//! document and records the change in the manifest repository. The document
//! is treated as text: only the tag bytes of the single `<service>:<tag>`
//! reference change, everything else (comments, ordering, other images) is
//! preserved byte for byte.

use std::path::Path;
use std::sync::Arc;

use keel_core::domain::manifest::{CommitReference, commit_message};
use keel_core::{ReleaseError, Result};
use regex::Regex;
use tracing::{info, instrument, warn};

use crate::retry::{Attempt, RetryConfig, retry};
use crate::scm::{PushOutcome, RebaseOutcome, SourceControl};

/// One `<service>:<tag>` occurrence in a document
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Anchor {
    /// 1-based line number
    pub line: usize,
    /// Byte range of the tag
    pub tag_start: usize,
    pub tag_end: usize,
    pub tag: String,
}

/// Result of patching a document in memory
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Patch {
    /// The reference already carries the tag
    Unchanged,
    Rewritten {
        document: String,
        previous_tag: String,
        line: usize,
    },
}

fn anchor_pattern(service: &str) -> Result<Regex> {
    // The service name must start a token: line start, whitespace, a quote,
    // a path separator or `=`. Tags follow the OCI tag grammar.
    let pattern = format!(
        r#"(?m)(?:^|[\s"'/=]){}:([A-Za-z0-9_][A-Za-z0-9_.\-]*)"#,
        regex::escape(service)
    );
    Regex::new(&pattern)
        .map_err(|e| ReleaseError::InvalidConfig(format!("service name '{}': {}", service, e)))
}

/// Finds every image reference for `service` in `document`
pub fn find_anchors(document: &str, service: &str) -> Result<Vec<Anchor>> {
    let pattern = anchor_pattern(service)?;
    Ok(pattern
        .captures_iter(document)
        .filter_map(|caps| caps.get(1))
        .map(|tag| Anchor {
            line: document[..tag.start()].matches('\n').count() + 1,
            tag_start: tag.start(),
            tag_end: tag.end(),
            tag: tag.as_str().to_string(),
        })
        .collect())
}

/// Same grammar the anchor pattern accepts, so a patched document stays patchable
fn is_valid_tag(tag: &str) -> bool {
    let mut chars = tag.chars();
    match chars.next() {
        Some(first) if first.is_ascii_alphanumeric() || first == '_' => {
            chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'))
        }
        _ => false,
    }
}

/// Locates the unique anchor for `service`, or explains why there isn't one
fn single_anchor(document: &str, service: &str, path: &str) -> Result<Anchor> {
    let mut anchors = find_anchors(document, service)?;
    match anchors.len() {
        0 => Err(ReleaseError::ManifestAnchorNotFound {
            path: path.to_string(),
            service: service.to_string(),
        }),
        1 => Ok(anchors.remove(0)),
        _ => Err(ReleaseError::ManifestAmbiguous {
            path: path.to_string(),
            service: service.to_string(),
            lines: anchors.iter().map(|a| a.line).collect(),
        }),
    }
}

/// Replaces the tag of the single `service` reference with `new_tag`
///
/// `path` is only used in error messages.
pub fn patch_document(document: &str, service: &str, new_tag: &str, path: &str) -> Result<Patch> {
    if !is_valid_tag(new_tag) {
        return Err(ReleaseError::InvalidConfig(format!(
            "'{}' is not a valid image tag",
            new_tag.escape_debug()
        )));
    }
    let anchor = single_anchor(document, service, path)?;
    if anchor.tag == new_tag {
        return Ok(Patch::Unchanged);
    }

    let mut patched = String::with_capacity(document.len() + new_tag.len());
    patched.push_str(&document[..anchor.tag_start]);
    patched.push_str(new_tag);
    patched.push_str(&document[anchor.tag_end..]);

    Ok(Patch::Rewritten {
        document: patched,
        previous_tag: anchor.tag,
        line: anchor.line,
    })
}

/// Patches a manifest inside a worktree and publishes the change
pub struct ManifestPatcher {
    scm: Arc<dyn SourceControl>,
    push_retry: RetryConfig,
}

impl ManifestPatcher {
    pub fn new(scm: Arc<dyn SourceControl>) -> Self {
        Self {
            scm,
            push_retry: RetryConfig::ONCE,
        }
    }

    pub fn with_push_retry(mut self, push_retry: RetryConfig) -> Self {
        self.push_retry = push_retry;
        self
    }

    /// Sets `service`'s image tag to `tag` in `manifest` and pushes the commit
    ///
    /// Re-running with the same tag is a no-op that returns the current HEAD
    /// with `created == false`. A rejected push is retried after rebasing
    /// onto the remote; a rebase conflict, or a second rejection once the
    /// retry budget is spent, fails with `ManifestPushConflict`.
    #[instrument(skip_all, fields(service = service, tag = tag))]
    pub async fn patch_and_commit(
        &self,
        worktree: &Path,
        manifest: &Path,
        service: &str,
        tag: &str,
        branch: &str,
    ) -> Result<CommitReference> {
        let file = worktree.join(manifest);
        let label = manifest.display().to_string();
        let document = tokio::fs::read_to_string(&file).await?;
        let message = commit_message(service, tag);

        let (patched, previous_tag) = match patch_document(&document, service, tag, &label)? {
            Patch::Unchanged => {
                info!("{} already references {}:{}, nothing to commit", label, service, tag);
                return Ok(CommitReference {
                    sha: self.scm.head(worktree).await?,
                    branch: branch.to_string(),
                    message,
                    created: false,
                });
            }
            Patch::Rewritten {
                document,
                previous_tag,
                line,
            } => {
                info!("{}:{}: {} -> {}", label, line, previous_tag, tag);
                (document, previous_tag)
            }
        };

        tokio::fs::write(&file, patched).await?;
        self.scm.commit_all(worktree, &message).await?;

        let attempt_push = |attempt: u32| {
            let scm = self.scm.clone();
            let worktree = worktree.to_path_buf();
            let file = file.clone();
            let label = label.clone();
            let service = service.to_string();
            let tag = tag.to_string();
            let branch = branch.to_string();
            async move {
                if attempt > 0
                    && let Err(e) = rebase(&*scm, &worktree, &file, &label, &service, &tag, &branch).await
                {
                    return Attempt::Fail(e);
                }
                match scm.push(&worktree, &branch).await {
                    Ok(PushOutcome::Pushed) => Attempt::Done(()),
                    Ok(PushOutcome::Rejected { details }) => {
                        Attempt::Retry(conflict(&branch, &tag, format!("push rejected: {}", details)))
                    }
                    Err(e) => Attempt::Fail(e),
                }
            }
        };
        retry("manifest push", self.push_retry, attempt_push).await?;

        let sha = self.scm.head(worktree).await?;
        info!("Pushed {} ({} -> {}) to {} as {}", label, previous_tag, tag, branch, sha);
        Ok(CommitReference {
            sha,
            branch: branch.to_string(),
            message,
            created: true,
        })
    }
}

fn conflict(branch: &str, tag: &str, reason: String) -> ReleaseError {
    ReleaseError::ManifestPushConflict {
        branch: branch.to_string(),
        tag: tag.to_string(),
        reason,
    }
}

/// Rebases onto the remote and checks the reference still carries our tag
async fn rebase(
    scm: &dyn SourceControl,
    worktree: &Path,
    file: &Path,
    label: &str,
    service: &str,
    tag: &str,
    branch: &str,
) -> Result<()> {
    match scm.rebase_onto_remote(worktree, branch).await? {
        RebaseOutcome::Clean => {}
        RebaseOutcome::Conflict { details } => {
            warn!("Rebase of {} onto origin/{} conflicted", label, branch);
            return Err(conflict(branch, tag, format!("rebase conflict: {}", details)));
        }
    }

    let document = tokio::fs::read_to_string(file).await?;
    let anchor = single_anchor(&document, service, label)?;
    if anchor.tag != tag {
        return Err(conflict(
            branch,
            tag,
            format!("after rebase {} references {}:{}", label, service, anchor.tag),
        ));
    }
    Ok(())
}

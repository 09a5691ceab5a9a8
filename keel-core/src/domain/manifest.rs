//! Manifest repository domain types

use serde::{Deserialize, Serialize};

/// The commit recording a manifest version bump
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitReference {
    /// Commit SHA now at the tip of the tracked branch
    pub sha: String,
    pub branch: String,
    pub message: String,
    /// False when the manifest already referenced the tag and nothing was committed
    pub created: bool,
}

/// Deterministic commit message for a tag bump
pub fn commit_message(service: &str, tag: &str) -> String {
    format!("release({}): update image tag to {}", service, tag)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_commit_message_embeds_tag() {
        assert_eq!(
            commit_message("orders", "42"),
            "release(orders): update image tag to 42"
        );
    }
}

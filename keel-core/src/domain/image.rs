//! Image domain types

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::domain::build::BuildId;

/// A published (or about to be published) container image
///
/// `tag` is always the build identifier of the release that produced it.
/// Once pushed, a reference is never re-pointed at a different digest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageReference {
    /// Registry host and optional path prefix (e.g. "registry.example.com/team")
    pub registry: String,
    pub service: String,
    pub tag: String,
    /// Content digest reported by the registry after push
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub digest: Option<String>,
}

impl ImageReference {
    pub fn new(registry: impl Into<String>, service: impl Into<String>, build_id: BuildId) -> Self {
        Self {
            registry: registry.into().trim_end_matches('/').to_string(),
            service: service.into(),
            tag: build_id.tag(),
            digest: None,
        }
    }

    /// Repository path without tag (e.g. "registry.example.com/team/orders")
    pub fn repository(&self) -> String {
        format!("{}/{}", self.registry, self.service)
    }

    /// Same repository, different tag
    pub fn with_tag(&self, tag: impl Into<String>) -> Self {
        Self {
            registry: self.registry.clone(),
            service: self.service.clone(),
            tag: tag.into(),
            digest: None,
        }
    }

    pub fn with_digest(mut self, digest: impl Into<String>) -> Self {
        self.digest = Some(digest.into());
        self
    }

    /// Parses "registry/path/service:tag", optionally followed by "@digest"
    ///
    /// The last path segment is the service; everything before it is the
    /// registry. A reference without a registry part or without a tag is
    /// rejected.
    pub fn parse(input: &str) -> Option<Self> {
        let (input, digest) = match input.trim().split_once('@') {
            Some((_, "")) => return None,
            Some((name, digest)) => (name, Some(digest.to_string())),
            None => (input.trim(), None),
        };
        let (repository, tag) = input.rsplit_once(':')?;
        if tag.is_empty() || tag.contains('/') {
            return None;
        }
        let (registry, service) = repository.rsplit_once('/')?;
        if registry.is_empty() || service.is_empty() {
            return None;
        }
        Some(Self {
            registry: registry.to_string(),
            service: service.to_string(),
            tag: tag.to_string(),
            digest,
        })
    }
}

impl fmt::Display for ImageReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.repository(), self.tag)
    }
}

/// An image built locally but not yet pushed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalImage {
    /// Local image ID as reported by the build tool
    pub id: String,
    /// The reference the image was tagged with
    pub reference: ImageReference,
}

/// An image already present in the registry under a service's repository
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteImage {
    pub reference: ImageReference,
}

impl RemoteImage {
    /// The build number encoded in the tag, if the tag is numeric
    pub fn build_number(&self) -> Option<u64> {
        self.reference.tag.parse().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_uses_build_tag() {
        let image = ImageReference::new("registry.example.com/team/", "orders", BuildId::new(42));
        assert_eq!(image.to_string(), "registry.example.com/team/orders:42");
        assert_eq!(image.repository(), "registry.example.com/team/orders");
    }

    #[test]
    fn test_parse_with_port_in_registry() {
        let image = ImageReference::parse("localhost:5000/orders:7").unwrap();
        assert_eq!(image.registry, "localhost:5000");
        assert_eq!(image.service, "orders");
        assert_eq!(image.tag, "7");
    }

    #[test]
    fn test_parse_rejects_untagged() {
        assert!(ImageReference::parse("localhost:5000/orders").is_none());
        assert!(ImageReference::parse("orders:7").is_none());
    }

    #[test]
    fn test_parse_keeps_digest_out_of_tag() {
        let image = ImageReference::parse("registry.example.com/orders:42@sha256:abc").unwrap();
        assert_eq!(image.registry, "registry.example.com");
        assert_eq!(image.service, "orders");
        assert_eq!(image.tag, "42");
        assert_eq!(image.digest.as_deref(), Some("sha256:abc"));
        assert_eq!(image.to_string(), "registry.example.com/orders:42");

        assert!(ImageReference::parse("registry.example.com/orders@sha256:abc").is_none());
        assert!(ImageReference::parse("registry.example.com/orders:42@").is_none());
    }

    #[test]
    fn test_remote_build_number() {
        let base = ImageReference::new("r.example.com", "orders", BuildId::new(1));
        let numeric = RemoteImage {
            reference: base.with_tag("12"),
        };
        let named = RemoteImage {
            reference: base.with_tag("latest"),
        };
        assert_eq!(numeric.build_number(), Some(12));
        assert_eq!(named.build_number(), None);
    }
}

//! Keel Runner
//!
//! The release reconciliation engine. One invocation releases one service
//! through a fixed, linear sequence of stages:
//!
//! - Version allocation: a unique, strictly increasing build identifier
//! - Artifact publishing: build, prune, push and scan the image
//! - Manifest patching: rewrite the image tag in the GitOps manifest and push
//! - Cluster reconciliation: create or update the workload and wait for rollout
//!
//! The [`executor`] runs the stages under per-stage failure policies and
//! produces the aggregate report. Every external system (container tooling,
//! scanners, source control, static analysis, the cluster) sits behind a
//! trait so the engine can be driven by the process-backed adapters in
//! [`tools`] or by in-memory fakes.

pub mod allocator;
pub mod credentials;
pub mod executor;
pub mod manifest;
pub mod pipeline;
pub mod publisher;
pub mod quality;
pub mod reconciler;
pub mod retry;
pub mod scm;
pub mod tools;

#[cfg(any(test, feature = "test-support"))]
pub mod testing;

pub use allocator::{BuildCounter, VersionAllocator};
pub use executor::{Stage, StageExecutor};
pub use manifest::ManifestPatcher;
pub use pipeline::{Collaborators, ReleaseContext, run_release};
pub use publisher::ArtifactPublisher;
pub use reconciler::ClusterReconciler;

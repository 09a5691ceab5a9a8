//! Core domain types
//!
//! These types represent the entities a release moves through: the build
//! identifier, the published image, the manifest commit, the cluster
//! workload and the per-stage results. They are shared between the engine
//! (which produces them) and the CLI (which renders them).

pub mod build;
pub mod cluster;
pub mod image;
pub mod manifest;
pub mod report;
pub mod scan;
pub mod stage;

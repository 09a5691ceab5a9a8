//! Keel Core
//!
//! Core types and abstractions for the Keel release orchestrator.
//!
//! This crate contains:
//! - Domain types: build identifiers, image references, reconciliation
//!   targets, stage results and the aggregate pipeline report
//! - The release error taxonomy shared by every stage
//! - Release configuration (TOML file plus validation)

pub mod config;
pub mod domain;
pub mod error;

pub use config::ReleaseConfig;
pub use error::{ErrorKind, ReleaseError, Result};

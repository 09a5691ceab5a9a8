//! `keel allocate`

use std::path::Path;

use anyhow::{Context, Result, bail};
use keel_runner::VersionAllocator;
use keel_runner::allocator::counter_from_config;

use crate::config::{self, Overrides};

pub fn handle_allocate(overrides: &Overrides, config_path: &Path) -> Result<i32> {
    let config = config::load_unvalidated(config_path, overrides)?;
    if config.service.trim().is_empty() {
        bail!("No service given (set `service` in {} or pass --service)", config_path.display());
    }

    let counter = counter_from_config(&config.counter);
    let source = counter.describe();
    let build_id = VersionAllocator::new(counter)
        .allocate(&config.service)
        .with_context(|| format!("Failed to allocate from {}", source))?;

    // Bare value on stdout so scripts can capture it
    println!("{}", build_id);
    Ok(0)
}

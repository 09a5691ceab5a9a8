//! Version allocation
//!
//! Produces the build identifier a release is tagged with. The identifier
//! must be unique per service and strictly increasing across invocations,
//! so it always comes from an authority outside the process: the CI
//! environment's build number or a shared counter directory.

use std::fs::OpenOptions;
use std::io::{ErrorKind, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};

use keel_core::config::CounterConfig;
use keel_core::domain::build::BuildId;
use keel_core::{ReleaseError, Result};
use tracing::{debug, info, warn};

/// Upper bound on marker collisions tolerated in one allocation
const MAX_CLAIM_ATTEMPTS: u64 = 64;

/// Source of monotonically increasing build numbers
pub trait BuildCounter: Send + Sync {
    /// Next identifier for `service`
    fn next(&self, service: &str) -> Result<BuildId>;

    /// Short description for logs
    fn describe(&self) -> String;
}

type Lookup = Box<dyn Fn(&str) -> Option<String> + Send + Sync>;

/// Reads the build number handed over by the CI system
pub struct EnvBuildCounter {
    variable: String,
    lookup: Lookup,
}

impl EnvBuildCounter {
    pub fn new(variable: impl Into<String>) -> Self {
        Self::with_lookup(variable, |name| std::env::var(name).ok())
    }

    /// Uses `lookup` instead of the process environment
    pub fn with_lookup(
        variable: impl Into<String>,
        lookup: impl Fn(&str) -> Option<String> + Send + Sync + 'static,
    ) -> Self {
        Self {
            variable: variable.into(),
            lookup: Box::new(lookup),
        }
    }
}

impl BuildCounter for EnvBuildCounter {
    fn next(&self, _service: &str) -> Result<BuildId> {
        let raw = (self.lookup)(&self.variable).ok_or_else(|| {
            ReleaseError::AllocationUnavailable(format!("{} is not set", self.variable))
        })?;
        raw.parse::<BuildId>().map_err(|_| {
            ReleaseError::AllocationUnavailable(format!(
                "{} is not a build number: '{}'",
                self.variable, raw
            ))
        })
    }

    fn describe(&self) -> String {
        format!("env:{}", self.variable)
    }
}

/// Counter backed by a directory shared between release runners
///
/// Every issued number is a marker file `<directory>/<service>/<n>` created
/// with `create_new`, so two concurrent allocations can never claim the
/// same number; the loser moves on to the next one.
pub struct FileBuildCounter {
    directory: PathBuf,
}

impl FileBuildCounter {
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
        }
    }

    fn highest_claimed(&self, service_dir: &std::path::Path) -> Result<u64> {
        let mut highest = 0;
        for entry in std::fs::read_dir(service_dir).map_err(unavailable)? {
            let entry = entry.map_err(unavailable)?;
            if let Some(n) = entry.file_name().to_str().and_then(|n| n.parse::<u64>().ok()) {
                highest = highest.max(n);
            }
        }
        Ok(highest)
    }
}

fn unavailable(e: std::io::Error) -> ReleaseError {
    ReleaseError::AllocationUnavailable(format!("build counter directory: {}", e))
}

impl BuildCounter for FileBuildCounter {
    fn next(&self, service: &str) -> Result<BuildId> {
        let service_dir = self.directory.join(service);
        std::fs::create_dir_all(&service_dir).map_err(unavailable)?;

        let mut candidate = self.highest_claimed(&service_dir)? + 1;
        for _ in 0..MAX_CLAIM_ATTEMPTS {
            let marker = service_dir.join(candidate.to_string());
            match OpenOptions::new().write(true).create_new(true).open(&marker) {
                Ok(mut file) => {
                    if let Err(e) = writeln!(file, "{}", chrono::Utc::now().to_rfc3339()) {
                        warn!("Claimed {} but could not timestamp {}: {}", candidate, marker.display(), e);
                    }
                    return Ok(BuildId::new(candidate));
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                    debug!("Build number {} already claimed for {}", candidate, service);
                    candidate += 1;
                }
                Err(e) => return Err(unavailable(e)),
            }
        }

        Err(ReleaseError::AllocationUnavailable(format!(
            "gave up after {} contended claims in {}",
            MAX_CLAIM_ATTEMPTS,
            service_dir.display()
        )))
    }

    fn describe(&self) -> String {
        format!("file:{}", self.directory.display())
    }
}

/// Process-local counter, for tests and dry runs
pub struct MemoryBuildCounter {
    next: AtomicU64,
}

impl MemoryBuildCounter {
    pub fn starting_at(first: u64) -> Self {
        Self {
            next: AtomicU64::new(first),
        }
    }
}

impl BuildCounter for MemoryBuildCounter {
    fn next(&self, _service: &str) -> Result<BuildId> {
        Ok(BuildId::new(self.next.fetch_add(1, Ordering::SeqCst)))
    }

    fn describe(&self) -> String {
        "memory".to_string()
    }
}

/// Builds the counter selected by configuration
pub fn counter_from_config(config: &CounterConfig) -> Box<dyn BuildCounter> {
    match config {
        CounterConfig::Env { variable } => Box::new(EnvBuildCounter::new(variable.clone())),
        CounterConfig::File { directory } => Box::new(FileBuildCounter::new(directory.clone())),
    }
}

/// Hands out build identifiers, refusing to ever go backwards
pub struct VersionAllocator {
    counter: Box<dyn BuildCounter>,
    last_issued: Option<BuildId>,
}

impl VersionAllocator {
    pub fn new(counter: Box<dyn BuildCounter>) -> Self {
        Self {
            counter,
            last_issued: None,
        }
    }

    /// Allocates the next build identifier for `service`
    ///
    /// Fails with `AllocationUnavailable` when the counter cannot answer or
    /// answers with a number not greater than one this allocator already
    /// issued; no identifier is ever issued twice.
    pub fn allocate(&mut self, service: &str) -> Result<BuildId> {
        let id = self.counter.next(service)?;
        if let Some(last) = self.last_issued
            && id <= last
        {
            return Err(ReleaseError::AllocationUnavailable(format!(
                "{} returned {} after {} was already issued",
                self.counter.describe(),
                id,
                last
            )));
        }
        info!("Allocated build {} for {} ({})", id, service, self.counter.describe());
        self.last_issued = Some(id);
        Ok(id)
    }

    pub fn last_issued(&self) -> Option<BuildId> {
        self.last_issued
    }
}

//! In-memory fakes for every external seam
//!
//! Available to unit tests and, through the `test-support` feature, to
//! integration tests. Each fake records what it was asked to do so tests
//! can assert on side effects.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use keel_core::domain::cluster::{ContainerSpec, NamespaceStatus, RolloutStatus, Workload};
use keel_core::domain::image::{ImageReference, LocalImage, RemoteImage};
use keel_core::domain::scan::Findings;
use keel_core::{ReleaseError, Result};

use crate::credentials::{CredentialProvider, Credentials, RegistryCredentials};
use crate::publisher::{ContainerTool, VulnerabilityScanner};
use crate::quality::{AnalysisSummary, GateStatus, QualityGate};
use crate::reconciler::ClusterApi;
use crate::scm::{PushOutcome, RebaseOutcome, SourceControl};

// =============================================================================
// Container tool
// =============================================================================

#[derive(Default)]
struct RegistryState {
    remote: Vec<String>,
    built: Vec<String>,
    pushed: Vec<String>,
    logins: Vec<String>,
}

#[derive(Default)]
pub struct FakeContainerTool {
    state: Mutex<RegistryState>,
    fail_build: bool,
    fail_push: bool,
    fail_delete: bool,
}

impl FakeContainerTool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Tags already present in the service repository
    pub fn with_remote_tags(self, tags: &[&str]) -> Self {
        self.state.lock().unwrap().remote = tags.iter().map(|t| t.to_string()).collect();
        self
    }

    pub fn failing_build(mut self) -> Self {
        self.fail_build = true;
        self
    }

    pub fn failing_push(mut self) -> Self {
        self.fail_push = true;
        self
    }

    pub fn failing_deletes(mut self) -> Self {
        self.fail_delete = true;
        self
    }

    pub fn built_tags(&self) -> Vec<String> {
        self.state.lock().unwrap().built.clone()
    }

    pub fn pushed_tags(&self) -> Vec<String> {
        self.state.lock().unwrap().pushed.clone()
    }

    pub fn remote_tags(&self) -> Vec<String> {
        self.state.lock().unwrap().remote.clone()
    }

    pub fn logins(&self) -> Vec<String> {
        self.state.lock().unwrap().logins.clone()
    }
}

#[async_trait]
impl ContainerTool for FakeContainerTool {
    async fn build(&self, _context_dir: &Path, image: &ImageReference) -> Result<LocalImage> {
        if self.fail_build {
            return Err(ReleaseError::tool("podman", "exit status 1: COPY failed"));
        }
        self.state.lock().unwrap().built.push(image.tag.clone());
        Ok(LocalImage {
            id: format!("sha256:local-{}", image.tag),
            reference: image.clone(),
        })
    }

    async fn login(&self, registry: &str, _credentials: &RegistryCredentials) -> Result<()> {
        self.state.lock().unwrap().logins.push(registry.to_string());
        Ok(())
    }

    async fn list_remote(&self, image: &ImageReference) -> Result<Vec<RemoteImage>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .remote
            .iter()
            .map(|tag| RemoteImage {
                reference: image.with_tag(tag.clone()),
            })
            .collect())
    }

    async fn delete_remote(&self, image: &ImageReference) -> Result<()> {
        if self.fail_delete {
            return Err(ReleaseError::tool("skopeo", "403 denied"));
        }
        self.state.lock().unwrap().remote.retain(|tag| *tag != image.tag);
        Ok(())
    }

    async fn push(&self, image: &LocalImage) -> Result<ImageReference> {
        if self.fail_push {
            return Err(ReleaseError::tool("podman", "connection reset by peer"));
        }
        let mut state = self.state.lock().unwrap();
        let tag = image.reference.tag.clone();
        state.pushed.push(tag.clone());
        if !state.remote.contains(&tag) {
            state.remote.push(tag.clone());
        }
        Ok(image
            .reference
            .clone()
            .with_digest(format!("sha256:remote-{}", tag)))
    }
}

// =============================================================================
// Scanner
// =============================================================================

pub struct FakeScanner {
    filesystem: Findings,
    image: Findings,
    fail: bool,
}

impl FakeScanner {
    pub fn clean() -> Self {
        Self {
            filesystem: Findings::new(),
            image: Findings::new(),
            fail: false,
        }
    }

    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::clean()
        }
    }

    pub fn with_filesystem_findings(mut self, findings: Findings) -> Self {
        self.filesystem = findings;
        self
    }

    pub fn with_image_findings(mut self, findings: Findings) -> Self {
        self.image = findings;
        self
    }
}

#[async_trait]
impl VulnerabilityScanner for FakeScanner {
    async fn scan_filesystem(&self, _path: &Path) -> Result<Findings> {
        if self.fail {
            return Err(ReleaseError::tool("trivy", "database download failed"));
        }
        Ok(self.filesystem.clone())
    }

    async fn scan_image(&self, _image: &ImageReference) -> Result<Findings> {
        if self.fail {
            return Err(ReleaseError::tool("trivy", "database download failed"));
        }
        Ok(self.image.clone())
    }
}

// =============================================================================
// Source control
// =============================================================================

#[derive(Default)]
struct ScmState {
    repositories: HashMap<String, Vec<(PathBuf, String)>>,
    push_outcomes: VecDeque<PushOutcome>,
    rebase_outcome: Option<RebaseOutcome>,
    rebase_rewrite: Option<(PathBuf, String)>,
    checkouts: Vec<(String, String, PathBuf)>,
    commits: Vec<String>,
    pushes: u32,
    rebases: u32,
}

/// Source control whose "remote" is a set of seeded files
#[derive(Default)]
pub struct FakeSourceControl {
    state: Mutex<ScmState>,
}

impl FakeSourceControl {
    pub fn new() -> Self {
        Self::default()
    }

    /// Files a checkout of `repository` produces
    pub fn with_repository(self, repository: &str, files: &[(&str, &str)]) -> Self {
        self.state.lock().unwrap().repositories.insert(
            repository.to_string(),
            files
                .iter()
                .map(|(path, contents)| (PathBuf::from(path), contents.to_string()))
                .collect(),
        );
        self
    }

    /// The next `count` pushes are rejected as non-fast-forward
    pub fn rejecting_pushes(self, count: usize) -> Self {
        {
            let mut state = self.state.lock().unwrap();
            for _ in 0..count {
                state.push_outcomes.push_back(PushOutcome::Rejected {
                    details: "! [rejected] HEAD -> main (fetch first)".to_string(),
                });
            }
        }
        self
    }

    pub fn with_rebase(self, outcome: RebaseOutcome) -> Self {
        self.state.lock().unwrap().rebase_outcome = Some(outcome);
        self
    }

    /// A clean rebase that brings in a remote version of `path`
    pub fn rewriting_on_rebase(self, path: &str, contents: &str) -> Self {
        self.state.lock().unwrap().rebase_rewrite = Some((PathBuf::from(path), contents.to_string()));
        self
    }

    pub fn checkouts(&self) -> Vec<(String, String, PathBuf)> {
        self.state.lock().unwrap().checkouts.clone()
    }

    pub fn commits(&self) -> Vec<String> {
        self.state.lock().unwrap().commits.clone()
    }

    pub fn push_count(&self) -> u32 {
        self.state.lock().unwrap().pushes
    }

    pub fn rebase_count(&self) -> u32 {
        self.state.lock().unwrap().rebases
    }
}

#[async_trait]
impl SourceControl for FakeSourceControl {
    async fn checkout(&self, repository: &str, branch: &str, dest: &Path) -> Result<()> {
        let files = {
            let mut state = self.state.lock().unwrap();
            state
                .checkouts
                .push((repository.to_string(), branch.to_string(), dest.to_path_buf()));
            state.repositories.get(repository).cloned()
        };
        let files = files.ok_or_else(|| ReleaseError::CheckoutFailed {
            repository: repository.to_string(),
            branch: branch.to_string(),
            reason: "repository not found".to_string(),
        })?;

        if dest.exists() {
            std::fs::remove_dir_all(dest)?;
        }
        std::fs::create_dir_all(dest)?;
        for (path, contents) in files {
            let file = dest.join(path);
            if let Some(parent) = file.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(file, contents)?;
        }
        Ok(())
    }

    async fn commit_all(&self, _worktree: &Path, message: &str) -> Result<String> {
        let mut state = self.state.lock().unwrap();
        state.commits.push(message.to_string());
        Ok(format!("sha-{}", state.commits.len()))
    }

    async fn push(&self, _worktree: &Path, _branch: &str) -> Result<PushOutcome> {
        let mut state = self.state.lock().unwrap();
        state.pushes += 1;
        Ok(state.push_outcomes.pop_front().unwrap_or(PushOutcome::Pushed))
    }

    async fn rebase_onto_remote(&self, worktree: &Path, _branch: &str) -> Result<RebaseOutcome> {
        let (outcome, rewrite) = {
            let mut state = self.state.lock().unwrap();
            state.rebases += 1;
            (
                state.rebase_outcome.clone().unwrap_or(RebaseOutcome::Clean),
                state.rebase_rewrite.clone(),
            )
        };
        if outcome == RebaseOutcome::Clean
            && let Some((path, contents)) = rewrite
        {
            std::fs::write(worktree.join(path), contents)?;
        }
        Ok(outcome)
    }

    async fn head(&self, _worktree: &Path) -> Result<String> {
        Ok(format!("sha-{}", self.state.lock().unwrap().commits.len()))
    }
}

// =============================================================================
// Cluster
// =============================================================================

#[derive(Debug, Clone)]
enum RolloutBehaviour {
    StableAfter(u32),
    Never,
    Fails(String),
}

struct ClusterState {
    workloads: HashMap<(String, String), Workload>,
    namespaces: BTreeSet<String>,
    mutations: u32,
    polls: u32,
}

pub struct FakeCluster {
    state: Mutex<ClusterState>,
    rollout: RolloutBehaviour,
    fail_apply: bool,
}

impl Default for FakeCluster {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeCluster {
    /// An empty cluster where every rollout completes on the first poll
    pub fn new() -> Self {
        Self {
            state: Mutex::new(ClusterState {
                workloads: HashMap::new(),
                namespaces: BTreeSet::new(),
                mutations: 0,
                polls: 0,
            }),
            rollout: RolloutBehaviour::StableAfter(1),
            fail_apply: false,
        }
    }

    /// An existing workload with one container named like the workload
    pub fn with_workload(self, namespace: &str, name: &str, image: &str, replicas: i32) -> Self {
        {
            let mut state = self.state.lock().unwrap();
            state.namespaces.insert(namespace.to_string());
            state.workloads.insert(
                (namespace.to_string(), name.to_string()),
                Workload {
                    namespace: namespace.to_string(),
                    name: name.to_string(),
                    containers: vec![ContainerSpec {
                        name: name.to_string(),
                        image: image.to_string(),
                    }],
                    replicas: Some(replicas),
                },
            );
        }
        self
    }

    /// Rollout reports complete from the `polls`-th status read on
    pub fn stable_after_polls(mut self, polls: u32) -> Self {
        self.rollout = RolloutBehaviour::StableAfter(polls);
        self
    }

    pub fn never_stable(mut self) -> Self {
        self.rollout = RolloutBehaviour::Never;
        self
    }

    pub fn failing_rollout(mut self, reason: &str) -> Self {
        self.rollout = RolloutBehaviour::Fails(reason.to_string());
        self
    }

    pub fn failing_apply(mut self) -> Self {
        self.fail_apply = true;
        self
    }

    pub fn workload(&self, namespace: &str, name: &str) -> Option<Workload> {
        self.state
            .lock()
            .unwrap()
            .workloads
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
    }

    pub fn has_namespace(&self, namespace: &str) -> bool {
        self.state.lock().unwrap().namespaces.contains(namespace)
    }

    /// Number of create and update calls
    pub fn mutations(&self) -> u32 {
        self.state.lock().unwrap().mutations
    }

    pub fn status_polls(&self) -> u32 {
        self.state.lock().unwrap().polls
    }
}

/// Value of the first `key:` line in a YAML-ish document
fn field(document: &str, key: &str) -> Option<String> {
    document.lines().find_map(|line| {
        let line = line.trim().trim_start_matches("- ");
        line.strip_prefix(key)
            .and_then(|rest| rest.strip_prefix(':'))
            .map(|value| value.trim().trim_matches('"').to_string())
    })
}

#[async_trait]
impl ClusterApi for FakeCluster {
    async fn get_workload(&self, namespace: &str, name: &str) -> Result<Option<Workload>> {
        Ok(self.workload(namespace, name))
    }

    async fn apply_manifest(&self, namespace: &str, name: &str, document: &str) -> Result<()> {
        if self.fail_apply {
            return Err(ReleaseError::tool("cluster-api", "422 Unprocessable Entity"));
        }
        let workload = Workload {
            namespace: namespace.to_string(),
            name: name.to_string(),
            containers: vec![ContainerSpec {
                name: field(document, "name").unwrap_or_else(|| name.to_string()),
                image: field(document, "image").unwrap_or_default(),
            }],
            replicas: field(document, "replicas").and_then(|r| r.parse().ok()),
        };
        let mut state = self.state.lock().unwrap();
        state.mutations += 1;
        state
            .workloads
            .insert((namespace.to_string(), name.to_string()), workload);
        Ok(())
    }

    async fn set_image(&self, namespace: &str, name: &str, container: &str, image: &str) -> Result<()> {
        if self.fail_apply {
            return Err(ReleaseError::tool("cluster-api", "422 Unprocessable Entity"));
        }
        let mut state = self.state.lock().unwrap();
        state.mutations += 1;
        let workload = state
            .workloads
            .get_mut(&(namespace.to_string(), name.to_string()))
            .ok_or_else(|| ReleaseError::tool("cluster-api", "404 Not Found"))?;
        for spec in workload.containers.iter_mut().filter(|c| c.name == container) {
            spec.image = image.to_string();
        }
        Ok(())
    }

    async fn rollout_status(&self, _namespace: &str, _name: &str) -> Result<RolloutStatus> {
        let polls = {
            let mut state = self.state.lock().unwrap();
            state.polls += 1;
            state.polls
        };
        // Yield like a real API call would
        tokio::time::sleep(Duration::from_millis(1)).await;

        let progressing = RolloutStatus::Progressing {
            updated: 1,
            available: 0,
            desired: 2,
        };
        Ok(match &self.rollout {
            RolloutBehaviour::StableAfter(n) if polls >= *n => RolloutStatus::Complete,
            RolloutBehaviour::StableAfter(_) | RolloutBehaviour::Never => progressing,
            RolloutBehaviour::Fails(reason) => RolloutStatus::Failed {
                reason: reason.clone(),
            },
        })
    }

    async fn create_namespace(&self, namespace: &str) -> Result<NamespaceStatus> {
        let created = self.state.lock().unwrap().namespaces.insert(namespace.to_string());
        Ok(if created {
            NamespaceStatus::Created
        } else {
            NamespaceStatus::AlreadyExists
        })
    }
}

// =============================================================================
// Quality gate and credentials
// =============================================================================

pub struct FakeQualityGate {
    gate: GateStatus,
    fail_analysis: bool,
    analyses: Mutex<u32>,
}

impl FakeQualityGate {
    pub fn passing() -> Self {
        Self {
            gate: GateStatus::Passed,
            fail_analysis: false,
            analyses: Mutex::new(0),
        }
    }

    pub fn failing(reason: &str) -> Self {
        Self {
            gate: GateStatus::Failed {
                reason: reason.to_string(),
            },
            ..Self::passing()
        }
    }

    pub fn broken_analysis(mut self) -> Self {
        self.fail_analysis = true;
        self
    }

    pub fn analyses(&self) -> u32 {
        *self.analyses.lock().unwrap()
    }
}

#[async_trait]
impl QualityGate for FakeQualityGate {
    async fn analyze(&self, _source_dir: &Path) -> Result<AnalysisSummary> {
        *self.analyses.lock().unwrap() += 1;
        if self.fail_analysis {
            return Err(ReleaseError::tool("sonar-scanner", "exit status 2"));
        }
        Ok(AnalysisSummary {
            task_id: Some("task-1".to_string()),
            detail: "analysis submitted".to_string(),
        })
    }

    async fn wait_for_gate(&self, _source_dir: &Path, _timeout: Duration) -> Result<GateStatus> {
        Ok(self.gate.clone())
    }
}

/// Hands out a fixed set of credentials, or a fixed refusal
pub struct StaticCredentials {
    credentials: Credentials,
    missing: Option<String>,
}

impl StaticCredentials {
    pub fn new(credentials: Credentials) -> Self {
        Self {
            credentials,
            missing: None,
        }
    }

    pub fn anonymous() -> Self {
        Self::new(Credentials::default())
    }

    pub fn missing(reason: &str) -> Self {
        Self {
            credentials: Credentials::default(),
            missing: Some(reason.to_string()),
        }
    }
}

impl CredentialProvider for StaticCredentials {
    fn scope(&self) -> Result<Credentials> {
        match &self.missing {
            Some(reason) => Err(ReleaseError::CredentialsUnavailable(reason.clone())),
            None => Ok(self.credentials.clone()),
        }
    }
}

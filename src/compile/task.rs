//! Compile tasks: one package to build on one stemcell.

use serde_json::{Map, Value, json};
use sha2::{Digest, Sha256};
use std::sync::Arc;

use crate::db::{CompiledPackageRecord, PackageRecord, StemcellRecord};
use crate::plan::Job;

/// Scheduling key: (package id, stemcell id).
pub type TaskKey = (u64, u64);

/// State of one compile task in the scheduling loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TaskState {
    /// Waiting for dependencies.
    #[default]
    Pending,
    /// All dependencies satisfied; eligible for dispatch.
    Ready,
    /// Handed to a worker.
    Dispatched,
    /// Compiled package recorded.
    Done,
    /// Worker reported failure.
    Failed,
}

impl TaskState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Failed)
    }
}

/// Canonical fingerprint over a dependency closure: the `[name, version]`
/// pairs of every package in the closure, sorted by name, JSON-encoded.
/// The empty closure encodes as `"[]"`.
pub fn dependency_key(closure: &[PackageRecord]) -> String {
    let mut pairs: Vec<(&str, &str)> = closure
        .iter()
        .map(|p| (p.name.as_str(), p.version.as_str()))
        .collect();
    pairs.sort();
    serde_json::to_string(&pairs).unwrap_or_else(|_| "[]".to_string())
}

/// One package to compile for one stemcell, with its resolved transitive
/// dependency closure.
#[derive(Clone, Debug)]
pub struct CompileTask {
    pub package: PackageRecord,
    pub stemcell: StemcellRecord,
    /// Transitive dependency closure, sorted by package name.
    pub closure: Vec<PackageRecord>,
    /// Direct dependency tasks; the scheduler dispatches this task only
    /// after all of them are done.
    pub dependencies: Vec<TaskKey>,
    pub dependency_key: String,
    /// Jobs awaiting this task's compiled package.
    pub jobs: Vec<Arc<Job>>,
    pub state: TaskState,
    pub compiled: Option<CompiledPackageRecord>,
}

impl CompileTask {
    pub fn new(
        package: PackageRecord,
        stemcell: StemcellRecord,
        mut closure: Vec<PackageRecord>,
        dependencies: Vec<TaskKey>,
    ) -> Self {
        closure.sort_by(|a, b| a.name.cmp(&b.name));
        let dependency_key = dependency_key(&closure);
        Self {
            package,
            stemcell,
            closure,
            dependencies,
            dependency_key,
            jobs: Vec::new(),
            state: TaskState::Pending,
            compiled: None,
        }
    }

    pub fn key(&self) -> TaskKey {
        (self.package.id, self.stemcell.id)
    }

    /// Content key for the global cache tier, derived from the package
    /// fingerprint, the dependency key, and the stemcell sha1.
    pub fn cache_key(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.package.fingerprint.as_bytes());
        hasher.update(self.dependency_key.as_bytes());
        hasher.update(self.stemcell.sha1.as_bytes());
        format!("{:x}", hasher.finalize())
    }

    /// Attach a job awaiting this package, once.
    pub fn add_job(&mut self, job: Arc<Job>) {
        if !self.jobs.iter().any(|j| Arc::ptr_eq(j, &job)) {
            self.jobs.push(job);
        }
    }

    /// Dependency manifest for the compile RPC: name → {version, sha1,
    /// blobstore_id} of each closure member's compiled artifact. `lookup`
    /// resolves a closure package to its compiled record.
    pub fn dependency_manifest(
        &self,
        mut lookup: impl FnMut(&PackageRecord) -> Option<CompiledPackageRecord>,
    ) -> Map<String, Value> {
        let mut manifest = Map::new();
        for dep in &self.closure {
            if let Some(compiled) = lookup(dep) {
                manifest.insert(
                    dep.name.clone(),
                    json!({
                        "version": dep.version,
                        "sha1": compiled.sha1,
                        "blobstore_id": compiled.blobstore_id,
                    }),
                );
            }
        }
        manifest
    }
}

//! Typed error hierarchy for the orchestrator core.
//!
//! Three top-level enums cover the three subsystems:
//! - `ReconcileError` — plan binding and drift detection failures
//! - `CompileError` — package compilation run failures
//! - `AgentError` — failures reported by (or while talking to) a worker agent
//!
//! Drift errors embed the conflicting identifiers in their messages so an
//! operator can see exactly which machine disagrees with the database.

use thiserror::Error;

/// Errors reported by a worker agent or its transport.
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("timed out waiting for agent `{agent_id}'")]
    RpcTimeout { agent_id: String },

    #[error("agent `{agent_id}' failed: {message}")]
    TaskFailed { agent_id: String, message: String },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl AgentError {
    /// Whether this error is an RPC timeout (fatal to the compilation run,
    /// but still guarantees worker teardown before it propagates).
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::RpcTimeout { .. })
    }
}

/// Errors from the state reconciler.
///
/// The `Agent*` and `VmInstanceOutOfSync` variants indicate drift between the
/// declared plan and live agent-reported state. They are fatal to the
/// reconciliation run; no automatic repair is attempted.
#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("deployment `{name}' does not exist")]
    DeploymentNotFound { name: String },

    #[error("release `{name}/{version}' does not exist")]
    ReleaseNotFound { name: String, version: String },

    #[error("stemcell `{name}/{version}' does not exist")]
    StemcellNotFound { name: String, version: String },

    #[error("release `{release}' has no package named `{package}'")]
    PackageNotFound { package: String, release: String },

    #[error("{entity} has not been bound")]
    Unbound { entity: String },

    #[error("VM `{vm_cid}' returns invalid state: expected Hash, got {details}")]
    AgentInvalidStateFormat { vm_cid: String, details: String },

    #[error(
        "VM `{vm_cid}' is out of sync: expected to be a part of deployment \
         `{expected}' but is actually a part of deployment `{actual}'"
    )]
    AgentWrongDeployment {
        vm_cid: String,
        expected: String,
        actual: String,
    },

    #[error(
        "VM `{vm_cid}' is out of sync: it reports itself as `{job}/{index}' \
         but there is no instance reference in DB"
    )]
    AgentUnexpectedJob {
        vm_cid: String,
        job: String,
        index: u64,
    },

    #[error(
        "VM `{vm_cid}' is out of sync: it reports itself as \
         `{reported_job}/{reported_index}' but according to DB it is \
         `{db_job}/{db_index}'"
    )]
    AgentJobMismatch {
        vm_cid: String,
        reported_job: String,
        reported_index: u64,
        db_job: String,
        db_index: u64,
    },

    #[error("VM `{vm_cid}' and instance `{job}/{index}' don't belong to the same deployment")]
    VmInstanceOutOfSync {
        vm_cid: String,
        job: String,
        index: u64,
    },

    #[error("failed to reserve IP on network `{network}' for {subject}: no more available")]
    NetworkExhausted { network: String, subject: String },

    #[error(transparent)]
    Agent(#[from] AgentError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Errors from the compilation scheduler and its worker pool.
#[derive(Debug, Error)]
pub enum CompileError {
    #[error("dependency cycle among packages: {packages:?}")]
    DependencyCycle { packages: Vec<String> },

    #[error("worker limit reached for stemcell `{stemcell}': {workers} workers")]
    WorkerLimit { stemcell: String, workers: usize },

    #[error("compilation cancelled")]
    Cancelled,

    #[error(transparent)]
    Agent(#[from] AgentError),

    #[error(transparent)]
    Reconcile(#[from] ReconcileError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Recognizes the legacy "no changes" conflict message some collaborators
/// return when an upload matches what is already stored. Callers treat a
/// benign conflict as a no-op. This is a compatibility shim kept for
/// collaborators that cannot report a structured conflict; prefer matching on
/// a typed error when one is available.
pub fn is_benign_conflict(message: &str) -> bool {
    message.contains("no changes") || message.contains("already uploaded")
}

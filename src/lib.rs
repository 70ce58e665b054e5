//! Helmsman: deployment reconciliation and package compilation core.
//!
//! The crate has two halves. The [`Reconciler`] binds a [`DeploymentPlan`]
//! against persisted state and live agents, detecting drift between what
//! machines report and what the database says. The [`PackageCompiler`]
//! schedules package builds over a bounded pool of ephemeral worker machines,
//! honoring dependency order and a two-tier compiled artifact cache.
//!
//! Infrastructure seams (cloud driver, agent transport, networks, the
//! distributed lock, and the global cache) are traits, so the core runs the
//! same against a real IaaS or the in-memory fakes the tests use.

pub mod agent;
pub mod cloud;
pub mod compile;
pub mod context;
pub mod db;
pub mod errors;
pub mod events;
pub mod lock;
pub mod network;
pub mod plan;
pub mod reconciler;

pub use agent::{AgentClient, AgentClientFactory, CompiledArtifact};
pub use cloud::CloudDriver;
pub use compile::{GlobalPackageCache, PackageCompiler};
pub use context::{CompilationConfig, CoreContext, DnsConfig};
pub use db::Database;
pub use errors::{AgentError, CompileError, ReconcileError};
pub use events::{Event, EventLog};
pub use lock::{DeployLock, InMemoryLocks, LockGuard};
pub use network::{Network, NetworkReservation};
pub use plan::DeploymentPlan;
pub use reconciler::{ConfigurationHasher, Reconciler};

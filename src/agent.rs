//! Worker-agent RPC interface.
//!
//! Every machine the orchestrator manages runs an agent. The orchestrator
//! talks to it through [`AgentClient`]; production transports and test fakes
//! both implement the trait. Clients are obtained from an
//! [`AgentClientFactory`] keyed by the agent identifier recorded on the
//! machine.

use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;

use crate::errors::AgentError;

/// Result of a successful `compile_package` RPC.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompiledArtifact {
    pub sha1: String,
    pub blobstore_id: String,
}

/// RPC surface of a single worker agent.
#[async_trait]
pub trait AgentClient: Send + Sync {
    /// Block until the agent answers pings. Carries the externally configured
    /// RPC timeout; a timeout surfaces as [`AgentError::RpcTimeout`].
    async fn wait_until_ready(&self) -> Result<(), AgentError>;

    /// Apply a new desired state to the agent.
    async fn apply(&self, state: &Value) -> Result<(), AgentError>;

    /// Compile one package on the worker. `dependencies` maps each dependency
    /// package name to `{version, sha1, blobstore_id}` of its compiled
    /// artifact.
    async fn compile_package(
        &self,
        blobstore_id: &str,
        sha1: &str,
        name: &str,
        version_label: &str,
        dependencies: &serde_json::Map<String, Value>,
    ) -> Result<CompiledArtifact, AgentError>;

    /// Fetch the agent's view of its own state.
    async fn get_state(&self) -> Result<Value, AgentError>;
}

/// Hands out [`AgentClient`]s for agent identifiers.
pub trait AgentClientFactory: Send + Sync {
    fn client(&self, agent_id: &str) -> Arc<dyn AgentClient>;
}

//! Explicit collaborator context.
//!
//! Everything that would otherwise live in process-global configuration —
//! cloud driver, database, lock service, global cache, cancellation flag —
//! is bundled into a [`CoreContext`] passed to each component at
//! construction.

use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::agent::AgentClientFactory;
use crate::cloud::CloudDriver;
use crate::compile::cache::GlobalPackageCache;
use crate::db::Database;
use crate::events::EventLog;
use crate::lock::DeployLock;

/// DNS settings for the orchestrator's own domain.
#[derive(Debug, Clone)]
pub struct DnsConfig {
    /// Domain the orchestrator maintains records under.
    pub domain_name: String,
    /// Address of the orchestrator's nameserver.
    pub address: String,
}

/// Compilation settings carried by the deployment plan.
#[derive(Debug, Clone)]
pub struct CompilationConfig {
    /// Maximum concurrent compile workers per stemcell.
    pub workers: usize,
    /// Network compile workers take their reservations on.
    pub network_name: String,
    /// Keep workers alive across tasks within a stemcell for the run.
    pub reuse_compilation_vms: bool,
    /// Cloud properties for compile workers.
    pub cloud_properties: Value,
    /// Environment passed to compile workers.
    pub env: Value,
}

impl CompilationConfig {
    pub fn new(workers: usize, network_name: &str) -> Self {
        Self {
            workers,
            network_name: network_name.to_string(),
            reuse_compilation_vms: false,
            cloud_properties: Value::Object(Default::default()),
            env: Value::Object(Default::default()),
        }
    }

    /// Enable or disable worker reuse.
    pub fn with_reuse(mut self, reuse: bool) -> Self {
        self.reuse_compilation_vms = reuse;
        self
    }

    /// Set cloud properties for compile workers.
    pub fn with_cloud_properties(mut self, properties: Value) -> Self {
        self.cloud_properties = properties;
        self
    }

    /// Set the worker environment.
    pub fn with_env(mut self, env: Value) -> Self {
        self.env = env;
        self
    }
}

/// Shared collaborator bundle for one orchestrator run.
pub struct CoreContext {
    pub db: Arc<Database>,
    pub cloud: Arc<dyn CloudDriver>,
    pub agents: Arc<dyn AgentClientFactory>,
    pub locks: Arc<dyn DeployLock>,
    pub events: Arc<EventLog>,
    /// Global compiled-package cache tier; `None` disables it.
    pub global_cache: Option<Arc<dyn GlobalPackageCache>>,
    /// DNS settings; `None` skips DNS binding.
    pub dns: Option<DnsConfig>,
    cancelled: Arc<AtomicBool>,
}

impl CoreContext {
    pub fn new(
        db: Arc<Database>,
        cloud: Arc<dyn CloudDriver>,
        agents: Arc<dyn AgentClientFactory>,
        locks: Arc<dyn DeployLock>,
    ) -> Self {
        Self {
            db,
            cloud,
            agents,
            locks,
            events: Arc::new(EventLog::new()),
            global_cache: None,
            dns: None,
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Enable the global compiled-package cache tier.
    pub fn with_global_cache(mut self, cache: Arc<dyn GlobalPackageCache>) -> Self {
        self.global_cache = Some(cache);
        self
    }

    /// Configure DNS binding.
    pub fn with_dns(mut self, dns: DnsConfig) -> Self {
        self.dns = Some(dns);
        self
    }

    /// Share an externally owned event log.
    pub fn with_events(mut self, events: Arc<EventLog>) -> Self {
        self.events = events;
        self
    }

    /// Share an externally owned cancellation flag.
    pub fn with_cancel_flag(mut self, flag: Arc<AtomicBool>) -> Self {
        self.cancelled = flag;
        self
    }

    /// Handle an observer can raise to stop new work being dispatched.
    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        self.cancelled.clone()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

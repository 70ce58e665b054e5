//! In-memory fakes for the infrastructure seams, plus plan builders shared
//! by the integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use serde_json::{Value, json};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Once};

use helmsman::agent::{AgentClient, AgentClientFactory, CompiledArtifact};
use helmsman::cloud::CloudDriver;
use helmsman::compile::{CachedArtifact, GlobalPackageCache};
use helmsman::context::{CompilationConfig, CoreContext};
use helmsman::db::Database;
use helmsman::errors::AgentError;
use helmsman::lock::InMemoryLocks;
use helmsman::network::{Network, NetworkReservation, ReservationKind};
use helmsman::plan::{DeploymentPlan, Job, ReleaseSpec, ResourcePool, StemcellSpec, TemplateSpec};

/// Route crate logs through the test harness, honoring `RUST_LOG`.
pub fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .init();
    });
}

// --- agents ---

#[derive(Clone, Copy)]
pub enum FailureKind {
    Timeout,
    TaskFailed,
}

/// Behavior and observations shared by every agent a factory hands out.
#[derive(Default)]
pub struct AgentBehavior {
    /// Package names in compile completion order.
    pub compiled: Mutex<Vec<String>>,
    /// Last dependency manifest seen per package name.
    pub manifests: Mutex<HashMap<String, serde_json::Map<String, Value>>>,
    /// Every state applied to any worker.
    pub applied_states: Mutex<Vec<Value>>,
    fail_packages: Mutex<HashMap<String, FailureKind>>,
    fail_ready: AtomicBool,
}

impl AgentBehavior {
    pub fn fail_package(&self, name: &str, kind: FailureKind) {
        self.fail_packages
            .lock()
            .unwrap()
            .insert(name.to_string(), kind);
    }

    pub fn fail_ready(&self) {
        self.fail_ready.store(true, Ordering::SeqCst);
    }

    pub fn compiled_packages(&self) -> Vec<String> {
        self.compiled.lock().unwrap().clone()
    }
}

pub struct FakeAgent {
    pub agent_id: String,
    state: Mutex<Value>,
    pub applied: Mutex<Vec<Value>>,
    behavior: Arc<AgentBehavior>,
}

impl FakeAgent {
    fn new(agent_id: &str, state: Value, behavior: Arc<AgentBehavior>) -> Self {
        Self {
            agent_id: agent_id.to_string(),
            state: Mutex::new(state),
            applied: Mutex::new(Vec::new()),
            behavior,
        }
    }

    pub fn set_state(&self, state: Value) {
        *self.state.lock().unwrap() = state;
    }
}

#[async_trait]
impl AgentClient for FakeAgent {
    async fn wait_until_ready(&self) -> Result<(), AgentError> {
        if self.behavior.fail_ready.load(Ordering::SeqCst) {
            return Err(AgentError::RpcTimeout {
                agent_id: self.agent_id.clone(),
            });
        }
        Ok(())
    }

    async fn apply(&self, state: &Value) -> Result<(), AgentError> {
        self.applied.lock().unwrap().push(state.clone());
        self.behavior
            .applied_states
            .lock()
            .unwrap()
            .push(state.clone());
        Ok(())
    }

    async fn compile_package(
        &self,
        _blobstore_id: &str,
        _sha1: &str,
        name: &str,
        _version_label: &str,
        dependencies: &serde_json::Map<String, Value>,
    ) -> Result<CompiledArtifact, AgentError> {
        self.behavior
            .manifests
            .lock()
            .unwrap()
            .insert(name.to_string(), dependencies.clone());
        let failure = self.behavior.fail_packages.lock().unwrap().get(name).copied();
        match failure {
            Some(FailureKind::Timeout) => Err(AgentError::RpcTimeout {
                agent_id: self.agent_id.clone(),
            }),
            Some(FailureKind::TaskFailed) => Err(AgentError::TaskFailed {
                agent_id: self.agent_id.clone(),
                message: format!("compile of {name} failed"),
            }),
            None => {
                self.behavior.compiled.lock().unwrap().push(name.to_string());
                Ok(CompiledArtifact {
                    sha1: format!("compiled {name}"),
                    blobstore_id: format!("blob {name}"),
                })
            }
        }
    }

    async fn get_state(&self) -> Result<Value, AgentError> {
        Ok(self.state.lock().unwrap().clone())
    }
}

/// Hands out [`FakeAgent`]s, creating one per agent id on demand.
pub struct FakeAgentFactory {
    pub behavior: Arc<AgentBehavior>,
    agents: Mutex<HashMap<String, Arc<FakeAgent>>>,
}

impl FakeAgentFactory {
    pub fn new() -> Self {
        Self {
            behavior: Arc::new(AgentBehavior::default()),
            agents: Mutex::new(HashMap::new()),
        }
    }

    /// Preregister an agent with a canned state, for reconciliation tests.
    pub fn register(&self, agent_id: &str, state: Value) -> Arc<FakeAgent> {
        let agent = Arc::new(FakeAgent::new(agent_id, state, self.behavior.clone()));
        self.agents
            .lock()
            .unwrap()
            .insert(agent_id.to_string(), agent.clone());
        agent
    }

    pub fn agent(&self, agent_id: &str) -> Option<Arc<FakeAgent>> {
        self.agents.lock().unwrap().get(agent_id).cloned()
    }
}

impl AgentClientFactory for FakeAgentFactory {
    fn client(&self, agent_id: &str) -> Arc<dyn AgentClient> {
        self.agents
            .lock()
            .unwrap()
            .entry(agent_id.to_string())
            .or_insert_with(|| {
                Arc::new(FakeAgent::new(
                    agent_id,
                    Value::Null,
                    self.behavior.clone(),
                ))
            })
            .clone()
    }
}

// --- cloud ---

#[derive(Default)]
pub struct FakeCloud {
    counter: AtomicUsize,
    pub created: Mutex<Vec<String>>,
    pub deleted: Mutex<Vec<String>>,
    fail_deletes: AtomicBool,
}

impl FakeCloud {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent `delete_vm` fail.
    pub fn fail_deletes(&self) {
        self.fail_deletes.store(true, Ordering::SeqCst);
    }

    pub fn create_count(&self) -> usize {
        self.created.lock().unwrap().len()
    }

    pub fn delete_count(&self) -> usize {
        self.deleted.lock().unwrap().len()
    }
}

#[async_trait]
impl CloudDriver for FakeCloud {
    async fn create_vm(
        &self,
        _agent_id: &str,
        _stemcell_cid: &str,
        _cloud_properties: &Value,
        _network_settings: &Value,
        _disk_ids: Option<&[String]>,
        _env: &Value,
    ) -> anyhow::Result<String> {
        let n = self.counter.fetch_add(1, Ordering::SeqCst) + 1;
        let cid = format!("vm-cid-{n}");
        self.created.lock().unwrap().push(cid.clone());
        Ok(cid)
    }

    async fn delete_vm(&self, vm_cid: &str) -> anyhow::Result<()> {
        if self.fail_deletes.load(Ordering::SeqCst) {
            anyhow::bail!("failed to delete `{vm_cid}'");
        }
        self.deleted.lock().unwrap().push(vm_cid.to_string());
        Ok(())
    }
}

// --- networks ---

pub struct FakeNetwork {
    name: String,
    /// `None` means unlimited addresses.
    capacity: Option<usize>,
    static_ips: HashSet<String>,
    reserved: AtomicUsize,
    released: AtomicUsize,
}

impl FakeNetwork {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            capacity: None,
            static_ips: HashSet::new(),
            reserved: AtomicUsize::new(0),
            released: AtomicUsize::new(0),
        }
    }

    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = Some(capacity);
        self
    }

    pub fn with_static_ip(mut self, ip: &str) -> Self {
        self.static_ips.insert(ip.to_string());
        self
    }

    pub fn reserve_count(&self) -> usize {
        self.reserved.load(Ordering::SeqCst)
    }

    pub fn release_count(&self) -> usize {
        self.released.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Network for FakeNetwork {
    fn name(&self) -> &str {
        &self.name
    }

    async fn reserve(&self, reservation: &mut NetworkReservation) -> anyhow::Result<()> {
        if let Some(ip) = &reservation.ip {
            if self.static_ips.contains(ip) {
                reservation.kind = ReservationKind::Static;
            }
        }
        if let Some(capacity) = self.capacity {
            if self.reserved.load(Ordering::SeqCst) >= capacity {
                return Ok(());
            }
        }
        self.reserved.fetch_add(1, Ordering::SeqCst);
        reservation.reserved = true;
        Ok(())
    }

    async fn release(&self, _reservation: &NetworkReservation) {
        self.released.fetch_add(1, Ordering::SeqCst);
    }

    fn network_settings(&self, _reservation: &NetworkReservation) -> Value {
        json!("network settings")
    }
}

// --- global cache ---

#[derive(Default)]
pub struct FakeGlobalCache {
    entries: Mutex<HashMap<String, CachedArtifact>>,
    pub exists_calls: AtomicUsize,
    pub fetch_calls: AtomicUsize,
    pub store_calls: AtomicUsize,
}

impl FakeGlobalCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn store_count(&self) -> usize {
        self.store_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl GlobalPackageCache for FakeGlobalCache {
    async fn exists(&self, cache_key: &str) -> anyhow::Result<bool> {
        self.exists_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.entries.lock().unwrap().contains_key(cache_key))
    }

    async fn fetch(&self, cache_key: &str) -> anyhow::Result<Option<CachedArtifact>> {
        self.fetch_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.entries.lock().unwrap().get(cache_key).cloned())
    }

    async fn store(&self, cache_key: &str, sha1: &str, blobstore_id: &str) -> anyhow::Result<()> {
        self.store_calls.fetch_add(1, Ordering::SeqCst);
        self.entries.lock().unwrap().insert(
            cache_key.to_string(),
            CachedArtifact {
                sha1: sha1.to_string(),
                blobstore_id: blobstore_id.to_string(),
            },
        );
        Ok(())
    }
}

// --- plan builders ---

/// Everything a compilation test needs, wired together.
pub struct CompileRig {
    pub db: Arc<Database>,
    pub cloud: Arc<FakeCloud>,
    pub agents: Arc<FakeAgentFactory>,
    pub network: Arc<FakeNetwork>,
    pub ctx: Arc<CoreContext>,
    pub plan: Arc<DeploymentPlan>,
}

impl CompileRig {
    pub fn behavior(&self) -> &AgentBehavior {
        &self.agents.behavior
    }
}

/// Two-stemcell sample deployment: a `dea` job on `stemcell_a` and a
/// `router` job on `stemcell_b`, sharing a package set with overlapping
/// dependencies. Yields eleven (package, stemcell) compile tasks.
pub fn two_stemcell_rig(
    reuse: bool,
    workers: usize,
    global: Option<Arc<dyn GlobalPackageCache>>,
) -> CompileRig {
    init_tracing();
    let db = Arc::new(Database::new());
    let release_rec = db.create_release("cf-release", "0.319");
    let packages: &[(&str, &[&str])] = &[
        ("common", &[]),
        ("ruby", &["common"]),
        ("p_syslog", &[]),
        ("dea", &["ruby", "common"]),
        ("warden", &["common"]),
        ("nginx", &["common"]),
        ("p_router", &["ruby", "common"]),
    ];
    for (name, deps) in packages {
        db.create_package(
            release_rec.id,
            name,
            "0.1-dev",
            &format!("fingerprint {name}"),
            deps,
            &format!("source blob {name}"),
            &format!("source sha {name}"),
        );
    }
    db.create_stemcell("stemcell_a", "0.2", "scid-a", "sha-a");
    db.create_stemcell("stemcell_b", "0.3", "scid-b", "sha-b");
    let deployment = db.create_deployment("mycloud");

    let release = Arc::new(ReleaseSpec::new("cf-release", "0.319"));
    release.bind_model(&db).unwrap();
    let stemcell_a = Arc::new(StemcellSpec::new("stemcell_a", "0.2"));
    stemcell_a.bind_model(&db).unwrap();
    let stemcell_b = Arc::new(StemcellSpec::new("stemcell_b", "0.3"));
    stemcell_b.bind_model(&db).unwrap();

    let pool_large = Arc::new(ResourcePool::new("large", stemcell_a, "default", 1));
    let pool_small = Arc::new(ResourcePool::new("small", stemcell_b, "default", 1));

    let dea_template = Arc::new(TemplateSpec::new("dea", &["dea", "nginx", "p_syslog"]));
    dea_template.bind_packages(&db, &release).unwrap();
    let warden_template = Arc::new(TemplateSpec::new("warden", &["warden"]));
    warden_template.bind_packages(&db, &release).unwrap();
    let nginx_template = Arc::new(TemplateSpec::new("nginx", &["nginx"]));
    nginx_template.bind_packages(&db, &release).unwrap();
    let router_template = Arc::new(TemplateSpec::new("p_router", &["p_router"]));
    router_template.bind_packages(&db, &release).unwrap();

    let mut dea_job = Job::new("dea", release.clone(), pool_large.clone());
    dea_job.add_template(dea_template);
    dea_job.add_template(warden_template.clone());

    let mut router_job = Job::new("router", release.clone(), pool_small.clone());
    router_job.add_template(nginx_template);
    router_job.add_template(router_template);
    router_job.add_template(warden_template);

    let compilation = CompilationConfig::new(workers, "default").with_reuse(reuse);
    let mut plan = DeploymentPlan::new("mycloud", compilation);
    let network = Arc::new(FakeNetwork::new("default"));
    plan.add_network(network.clone());
    plan.add_release(release);
    plan.add_resource_pool(pool_large);
    plan.add_resource_pool(pool_small);
    plan.add_job(Arc::new(dea_job));
    plan.add_job(Arc::new(router_job));
    plan.bind_model(deployment);

    let cloud = Arc::new(FakeCloud::new());
    let agents = Arc::new(FakeAgentFactory::new());
    let mut ctx = CoreContext::new(
        db.clone(),
        cloud.clone(),
        agents.clone(),
        Arc::new(InMemoryLocks::new()),
    );
    if let Some(global) = global {
        ctx = ctx.with_global_cache(global);
    }

    CompileRig {
        db,
        cloud,
        agents,
        network,
        ctx: Arc::new(ctx),
        plan: Arc::new(plan),
    }
}

/// Single-stemcell variant of the sample deployment: just the `dea` job.
pub fn single_stemcell_rig(reuse: bool, workers: usize) -> CompileRig {
    let rig = two_stemcell_rig(reuse, workers, None);
    let compilation = CompilationConfig::new(workers, "default").with_reuse(reuse);
    let mut plan = DeploymentPlan::new("mycloud", compilation);
    plan.add_network(rig.network.clone());
    let dea = rig.plan.job("dea").unwrap();
    plan.add_release(dea.release.clone());
    plan.add_resource_pool(dea.resource_pool.clone());
    plan.add_job(dea);
    plan.bind_model(rig.db.find_deployment("mycloud").unwrap());

    CompileRig {
        plan: Arc::new(plan),
        ..rig
    }
}

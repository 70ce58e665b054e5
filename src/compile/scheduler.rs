//! Package compilation scheduler.
//!
//! Drives the task graph over a bounded worker pool: tasks whose dependencies
//! are done are dispatched onto spawned workers, at most `workers` at a time
//! per stemcell, with results fed back over a channel. Each dispatched task
//! takes the per-package compile lock, re-checks the cache, and only then
//! provisions (or reuses) a worker machine.

use serde_json::{Map, Value, json};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::{Semaphore, mpsc};
use tracing::{debug, info, warn};

use crate::compile::cache::ArtifactCache;
use crate::compile::graph::TaskGraph;
use crate::compile::task::{CompileTask, TaskKey};
use crate::compile::vm_pool::{VmPool, WorkerHandle};
use crate::context::CoreContext;
use crate::db::{CompiledPackageRecord, StemcellRecord};
use crate::errors::CompileError;
use crate::plan::DeploymentPlan;

const COMPILE_STAGE: &str = "compiling packages";

/// Snapshot of one task handed to a spawned worker.
struct TaskSpec {
    task: CompileTask,
    manifest: Map<String, Value>,
}

struct TaskOutcome {
    key: TaskKey,
    result: Result<CompiledPackageRecord, CompileError>,
}

/// Compiles every package a plan's jobs need, per stemcell.
#[derive(Clone)]
pub struct PackageCompiler {
    plan: Arc<DeploymentPlan>,
    ctx: Arc<CoreContext>,
    pool: Arc<VmPool>,
    cache: Arc<ArtifactCache>,
    tasks_count: Arc<AtomicUsize>,
    performed: Arc<AtomicUsize>,
}

impl PackageCompiler {
    pub fn new(plan: Arc<DeploymentPlan>, ctx: Arc<CoreContext>) -> Self {
        let cache = Arc::new(ArtifactCache::new(
            ctx.db.clone(),
            ctx.global_cache.clone(),
        ));
        let pool = Arc::new(VmPool::new(plan.compilation.workers.max(1)));
        Self {
            plan,
            ctx,
            pool,
            cache,
            tasks_count: Arc::new(AtomicUsize::new(0)),
            performed: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Total compile tasks in the last run, cache hits included.
    pub fn compile_tasks_count(&self) -> usize {
        self.tasks_count.load(Ordering::SeqCst)
    }

    /// Compilations that actually ran on a worker in the last run.
    pub fn compilations_performed(&self) -> usize {
        self.performed.load(Ordering::SeqCst)
    }

    /// Compile everything the plan needs. Idle workers are destroyed before
    /// returning, on success and on failure alike.
    pub async fn compile(&self) -> Result<(), CompileError> {
        let mut graph = TaskGraph::build(&self.plan, &self.ctx.db)?;
        self.tasks_count.store(graph.len(), Ordering::SeqCst);
        self.performed.store(0, Ordering::SeqCst);

        if graph.is_empty() {
            info!("no packages to compile");
            return Ok(());
        }
        info!(tasks = graph.len(), "compiling packages");

        let mut completed = 0;
        for key in graph.keys() {
            let task = graph.task(&key);
            if let Some(record) = self.cache.find_compiled_package(task).await? {
                completed += 1;
                self.emit_progress(graph.task(&key), graph.len(), completed);
                graph.complete(&key, record);
            }
        }

        let result = self.run_schedule(&mut graph, completed).await;
        self.drain_pool().await;
        result?;

        self.ctx.events.stage_complete(COMPILE_STAGE, graph.len());
        Ok(())
    }

    async fn run_schedule(
        &self,
        graph: &mut TaskGraph,
        mut completed: usize,
    ) -> Result<(), CompileError> {
        let total = graph.len();
        let workers = self.plan.compilation.workers.max(1);
        let mut slots: HashMap<u64, Arc<Semaphore>> = HashMap::new();
        for key in graph.keys() {
            slots
                .entry(key.1)
                .or_insert_with(|| Arc::new(Semaphore::new(workers)));
        }

        let (tx, mut rx) = mpsc::channel::<TaskOutcome>(total);
        let mut in_flight = 0usize;
        let mut first_error: Option<CompileError> = None;

        loop {
            graph.promote_ready();
            if first_error.is_none() && !self.ctx.is_cancelled() {
                for key in graph.ready_keys() {
                    let slot = slots[&key.1].clone();
                    let Ok(permit) = slot.try_acquire_owned() else {
                        continue;
                    };
                    let spec = TaskSpec {
                        task: graph.task(&key).clone(),
                        manifest: graph.manifest_for(&key),
                    };
                    graph.mark_dispatched(&key);
                    in_flight += 1;

                    let compiler = self.clone();
                    let tx = tx.clone();
                    tokio::spawn(async move {
                        let result = compiler.compile_package(&spec).await;
                        drop(permit);
                        let _ = tx.send(TaskOutcome { key, result }).await;
                    });
                }
            }

            if in_flight == 0 {
                break;
            }
            let Some(outcome) = rx.recv().await else {
                break;
            };
            in_flight -= 1;

            match outcome.result {
                Ok(record) => {
                    completed += 1;
                    self.emit_progress(graph.task(&outcome.key), total, completed);
                    graph.complete(&outcome.key, record);
                }
                Err(err) => {
                    graph.fail(&outcome.key);
                    if first_error.is_none() {
                        warn!(error = %err, "compilation task failed; halting dispatch");
                        first_error = Some(err);
                    }
                }
            }
        }

        if let Some(err) = first_error {
            return Err(err);
        }
        if !graph.all_done() {
            return Err(CompileError::Cancelled);
        }
        Ok(())
    }

    fn emit_progress(&self, task: &CompileTask, total: usize, index: usize) {
        self.ctx.events.progress(
            COMPILE_STAGE,
            total,
            &format!("{}/{}", task.package.name, task.package.version),
            index,
        );
    }

    /// Compile one task end to end, holding the per-package compile lock.
    async fn compile_package(
        &self,
        spec: &TaskSpec,
    ) -> Result<CompiledPackageRecord, CompileError> {
        let task = &spec.task;
        let lock_key = format!(
            "package:{}:stemcell:{}",
            task.package.id, task.stemcell.id
        );
        let _guard = self.ctx.locks.acquire(&lock_key).await?;

        // Another director may have compiled this while we waited.
        if let Some(record) = self.cache.find_compiled_package(task).await? {
            debug!(package = %task.package.name, "compiled package appeared while waiting for lock");
            return Ok(record);
        }

        let worker = self.prepare_vm(&task.stemcell).await?;
        match self.run_compile(&worker, task, &spec.manifest).await {
            Ok((artifact, build)) => {
                self.finish_worker(worker).await;
                self.performed.fetch_add(1, Ordering::SeqCst);
                let record = self.ctx.db.save_compiled_package(
                    task.package.id,
                    task.stemcell.id,
                    &task.dependency_key,
                    build,
                    &artifact.sha1,
                    &artifact.blobstore_id,
                );
                if let Err(err) = self.cache.save_to_global_cache(task, &record).await {
                    warn!(package = %task.package.name, error = %err, "failed to publish to global cache");
                }
                Ok(record)
            }
            Err(err) => {
                self.discard_worker(worker).await;
                Err(err)
            }
        }
    }

    async fn run_compile(
        &self,
        worker: &WorkerHandle,
        task: &CompileTask,
        manifest: &Map<String, Value>,
    ) -> Result<(crate::agent::CompiledArtifact, u32), CompileError> {
        let build = self.ctx.db.next_build(task.package.id);
        let version_label = format!("{}.{}", task.package.version, build);
        info!(
            package = %task.package.name,
            version = %version_label,
            stemcell = %task.stemcell.name,
            cid = %worker.machine.cid,
            "compiling package"
        );
        let artifact = worker
            .agent
            .compile_package(
                &task.package.blobstore_id,
                &task.package.sha1,
                &task.package.name,
                &version_label,
                manifest,
            )
            .await?;
        Ok((artifact, build))
    }

    /// Reuse an idle worker when configured, otherwise provision a fresh one
    /// and bring its agent to the compiling state.
    async fn prepare_vm(&self, stemcell: &StemcellRecord) -> Result<WorkerHandle, CompileError> {
        if self.plan.compilation.reuse_compilation_vms {
            if let Some(worker) = self.pool.get_vm(stemcell.id) {
                debug!(cid = %worker.machine.cid, "reusing compilation worker");
                return Ok(worker);
            }
        }

        let config = &self.plan.compilation;
        let network = self.plan.network(&config.network_name).ok_or_else(|| {
            anyhow::anyhow!("compilation network `{}' is not in the plan", config.network_name)
        })?;
        let deployment = self.plan.model()?;
        let worker = self
            .pool
            .add_vm(stemcell, network.as_ref(), &self.ctx, config, deployment.id)
            .await?;
        self.ready_worker(worker).await
    }

    /// Wait for the fresh worker's agent and apply the compiling state. A
    /// worker that never becomes ready is destroyed here.
    async fn ready_worker(&self, worker: WorkerHandle) -> Result<WorkerHandle, CompileError> {
        let mut networks = Map::new();
        networks.insert(
            self.plan.compilation.network_name.clone(),
            worker.network_settings.clone(),
        );
        let initial_state = json!({
            "deployment": self.plan.name,
            "resource_pool": "package_compiler",
            "networks": networks,
        });

        let readied = async {
            worker.agent.wait_until_ready().await?;
            worker.agent.apply(&initial_state).await
        }
        .await;

        match readied {
            Ok(()) => Ok(worker),
            Err(err) => {
                self.discard_worker(worker).await;
                Err(err.into())
            }
        }
    }

    /// A task finished on this worker: keep it for reuse or destroy it.
    async fn finish_worker(&self, worker: WorkerHandle) {
        if self.plan.compilation.reuse_compilation_vms {
            self.pool.return_vm(worker);
        } else {
            self.pool.remove_vm(&worker);
            self.teardown_worker(worker).await;
        }
    }

    /// Destroy a worker after a failure. Teardown problems are logged, never
    /// allowed to mask the original error.
    async fn discard_worker(&self, worker: WorkerHandle) {
        self.pool.remove_vm(&worker);
        self.teardown_worker(worker).await;
    }

    async fn teardown_worker(&self, worker: WorkerHandle) {
        if let Err(err) = self.ctx.cloud.delete_vm(&worker.machine.cid).await {
            warn!(cid = %worker.machine.cid, error = %err, "failed to delete compilation worker");
        }
        self.ctx.db.delete_machine(worker.machine.id);
        if let Some(reservation) = &worker.reservation {
            if let Some(network) = self.plan.network(&reservation.network) {
                network.release(reservation).await;
            }
        }
        debug!(cid = %worker.machine.cid, "compilation worker destroyed");
    }

    async fn drain_pool(&self) {
        for worker in self.pool.drain_all() {
            self.teardown_worker(worker).await;
        }
    }
}

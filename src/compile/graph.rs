//! Compile task graph construction.
//!
//! For each job the builder walks template → package references, creates one
//! task per (package, stemcell) pair, and recursively creates tasks for every
//! dependency. Edges are direct dependencies; each task also carries its full
//! transitive closure for the dependency key and the compile manifest.
//! Missing dependency packages and cycles are build-time errors.

use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use crate::compile::task::{CompileTask, TaskKey, TaskState};
use crate::db::{CompiledPackageRecord, Database, PackageRecord, StemcellRecord};
use crate::errors::CompileError;
use crate::plan::{DeploymentPlan, Job, ReleaseSpec};

/// Dependency graph of compile tasks for one plan.
#[derive(Debug)]
pub struct TaskGraph {
    tasks: HashMap<TaskKey, CompileTask>,
    /// Insertion order, for deterministic iteration.
    order: Vec<TaskKey>,
}

impl TaskGraph {
    /// Build the graph for every package referenced by the plan's jobs.
    pub fn build(plan: &DeploymentPlan, db: &Database) -> Result<Self, CompileError> {
        let mut graph = Self {
            tasks: HashMap::new(),
            order: Vec::new(),
        };

        for job in plan.jobs() {
            let stemcell = job.resource_pool.stemcell.model()?;
            for template in job.templates() {
                for package in template.packages()? {
                    let mut visiting = Vec::new();
                    let key = graph.ensure_task(
                        package.clone(),
                        &stemcell,
                        &job.release,
                        db,
                        &mut visiting,
                    )?;
                    graph.attach_job(key, job.clone());
                }
            }
        }

        Ok(graph)
    }

    fn ensure_task(
        &mut self,
        package: PackageRecord,
        stemcell: &StemcellRecord,
        release: &Arc<ReleaseSpec>,
        db: &Database,
        visiting: &mut Vec<String>,
    ) -> Result<TaskKey, CompileError> {
        let key = (package.id, stemcell.id);
        if self.tasks.contains_key(&key) {
            return Ok(key);
        }
        if visiting.contains(&package.name) {
            let mut packages = visiting.clone();
            packages.push(package.name.clone());
            return Err(CompileError::DependencyCycle { packages });
        }

        visiting.push(package.name.clone());
        let mut dependencies = Vec::new();
        let mut closure: BTreeMap<String, PackageRecord> = BTreeMap::new();
        for dep_name in package.dependency_names.clone() {
            let dep = release.get_package(db, &dep_name)?;
            let dep_key = self.ensure_task(dep.clone(), stemcell, release, db, visiting)?;
            dependencies.push(dep_key);
            closure.insert(dep.name.clone(), dep);
            for transitive in &self.tasks[&dep_key].closure {
                closure.insert(transitive.name.clone(), transitive.clone());
            }
        }
        visiting.pop();

        let task = CompileTask::new(
            package,
            stemcell.clone(),
            closure.into_values().collect(),
            dependencies,
        );
        self.order.push(key);
        self.tasks.insert(key, task);
        Ok(key)
    }

    /// Attach a job to a task and to every task in its closure: dependency
    /// results flow to every job that pulled them in.
    fn attach_job(&mut self, key: TaskKey, job: Arc<Job>) {
        let closure_keys: Vec<TaskKey> = self.tasks[&key]
            .closure
            .iter()
            .map(|p| (p.id, key.1))
            .collect();
        if let Some(task) = self.tasks.get_mut(&key) {
            task.add_job(job.clone());
        }
        for dep_key in closure_keys {
            if let Some(task) = self.tasks.get_mut(&dep_key) {
                task.add_job(job.clone());
            }
        }
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn keys(&self) -> Vec<TaskKey> {
        self.order.clone()
    }

    pub fn task(&self, key: &TaskKey) -> &CompileTask {
        &self.tasks[key]
    }

    /// Promote every pending task whose dependencies are all done. Returns
    /// the keys now ready for dispatch.
    pub fn promote_ready(&mut self) -> Vec<TaskKey> {
        let ready: Vec<TaskKey> = self
            .order
            .iter()
            .filter(|key| {
                let task = &self.tasks[key];
                task.state == TaskState::Pending
                    && task
                        .dependencies
                        .iter()
                        .all(|dep| self.tasks[dep].state == TaskState::Done)
            })
            .copied()
            .collect();
        for key in &ready {
            if let Some(task) = self.tasks.get_mut(key) {
                task.state = TaskState::Ready;
            }
        }
        ready
    }

    /// Tasks promoted to ready but not yet dispatched.
    pub fn ready_keys(&self) -> Vec<TaskKey> {
        self.order
            .iter()
            .filter(|key| self.tasks[key].state == TaskState::Ready)
            .copied()
            .collect()
    }

    pub fn mark_dispatched(&mut self, key: &TaskKey) {
        if let Some(task) = self.tasks.get_mut(key) {
            task.state = TaskState::Dispatched;
        }
    }

    /// Record a compiled package for a task and hand it to every waiting job.
    pub fn complete(&mut self, key: &TaskKey, compiled: CompiledPackageRecord) {
        if let Some(task) = self.tasks.get_mut(key) {
            task.state = TaskState::Done;
            task.compiled = Some(compiled.clone());
            for job in &task.jobs {
                job.use_compiled_package(compiled.clone());
            }
        }
    }

    pub fn fail(&mut self, key: &TaskKey) {
        if let Some(task) = self.tasks.get_mut(key) {
            task.state = TaskState::Failed;
        }
    }

    pub fn all_done(&self) -> bool {
        self.tasks.values().all(|t| t.state == TaskState::Done)
    }

    /// Compile manifest for a task, resolved against its closure's recorded
    /// compiled packages.
    pub fn manifest_for(&self, key: &TaskKey) -> Map<String, Value> {
        let stemcell_id = key.1;
        let task = &self.tasks[key];
        task.dependency_manifest(|package| {
            self.tasks
                .get(&(package.id, stemcell_id))
                .and_then(|t| t.compiled.clone())
        })
    }
}

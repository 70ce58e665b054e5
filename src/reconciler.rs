//! State reconciler: binds the deployment plan to persisted state and live
//! agents, detecting drift along the way.
//!
//! Binding runs in a fixed order. Models first (deployment, releases,
//! stemcells, templates), then every existing machine is interrogated
//! concurrently and sorted into instances, idle pool members, or deletion
//! candidates. Allocation, network reservations, configuration hashes, and
//! DNS follow, and cleanup of unneeded machines and instances runs last.

use serde_json::{Value, json};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::task::JoinSet;
use tracing::{debug, info};

use crate::context::CoreContext;
use crate::db::{InstanceRecord, MachineRecord};
use crate::errors::ReconcileError;
use crate::network::NetworkReservation;
use crate::plan::{DeploymentPlan, IdleVm, Job, ResourcePool};

const DNS_TTL_4H: u32 = 14400;
const DNS_SOA_CONTENT: &str = "localhost hostmaster@localhost 0 10800 604800 30";

/// Computes a digest of a job's configuration, used to decide whether
/// instances need a configuration update.
pub trait ConfigurationHasher: Send + Sync {
    fn configuration_hash(&self, job: &Job) -> anyhow::Result<String>;
}

/// Default hasher: SHA-256 over the job's template and package identity.
pub struct DigestHasher;

impl ConfigurationHasher for DigestHasher {
    fn configuration_hash(&self, job: &Job) -> anyhow::Result<String> {
        let mut templates = Vec::new();
        for template in job.templates() {
            let packages: Vec<Value> = template
                .packages()?
                .iter()
                .map(|p| json!([p.name, p.version, p.fingerprint]))
                .collect();
            templates.push(json!({ "name": template.name, "packages": packages }));
        }
        let digest_input =
            serde_json::to_vec(&json!({ "job": job.name, "templates": templates }))?;
        let mut hasher = Sha256::new();
        hasher.update(&digest_input);
        Ok(format!("{:x}", hasher.finalize()))
    }
}

/// Reconciles one deployment plan against the database and live agents.
#[derive(Clone)]
pub struct Reconciler {
    plan: Arc<DeploymentPlan>,
    ctx: Arc<CoreContext>,
    hasher: Arc<dyn ConfigurationHasher>,
}

impl Reconciler {
    pub fn new(plan: Arc<DeploymentPlan>, ctx: Arc<CoreContext>) -> Self {
        Self {
            plan,
            ctx,
            hasher: Arc::new(DigestHasher),
        }
    }

    /// Replace the configuration hasher.
    pub fn with_hasher(mut self, hasher: Arc<dyn ConfigurationHasher>) -> Self {
        self.hasher = hasher;
        self
    }

    /// Run every binding stage in order.
    pub async fn reconcile(&self) -> Result<(), ReconcileError> {
        info!(deployment = %self.plan.name, "reconciling deployment");
        self.bind_deployment()?;
        self.bind_releases().await?;
        self.bind_stemcells()?;
        self.bind_templates()?;
        self.bind_existing_deployment().await?;
        self.bind_resource_pools();
        self.bind_unallocated_vms()?;
        self.bind_instance_networks().await?;
        self.bind_configuration()?;
        self.bind_dns()?;
        self.delete_unneeded_vms().await?;
        self.delete_unneeded_instances().await?;
        Ok(())
    }

    /// Attach the persisted deployment record to the plan.
    pub fn bind_deployment(&self) -> Result<(), ReconcileError> {
        let record = self.ctx.db.find_deployment(&self.plan.name).ok_or_else(|| {
            ReconcileError::DeploymentNotFound {
                name: self.plan.name.clone(),
            }
        })?;
        self.plan.bind_model(record);
        Ok(())
    }

    /// Resolve every release the plan references, each under its release
    /// lock so uploads cannot race the binding.
    pub async fn bind_releases(&self) -> Result<(), ReconcileError> {
        for release in self.plan.releases() {
            let _guard = self
                .ctx
                .locks
                .acquire(&format!("release:{}", release.name))
                .await?;
            release.bind_model(&self.ctx.db)?;
        }
        Ok(())
    }

    /// Resolve the stemcell of every resource pool.
    pub fn bind_stemcells(&self) -> Result<(), ReconcileError> {
        for pool in self.plan.resource_pools() {
            pool.stemcell.bind_model(&self.ctx.db)?;
        }
        Ok(())
    }

    /// Resolve template package references within each job's release.
    pub fn bind_templates(&self) -> Result<(), ReconcileError> {
        for job in self.plan.jobs() {
            for template in job.templates() {
                template.bind_packages(&self.ctx.db, &job.release)?;
            }
        }
        Ok(())
    }

    /// Interrogate every machine persisted for this deployment, concurrently,
    /// and sort each into an instance binding, an idle pool member, or a
    /// deletion candidate.
    pub async fn bind_existing_deployment(&self) -> Result<(), ReconcileError> {
        let deployment = self.plan.model()?;
        let mut work = JoinSet::new();
        for machine in self.ctx.db.machines_for_deployment(deployment.id) {
            let reconciler = self.clone();
            work.spawn(async move { reconciler.bind_existing_vm(machine).await });
        }
        while let Some(joined) = work.join_next().await {
            joined.map_err(|e| ReconcileError::Other(e.into()))??;
        }
        Ok(())
    }

    async fn bind_existing_vm(&self, machine: MachineRecord) -> Result<(), ReconcileError> {
        let agent = self.ctx.agents.client(&machine.agent_id);
        let state = agent.get_state().await?;
        self.verify_state(&machine, &state)?;
        let reservations = self.reservations_from_state(&state).await?;

        if let Some(instance) = self.ctx.db.instance_for_machine(machine.id) {
            self.bind_instance(machine, instance, state, reservations)
                .await;
            return Ok(());
        }

        let pool_name = state
            .get("resource_pool")
            .and_then(|p| p.get("name"))
            .and_then(Value::as_str);
        match pool_name.and_then(|name| self.plan.resource_pool(name)) {
            Some(pool) => self.bind_idle_vm(machine, &pool, state, reservations).await,
            None => {
                debug!(cid = %machine.cid, "machine's resource pool is gone; scheduling deletion");
                self.release_reservations(reservations.into_values()).await;
                self.plan.delete_vm(machine);
            }
        }
        Ok(())
    }

    /// Check that an agent's reported state is consistent with the database.
    pub fn verify_state(
        &self,
        machine: &MachineRecord,
        state: &Value,
    ) -> Result<(), ReconcileError> {
        let Some(reported) = state.as_object() else {
            return Err(ReconcileError::AgentInvalidStateFormat {
                vm_cid: machine.cid.clone(),
                details: value_kind(state).to_string(),
            });
        };

        let reported_deployment = reported
            .get("deployment")
            .and_then(Value::as_str)
            .unwrap_or_default();
        if reported_deployment != self.plan.name {
            return Err(ReconcileError::AgentWrongDeployment {
                vm_cid: machine.cid.clone(),
                expected: self.plan.name.clone(),
                actual: reported_deployment.to_string(),
            });
        }

        let reported_job = reported
            .get("job")
            .and_then(|j| j.get("name"))
            .and_then(Value::as_str);
        let reported_index = reported.get("index").and_then(Value::as_u64);
        if let (Some(job), Some(index)) = (reported_job, reported_index) {
            let Some(record) = self.ctx.db.instance_for_machine(machine.id) else {
                return Err(ReconcileError::AgentUnexpectedJob {
                    vm_cid: machine.cid.clone(),
                    job: job.to_string(),
                    index,
                });
            };
            if record.deployment_id != machine.deployment_id {
                return Err(ReconcileError::VmInstanceOutOfSync {
                    vm_cid: machine.cid.clone(),
                    job: job.to_string(),
                    index,
                });
            }
            let renamed = self.plan.resolve_job_name(&record.job);
            let job_matches = record.job == job || renamed == job;
            // Compared in u64 so an index beyond the u32 range never aliases
            // a real instance index.
            if !job_matches || u64::from(record.index) != index {
                return Err(ReconcileError::AgentJobMismatch {
                    vm_cid: machine.cid.clone(),
                    reported_job: job.to_string(),
                    reported_index: index,
                    db_job: record.job,
                    db_index: record.index.into(),
                });
            }
        }

        Ok(())
    }

    /// Rebuild reservations from the networks an agent reports, keeping only
    /// the ones the plan's networks confirm.
    async fn reservations_from_state(
        &self,
        state: &Value,
    ) -> Result<HashMap<String, NetworkReservation>, ReconcileError> {
        let mut reservations = HashMap::new();
        let Some(networks) = state.get("networks").and_then(Value::as_object) else {
            return Ok(reservations);
        };
        for (name, settings) in networks {
            let Some(network) = self.plan.network(name) else {
                continue;
            };
            let ip = settings
                .get("ip")
                .and_then(Value::as_str)
                .map(str::to_string);
            let mut reservation = NetworkReservation::from_state(name, ip);
            network.reserve(&mut reservation).await?;
            if reservation.reserved {
                reservations.insert(name.clone(), reservation);
            }
        }
        Ok(reservations)
    }

    /// Register a machine with no instance as an idle pool member. A dynamic
    /// reservation on the pool's own network travels with the machine; static
    /// and foreign reservations are released.
    async fn bind_idle_vm(
        &self,
        machine: MachineRecord,
        pool: &ResourcePool,
        state: Value,
        reservations: HashMap<String, NetworkReservation>,
    ) {
        let mut idle = IdleVm::new(machine, Some(state));
        for (name, reservation) in reservations {
            if name == pool.network_name && !reservation.is_static() {
                idle.use_reservation(reservation);
            } else {
                self.release_reservations(std::iter::once(reservation)).await;
            }
        }
        pool.add_idle_vm(idle);
    }

    /// Bind a machine that the database maps to an instance. Instances whose
    /// job left the plan, or whose index fell off the end, are scheduled for
    /// deletion instead.
    async fn bind_instance(
        &self,
        machine: MachineRecord,
        record: InstanceRecord,
        state: Value,
        reservations: HashMap<String, NetworkReservation>,
    ) {
        let job_name = self.plan.resolve_job_name(&record.job);
        let bound = self
            .plan
            .job(&job_name)
            .and_then(|job| job.instance(record.index).map(|i| (job.clone(), i)));

        match bound {
            Some((job, instance)) => {
                instance.use_model(record, Some(machine));
                instance.set_current_state(state);
                instance.take_network_reservations(reservations);
                job.resource_pool.mark_active_vm();
            }
            None => {
                debug!(
                    job = %record.job,
                    index = record.index,
                    "instance no longer in plan; scheduling deletion"
                );
                self.release_reservations(reservations.into_values()).await;
                self.plan.delete_instance(record);
            }
        }
    }

    async fn release_reservations(
        &self,
        reservations: impl IntoIterator<Item = NetworkReservation>,
    ) {
        for reservation in reservations {
            if let Some(network) = self.plan.network(&reservation.network) {
                network.release(&reservation).await;
            }
        }
    }

    /// Log pool occupancy after existing machines have been sorted.
    pub fn bind_resource_pools(&self) {
        for pool in self.plan.resource_pools() {
            debug!(
                pool = %pool.name,
                idle = pool.idle_count(),
                active = pool.active_count(),
                missing = pool.missing_vm_count(),
                "resource pool bound"
            );
        }
    }

    /// Hand idle machines to instances that lack one, then make the database
    /// match every instance binding.
    pub fn bind_unallocated_vms(&self) -> Result<(), ReconcileError> {
        let deployment = self.plan.model()?;
        for job in self.plan.jobs() {
            for instance in job.instances() {
                instance.bind_unallocated_vm(&job.resource_pool);
                instance.sync_state_with_db(&self.ctx.db, deployment.id);
            }
        }
        Ok(())
    }

    /// Reserve every network address instances still need.
    pub async fn bind_instance_networks(&self) -> Result<(), ReconcileError> {
        for job in self.plan.jobs() {
            for instance in job.instances() {
                for mut reservation in instance.unreserved_reservations() {
                    let network = self.plan.network(&reservation.network).ok_or_else(|| {
                        anyhow::anyhow!("network `{}' is not in the plan", reservation.network)
                    })?;
                    network.reserve(&mut reservation).await?;
                    if !reservation.reserved {
                        return Err(ReconcileError::NetworkExhausted {
                            network: reservation.network.clone(),
                            subject: format!("instance `{}/{}'", job.name, instance.index),
                        });
                    }
                    instance.store_reservation(reservation);
                }
            }
        }
        Ok(())
    }

    /// Compute and record each job's configuration hash.
    pub fn bind_configuration(&self) -> Result<(), ReconcileError> {
        for job in self.plan.jobs() {
            let hash = self.hasher.configuration_hash(job)?;
            job.set_config_hash(hash);
        }
        Ok(())
    }

    /// Ensure the deployment's DNS domain and its SOA/NS/A scaffolding exist.
    /// Idempotent; a no-op when DNS is not configured.
    pub fn bind_dns(&self) -> Result<(), ReconcileError> {
        let Some(dns) = &self.ctx.dns else {
            return Ok(());
        };
        let db = &self.ctx.db;
        let domain = db.find_or_create_dns_domain(&dns.domain_name, "NATIVE");
        db.find_or_create_dns_record(domain.id, &dns.domain_name, "SOA", DNS_SOA_CONTENT, None);
        let ns_host = format!("ns.{}", dns.domain_name);
        db.find_or_create_dns_record(
            domain.id,
            &dns.domain_name,
            "NS",
            &ns_host,
            Some(DNS_TTL_4H),
        );
        db.find_or_create_dns_record(domain.id, &ns_host, "A", &dns.address, Some(DNS_TTL_4H));
        self.plan.set_dns_domain(domain);
        Ok(())
    }

    /// Destroy machines nothing in the plan claims. A failed cloud delete
    /// aborts the stage, leaving the record for the next run.
    pub async fn delete_unneeded_vms(&self) -> Result<(), ReconcileError> {
        let machines = self.plan.take_unneeded_vms();
        if machines.is_empty() {
            return Ok(());
        }
        let stage = "deleting unneeded VMs";
        let total = machines.len();
        for (i, machine) in machines.into_iter().enumerate() {
            self.ctx.events.progress(stage, total, &machine.cid, i + 1);
            info!(cid = %machine.cid, "deleting unneeded VM");
            self.ctx.cloud.delete_vm(&machine.cid).await?;
            self.ctx.db.delete_machine(machine.id);
        }
        self.ctx.events.stage_complete(stage, total);
        Ok(())
    }

    /// Destroy instances (and their machines) nothing in the plan claims.
    /// Same failure policy as the VM phase: a failed cloud delete aborts the
    /// stage, leaving the records for the next run.
    pub async fn delete_unneeded_instances(&self) -> Result<(), ReconcileError> {
        let instances = self.plan.take_unneeded_instances();
        if instances.is_empty() {
            return Ok(());
        }
        let stage = "deleting unneeded instances";
        let total = instances.len();
        for (i, instance) in instances.into_iter().enumerate() {
            let label = format!("{}/{}", instance.job, instance.index);
            self.ctx.events.progress(stage, total, &label, i + 1);
            info!(instance = %label, "deleting unneeded instance");
            if let Some(machine) = instance
                .vm_id
                .and_then(|vm_id| self.ctx.db.find_machine(vm_id))
            {
                self.ctx.cloud.delete_vm(&machine.cid).await?;
                self.ctx.db.delete_machine(machine.id);
            }
            self.ctx.db.delete_instance(instance.id);
        }
        self.ctx.events.stage_complete(stage, total);
        Ok(())
    }
}

fn value_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "Null",
        Value::Bool(_) => "Boolean",
        Value::Number(_) => "Number",
        Value::String(_) => "String",
        Value::Array(_) => "Array",
        Value::Object(_) => "Hash",
    }
}

//! Jobs and their instances.

use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::db::{CompiledPackageRecord, Database, InstanceRecord, MachineRecord};
use crate::network::NetworkReservation;
use crate::plan::pool::ResourcePool;
use crate::plan::{ReleaseSpec, TemplateSpec};

/// A named group of instances sharing templates and a resource pool.
/// Accumulates compiled-package results for its referenced packages.
#[derive(Debug)]
pub struct Job {
    pub name: String,
    pub release: Arc<ReleaseSpec>,
    pub resource_pool: Arc<ResourcePool>,
    templates: Vec<Arc<TemplateSpec>>,
    instances: Vec<Arc<Instance>>,
    compiled_packages: Mutex<Vec<CompiledPackageRecord>>,
    config_hash: Mutex<Option<String>>,
}

impl Job {
    pub fn new(name: &str, release: Arc<ReleaseSpec>, resource_pool: Arc<ResourcePool>) -> Self {
        Self {
            name: name.to_string(),
            release,
            resource_pool,
            templates: Vec::new(),
            instances: Vec::new(),
            compiled_packages: Mutex::new(Vec::new()),
            config_hash: Mutex::new(None),
        }
    }

    pub fn add_template(&mut self, template: Arc<TemplateSpec>) {
        self.templates.push(template);
    }

    /// Append a new instance; indices are assigned in order.
    pub fn add_instance(&mut self) -> Arc<Instance> {
        let instance = Arc::new(Instance::new(&self.name, self.instances.len() as u32));
        self.instances.push(instance.clone());
        instance
    }

    pub fn templates(&self) -> &[Arc<TemplateSpec>] {
        &self.templates
    }

    pub fn instances(&self) -> &[Arc<Instance>] {
        &self.instances
    }

    pub fn instance(&self, index: u32) -> Option<Arc<Instance>> {
        self.instances.get(index as usize).cloned()
    }

    /// Attach a compiled-package result. Repeated attachments for the same
    /// package are ignored.
    pub fn use_compiled_package(&self, compiled: CompiledPackageRecord) {
        let mut packages = self
            .compiled_packages
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if !packages.iter().any(|c| c.package_id == compiled.package_id) {
            packages.push(compiled);
        }
    }

    pub fn compiled_packages(&self) -> Vec<CompiledPackageRecord> {
        self.compiled_packages
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn set_config_hash(&self, hash: String) {
        *self
            .config_hash
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(hash);
    }

    pub fn config_hash(&self) -> Option<String> {
        self.config_hash
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[derive(Debug, Default)]
struct Binding {
    model: Option<InstanceRecord>,
    machine: Option<MachineRecord>,
    current_state: Option<Value>,
    reservations: HashMap<String, NetworkReservation>,
}

/// One member of a job, identified by (job name, index). Bound to at most
/// one persisted machine at a time.
#[derive(Debug)]
pub struct Instance {
    pub job_name: String,
    pub index: u32,
    binding: Mutex<Binding>,
}

impl Instance {
    pub fn new(job_name: &str, index: u32) -> Self {
        Self {
            job_name: job_name.to_string(),
            index,
            binding: Mutex::new(Binding::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Binding> {
        self.binding.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Attach the persisted instance record and, if known, its machine.
    pub fn use_model(&self, model: InstanceRecord, machine: Option<MachineRecord>) {
        let mut binding = self.lock();
        binding.model = Some(model);
        if machine.is_some() {
            binding.machine = machine;
        }
    }

    pub fn set_current_state(&self, state: Value) {
        self.lock().current_state = Some(state);
    }

    pub fn current_state(&self) -> Option<Value> {
        self.lock().current_state.clone()
    }

    pub fn model(&self) -> Option<InstanceRecord> {
        self.lock().model.clone()
    }

    pub fn machine(&self) -> Option<MachineRecord> {
        self.lock().machine.clone()
    }

    pub fn has_machine(&self) -> bool {
        self.lock().machine.is_some()
    }

    /// Register a reservation the instance should hold (plan construction).
    pub fn add_network_reservation(&self, reservation: NetworkReservation) {
        self.lock()
            .reservations
            .insert(reservation.network.clone(), reservation);
    }

    /// Adopt live reservations reported by the agent, keeping any already
    /// reserved claim over an incoming one.
    pub fn take_network_reservations(
        &self,
        reservations: HashMap<String, NetworkReservation>,
    ) {
        let mut binding = self.lock();
        for (network, reservation) in reservations {
            let keep_existing = binding
                .reservations
                .get(&network)
                .is_some_and(|r| r.reserved);
            if !keep_existing {
                binding.reservations.insert(network, reservation);
            }
        }
    }

    pub fn network_reservations(&self) -> HashMap<String, NetworkReservation> {
        self.lock().reservations.clone()
    }

    /// Reservations not yet confirmed by their network.
    pub fn unreserved_reservations(&self) -> Vec<NetworkReservation> {
        self.lock()
            .reservations
            .values()
            .filter(|r| !r.reserved)
            .cloned()
            .collect()
    }

    /// Write back a reservation after a live reserve.
    pub fn store_reservation(&self, reservation: NetworkReservation) {
        self.lock()
            .reservations
            .insert(reservation.network.clone(), reservation);
    }

    /// Take an idle machine from the pool if this instance has none yet.
    pub fn bind_unallocated_vm(&self, pool: &ResourcePool) {
        let mut binding = self.lock();
        if binding.machine.is_some() {
            return;
        }
        if let Some(idle) = pool.allocate_idle() {
            if let Some(reservation) = idle.reservation {
                binding
                    .reservations
                    .insert(reservation.network.clone(), reservation);
            }
            binding.machine = Some(idle.machine);
            pool.mark_active_vm();
        }
    }

    /// Make the persisted instance record match this binding. Must run after
    /// `bind_unallocated_vm` so an allocated machine is recorded.
    pub fn sync_state_with_db(&self, db: &Database, deployment_id: u64) {
        let mut binding = self.lock();
        let vm_id = binding.machine.as_ref().map(|m| m.id);
        match &binding.model {
            Some(model) => db.update_instance_vm(model.id, vm_id),
            None => {
                let record = db.create_instance(deployment_id, &self.job_name, self.index, vm_id);
                binding.model = Some(record);
            }
        }
    }
}

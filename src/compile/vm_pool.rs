//! Pool of compilation worker machines.
//!
//! Workers are ephemeral machines created from the compiling stemcell. The
//! pool tracks idle workers per stemcell so reuse mode can hand a finished
//! worker to the next task instead of cycling machines. Destruction is the
//! scheduler's job; the pool only accounts for capacity.

use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, info};
use uuid::Uuid;

use crate::agent::AgentClient;
use crate::context::{CompilationConfig, CoreContext};
use crate::db::{MachineRecord, StemcellRecord};
use crate::errors::{CompileError, ReconcileError};
use crate::network::{Network, NetworkReservation};

/// One provisioned compilation worker.
pub struct WorkerHandle {
    pub stemcell_id: u64,
    pub machine: MachineRecord,
    pub agent: Arc<dyn AgentClient>,
    pub reservation: Option<NetworkReservation>,
    pub network_settings: Value,
}

#[derive(Default)]
struct PoolState {
    /// Idle workers by stemcell id.
    idle: HashMap<u64, Vec<WorkerHandle>>,
    /// Live workers (idle or busy) by stemcell id.
    totals: HashMap<u64, usize>,
}

/// Worker pool bounded per stemcell.
pub struct VmPool {
    capacity: usize,
    state: Mutex<PoolState>,
}

impl VmPool {
    /// `capacity` bounds live workers per stemcell.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            state: Mutex::new(PoolState::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Take an idle worker built from the given stemcell, if any.
    pub fn get_vm(&self, stemcell_id: u64) -> Option<WorkerHandle> {
        self.lock()
            .idle
            .get_mut(&stemcell_id)
            .and_then(|workers| workers.pop())
    }

    /// Provision a fresh worker: reserve an address, create the machine, and
    /// register it in the database.
    pub async fn add_vm(
        &self,
        stemcell: &StemcellRecord,
        network: &dyn Network,
        ctx: &CoreContext,
        config: &CompilationConfig,
        deployment_id: u64,
    ) -> Result<WorkerHandle, CompileError> {
        {
            let mut state = self.lock();
            let live = state.totals.entry(stemcell.id).or_default();
            if *live >= self.capacity {
                return Err(CompileError::WorkerLimit {
                    stemcell: stemcell.name.clone(),
                    workers: self.capacity,
                });
            }
            *live += 1;
        }

        match self
            .provision(stemcell, network, ctx, config, deployment_id)
            .await
        {
            Ok(worker) => Ok(worker),
            Err(err) => {
                self.release_slot(stemcell.id);
                Err(err)
            }
        }
    }

    fn release_slot(&self, stemcell_id: u64) {
        let mut state = self.lock();
        if let Some(live) = state.totals.get_mut(&stemcell_id) {
            *live = live.saturating_sub(1);
        }
    }

    async fn provision(
        &self,
        stemcell: &StemcellRecord,
        network: &dyn Network,
        ctx: &CoreContext,
        config: &CompilationConfig,
        deployment_id: u64,
    ) -> Result<WorkerHandle, CompileError> {
        let mut reservation = NetworkReservation::dynamic(network.name());
        network.reserve(&mut reservation).await?;
        if !reservation.reserved {
            return Err(ReconcileError::NetworkExhausted {
                network: network.name().to_string(),
                subject: "compilation worker".to_string(),
            }
            .into());
        }
        let network_settings = network.network_settings(&reservation);

        let agent_id = Uuid::new_v4().to_string();
        let cid = match ctx
            .cloud
            .create_vm(
                &agent_id,
                &stemcell.cid,
                &config.cloud_properties,
                &network_settings,
                None,
                &config.env,
            )
            .await
        {
            Ok(cid) => cid,
            Err(err) => {
                network.release(&reservation).await;
                return Err(CompileError::Other(err));
            }
        };

        let machine = ctx.db.create_machine(deployment_id, &cid, &agent_id);
        info!(cid = %machine.cid, stemcell = %stemcell.name, "created compilation worker");

        Ok(WorkerHandle {
            stemcell_id: stemcell.id,
            agent: ctx.agents.client(&machine.agent_id),
            machine,
            reservation: Some(reservation),
            network_settings,
        })
    }

    /// Return a worker to the idle set for reuse.
    pub fn return_vm(&self, worker: WorkerHandle) {
        debug!(cid = %worker.machine.cid, "worker returned to pool");
        self.lock()
            .idle
            .entry(worker.stemcell_id)
            .or_default()
            .push(worker);
    }

    /// Drop a worker from the pool's accounting. The caller destroys it.
    pub fn remove_vm(&self, worker: &WorkerHandle) {
        self.release_slot(worker.stemcell_id);
    }

    /// Empty the idle set, releasing each worker's capacity slot. The caller
    /// destroys the machines.
    pub fn drain_all(&self) -> Vec<WorkerHandle> {
        let mut state = self.lock();
        let workers: Vec<WorkerHandle> = state.idle.drain().flat_map(|(_, w)| w).collect();
        for worker in &workers {
            if let Some(live) = state.totals.get_mut(&worker.stemcell_id) {
                *live = live.saturating_sub(1);
            }
        }
        workers
    }
}

//! Resource pools: named machine capacity bound to one stemcell and network.

use serde_json::Value;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::db::MachineRecord;
use crate::network::NetworkReservation;
use crate::plan::StemcellSpec;

/// A pooled machine not yet bound to any instance.
#[derive(Debug, Clone)]
pub struct IdleVm {
    pub machine: MachineRecord,
    pub current_state: Option<Value>,
    pub reservation: Option<NetworkReservation>,
}

impl IdleVm {
    pub fn new(machine: MachineRecord, current_state: Option<Value>) -> Self {
        Self {
            machine,
            current_state,
            reservation: None,
        }
    }

    /// Keep a still-valid dynamic reservation for reuse.
    pub fn use_reservation(&mut self, reservation: NetworkReservation) {
        self.reservation = Some(reservation);
    }
}

#[derive(Debug, Default)]
struct PoolState {
    idle: Vec<IdleVm>,
    active: usize,
}

/// Named machine capacity group. Idle and active counts are mutated under
/// the pool's own lock, never a plan-wide one, so concurrent binds of
/// machines in different pools do not serialize.
#[derive(Debug)]
pub struct ResourcePool {
    pub name: String,
    pub stemcell: Arc<StemcellSpec>,
    pub network_name: String,
    /// Desired machine count for the pool.
    pub capacity: usize,
    state: Mutex<PoolState>,
}

impl ResourcePool {
    pub fn new(
        name: &str,
        stemcell: Arc<StemcellSpec>,
        network_name: &str,
        capacity: usize,
    ) -> Self {
        Self {
            name: name.to_string(),
            stemcell,
            network_name: network_name.to_string(),
            capacity,
            state: Mutex::new(PoolState::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Add a live machine to the idle set.
    pub fn add_idle_vm(&self, idle: IdleVm) {
        self.lock().idle.push(idle);
    }

    /// Take one idle machine out of the pool, if any.
    pub fn allocate_idle(&self) -> Option<IdleVm> {
        self.lock().idle.pop()
    }

    /// Record that one of the pool's machines is bound to an instance.
    pub fn mark_active_vm(&self) {
        self.lock().active += 1;
    }

    pub fn idle_count(&self) -> usize {
        self.lock().idle.len()
    }

    pub fn active_count(&self) -> usize {
        self.lock().active
    }

    /// Machines still missing to reach the pool's desired capacity.
    pub fn missing_vm_count(&self) -> usize {
        let state = self.lock();
        self.capacity.saturating_sub(state.idle.len() + state.active)
    }
}

//! Exclusive ownership ledger over the fixed set of sandbox VMs.
//!
//! The pool knows nothing about power state; it enforces exactly one live
//! lease per VM name and FIFO fairness among waiters. Serialization across
//! pipelines on the same VM follows from release happening only after the
//! holder's cleanup completed.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use chrono::{DateTime, Local};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::oneshot;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{ErrorKind, SandboxError};

/// Exclusive claim on one VM for the duration of one pipeline run.
///
/// Dropping a lease does **not** release the VM — call [`VmPool::release`]
/// explicitly so release always happens after cleanup, never at an arbitrary
/// drop point.
#[derive(Debug)]
pub struct VmLease {
    pub vm_name: String,
    pub pipeline_id: Uuid,
    pub acquired_at: DateTime<Local>,
}

#[derive(Debug)]
struct Waiter {
    waiter_id: u64,
    pipeline_id: Uuid,
    tx: oneshot::Sender<VmLease>,
}

#[derive(Debug, Default)]
struct Slot {
    /// Pipeline currently holding the lease, if any.
    holder: Option<Uuid>,
    waiters: VecDeque<Waiter>,
    /// Set when cleanup could not return the VM to an off state. Cleared by
    /// the next successful pre-run cleanup.
    needs_attention: bool,
}

/// Point-in-time view for the health endpoint.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolSnapshot {
    pub total: usize,
    pub free: usize,
    pub leased: usize,
    pub needs_attention: Vec<String>,
}

pub struct VmPool {
    slots: Mutex<HashMap<String, Slot>>,
    next_waiter_id: Mutex<u64>,
}

impl VmPool {
    pub fn new(vm_names: impl IntoIterator<Item = String>) -> Self {
        let slots = vm_names
            .into_iter()
            .map(|name| (name, Slot::default()))
            .collect();
        Self {
            slots: Mutex::new(slots),
            next_waiter_id: Mutex::new(0),
        }
    }

    /// Acquire `vm_name` exclusively, waiting up to `wait_deadline` behind
    /// earlier waiters on the same VM.
    pub async fn acquire(
        &self,
        vm_name: &str,
        pipeline_id: Uuid,
        wait_deadline: Duration,
    ) -> Result<VmLease, SandboxError> {
        let (waiter_id, rx) = {
            let mut slots = self.slots.lock();
            let slot = slots.get_mut(vm_name).ok_or_else(|| {
                SandboxError::new(ErrorKind::VmUnknown, format!("VM not in pool: {vm_name}"))
            })?;

            if slot.holder.is_none() && slot.waiters.is_empty() {
                slot.holder = Some(pipeline_id);
                debug!(vm = vm_name, %pipeline_id, "lease granted immediately");
                return Ok(VmLease {
                    vm_name: vm_name.to_string(),
                    pipeline_id,
                    acquired_at: Local::now(),
                });
            }

            let waiter_id = {
                let mut next = self.next_waiter_id.lock();
                *next += 1;
                *next
            };
            let (tx, rx) = oneshot::channel();
            slot.waiters.push_back(Waiter {
                waiter_id,
                pipeline_id,
                tx,
            });
            debug!(
                vm = vm_name,
                %pipeline_id,
                queue_len = slot.waiters.len(),
                "queued for lease"
            );
            (waiter_id, rx)
        };

        match tokio::time::timeout(wait_deadline, rx).await {
            Ok(Ok(lease)) => Ok(lease),
            // Sender dropped: the pool was shut down while we waited.
            Ok(Err(_)) => Err(SandboxError::cancelled(format!(
                "lease wait on {vm_name} aborted"
            ))),
            Err(_) => {
                self.remove_waiter(vm_name, waiter_id);
                Err(SandboxError::cancelled(format!(
                    "lease on {vm_name} not granted within {wait_deadline:?}"
                )))
            }
        }
    }

    /// Release a lease and hand the VM to the next FIFO waiter, if any.
    /// Idempotent: releasing a lease the pool no longer tracks is a no-op.
    pub fn release(&self, lease: VmLease) {
        let mut slots = self.slots.lock();
        let Some(slot) = slots.get_mut(&lease.vm_name) else {
            warn!(vm = %lease.vm_name, "release for VM not in pool");
            return;
        };

        if slot.holder != Some(lease.pipeline_id) {
            debug!(vm = %lease.vm_name, "stale release ignored");
            return;
        }

        // FIFO handoff: the lease transfers directly to the next waiter so
        // no third party can steal the slot in between.
        loop {
            match slot.waiters.pop_front() {
                Some(waiter) => {
                    let next_lease = VmLease {
                        vm_name: lease.vm_name.clone(),
                        pipeline_id: waiter.pipeline_id,
                        acquired_at: Local::now(),
                    };
                    match waiter.tx.send(next_lease) {
                        Ok(()) => {
                            slot.holder = Some(waiter.pipeline_id);
                            debug!(vm = %lease.vm_name, "lease handed to next waiter");
                            return;
                        }
                        // Receiver gave up (deadline); try the next one.
                        Err(_) => continue,
                    }
                }
                None => {
                    slot.holder = None;
                    debug!(vm = %lease.vm_name, "lease released, VM free");
                    return;
                }
            }
        }
    }

    /// Flag a VM whose cleanup failed; it stays leasable, but operators see
    /// it on the health view until a later cleanup succeeds.
    pub fn mark_needs_attention(&self, vm_name: &str) {
        if let Some(slot) = self.slots.lock().get_mut(vm_name) {
            warn!(vm = vm_name, "VM flagged needs-attention");
            slot.needs_attention = true;
        }
    }

    pub fn clear_needs_attention(&self, vm_name: &str) {
        if let Some(slot) = self.slots.lock().get_mut(vm_name) {
            if slot.needs_attention {
                debug!(vm = vm_name, "needs-attention flag cleared");
            }
            slot.needs_attention = false;
        }
    }

    pub fn needs_attention(&self, vm_name: &str) -> bool {
        self.slots
            .lock()
            .get(vm_name)
            .map(|s| s.needs_attention)
            .unwrap_or(false)
    }

    pub fn snapshot(&self) -> PoolSnapshot {
        let slots = self.slots.lock();
        let total = slots.len();
        let leased = slots.values().filter(|s| s.holder.is_some()).count();
        let needs_attention = slots
            .iter()
            .filter(|(_, s)| s.needs_attention)
            .map(|(name, _)| name.clone())
            .collect();
        PoolSnapshot {
            total,
            free: total - leased,
            leased,
            needs_attention,
        }
    }

    fn remove_waiter(&self, vm_name: &str, waiter_id: u64) {
        let mut slots = self.slots.lock();
        if let Some(slot) = slots.get_mut(vm_name) {
            slot.waiters.retain(|w| w.waiter_id != waiter_id);
        }
    }
}

//! In-memory task registry with validated status transitions.
//!
//! A single mutex guards the whole map; reads clone out, so handlers never
//! hold the lock across an await point. Invalid transitions and duplicate
//! per-VM records are programming errors — they return `Internal` and the
//! tests treat them as fatal.

use std::collections::HashMap;

use parking_lot::Mutex;
use tracing::{debug, error};
use uuid::Uuid;

use crate::error::SandboxError;
use crate::model::{Summary, Task, TaskStatus, VmResult};

#[derive(Default)]
pub struct ResultStore {
    tasks: Mutex<HashMap<Uuid, Task>>,
}

impl ResultStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, task: Task) {
        debug!(task_id = %task.task_id, "task registered");
        self.tasks.lock().insert(task.task_id, task);
    }

    pub fn get(&self, task_id: Uuid) -> Option<Task> {
        self.tasks.lock().get(&task_id).cloned()
    }

    pub fn status(&self, task_id: Uuid) -> Option<TaskStatus> {
        self.tasks.lock().get(&task_id).map(|t| t.status)
    }

    /// Tasks matching an optional status filter, newest first.
    pub fn list(&self, status: Option<TaskStatus>, limit: usize) -> Vec<Task> {
        let tasks = self.tasks.lock();
        let mut out: Vec<Task> = tasks
            .values()
            .filter(|t| status.map_or(true, |s| t.status == s))
            .cloned()
            .collect();
        out.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        out.truncate(limit);
        out
    }

    /// Advance a task's status, enforcing the monotone order. An illegal
    /// transition is an invariant violation and fails loudly.
    pub fn advance_status(&self, task_id: Uuid, next: TaskStatus) -> Result<(), SandboxError> {
        let mut tasks = self.tasks.lock();
        let task = tasks
            .get_mut(&task_id)
            .ok_or_else(|| SandboxError::internal(format!("unknown task: {task_id}")))?;

        if !task.status.can_advance_to(next) {
            error!(
                %task_id,
                from = ?task.status,
                to = ?next,
                "illegal status transition"
            );
            return Err(SandboxError::internal(format!(
                "illegal status transition {:?} -> {:?} for {task_id}",
                task.status, next
            )));
        }

        debug!(%task_id, from = ?task.status, to = ?next, "status advanced");
        task.status = next;
        Ok(())
    }

    /// Record the result of one VM's pipeline. Each requested VM gets
    /// exactly one entry; a second write is an invariant violation.
    pub fn record_per_vm(
        &self,
        task_id: Uuid,
        vm_name: &str,
        result: VmResult,
    ) -> Result<(), SandboxError> {
        let mut tasks = self.tasks.lock();
        let task = tasks
            .get_mut(&task_id)
            .ok_or_else(|| SandboxError::internal(format!("unknown task: {task_id}")))?;

        if !task.requested_vms.iter().any(|v| v == vm_name) {
            return Err(SandboxError::internal(format!(
                "result for {vm_name} which {task_id} never requested"
            )));
        }
        if task.per_vm_results.contains_key(vm_name) {
            return Err(SandboxError::internal(format!(
                "duplicate per-VM result for {vm_name} on {task_id}"
            )));
        }

        task.per_vm_results.insert(vm_name.to_string(), result);
        Ok(())
    }

    pub fn record_summary(&self, task_id: Uuid, summary: Summary) -> Result<(), SandboxError> {
        let mut tasks = self.tasks.lock();
        let task = tasks
            .get_mut(&task_id)
            .ok_or_else(|| SandboxError::internal(format!("unknown task: {task_id}")))?;
        task.summary = Some(summary);
        Ok(())
    }

    pub fn counts(&self) -> StoreCounts {
        let tasks = self.tasks.lock();
        let mut counts = StoreCounts::default();
        for task in tasks.values() {
            counts.total += 1;
            match task.status {
                TaskStatus::Pending => counts.pending += 1,
                TaskStatus::Running => counts.running += 1,
                TaskStatus::Completed => counts.completed += 1,
                TaskStatus::Failed => counts.failed += 1,
                TaskStatus::Cancelled => counts.cancelled += 1,
            }
        }
        counts
    }
}

#[derive(Debug, Default, Clone, Copy, serde::Serialize)]
pub struct StoreCounts {
    pub total: usize,
    pub pending: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
}

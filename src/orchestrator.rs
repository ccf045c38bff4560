//! Task orchestration: bounded intake queue, concurrency ceiling, per-VM
//! fan-out, and result aggregation.
//!
//! The orchestrator shares no mutable state with pipelines except through
//! the result store and the VM pool. A task fans out into one pipeline per
//! requested VM; pipelines are siblings — one failing, timing out, or being
//! cancelled never cancels the others. The task itself always reaches a
//! terminal status: Completed when at least one pipeline produced a result
//! structure, Failed only when none did, Cancelled when cancellation won.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::VmSpec;
use crate::error::{ErrorKind, SandboxError};
use crate::model::{Sample, Summary, Task, TaskStatus};
use crate::pipeline::{run_pipeline, PipelineDeps};
use crate::store::ResultStore;

pub struct Orchestrator {
    deps: PipelineDeps,
    store: Arc<ResultStore>,
    vms: HashMap<String, VmSpec>,
    /// Config order; used when a submission names no VMs.
    default_vms: Vec<String>,
    queue_tx: mpsc::Sender<Uuid>,
    queue_capacity: usize,
    semaphore: Arc<Semaphore>,
    cancels: Mutex<HashMap<Uuid, CancellationToken>>,
    shutdown: CancellationToken,
}

/// Queue and worker occupancy for the health endpoint.
#[derive(Debug, Clone, Copy, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueSnapshot {
    pub depth: usize,
    pub capacity: usize,
    pub running: usize,
    pub max_concurrent: usize,
}

impl Orchestrator {
    /// Build the orchestrator. The returned receiver must be passed to
    /// [`Orchestrator::start`]; splitting construction from startup lets
    /// tests wire everything before any worker runs.
    pub fn new(
        deps: PipelineDeps,
        store: Arc<ResultStore>,
        vm_specs: Vec<VmSpec>,
    ) -> (Arc<Self>, mpsc::Receiver<Uuid>) {
        let queue_capacity = deps.analysis.queue_size;
        let max_concurrent = deps.analysis.max_concurrent_tasks;
        let (queue_tx, queue_rx) = mpsc::channel(queue_capacity);

        let default_vms = vm_specs.iter().map(|v| v.name.clone()).collect();
        let vms = vm_specs.into_iter().map(|v| (v.name.clone(), v)).collect();

        let orchestrator = Arc::new(Self {
            deps,
            store,
            vms,
            default_vms,
            queue_tx,
            queue_capacity,
            semaphore: Arc::new(Semaphore::new(max_concurrent)),
            cancels: Mutex::new(HashMap::new()),
            shutdown: CancellationToken::new(),
        });
        (orchestrator, queue_rx)
    }

    /// Spawn the worker loop.
    pub fn start(self: &Arc<Self>, queue_rx: mpsc::Receiver<Uuid>) -> tokio::task::JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move {
            this.worker_loop(queue_rx).await;
        })
    }

    /// Stop accepting progress: cancels every running task's token. Queued
    /// tasks are drained by their pipelines observing the cancel.
    pub fn stop(&self) {
        info!("orchestrator stopping, cancelling running tasks");
        self.shutdown.cancel();
    }

    // ------------------------------------------------------------------
    // Submission
    // ------------------------------------------------------------------

    /// Register and enqueue a task. The queue permit is reserved before the
    /// task is stored, so a `QueueFull` rejection never leaves a phantom
    /// Pending task behind.
    pub fn submit(
        &self,
        sample: Sample,
        vm_names: Option<Vec<String>>,
        timeout_secs: u64,
    ) -> Result<Uuid, SandboxError> {
        let requested = match vm_names {
            Some(names) if !names.is_empty() => names,
            _ => self.default_vms.clone(),
        };

        // Validate and dedupe, preserving request order.
        let mut seen = HashSet::new();
        let mut vms = Vec::new();
        for name in requested {
            if !self.vms.contains_key(&name) {
                return Err(SandboxError::new(
                    ErrorKind::VmUnknown,
                    format!("requested VM is not configured: {name}"),
                ));
            }
            if seen.insert(name.clone()) {
                vms.push(name);
            }
        }

        let permit = self.queue_tx.try_reserve().map_err(|e| match e {
            mpsc::error::TrySendError::Full(()) => SandboxError::new(
                ErrorKind::QueueFull,
                format!("work queue at capacity ({})", self.queue_capacity),
            ),
            mpsc::error::TrySendError::Closed(()) => {
                SandboxError::internal("orchestrator queue closed")
            }
        })?;

        let task = Task::new(sample, vms, timeout_secs);
        let task_id = task.task_id;
        info!(
            %task_id,
            sample = %task.sample.name,
            vms = ?task.requested_vms,
            "task submitted"
        );
        self.store.insert(task);
        permit.send(task_id);
        Ok(task_id)
    }

    /// Cancel a task. Pending tasks flip to Cancelled immediately; running
    /// tasks get their token cancelled and reach Cancelled once their
    /// pipelines have finished cleanup.
    pub fn cancel(&self, task_id: Uuid) -> bool {
        match self.store.status(task_id) {
            None => false,
            Some(TaskStatus::Pending) => {
                info!(%task_id, "cancelling pending task");
                self.store
                    .advance_status(task_id, TaskStatus::Cancelled)
                    .is_ok()
            }
            Some(TaskStatus::Running) => match self.cancels.lock().get(&task_id) {
                Some(token) => {
                    info!(%task_id, "cancelling running task");
                    token.cancel();
                    true
                }
                None => false,
            },
            Some(_) => false,
        }
    }

    pub fn queue_snapshot(&self) -> QueueSnapshot {
        let max_concurrent = self.deps.analysis.max_concurrent_tasks;
        QueueSnapshot {
            depth: self.queue_capacity - self.queue_tx.capacity(),
            capacity: self.queue_capacity,
            running: max_concurrent - self.semaphore.available_permits(),
            max_concurrent,
        }
    }

    // ------------------------------------------------------------------
    // Worker
    // ------------------------------------------------------------------

    async fn worker_loop(self: Arc<Self>, mut queue_rx: mpsc::Receiver<Uuid>) {
        info!("orchestrator worker started");
        loop {
            let task_id = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                received = queue_rx.recv() => match received {
                    Some(id) => id,
                    None => break,
                },
            };

            // The ceiling applies before the task starts; dequeuing waits
            // here when all slots are busy.
            let permit = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                acquired = self.semaphore.clone().acquire_owned() => match acquired {
                    Ok(p) => p,
                    Err(_) => break,
                },
            };

            let this = self.clone();
            tokio::spawn(async move {
                this.run_task(task_id).await;
                drop(permit);
            });
        }
        info!("orchestrator worker stopped");
    }

    async fn run_task(self: &Arc<Self>, task_id: Uuid) {
        let Some(task) = self.store.get(task_id) else {
            error!(%task_id, "dequeued unknown task");
            return;
        };
        if task.status != TaskStatus::Pending {
            // Cancelled while still queued.
            debug!(%task_id, status = ?task.status, "skipping dequeued task");
            return;
        }

        let token = self.shutdown.child_token();
        self.cancels.lock().insert(task_id, token.clone());
        if self
            .store
            .advance_status(task_id, TaskStatus::Running)
            .is_err()
        {
            // Lost a race with cancellation.
            self.cancels.lock().remove(&task_id);
            return;
        }

        // Fan out: one pipeline per requested VM, siblings independent.
        let mut pipelines = JoinSet::new();
        for vm_name in &task.requested_vms {
            let Some(spec) = self.vms.get(vm_name).cloned() else {
                // Submission validated this; disappearing now is a bug.
                error!(%task_id, vm = %vm_name, "requested VM vanished from configuration");
                continue;
            };
            let deps = self.deps.clone();
            let sample = task.sample.clone();
            let vm_token = token.clone();
            let deadline = self.deps.analysis.per_vm_deadline(task.timeout_secs);
            pipelines
                .spawn(async move { run_pipeline(&deps, &sample, &spec, vm_token, deadline).await });
        }

        let mut produced = 0usize;
        while let Some(joined) = pipelines.join_next().await {
            match joined {
                Ok(vm_result) => {
                    produced += 1;
                    let vm_name = vm_result.vm_name.clone();
                    if let Err(e) = self.store.record_per_vm(task_id, &vm_name, vm_result) {
                        error!(%task_id, vm = %vm_name, error = %e, "failed to record result");
                    }
                }
                Err(join_error) => {
                    error!(%task_id, error = %join_error, "pipeline task panicked");
                }
            }
        }
        self.cancels.lock().remove(&task_id);

        let Some(task) = self.store.get(task_id) else {
            return;
        };
        let summary = summarize(&task);
        if let Err(e) = self.store.record_summary(task_id, summary) {
            error!(%task_id, error = %e, "failed to record summary");
        }

        let terminal = if token.is_cancelled() {
            TaskStatus::Cancelled
        } else if produced == 0 {
            TaskStatus::Failed
        } else {
            TaskStatus::Completed
        };
        if let Err(e) = self.store.advance_status(task_id, terminal) {
            error!(%task_id, error = %e, "failed to finalize task status");
        }
        info!(%task_id, status = ?terminal, produced, "task finished");
        if terminal == TaskStatus::Failed {
            warn!(%task_id, "no pipeline produced a result structure");
        }
    }
}

/// Aggregate per-VM results into the task summary: union of alert counts,
/// total event count, earliest detections overall and per agent kind, and
/// the detection verdict (any alert, or any agent-side deletion).
pub fn summarize(task: &Task) -> Summary {
    let mut detected = false;
    let mut first_detection_at = None;
    let mut first_detections = std::collections::BTreeMap::new();
    let mut alert_counts = std::collections::BTreeMap::new();
    let mut event_count = 0u64;

    for result in task.per_vm_results.values() {
        if result.sample_deleted_by_agent {
            detected = true;
        }
        event_count += result.events.len() as u64;

        for alert in &result.alerts {
            detected = true;
            *alert_counts.entry(alert.kind.clone()).or_insert(0) += 1;

            if first_detection_at.map_or(true, |t| alert.timestamp < t) {
                first_detection_at = Some(alert.timestamp);
            }
            let agent = result.agent_kind.as_str().to_string();
            first_detections
                .entry(agent)
                .and_modify(|t| {
                    if alert.timestamp < *t {
                        *t = alert.timestamp;
                    }
                })
                .or_insert(alert.timestamp);
        }
    }

    Summary {
        detected,
        first_detection_at,
        first_detections,
        alert_counts,
        event_count,
    }
}

//! Core data model: samples, tasks, per-VM results, alerts, and behavioral
//! events.
//!
//! Everything here serializes with camelCase keys because these structs *are*
//! the report format — there is no separate DTO layer. Alerts and events are
//! closed structures; product-specific fields survive in `raw_fields` so
//! collectors never need to widen the core schema.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::AgentKind;
use crate::error::ErrorKind;

// ---------------------------------------------------------------------------
// Sample
// ---------------------------------------------------------------------------

/// An uploaded sample. Immutable after submission; shared read-only across
/// every pipeline of every task that references it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Sample {
    pub sample_id: Uuid,
    pub name: String,
    pub path: std::path::PathBuf,
    pub hash_hex: String,
    pub size_bytes: u64,
    pub received_at: DateTime<Local>,
}

impl Sample {
    /// Filename the sample gets inside the guest. Extensionless samples are
    /// given a `.bin` suffix so the guest shell can address them.
    pub fn guest_file_name(&self) -> String {
        if self.name.contains('.') {
            self.name.clone()
        } else {
            format!("{}.bin", self.name)
        }
    }
}

// ---------------------------------------------------------------------------
// Task
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }

    /// Whether `self → next` is a legal transition. Status advances
    /// monotonically; only Cancelled may preempt Pending or Running.
    pub fn can_advance_to(&self, next: TaskStatus) -> bool {
        matches!(
            (self, next),
            (TaskStatus::Pending, TaskStatus::Running)
                | (TaskStatus::Pending, TaskStatus::Cancelled)
                | (TaskStatus::Running, TaskStatus::Completed)
                | (TaskStatus::Running, TaskStatus::Failed)
                | (TaskStatus::Running, TaskStatus::Cancelled)
        )
    }
}

/// One analysis request: a sample fanned out across an ordered set of VMs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub task_id: Uuid,
    pub sample: Sample,
    /// Ordered, unique VM names this task runs on.
    pub requested_vms: Vec<String>,
    pub timeout_secs: u64,
    pub created_at: DateTime<Local>,
    pub status: TaskStatus,
    /// One entry per requested VM, written exactly once by the owning
    /// pipeline.
    pub per_vm_results: BTreeMap<String, VmResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<Summary>,
}

impl Task {
    pub fn new(sample: Sample, requested_vms: Vec<String>, timeout_secs: u64) -> Self {
        Self {
            task_id: Uuid::new_v4(),
            sample,
            requested_vms,
            timeout_secs,
            created_at: Local::now(),
            status: TaskStatus::Pending,
            per_vm_results: BTreeMap::new(),
            summary: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Pipeline phases and per-VM results
// ---------------------------------------------------------------------------

/// Where a pipeline is (or where it stopped). Order is total within a run;
/// terminal cleanup always executes regardless of the phase a failure or
/// cancellation hit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Phase {
    Queued,
    Acquired,
    Restoring,
    Starting,
    WaitingGuest,
    Uploading,
    Detonating,
    Dwelling,
    Collecting,
    Cleanup,
    Released,
}

/// Outcome of one sample on one VM. Mutated only by the owning pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VmResult {
    pub vm_name: String,
    pub agent_kind: AgentKind,
    pub phase: Phase,
    pub started_at: DateTime<Local>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Local>>,
    /// The agent removed the sample before execution — a first-class
    /// detection outcome, not an error.
    pub sample_deleted_by_agent: bool,
    pub alerts: Vec<Alert>,
    pub events: Vec<Event>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_detail: Option<String>,
}

impl VmResult {
    pub fn new(vm_name: impl Into<String>, agent_kind: AgentKind) -> Self {
        Self {
            vm_name: vm_name.into(),
            agent_kind,
            phase: Phase::Queued,
            started_at: Local::now(),
            ended_at: None,
            sample_deleted_by_agent: false,
            alerts: Vec::new(),
            events: Vec::new(),
            error_kind: None,
            error_detail: None,
        }
    }

    pub fn record_error(&mut self, kind: ErrorKind, detail: impl Into<String>) {
        self.error_kind = Some(kind);
        self.error_detail = Some(detail.into());
    }

    pub fn is_errored(&self) -> bool {
        self.error_kind.is_some()
    }
}

// ---------------------------------------------------------------------------
// Alerts
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Low,
    Medium,
    High,
    Critical,
}

/// A threat alert raised by a security agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Alert {
    pub alert_id: String,
    /// Local time with explicit offset, normalized by the collector.
    pub timestamp: DateTime<Local>,
    pub severity: Severity,
    /// Alert category, e.g. `quarantine` or `threat-detection`.
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub threat_name: Option<String>,
    /// Path or filename the agent associated with the detection.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_hint: Option<String>,
    /// Product-specific fields preserved verbatim.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub raw_fields: HashMap<String, String>,
}

// ---------------------------------------------------------------------------
// Behavioral events
// ---------------------------------------------------------------------------

/// The behavioral monitor's event vocabulary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum EventType {
    ProcessCreate,
    ProcessExit,
    RemoteThread,
    ProcessAccess,
    ProcessTampering,
    FileCreate,
    FileDelete,
    FileStreamCreate,
    FileCreateTimeChange,
    FileBlockExec,
    FileBlockShred,
    RegKeyChange,
    RegValueSet,
    RegRename,
    NetConnect,
    DnsQuery,
    DriverLoad,
    ImageLoad,
    RawRead,
    ServiceConfigChange,
    PipeCreate,
    PipeConnect,
    WmiFilter,
    WmiConsumer,
    WmiBinding,
    ClipboardChange,
    SvcStateChange,
    Other,
}

/// One structured observation from the behavioral monitor.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    pub event_type: EventType,
    pub timestamp: DateTime<Local>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ppid: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command_line: Option<String>,
    /// Event-specific objects: target file, registry key, remote address,
    /// queried domain.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub targets: Vec<String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub raw_fields: HashMap<String, String>,
}

// ---------------------------------------------------------------------------
// Summary and report
// ---------------------------------------------------------------------------

/// Cross-VM aggregate published when a task completes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Summary {
    /// Any alert raised, or any agent consumed the sample before execution.
    pub detected: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first_detection_at: Option<DateTime<Local>>,
    /// Earliest detection per agent, keyed by agent kind name.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub first_detections: BTreeMap<String, DateTime<Local>>,
    /// Alert count per alert kind.
    pub alert_counts: BTreeMap<String, u64>,
    pub event_count: u64,
}

/// The stable report body served by `GET /api/result/{taskId}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Report {
    pub task_id: Uuid,
    pub sample: ReportSample,
    pub created_at: DateTime<Local>,
    pub status: TaskStatus,
    #[serde(rename = "perVM")]
    pub per_vm: Vec<VmResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<Summary>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportSample {
    pub name: String,
    pub hash_hex: String,
    pub size_bytes: u64,
}

impl Report {
    /// Flatten a task into the report shape, ordering per-VM entries the way
    /// the VMs were requested.
    pub fn from_task(task: &Task) -> Self {
        let per_vm = task
            .requested_vms
            .iter()
            .filter_map(|name| task.per_vm_results.get(name).cloned())
            .collect();
        Self {
            task_id: task.task_id,
            sample: ReportSample {
                name: task.sample.name.clone(),
                hash_hex: task.sample.hash_hex.clone(),
                size_bytes: task.sample.size_bytes,
            },
            created_at: task.created_at,
            status: task.status,
            per_vm,
            summary: task.summary.clone(),
        }
    }
}

//! End-to-end orchestration tests over a scripted fake VM controller.
//!
//! No VirtualBox, no guests: the fake controller answers the same trait the
//! real CLI wrapper implements, with per-VM knobs for the interesting
//! failure shapes (guest never ready, agent deletes the sample on upload).
//! Collectors are likewise substituted so the tests assert on orchestration
//! behavior — phase outcomes, exclusivity, cleanup discipline, cancellation
//! — rather than on parser details, which have their own unit tests.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Local;
use parking_lot::Mutex;
use uuid::Uuid;

use blastbox::collect::{Collection, CollectionWindow, Collector, CollectorRegistry, SampleHints};
use blastbox::config::{AgentKind, AnalysisSettings, VmRole, VmSpec};
use blastbox::error::{ErrorKind, SandboxError};
use blastbox::model::{Alert, Event, EventType, Phase, Sample, Severity, Task, TaskStatus};
use blastbox::orchestrator::Orchestrator;
use blastbox::pipeline::PipelineDeps;
use blastbox::store::ResultStore;
use blastbox::vm::{GuestExec, GuestOps, StartMode, VmController, VmPool, VmStatus};

// ---------------------------------------------------------------------------
// Fake controller
// ---------------------------------------------------------------------------

#[derive(Default)]
struct FakeKnobs {
    /// VMs whose guest additions never come up.
    guest_never_ready: HashSet<String>,
    /// VMs whose agent deletes the sample immediately after upload.
    delete_on_upload: HashSet<String>,
}

struct FakeController {
    knobs: FakeKnobs,
    /// Chronological call log, e.g. `restore:def`, `copy:def:s0.exe`.
    calls: Mutex<Vec<String>>,
    /// Simulated power state per VM.
    power: Mutex<HashMap<String, &'static str>>,
    /// Whether the uploaded sample is still present per VM.
    sample_present: Mutex<HashMap<String, bool>>,
    /// VMs currently inside a run (restore seen, final cleanup not yet).
    in_run: Mutex<HashSet<String>>,
    active_runs: AtomicUsize,
    max_active_runs: AtomicUsize,
    overlap_detected: AtomicUsize,
}

impl FakeController {
    fn new(knobs: FakeKnobs) -> Arc<Self> {
        Arc::new(Self {
            knobs,
            calls: Mutex::new(Vec::new()),
            power: Mutex::new(HashMap::new()),
            sample_present: Mutex::new(HashMap::new()),
            in_run: Mutex::new(HashSet::new()),
            active_runs: AtomicUsize::new(0),
            max_active_runs: AtomicUsize::new(0),
            overlap_detected: AtomicUsize::new(0),
        })
    }

    fn record(&self, call: String) {
        self.calls.lock().push(call);
    }

    fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    fn power_of(&self, vm: &str) -> &'static str {
        self.power.lock().get(vm).copied().unwrap_or("poweroff")
    }

    fn saw_overlap(&self) -> bool {
        self.overlap_detected.load(Ordering::SeqCst) > 0
    }

    fn max_concurrent_runs(&self) -> usize {
        self.max_active_runs.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl VmController for FakeController {
    async fn status(&self, vm: &str) -> VmStatus {
        let raw = self.power_of(vm);
        VmStatus {
            power_state: blastbox::vm::PowerState::parse(raw),
            session_state: "Unlocked".to_string(),
        }
    }

    async fn restore_snapshot(&self, vm: &str, _snapshot: &str) -> Result<(), SandboxError> {
        self.record(format!("restore:{vm}"));

        // Exclusivity probe: a restore while the same VM is mid-run means
        // two pipelines overlapped on one VM.
        if !self.in_run.lock().insert(vm.to_string()) {
            self.overlap_detected.fetch_add(1, Ordering::SeqCst);
        }
        let active = self.active_runs.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active_runs.fetch_max(active, Ordering::SeqCst);
        Ok(())
    }

    async fn power_on(&self, vm: &str, _mode: StartMode) -> Result<(), SandboxError> {
        self.record(format!("power_on:{vm}"));
        self.power.lock().insert(vm.to_string(), "running");
        Ok(())
    }

    async fn wait_guest_ready(
        &self,
        vm: &str,
        _user: &str,
        _password: &str,
        _deadline: Duration,
    ) -> Result<(), SandboxError> {
        self.record(format!("wait_ready:{vm}"));
        if self.knobs.guest_never_ready.contains(vm) {
            return Err(SandboxError::new(
                ErrorKind::EnvironmentFailed,
                format!("guest additions not ready on {vm}"),
            ));
        }
        Ok(())
    }

    async fn copy_to_guest(
        &self,
        vm: &str,
        host_path: &std::path::Path,
        _guest_path: &str,
        _user: &str,
        _password: &str,
        _deadline: Duration,
    ) -> Result<(), SandboxError> {
        let file = host_path
            .file_name()
            .map(|f| f.to_string_lossy().into_owned())
            .unwrap_or_default();
        self.record(format!("copy:{vm}:{file}"));
        self.sample_present
            .lock()
            .insert(vm.to_string(), !self.knobs.delete_on_upload.contains(vm));
        Ok(())
    }

    async fn exec_in_guest(
        &self,
        vm: &str,
        _program: &str,
        argv: &[String],
        _user: &str,
        _password: &str,
        _deadline: Duration,
    ) -> Result<GuestExec, SandboxError> {
        let script = argv.last().cloned().unwrap_or_default();
        let stdout = if script.starts_with("Test-Path") {
            self.record(format!("probe:{vm}"));
            let present = self.sample_present.lock().get(vm).copied().unwrap_or(false);
            if present { "True\r\n" } else { "False\r\n" }
        } else if script.starts_with("Start-Process") {
            self.record(format!("detonate:{vm}"));
            ""
        } else {
            ""
        };
        Ok(GuestExec {
            exit_code: 0,
            stdout: stdout.to_string(),
            stderr: String::new(),
        })
    }

    async fn cleanup_resources(&self, vm: &str) -> Result<(), SandboxError> {
        self.record(format!("cleanup:{vm}"));
        self.power.lock().insert(vm.to_string(), "poweroff");
        if self.in_run.lock().remove(vm) {
            self.active_runs.fetch_sub(1, Ordering::SeqCst);
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Fake collectors
// ---------------------------------------------------------------------------

/// Raises one critical alert for the VMs it is armed for, nothing otherwise.
struct FakeAlertCollector {
    alert_for: HashSet<String>,
}

#[async_trait]
impl Collector for FakeAlertCollector {
    async fn collect(
        &self,
        guest: &GuestOps,
        window: &CollectionWindow,
        hints: &SampleHints,
    ) -> Result<Collection, SandboxError> {
        if !self.alert_for.contains(guest.vm_name()) {
            return Ok(Collection::default());
        }
        Ok(Collection {
            alerts: vec![Alert {
                alert_id: format!("fake-{}", guest.vm_name()),
                timestamp: window.start + chrono::Duration::seconds(1),
                severity: Severity::Critical,
                kind: "quarantine".to_string(),
                threat_name: Some("EICAR-Test-File".to_string()),
                file_hint: Some(hints.file_name.clone()),
                raw_fields: HashMap::new(),
            }],
            events: Vec::new(),
        })
    }
}

/// Returns a fixed batch of behavioral events inside the window.
struct FakeEventCollector {
    events_per_collect: usize,
}

#[async_trait]
impl Collector for FakeEventCollector {
    async fn collect(
        &self,
        _guest: &GuestOps,
        window: &CollectionWindow,
        _hints: &SampleHints,
    ) -> Result<Collection, SandboxError> {
        let events = (0..self.events_per_collect)
            .map(|i| Event {
                event_type: EventType::ProcessCreate,
                timestamp: window.start + chrono::Duration::milliseconds(i as i64),
                pid: Some(1000 + i as u32),
                ppid: Some(4),
                image: Some("C:\\sample.exe".to_string()),
                command_line: None,
                targets: Vec::new(),
                raw_fields: HashMap::new(),
            })
            .collect();
        Ok(Collection {
            alerts: Vec::new(),
            events,
        })
    }
}

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

fn vm_spec(name: &str, agent: AgentKind) -> VmSpec {
    VmSpec {
        name: name.to_string(),
        role: if agent == AgentKind::BehavioralMonitor {
            VmRole::Behavioral
        } else {
            VmRole::SecurityAgent
        },
        agent,
        user: "vboxuser".to_string(),
        password: "123456".to_string(),
        baseline_snapshot: "baseline".to_string(),
        desktop_path: None,
        startup_timeout_secs: None,
    }
}

fn fast_analysis(monitoring_window: u64, max_concurrent: usize) -> AnalysisSettings {
    let mut analysis = AnalysisSettings::default();
    analysis.vm_startup_timeout = 5;
    analysis.detonation_dwell = 0;
    analysis.monitoring_window = monitoring_window;
    analysis.max_concurrent_tasks = max_concurrent;
    analysis.queue_size = 100;
    analysis.gui_mode = false;
    analysis.per_vm_max_secs = 60;
    analysis.collection_grace_secs = 30;
    analysis.cleanup_max_secs = 10;
    analysis
}

struct Harness {
    orchestrator: Arc<Orchestrator>,
    store: Arc<ResultStore>,
    pool: Arc<VmPool>,
    controller: Arc<FakeController>,
    /// Kept alive when the worker is not started, so the queue stays open.
    _queue_rx: Option<tokio::sync::mpsc::Receiver<Uuid>>,
}

fn harness(
    specs: Vec<VmSpec>,
    knobs: FakeKnobs,
    analysis: AnalysisSettings,
    alert_for: &[&str],
    start_worker: bool,
) -> Harness {
    let controller = FakeController::new(knobs);
    let pool = Arc::new(VmPool::new(specs.iter().map(|s| s.name.clone())));

    let mut collectors: HashMap<AgentKind, Arc<dyn Collector>> = HashMap::new();
    let alert_set: HashSet<String> = alert_for.iter().map(|s| s.to_string()).collect();
    for kind in [
        AgentKind::Defender,
        AgentKind::Kaspersky,
        AgentKind::Mcafee,
        AgentKind::Avira,
        AgentKind::Trend,
    ] {
        collectors.insert(
            kind,
            Arc::new(FakeAlertCollector {
                alert_for: alert_set.clone(),
            }),
        );
    }
    collectors.insert(
        AgentKind::BehavioralMonitor,
        Arc::new(FakeEventCollector {
            events_per_collect: 5,
        }),
    );

    let deps = PipelineDeps {
        controller: controller.clone(),
        pool: pool.clone(),
        collectors: Arc::new(CollectorRegistry::with_collectors(collectors)),
        analysis,
    };
    let store = Arc::new(ResultStore::new());
    let (orchestrator, queue_rx) = Orchestrator::new(deps, store.clone(), specs);
    let queue_rx = if start_worker {
        orchestrator.start(queue_rx);
        None
    } else {
        Some(queue_rx)
    };

    Harness {
        orchestrator,
        store,
        pool,
        controller,
        _queue_rx: queue_rx,
    }
}

fn sample_named(name: &str) -> Sample {
    Sample {
        sample_id: Uuid::new_v4(),
        name: name.to_string(),
        path: format!("/tmp/uploads/{name}").into(),
        hash_hex: "aa".repeat(32),
        size_bytes: 68,
        received_at: Local::now(),
    }
}

async fn wait_terminal(store: &ResultStore, task_id: Uuid, max: Duration) -> Task {
    let deadline = tokio::time::Instant::now() + max;
    loop {
        if let Some(task) = store.get(task_id) {
            if task.status.is_terminal() {
                return task;
            }
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "task {task_id} did not reach a terminal status in {max:?}"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

// ---------------------------------------------------------------------------
// Scenario: clean file on two VMs
// ---------------------------------------------------------------------------

#[tokio::test]
async fn clean_file_on_two_vms_completes_undetected() {
    let h = harness(
        vec![
            vm_spec("beh", AgentKind::BehavioralMonitor),
            vm_spec("def", AgentKind::Defender),
        ],
        FakeKnobs::default(),
        fast_analysis(0, 10),
        &[],
        true,
    );

    let task_id = h
        .orchestrator
        .submit(
            sample_named("calc.exe"),
            Some(vec!["beh".into(), "def".into()]),
            300,
        )
        .unwrap();
    let task = wait_terminal(&h.store, task_id, Duration::from_secs(10)).await;

    assert_eq!(task.status, TaskStatus::Completed);
    assert_eq!(task.per_vm_results.len(), 2);

    let summary = task.summary.expect("summary present");
    assert!(!summary.detected);
    assert!(summary.alert_counts.is_empty());
    assert!(summary.event_count > 0, "behavioral VM must contribute events");

    for vm in ["beh", "def"] {
        let result = &task.per_vm_results[vm];
        assert_eq!(result.phase, Phase::Released);
        assert!(result.error_kind.is_none());
        assert!(!result.sample_deleted_by_agent);
        assert_eq!(h.controller.power_of(vm), "poweroff", "{vm} must end off");
    }
}

// ---------------------------------------------------------------------------
// Scenario: agent deletes the sample on upload
// ---------------------------------------------------------------------------

#[tokio::test]
async fn agent_deletion_is_a_detection_and_skips_execution() {
    let mut knobs = FakeKnobs::default();
    knobs.delete_on_upload.insert("def".to_string());

    let h = harness(
        vec![vm_spec("def", AgentKind::Defender)],
        knobs,
        fast_analysis(0, 10),
        &["def"],
        true,
    );

    let task_id = h
        .orchestrator
        .submit(sample_named("eicar.com"), Some(vec!["def".into()]), 300)
        .unwrap();
    let task = wait_terminal(&h.store, task_id, Duration::from_secs(10)).await;

    assert_eq!(task.status, TaskStatus::Completed);
    let result = &task.per_vm_results["def"];
    assert!(result.sample_deleted_by_agent);
    assert!(result.error_kind.is_none(), "agent deletion is not an error");
    assert!(result
        .alerts
        .iter()
        .any(|a| a.severity >= Severity::High));

    let summary = task.summary.unwrap();
    assert!(summary.detected);

    // The sample must never have been executed.
    let calls = h.controller.calls();
    assert!(
        !calls.iter().any(|c| c.starts_with("detonate:")),
        "no execution may be attempted after agent deletion: {calls:?}"
    );
}

// ---------------------------------------------------------------------------
// Scenario: guest never ready; sibling unaffected
// ---------------------------------------------------------------------------

#[tokio::test]
async fn guest_not_ready_fails_one_vm_and_leaves_sibling_alone() {
    let mut knobs = FakeKnobs::default();
    knobs.guest_never_ready.insert("bad".to_string());

    let h = harness(
        vec![
            vm_spec("bad", AgentKind::Kaspersky),
            vm_spec("def", AgentKind::Defender),
        ],
        knobs,
        fast_analysis(0, 10),
        &[],
        true,
    );

    let task_id = h
        .orchestrator
        .submit(
            sample_named("sample.exe"),
            Some(vec!["bad".into(), "def".into()]),
            300,
        )
        .unwrap();
    let task = wait_terminal(&h.store, task_id, Duration::from_secs(10)).await;

    // The task ran; the failure lives on the individual result.
    assert_eq!(task.status, TaskStatus::Completed);

    let bad = &task.per_vm_results["bad"];
    assert_eq!(bad.error_kind, Some(ErrorKind::EnvironmentFailed));
    assert_eq!(bad.phase, Phase::WaitingGuest);
    assert_eq!(h.controller.power_of("bad"), "poweroff");

    let good = &task.per_vm_results["def"];
    assert!(good.error_kind.is_none());
    assert_eq!(good.phase, Phase::Released);
}

// ---------------------------------------------------------------------------
// Scenario: serialized pipelines on one VM, completion in submission order
// ---------------------------------------------------------------------------

#[tokio::test]
async fn twelve_tasks_on_one_vm_serialize_without_lease_overlap() {
    let h = harness(
        vec![vm_spec("solo", AgentKind::Defender)],
        FakeKnobs::default(),
        // One task at a time makes completion order deterministic.
        fast_analysis(0, 1),
        &[],
        true,
    );

    let mut ids = Vec::new();
    for i in 0..12 {
        let id = h
            .orchestrator
            .submit(sample_named(&format!("s{i:02}.exe")), None, 300)
            .unwrap();
        ids.push(id);
    }

    for id in &ids {
        let task = wait_terminal(&h.store, *id, Duration::from_secs(30)).await;
        assert_eq!(task.status, TaskStatus::Completed);
    }

    assert!(
        !h.controller.saw_overlap(),
        "two pipelines overlapped on the same VM"
    );
    assert_eq!(h.controller.max_concurrent_runs(), 1);

    // Uploads happened in submission order.
    let uploads: Vec<String> = h
        .controller
        .calls()
        .into_iter()
        .filter(|c| c.starts_with("copy:solo:"))
        .collect();
    let expected: Vec<String> = (0..12).map(|i| format!("copy:solo:s{i:02}.exe")).collect();
    assert_eq!(uploads, expected);

    assert_eq!(h.pool.snapshot().leased, 0, "all leases must be back");
}

// ---------------------------------------------------------------------------
// Scenario: concurrency ceiling
// ---------------------------------------------------------------------------

#[tokio::test]
async fn active_pipelines_never_exceed_the_ceiling() {
    let specs: Vec<VmSpec> = (0..4)
        .map(|i| vm_spec(&format!("vm{i}"), AgentKind::Defender))
        .collect();
    let h = harness(
        specs,
        FakeKnobs::default(),
        // A 1 s monitoring window keeps runs overlapping long enough for the
        // gauge to see any ceiling violation.
        fast_analysis(1, 2),
        &[],
        true,
    );

    let mut ids = Vec::new();
    for i in 0..4 {
        let id = h
            .orchestrator
            .submit(
                sample_named("sample.exe"),
                Some(vec![format!("vm{i}")]),
                300,
            )
            .unwrap();
        ids.push(id);
    }
    for id in &ids {
        wait_terminal(&h.store, *id, Duration::from_secs(30)).await;
    }

    assert!(
        h.controller.max_concurrent_runs() <= 2,
        "ceiling of 2 was exceeded: {}",
        h.controller.max_concurrent_runs()
    );
}

// ---------------------------------------------------------------------------
// Scenario: cancellation during Dwelling
// ---------------------------------------------------------------------------

#[tokio::test]
async fn cancel_during_dwelling_cleans_up_and_keeps_partial_events() {
    let h = harness(
        vec![vm_spec("beh", AgentKind::BehavioralMonitor)],
        FakeKnobs::default(),
        // A long monitoring window the cancel will interrupt.
        fast_analysis(30, 10),
        &[],
        true,
    );

    let task_id = h
        .orchestrator
        .submit(sample_named("slow.exe"), Some(vec!["beh".into()]), 300)
        .unwrap();

    // Wait until the sample has been launched — the pipeline is dwelling.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        if h.controller
            .calls()
            .iter()
            .any(|c| c == "detonate:beh")
        {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "pipeline never reached detonation"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    assert!(h.orchestrator.cancel(task_id));
    let task = wait_terminal(&h.store, task_id, Duration::from_secs(10)).await;

    assert_eq!(task.status, TaskStatus::Cancelled);
    let result = &task.per_vm_results["beh"];
    assert_eq!(result.error_kind, Some(ErrorKind::Cancelled));
    assert_eq!(result.phase, Phase::Dwelling);
    assert!(
        !result.events.is_empty(),
        "events observed before the cancel must be preserved"
    );
    assert_eq!(h.controller.power_of("beh"), "poweroff");

    // Cleanup ran after the detonation, not before it.
    let calls = h.controller.calls();
    let detonate_idx = calls.iter().position(|c| c == "detonate:beh").unwrap();
    let last_cleanup = calls.iter().rposition(|c| c == "cleanup:beh").unwrap();
    assert!(last_cleanup > detonate_idx);
}

// ---------------------------------------------------------------------------
// Boundary behaviors
// ---------------------------------------------------------------------------

#[tokio::test]
async fn queue_at_capacity_rejects_with_queue_full() {
    let mut analysis = fast_analysis(0, 10);
    analysis.queue_size = 1;

    // No worker: the single queue slot stays occupied.
    let h = harness(
        vec![vm_spec("def", AgentKind::Defender)],
        FakeKnobs::default(),
        analysis,
        &[],
        false,
    );

    h.orchestrator
        .submit(sample_named("first.exe"), None, 300)
        .unwrap();
    let err = h
        .orchestrator
        .submit(sample_named("second.exe"), None, 300)
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::QueueFull);
}

#[tokio::test]
async fn unknown_vm_is_rejected_at_submission() {
    let h = harness(
        vec![vm_spec("def", AgentKind::Defender)],
        FakeKnobs::default(),
        fast_analysis(0, 10),
        &[],
        false,
    );

    let err = h
        .orchestrator
        .submit(
            sample_named("x.exe"),
            Some(vec!["not-configured".into()]),
            300,
        )
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::VmUnknown);
}

#[tokio::test]
async fn pending_task_can_be_cancelled_before_it_runs() {
    let h = harness(
        vec![vm_spec("def", AgentKind::Defender)],
        FakeKnobs::default(),
        fast_analysis(0, 10),
        &[],
        false,
    );

    let task_id = h
        .orchestrator
        .submit(sample_named("x.exe"), None, 300)
        .unwrap();
    assert!(h.orchestrator.cancel(task_id));
    assert_eq!(h.store.status(task_id), Some(TaskStatus::Cancelled));

    // Cancelling a terminal task is a no-op.
    assert!(!h.orchestrator.cancel(task_id));
}

#[tokio::test]
async fn duplicate_submissions_do_not_alias() {
    let h = harness(
        vec![vm_spec("def", AgentKind::Defender)],
        FakeKnobs::default(),
        fast_analysis(0, 10),
        &[],
        true,
    );

    let first = h
        .orchestrator
        .submit(sample_named("same.exe"), None, 300)
        .unwrap();
    let second = h
        .orchestrator
        .submit(sample_named("same.exe"), None, 300)
        .unwrap();
    assert_ne!(first, second);

    let task_a = wait_terminal(&h.store, first, Duration::from_secs(10)).await;
    let task_b = wait_terminal(&h.store, second, Duration::from_secs(10)).await;
    assert_eq!(task_a.status, TaskStatus::Completed);
    assert_eq!(task_b.status, TaskStatus::Completed);
    assert_ne!(task_a.sample.sample_id, task_b.sample.sample_id);
}

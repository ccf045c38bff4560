//! YAML configuration for the sandbox service.
//!
//! Loaded once at process start and handed to the collaborators by value —
//! there is no ambient settings singleton. Every tunable the pipeline or
//! orchestrator consults lives here so behavior is reproducible from the
//! config file alone.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// VM entries
// ---------------------------------------------------------------------------

/// What a sandbox VM contributes to an analysis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum VmRole {
    /// Captures structured behavioral events from the host-level monitor.
    Behavioral,
    /// Carries an endpoint-protection product that raises threat alerts.
    SecurityAgent,
}

/// The agent installed inside a sandbox VM. Selects the collector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AgentKind {
    Defender,
    Kaspersky,
    Mcafee,
    Avira,
    Trend,
    BehavioralMonitor,
}

impl AgentKind {
    /// Stable lowercase name used in summaries and logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentKind::Defender => "defender",
            AgentKind::Kaspersky => "kaspersky",
            AgentKind::Mcafee => "mcafee",
            AgentKind::Avira => "avira",
            AgentKind::Trend => "trend",
            AgentKind::BehavioralMonitor => "behavioral-monitor",
        }
    }
}

/// One configured sandbox VM. Immutable after load.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VmSpec {
    /// VM name as known to the virtualization CLI.
    pub name: String,
    pub role: VmRole,
    pub agent: AgentKind,
    /// Guest account used for file transfer and in-guest execution.
    pub user: String,
    pub password: String,
    /// Clean pre-infection snapshot restored between runs.
    pub baseline_snapshot: String,
    /// Where the sample lands inside the guest. Defaults to the user's
    /// desktop when omitted.
    #[serde(default)]
    pub desktop_path: Option<String>,
    /// Per-VM override for the guest-ready deadline. Agents known to boot
    /// slowly (full EDR stacks) raise this above the global default.
    #[serde(default)]
    pub startup_timeout_secs: Option<u64>,
}

impl VmSpec {
    pub fn desktop(&self) -> String {
        match &self.desktop_path {
            Some(p) => p.clone(),
            None => format!("C:\\Users\\{}\\Desktop", self.user),
        }
    }
}

// ---------------------------------------------------------------------------
// Sections
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "defaults::host")]
    pub host: String,
    #[serde(default = "defaults::port")]
    pub port: u16,
    /// Required in the `X-API-Key` header on every request except health.
    pub api_key: String,
    #[serde(default = "defaults::upload_dir")]
    pub upload_dir: PathBuf,
    /// Uploads over this limit are rejected with `InvalidSample`.
    #[serde(default = "defaults::max_file_size")]
    pub max_file_size: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VirtualizationConfig {
    /// Absolute path to the VBoxManage binary, or `auto` to probe the
    /// usual install locations and `PATH`.
    #[serde(default = "defaults::vboxmanage_path")]
    pub vboxmanage_path: String,
}

impl Default for VirtualizationConfig {
    fn default() -> Self {
        Self {
            vboxmanage_path: defaults::vboxmanage_path(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisSettings {
    /// Global guest-ready deadline (seconds), overridable per VM.
    #[serde(default = "defaults::vm_startup_timeout")]
    pub vm_startup_timeout: u64,
    /// Wait after upload before probing whether the agent consumed the
    /// sample (seconds).
    #[serde(default = "defaults::detonation_dwell")]
    pub detonation_dwell: u64,
    /// Monitoring window after detonation (seconds).
    #[serde(default = "defaults::monitoring_window")]
    pub monitoring_window: u64,
    /// Ceiling on concurrently running tasks.
    #[serde(default = "defaults::max_concurrent_tasks")]
    pub max_concurrent_tasks: usize,
    /// Bounded work-queue capacity; submissions beyond it are rejected.
    #[serde(default = "defaults::queue_size")]
    pub queue_size: usize,
    /// Start VMs with a visible console so operators can observe runs.
    #[serde(default = "defaults::gui_mode")]
    pub gui_mode: bool,
    /// Upper bound on a single per-VM pipeline regardless of the task
    /// timeout (seconds).
    #[serde(default = "defaults::per_vm_max_secs")]
    pub per_vm_max_secs: u64,
    /// Grace window around the detonation interval when filtering
    /// collected alerts and events (seconds).
    #[serde(default = "defaults::collection_grace_secs")]
    pub collection_grace_secs: u64,
    /// Deadline for the terminal cleanup phase. Past it the VM is flagged
    /// needs-attention and the lease is released anyway (seconds).
    #[serde(default = "defaults::cleanup_max_secs")]
    pub cleanup_max_secs: u64,
}

impl Default for AnalysisSettings {
    fn default() -> Self {
        // serde_yaml applies field defaults only through Deserialize; an
        // empty mapping round-trip keeps the two paths identical.
        serde_yaml::from_str("{}").expect("empty analysis section deserializes")
    }
}

impl AnalysisSettings {
    pub fn detonation_dwell_duration(&self) -> Duration {
        Duration::from_secs(self.detonation_dwell)
    }

    pub fn monitoring_window_duration(&self) -> Duration {
        Duration::from_secs(self.monitoring_window)
    }

    pub fn cleanup_deadline(&self) -> Duration {
        Duration::from_secs(self.cleanup_max_secs)
    }

    /// Guest-ready deadline for one VM, honoring its override.
    pub fn startup_deadline(&self, vm: &VmSpec) -> Duration {
        Duration::from_secs(vm.startup_timeout_secs.unwrap_or(self.vm_startup_timeout))
    }

    /// Effective per-VM pipeline deadline for a task-level timeout.
    pub fn per_vm_deadline(&self, task_timeout_secs: u64) -> Duration {
        Duration::from_secs(task_timeout_secs.min(self.per_vm_max_secs))
    }

    pub fn grace(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.collection_grace_secs as i64)
    }
}

mod defaults {
    use std::path::PathBuf;

    pub fn host() -> String {
        "0.0.0.0".to_string()
    }
    pub fn port() -> u16 {
        8000
    }
    pub fn upload_dir() -> PathBuf {
        PathBuf::from("./uploads")
    }
    pub fn max_file_size() -> u64 {
        100 * 1024 * 1024
    }
    pub fn vboxmanage_path() -> String {
        "auto".to_string()
    }
    pub fn vm_startup_timeout() -> u64 {
        120
    }
    pub fn detonation_dwell() -> u64 {
        5
    }
    pub fn monitoring_window() -> u64 {
        60
    }
    pub fn max_concurrent_tasks() -> usize {
        10
    }
    pub fn queue_size() -> usize {
        100
    }
    pub fn gui_mode() -> bool {
        true
    }
    pub fn per_vm_max_secs() -> u64 {
        600
    }
    pub fn collection_grace_secs() -> u64 {
        30
    }
    pub fn cleanup_max_secs() -> u64 {
        60
    }
}

// ---------------------------------------------------------------------------
// Top level
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    pub server: ServerConfig,
    #[serde(default)]
    pub virtualization: VirtualizationConfig,
    pub vms: Vec<VmSpec>,
    #[serde(default)]
    pub analysis: AnalysisSettings,
}

impl Settings {
    /// Load and validate settings from a YAML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("read config file: {}", path.display()))?;
        let settings: Settings = serde_yaml::from_str(&content)
            .with_context(|| format!("parse config file: {}", path.display()))?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<()> {
        if self.server.api_key.trim().is_empty() {
            bail!("server.api_key must not be empty");
        }
        if self.vms.is_empty() {
            bail!("at least one VM must be configured under `vms`");
        }
        let mut seen = HashSet::new();
        for vm in &self.vms {
            if !seen.insert(vm.name.as_str()) {
                bail!("duplicate VM name in config: {}", vm.name);
            }
            if vm.baseline_snapshot.trim().is_empty() {
                bail!("vm {} has an empty baseline_snapshot", vm.name);
            }
        }
        if self.analysis.queue_size == 0 {
            bail!("analysis.queue_size must be at least 1");
        }
        if self.analysis.max_concurrent_tasks == 0 {
            bail!("analysis.max_concurrent_tasks must be at least 1");
        }
        Ok(())
    }

    pub fn vm(&self, name: &str) -> Option<&VmSpec> {
        self.vms.iter().find(|v| v.name == name)
    }

    pub fn vm_names(&self) -> Vec<String> {
        self.vms.iter().map(|v| v.name.clone()).collect()
    }
}

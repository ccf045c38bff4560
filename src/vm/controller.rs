//! VM control via the VirtualBox CLI (`VBoxManage`).
//!
//! ## Architecture
//!
//! ```text
//! pipeline ──▶ dyn VmController ──▶ VBoxManageController
//!                                        └► dyn CliRunner ──▶ VBoxManage child process
//! ```
//!
//! Every operation is one-shot: a fresh child process is spawned, awaited
//! under an explicit timeout, and reaped. A child that outlives its timeout
//! has its whole process group killed before the call returns — the
//! controller never leaves zombies behind.
//!
//! VM state machine, as observed here:
//!
//! ```text
//! poweroff ──power_on──▶ starting ──(guest additions up)──▶ running
//! running/paused/stuck/starting ──cleanup_resources──▶ poweroff
//! poweroff ──restore_snapshot──▶ poweroff (baseline)
//! ```

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::error::{ErrorKind, SandboxError};

// ---------------------------------------------------------------------------
// Observed VM state
// ---------------------------------------------------------------------------

/// Power state parsed from `showvminfo --machinereadable`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerState {
    Running,
    Paused,
    Stuck,
    Starting,
    Poweroff,
    Aborted,
    Saved,
    Unknown,
}

impl PowerState {
    pub fn parse(raw: &str) -> Self {
        match raw.to_ascii_lowercase().as_str() {
            "running" => PowerState::Running,
            "paused" => PowerState::Paused,
            "gurumeditation" | "stuck" => PowerState::Stuck,
            "starting" | "restoring" => PowerState::Starting,
            "poweroff" | "poweredoff" => PowerState::Poweroff,
            "aborted" => PowerState::Aborted,
            "saved" => PowerState::Saved,
            _ => PowerState::Unknown,
        }
    }

    /// States from which a shutdown ladder is required before snapshot work.
    pub fn is_live(&self) -> bool {
        matches!(
            self,
            PowerState::Running | PowerState::Paused | PowerState::Stuck | PowerState::Starting
        )
    }

    /// States that count as "off" for the cleanup post-condition.
    pub fn is_off(&self) -> bool {
        matches!(
            self,
            PowerState::Poweroff | PowerState::Aborted | PowerState::Saved
        )
    }
}

#[derive(Debug, Clone)]
pub struct VmStatus {
    pub power_state: PowerState,
    /// Raw session state string (`Unlocked`, `Locked`, …); informational.
    pub session_state: String,
}

/// Console mode for `power_on`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartMode {
    /// Visible console so operators can watch the detonation.
    Gui,
    Headless,
}

impl StartMode {
    fn as_arg(&self) -> &'static str {
        match self {
            StartMode::Gui => "gui",
            StartMode::Headless => "headless",
        }
    }

    pub fn from_gui_flag(gui: bool) -> Self {
        if gui {
            StartMode::Gui
        } else {
            StartMode::Headless
        }
    }
}

/// Captured output of a guest-side execution.
#[derive(Debug, Clone)]
pub struct GuestExec {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl GuestExec {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

// ---------------------------------------------------------------------------
// Controller trait
// ---------------------------------------------------------------------------

/// The operations a pipeline needs from the virtualization layer.
///
/// Held as `Arc<dyn VmController>` so tests can stand in a scripted fake.
#[async_trait]
pub trait VmController: Send + Sync {
    /// Never fails: an unknown or unreachable VM reports
    /// `PowerState::Unknown`.
    async fn status(&self, vm: &str) -> VmStatus;

    /// Precondition: VM not running (call [`cleanup_resources`] first).
    async fn restore_snapshot(&self, vm: &str, snapshot: &str) -> Result<(), SandboxError>;

    /// Returns once the CLI accepts the start request; guest readiness is a
    /// separate probe via [`wait_guest_ready`].
    async fn power_on(&self, vm: &str, mode: StartMode) -> Result<(), SandboxError>;

    /// Polls a trivial guest command until it exits cleanly or the deadline
    /// elapses.
    async fn wait_guest_ready(
        &self,
        vm: &str,
        user: &str,
        password: &str,
        deadline: Duration,
    ) -> Result<(), SandboxError>;

    /// Exclusive upload; overwrites an existing guest file.
    async fn copy_to_guest(
        &self,
        vm: &str,
        host_path: &std::path::Path,
        guest_path: &str,
        user: &str,
        password: &str,
        deadline: Duration,
    ) -> Result<(), SandboxError>;

    /// Runs a single program with argv inside the guest. Not a shell —
    /// shelled invocations are composed by the guest command layer.
    async fn exec_in_guest(
        &self,
        vm: &str,
        program: &str,
        argv: &[String],
        user: &str,
        password: &str,
        deadline: Duration,
    ) -> Result<GuestExec, SandboxError>;

    /// Return the VM to `poweroff` with no held session, surviving stuck and
    /// locked states. Idempotent; safe on an already-off VM. Every pipeline
    /// exit path calls this.
    async fn cleanup_resources(&self, vm: &str) -> Result<(), SandboxError>;
}

// ---------------------------------------------------------------------------
// CLI runner seam
// ---------------------------------------------------------------------------

/// Output of one CLI invocation.
#[derive(Debug, Clone)]
pub struct CliOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CliOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Spawns the virtualization CLI. Split out of the controller so the
/// shutdown ladder and parsers can be exercised against scripted output.
#[async_trait]
pub trait CliRunner: Send + Sync {
    async fn run(&self, args: &[String], timeout: Duration) -> Result<CliOutput, SandboxError>;
}

/// Production runner: one fresh `VBoxManage` child per call.
pub struct ProcessCliRunner {
    binary: PathBuf,
}

impl ProcessCliRunner {
    pub fn new(binary: PathBuf) -> Self {
        Self { binary }
    }
}

#[async_trait]
impl CliRunner for ProcessCliRunner {
    async fn run(&self, args: &[String], timeout: Duration) -> Result<CliOutput, SandboxError> {
        let mut cmd = tokio::process::Command::new(&self.binary);
        cmd.args(args)
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);

        debug!(binary = %self.binary.display(), ?args, "spawning CLI");

        let child = cmd.spawn().map_err(|e| {
            SandboxError::internal(format!(
                "failed to spawn {}: {e}",
                self.binary.display()
            ))
        })?;
        let pid = child.id();

        match tokio::time::timeout(timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => Ok(CliOutput {
                exit_code: output.status.code().unwrap_or(-1),
                stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            }),
            Ok(Err(e)) => Err(SandboxError::internal(format!(
                "failed to wait for {}: {e}",
                self.binary.display()
            ))),
            Err(_) => {
                // Deadline hit: kill the whole process group so guestcontrol
                // helpers spawned by VBoxManage die with it. kill_on_drop
                // reaps the direct child afterwards.
                #[cfg(unix)]
                if let Some(pid) = pid {
                    unsafe {
                        libc::kill(-(pid as i32), libc::SIGKILL);
                    }
                }
                warn!(binary = %self.binary.display(), ?args, "CLI call timed out, process group killed");
                Err(SandboxError::internal(format!(
                    "{} timed out after {:?}",
                    self.binary.display(),
                    timeout
                )))
            }
        }
    }
}

/// Locate the VBoxManage binary: an explicit path from config, or probe
/// `PATH` and the usual install locations when set to `auto`.
pub fn find_vboxmanage(configured: &str) -> Result<PathBuf> {
    if configured != "auto" {
        let path = PathBuf::from(configured);
        if path.exists() {
            return Ok(path);
        }
        bail!(
            "configured vboxmanage_path does not exist: {}",
            path.display()
        );
    }

    if let Ok(path_var) = std::env::var("PATH") {
        for dir in std::env::split_paths(&path_var) {
            let candidate = dir.join("VBoxManage");
            if candidate.exists() {
                return Ok(candidate);
            }
        }
    }

    let candidates: &[&str] = &[
        "/usr/bin/VBoxManage",
        "/usr/local/bin/VBoxManage",
        "/Applications/VirtualBox.app/Contents/MacOS/VBoxManage",
    ];
    for &path in candidates {
        if PathBuf::from(path).exists() {
            return Ok(PathBuf::from(path));
        }
    }

    bail!(
        "VBoxManage binary not found. Install VirtualBox or set \
         virtualization.vboxmanage_path to its absolute path."
    )
}

// ---------------------------------------------------------------------------
// VBoxManage controller
// ---------------------------------------------------------------------------

/// Default timeout for plain control-plane calls (startvm, controlvm,
/// snapshot, showvminfo).
const CONTROL_TIMEOUT: Duration = Duration::from_secs(120);

/// How long to wait after ACPI power button before checking again.
const ACPI_GRACE: Duration = Duration::from_secs(5);

/// Maximum seconds to poll for the VM to reach an off state.
const STOP_POLL_MAX: u32 = 30;

/// Settle interval after power-off so the platform releases the session
/// lock before the next snapshot operation.
const SESSION_SETTLE: Duration = Duration::from_secs(2);

/// Interval between guest-readiness probes.
const READY_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Timeout for a single guest-readiness probe command.
const READY_PROBE_TIMEOUT: Duration = Duration::from_secs(15);

pub struct VBoxManageController {
    runner: Box<dyn CliRunner>,
}

impl VBoxManageController {
    pub fn new(configured_path: &str) -> Result<Self> {
        let binary = find_vboxmanage(configured_path)?;
        info!(path = %binary.display(), "found VBoxManage binary");
        Ok(Self {
            runner: Box::new(ProcessCliRunner::new(binary)),
        })
    }

    /// Test seam: construct with a scripted runner.
    pub fn with_runner(runner: Box<dyn CliRunner>) -> Self {
        Self { runner }
    }

    async fn control(&self, args: &[&str]) -> Result<CliOutput, SandboxError> {
        let owned: Vec<String> = args.iter().map(|s| s.to_string()).collect();
        self.runner.run(&owned, CONTROL_TIMEOUT).await
    }

    async fn power_off_hard(&self, vm: &str) -> bool {
        match self.control(&["controlvm", vm, "poweroff"]).await {
            Ok(out) => out.success(),
            Err(e) => {
                warn!(vm, error = %e, "poweroff invocation failed");
                false
            }
        }
    }

    async fn acpi_power_button(&self, vm: &str) -> bool {
        match self.control(&["controlvm", vm, "acpipowerbutton"]).await {
            Ok(out) => out.success(),
            Err(e) => {
                warn!(vm, error = %e, "acpipowerbutton invocation failed");
                false
            }
        }
    }
}

/// Parse `showvminfo --machinereadable` output into key/value pairs and
/// extract the power and session state.
pub fn parse_machine_readable(stdout: &str) -> VmStatus {
    let mut power = PowerState::Unknown;
    let mut session = String::from("unknown");

    for line in stdout.lines() {
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let value = value.trim().trim_matches('"');
        match key.trim() {
            "VMState" => power = PowerState::parse(value),
            "SessionState" => session = value.to_string(),
            _ => {}
        }
    }

    VmStatus {
        power_state: power,
        session_state: session,
    }
}

/// Recognize credential rejections in guestcontrol stderr so they surface
/// as `AuthFailed` rather than a generic transfer error.
fn is_auth_failure(stderr: &str) -> bool {
    let lower = stderr.to_ascii_lowercase();
    lower.contains("verr_authentication_failure")
        || lower.contains("authentication")
        || lower.contains("invalid user name or password")
}

#[async_trait]
impl VmController for VBoxManageController {
    async fn status(&self, vm: &str) -> VmStatus {
        match self
            .control(&["showvminfo", vm, "--machinereadable"])
            .await
        {
            Ok(out) if out.success() => parse_machine_readable(&out.stdout),
            Ok(out) => {
                debug!(vm, stderr = %out.stderr.trim(), "showvminfo failed, reporting unknown");
                VmStatus {
                    power_state: PowerState::Unknown,
                    session_state: "unknown".to_string(),
                }
            }
            Err(e) => {
                warn!(vm, error = %e, "showvminfo invocation failed");
                VmStatus {
                    power_state: PowerState::Unknown,
                    session_state: "unknown".to_string(),
                }
            }
        }
    }

    async fn restore_snapshot(&self, vm: &str, snapshot: &str) -> Result<(), SandboxError> {
        info!(vm, snapshot, "restoring baseline snapshot");
        let out = self.control(&["snapshot", vm, "restore", snapshot]).await?;
        if out.success() {
            Ok(())
        } else {
            Err(SandboxError::new(
                ErrorKind::EnvironmentFailed,
                format!(
                    "snapshot restore failed for {vm} ({snapshot}): {}",
                    out.stderr.trim()
                ),
            ))
        }
    }

    async fn power_on(&self, vm: &str, mode: StartMode) -> Result<(), SandboxError> {
        info!(vm, mode = mode.as_arg(), "starting VM");
        let out = self
            .control(&["startvm", vm, "--type", mode.as_arg()])
            .await?;
        if out.success() {
            Ok(())
        } else {
            Err(SandboxError::new(
                ErrorKind::EnvironmentFailed,
                format!("startvm failed for {vm}: {}", out.stderr.trim()),
            ))
        }
    }

    async fn wait_guest_ready(
        &self,
        vm: &str,
        user: &str,
        password: &str,
        deadline: Duration,
    ) -> Result<(), SandboxError> {
        let started = tokio::time::Instant::now();
        info!(vm, ?deadline, "waiting for guest additions");

        loop {
            let probe = self
                .exec_in_guest(
                    vm,
                    "cmd.exe",
                    &["/c".to_string(), "echo".to_string(), "ready".to_string()],
                    user,
                    password,
                    READY_PROBE_TIMEOUT,
                )
                .await;

            match probe {
                Ok(exec) if exec.success() => {
                    info!(vm, elapsed = ?started.elapsed(), "guest is ready");
                    return Ok(());
                }
                Ok(exec) => {
                    debug!(vm, exit = exec.exit_code, "guest probe returned non-zero");
                }
                Err(e) if e.kind == ErrorKind::AuthFailed => return Err(e),
                Err(e) => {
                    debug!(vm, error = %e, "guest probe failed");
                }
            }

            if started.elapsed() >= deadline {
                return Err(SandboxError::new(
                    ErrorKind::EnvironmentFailed,
                    format!("guest additions not ready on {vm} within {deadline:?}"),
                ));
            }
            tokio::time::sleep(READY_POLL_INTERVAL).await;
        }
    }

    async fn copy_to_guest(
        &self,
        vm: &str,
        host_path: &std::path::Path,
        guest_path: &str,
        user: &str,
        password: &str,
        deadline: Duration,
    ) -> Result<(), SandboxError> {
        if !host_path.exists() {
            return Err(SandboxError::new(
                ErrorKind::TransferFailed,
                format!("host file does not exist: {}", host_path.display()),
            ));
        }

        // Target directory first; failure is tolerable (it usually exists).
        if let Some(dir) = guest_parent_dir(guest_path) {
            let mkdir_args = vec![
                "guestcontrol".to_string(),
                vm.to_string(),
                "--username".to_string(),
                user.to_string(),
                "--password".to_string(),
                password.to_string(),
                "mkdir".to_string(),
                dir,
                "--parents".to_string(),
            ];
            match self.runner.run(&mkdir_args, deadline).await {
                Ok(out) if !out.success() => {
                    debug!(vm, stderr = %out.stderr.trim(), "guest mkdir failed (may already exist)");
                }
                Err(e) => debug!(vm, error = %e, "guest mkdir invocation failed"),
                _ => {}
            }
        }

        let host = host_path.to_string_lossy().into_owned();
        info!(vm, host = %host, guest = guest_path, "copying sample into guest");
        let args = vec![
            "guestcontrol".to_string(),
            vm.to_string(),
            "--username".to_string(),
            user.to_string(),
            "--password".to_string(),
            password.to_string(),
            "copyto".to_string(),
            host,
            guest_path.to_string(),
        ];
        let out = self.runner.run(&args, deadline).await?;
        if out.success() {
            Ok(())
        } else if is_auth_failure(&out.stderr) {
            Err(SandboxError::new(
                ErrorKind::AuthFailed,
                format!("guest credentials rejected on {vm}"),
            ))
        } else {
            Err(SandboxError::new(
                ErrorKind::TransferFailed,
                format!("copyto failed on {vm}: {}", out.stderr.trim()),
            ))
        }
    }

    async fn exec_in_guest(
        &self,
        vm: &str,
        program: &str,
        argv: &[String],
        user: &str,
        password: &str,
        deadline: Duration,
    ) -> Result<GuestExec, SandboxError> {
        let mut args = vec![
            "guestcontrol".to_string(),
            vm.to_string(),
            "run".to_string(),
            "--exe".to_string(),
            program.to_string(),
            "--username".to_string(),
            user.to_string(),
            "--password".to_string(),
            password.to_string(),
            "--wait-stdout".to_string(),
            "--wait-stderr".to_string(),
        ];
        if !argv.is_empty() {
            args.push("--".to_string());
            args.extend(argv.iter().cloned());
        }

        let out = self.runner.run(&args, deadline).await?;
        if !out.success() && is_auth_failure(&out.stderr) {
            return Err(SandboxError::new(
                ErrorKind::AuthFailed,
                format!("guest credentials rejected on {vm}"),
            ));
        }
        Ok(GuestExec {
            exit_code: out.exit_code,
            stdout: out.stdout,
            stderr: out.stderr,
        })
    }

    async fn cleanup_resources(&self, vm: &str) -> Result<(), SandboxError> {
        info!(vm, "cleaning up VM resources");

        // 1. Where are we?
        let status = self.status(vm).await;
        debug!(vm, state = ?status.power_state, session = %status.session_state, "pre-cleanup state");

        // 2. Shutdown ladder: graceful → ACPI → forced.
        if status.power_state.is_live() {
            if self.power_off_hard(vm).await {
                info!(vm, "graceful poweroff accepted");
            } else {
                warn!(vm, "graceful poweroff failed, trying ACPI power button");
                if self.acpi_power_button(vm).await {
                    tokio::time::sleep(ACPI_GRACE).await;
                }
                if !self.status(vm).await.power_state.is_off() {
                    warn!(vm, "still not off, forcing poweroff");
                    let _ = self.power_off_hard(vm).await;
                }
            }
        }

        // 3. Poll until the VM reports an off state.
        let mut stopped = self.status(vm).await.power_state.is_off();
        let mut waited = 0;
        while !stopped && waited < STOP_POLL_MAX {
            tokio::time::sleep(Duration::from_secs(1)).await;
            waited += 1;
            let state = self.status(vm).await.power_state;
            debug!(vm, ?state, waited, "waiting for VM to stop");
            stopped = state.is_off();
        }

        // 4. Let the platform release the session lock.
        tokio::time::sleep(SESSION_SETTLE).await;

        // 5. Verdict.
        if stopped {
            info!(vm, "VM resources cleaned up");
            Ok(())
        } else {
            Err(SandboxError::new(
                ErrorKind::CleanupFailed,
                format!("{vm} did not reach an off state within {STOP_POLL_MAX}s"),
            ))
        }
    }
}

/// Parent directory of a Windows guest path, for `mkdir --parents`.
fn guest_parent_dir(guest_path: &str) -> Option<String> {
    let normalized = guest_path.replace('/', "\\");
    let idx = normalized.rfind('\\')?;
    if idx == 0 {
        return None;
    }
    Some(normalized[..idx].to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_power_states() {
        assert_eq!(PowerState::parse("running"), PowerState::Running);
        assert_eq!(PowerState::parse("GuruMeditation"), PowerState::Stuck);
        assert_eq!(PowerState::parse("poweroff"), PowerState::Poweroff);
        assert_eq!(PowerState::parse("saved"), PowerState::Saved);
        assert_eq!(PowerState::parse("???"), PowerState::Unknown);
    }

    #[test]
    fn live_and_off_sets_are_disjoint() {
        for state in [
            PowerState::Running,
            PowerState::Paused,
            PowerState::Stuck,
            PowerState::Starting,
            PowerState::Poweroff,
            PowerState::Aborted,
            PowerState::Saved,
            PowerState::Unknown,
        ] {
            assert!(
                !(state.is_live() && state.is_off()),
                "{state:?} must not be both live and off"
            );
        }
        assert!(!PowerState::Unknown.is_live());
        assert!(!PowerState::Unknown.is_off());
    }

    #[test]
    fn machine_readable_parse_extracts_states() {
        let out = concat!(
            "name=\"win10-defender\"\n",
            "ostype=\"Windows10_64\"\n",
            "VMState=\"running\"\n",
            "VMStateChangeTime=\"2026-01-10T09:00:00.000000000\"\n",
            "SessionState=\"Locked\"\n",
        );
        let status = parse_machine_readable(out);
        assert_eq!(status.power_state, PowerState::Running);
        assert_eq!(status.session_state, "Locked");
    }

    #[test]
    fn machine_readable_parse_tolerates_missing_keys() {
        let status = parse_machine_readable("name=\"x\"\n");
        assert_eq!(status.power_state, PowerState::Unknown);
        assert_eq!(status.session_state, "unknown");
    }

    #[test]
    fn auth_failure_is_recognized() {
        assert!(is_auth_failure(
            "VBoxManage: error: VERR_AUTHENTICATION_FAILURE"
        ));
        assert!(is_auth_failure("The specified user was not able to logon: authentication failed"));
        assert!(!is_auth_failure("VERR_FILE_NOT_FOUND"));
    }

    #[test]
    fn guest_parent_dir_handles_windows_paths() {
        assert_eq!(
            guest_parent_dir("C:\\Users\\vboxuser\\Desktop\\sample.exe").as_deref(),
            Some("C:\\Users\\vboxuser\\Desktop")
        );
        assert_eq!(
            guest_parent_dir("C:/Users/vboxuser/Desktop/s.exe").as_deref(),
            Some("C:\\Users\\vboxuser\\Desktop")
        );
        assert_eq!(guest_parent_dir("sample.exe"), None);
    }

    #[test]
    fn start_mode_args() {
        assert_eq!(StartMode::Gui.as_arg(), "gui");
        assert_eq!(StartMode::Headless.as_arg(), "headless");
        assert_eq!(StartMode::from_gui_flag(true), StartMode::Gui);
        assert_eq!(StartMode::from_gui_flag(false), StartMode::Headless);
    }
}

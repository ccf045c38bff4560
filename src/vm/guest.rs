//! Guest command construction and interpretation.
//!
//! Every PowerShell invocation that reaches a guest goes through
//! [`GuestCommand`]. The builder owns the quoting rules — outer double
//! quotes around the whole `-Command` payload, single quotes around every
//! embedded path, single quotes inside paths doubled — so raw path strings
//! never meet the shell. Backslash-escaped double quotes are unrepresentable
//! by construction.
//!
//! The interpretation half deals with what PowerShell actually prints:
//! command echo, prompt markers, and pipeline noise are stripped before any
//! line counts as data.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::config::VmSpec;
use crate::error::{ErrorKind, SandboxError};
use crate::vm::controller::{GuestExec, VmController};

/// Full path to the guest PowerShell binary. Invoked directly rather than
/// through `cmd.exe` so argv reaches it without an extra quoting layer.
pub const POWERSHELL: &str = "C:\\Windows\\System32\\WindowsPowerShell\\v1.0\\powershell.exe";

/// PowerShell prompt marker; interactive echo lines start with it.
const PROMPT_MARKER: &str = "PS ";

/// Tokens that mark a line as shell plumbing rather than data.
const CONTROL_TOKENS: [char; 3] = ['|', '{', '}'];

// ---------------------------------------------------------------------------
// Quoting
// ---------------------------------------------------------------------------

/// Wrap a path in single quotes for embedding in a PowerShell script.
/// Single quotes inside the path are doubled, the shell's own escape
/// convention.
pub fn ps_quote(path: &str) -> String {
    format!("'{}'", path.replace('\'', "''"))
}

// ---------------------------------------------------------------------------
// Command builder
// ---------------------------------------------------------------------------

/// A single PowerShell invocation, tracked with the cmdlet name so command
/// echo can be filtered out of stdout afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuestCommand {
    cmdlet: String,
    script: String,
}

impl GuestCommand {
    fn new(cmdlet: impl Into<String>, script: String) -> Self {
        let script = script.trim().to_string();
        debug_assert!(
            !script.contains('"'),
            "guest scripts must not embed double quotes: {script}"
        );
        Self {
            cmdlet: cmdlet.into(),
            script,
        }
    }

    /// `Test-Path '<path>'` — prints `True` or `False`.
    pub fn test_path(path: &str) -> Self {
        Self::new("Test-Path", format!("Test-Path {}", ps_quote(path)))
    }

    /// `Remove-Item '<path>' -Force` — deletion errors are suppressed so an
    /// already-removed file is not a failure.
    pub fn remove_item(path: &str) -> Self {
        Self::new(
            "Remove-Item",
            format!(
                "Remove-Item {} -Force -ErrorAction SilentlyContinue",
                ps_quote(path)
            ),
        )
    }

    /// `Get-ChildItem '<dir>' -File [-Recurse]` printing bare file names,
    /// one per line.
    pub fn list_files(dir: &str, recursive: bool) -> Self {
        let recurse = if recursive { " -Recurse" } else { "" };
        Self::new(
            "Get-ChildItem",
            format!(
                "Get-ChildItem {} -File{recurse} | Select-Object -ExpandProperty Name",
                ps_quote(dir)
            ),
        )
    }

    /// `Start-Process -FilePath '<path>' [args]` — launches and returns
    /// without waiting for the started process.
    pub fn start_process(path: &str, argv: &[String]) -> Self {
        let mut script = format!("Start-Process -FilePath {}", ps_quote(path));
        if !argv.is_empty() {
            let joined = argv
                .iter()
                .map(|a| ps_quote(a))
                .collect::<Vec<_>>()
                .join(",");
            script.push_str(&format!(" -ArgumentList {joined}"));
        }
        Self::new("Start-Process", script)
    }

    /// `Get-Content '<path>'`.
    pub fn get_content(path: &str) -> Self {
        Self::new("Get-Content", format!("Get-Content {}", ps_quote(path)))
    }

    /// Escape hatch for collector-specific scripts. The caller supplies the
    /// cmdlet name for echo filtering and must route paths through
    /// [`ps_quote`].
    pub fn raw(cmdlet: impl Into<String>, script: impl Into<String>) -> Self {
        Self::new(cmdlet, script.into())
    }

    pub fn cmdlet(&self) -> &str {
        &self.cmdlet
    }

    pub fn script(&self) -> &str {
        &self.script
    }

    /// Argv handed to the PowerShell binary. The script travels as one
    /// argument, so no host-side quoting layer is involved.
    pub fn argv(&self) -> Vec<String> {
        vec!["-Command".to_string(), self.script.clone()]
    }

    /// The command as it reads in the guest: outer double quotes around the
    /// payload, single quotes inside. This is the rendering logs and the
    /// golden tests assert on.
    pub fn command_line(&self) -> String {
        format!("powershell -Command \"{}\"", self.script)
    }
}

// ---------------------------------------------------------------------------
// Output interpretation
// ---------------------------------------------------------------------------

/// Strip command echo and shell noise from stdout, leaving only data lines.
///
/// Filters, in order: empty lines, prompt-marker lines, lines containing
/// control tokens, lines that begin with the invoked cmdlet (the echo).
pub fn data_lines(stdout: &str, cmdlet: &str) -> Vec<String> {
    stdout
        .lines()
        .map(|l| l.trim_end_matches(['\r', ' ']))
        .filter(|l| !l.trim().is_empty())
        .filter(|l| !l.starts_with(PROMPT_MARKER))
        .filter(|l| !l.contains(CONTROL_TOKENS))
        .filter(|l| !l.trim_start().starts_with(cmdlet))
        .map(|l| l.trim().to_string())
        .collect()
}

/// Interpret a `Test-Path` style probe: the literal `True`/`true` among the
/// data lines means true; anything else, including no output, means false.
pub fn parse_bool_probe(stdout: &str, cmdlet: &str) -> bool {
    data_lines(stdout, cmdlet)
        .iter()
        .any(|l| l == "True" || l == "true")
}

// ---------------------------------------------------------------------------
// Guest operations
// ---------------------------------------------------------------------------

/// Timeout for quick probes (existence checks, deletions).
const PROBE_TIMEOUT: Duration = Duration::from_secs(30);

/// Timeout for listing and file reads used by collectors.
const READ_TIMEOUT: Duration = Duration::from_secs(60);

/// Upper bound on the fire-and-forget detonation call. The sample itself is
/// not awaited; this bounds only the `Start-Process` launch.
const DETONATE_TIMEOUT: Duration = Duration::from_secs(60);

/// Standard guest primitives for one VM, bound to its credentials.
///
/// Collectors and the pipeline share this handle; it is the only way guest
/// PowerShell is reached.
#[derive(Clone)]
pub struct GuestOps {
    controller: Arc<dyn VmController>,
    spec: VmSpec,
}

impl GuestOps {
    pub fn new(controller: Arc<dyn VmController>, spec: VmSpec) -> Self {
        Self { controller, spec }
    }

    pub fn spec(&self) -> &VmSpec {
        &self.spec
    }

    pub fn vm_name(&self) -> &str {
        &self.spec.name
    }

    /// Run one built command in the guest.
    pub async fn run(
        &self,
        command: &GuestCommand,
        timeout: Duration,
    ) -> Result<GuestExec, SandboxError> {
        debug!(vm = %self.spec.name, cmd = %command.command_line(), "guest exec");
        self.controller
            .exec_in_guest(
                &self.spec.name,
                POWERSHELL,
                &command.argv(),
                &self.spec.user,
                &self.spec.password,
                timeout,
            )
            .await
    }

    /// Does a path exist in the guest?
    pub async fn path_exists(&self, path: &str) -> Result<bool, SandboxError> {
        let cmd = GuestCommand::test_path(path);
        let exec = self.run(&cmd, PROBE_TIMEOUT).await?;
        Ok(parse_bool_probe(&exec.stdout, cmd.cmdlet()))
    }

    /// Delete a guest path. Missing paths are not an error.
    pub async fn delete_path(&self, path: &str) -> Result<(), SandboxError> {
        let cmd = GuestCommand::remove_item(path);
        let exec = self.run(&cmd, PROBE_TIMEOUT).await?;
        // Non-zero exit with empty stderr still counts as failure.
        if exec.success() {
            Ok(())
        } else {
            Err(SandboxError::new(
                ErrorKind::CollectionFailed,
                format!("failed to delete {path} on {}: exit {}", self.spec.name, exec.exit_code),
            ))
        }
    }

    /// List file names in a guest directory.
    pub async fn list_files(
        &self,
        dir: &str,
        recursive: bool,
    ) -> Result<Vec<String>, SandboxError> {
        let cmd = GuestCommand::list_files(dir, recursive);
        let exec = self.run(&cmd, READ_TIMEOUT).await?;
        // Non-zero exit with empty stderr still counts as failure.
        if !exec.success() {
            let detail = if exec.stderr.trim().is_empty() {
                format!("exit {}", exec.exit_code)
            } else {
                exec.stderr.trim().to_string()
            };
            return Err(SandboxError::new(
                ErrorKind::CollectionFailed,
                format!("listing {dir} on {} failed: {detail}", self.spec.name),
            ));
        }
        Ok(data_lines(&exec.stdout, cmd.cmdlet()))
    }

    /// Launch an executable in the guest and deliberately do not await it.
    ///
    /// Malware that blocks or loops must not stall the pipeline; whatever the
    /// sample leaves running is destroyed by the next snapshot restore.
    pub fn run_executable_detached(&self, path: &str, argv: &[String]) {
        let cmd = GuestCommand::start_process(path, argv);
        let this = self.clone();
        let path = path.to_string();
        tokio::spawn(async move {
            match this.run(&cmd, DETONATE_TIMEOUT).await {
                Ok(exec) if exec.success() => {
                    debug!(vm = %this.spec.name, %path, "detonation launch accepted");
                }
                Ok(exec) => {
                    warn!(
                        vm = %this.spec.name,
                        %path,
                        exit = exec.exit_code,
                        stderr = %exec.stderr.trim(),
                        "detonation launch returned non-zero"
                    );
                }
                Err(e) => {
                    warn!(vm = %this.spec.name, %path, error = %e, "detonation launch failed");
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ps_quote_wraps_in_single_quotes() {
        assert_eq!(ps_quote("C:\\tmp\\a.exe"), "'C:\\tmp\\a.exe'");
    }

    #[test]
    fn ps_quote_doubles_embedded_single_quotes() {
        assert_eq!(
            ps_quote("C:\\Users\\o'brien\\a.exe"),
            "'C:\\Users\\o''brien\\a.exe'"
        );
    }

    #[test]
    fn test_path_command_uses_single_quoted_path() {
        let cmd = GuestCommand::test_path("C:\\Users\\v b\\Desktop\\sample.exe");
        assert_eq!(
            cmd.script(),
            "Test-Path 'C:\\Users\\v b\\Desktop\\sample.exe'"
        );
        assert!(!cmd.command_line().contains("\\\""));
    }

    #[test]
    fn start_process_with_arguments() {
        let cmd =
            GuestCommand::start_process("C:\\s.exe", &["-a".to_string(), "b c".to_string()]);
        assert_eq!(
            cmd.script(),
            "Start-Process -FilePath 'C:\\s.exe' -ArgumentList '-a','b c'"
        );
    }

    #[test]
    fn argv_carries_script_as_single_argument() {
        let cmd = GuestCommand::test_path("C:\\x.exe");
        let argv = cmd.argv();
        assert_eq!(argv.len(), 2);
        assert_eq!(argv[0], "-Command");
        assert_eq!(argv[1], "Test-Path 'C:\\x.exe'");
    }

    #[test]
    fn data_lines_drops_empty_lines() {
        let out = "\r\n\r\na.exe\r\n\r\n";
        assert_eq!(data_lines(out, "Get-ChildItem"), vec!["a.exe"]);
    }

    #[test]
    fn data_lines_drops_prompt_marker_lines() {
        let out = "PS C:\\Users\\vboxuser> Get-ChildItem\r\nreport.txt\r\n";
        assert_eq!(data_lines(out, "Get-ChildItem"), vec!["report.txt"]);
    }

    #[test]
    fn data_lines_drops_control_token_lines() {
        let out = concat!(
            "Get-ChildItem 'C:\\q' -File | Select-Object -ExpandProperty Name\r\n",
            "if ($x) { Write-Output $x }\r\n",
            "rca_001.xml\r\n",
        );
        assert_eq!(data_lines(out, "Get-ChildItem"), vec!["rca_001.xml"]);
    }

    #[test]
    fn data_lines_drops_cmdlet_echo() {
        let out = "Get-ChildItem fell through without a pipe token\r\nsample.qua\r\n";
        assert_eq!(data_lines(out, "Get-ChildItem"), vec!["sample.qua"]);
    }

    #[test]
    fn bool_probe_finds_literal_true() {
        assert!(parse_bool_probe("True\r\n", "Test-Path"));
        assert!(parse_bool_probe("\r\ntrue\r\n", "Test-Path"));
    }

    #[test]
    fn bool_probe_false_on_false_or_empty() {
        assert!(!parse_bool_probe("False\r\n", "Test-Path"));
        assert!(!parse_bool_probe("", "Test-Path"));
    }

    #[test]
    fn bool_probe_ignores_command_echo_containing_true() {
        // The echoed command itself must not satisfy the probe.
        let out = "Test-Path 'C:\\True\\sample.exe'\r\nFalse\r\n";
        assert!(!parse_bool_probe(out, "Test-Path"));
    }
}

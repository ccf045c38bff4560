//! Avira collector.
//!
//! Avira encrypts quarantined files, renames them to `*.qua`, and records the
//! detection metadata in the quarantine header. A helper script baked into
//! the baseline snapshot (`C:\get_report\get_report.ps1`) decodes one header
//! and prints it as JSON: `{"malware": …, "path": …, "utc": <epoch secs>}`.
//!
//! The collector lists the quarantine directory (echo-filtered) and decodes
//! each entry.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Local, TimeZone};
use serde::Deserialize;
use tracing::{debug, warn};

use crate::error::{ErrorKind, SandboxError};
use crate::model::{Alert, Severity};
use crate::vm::guest::ps_quote;
use crate::vm::{GuestCommand, GuestOps};

use super::{Collection, CollectionWindow, Collector, SampleHints};

const QUARANTINE_DIR: &str = "C:\\ProgramData\\Avira\\Endpoint Protection SDK\\quarantine";
const HEADER_SCRIPT: &str = "C:\\get_report\\get_report.ps1";

const READ_TIMEOUT: Duration = Duration::from_secs(60);

pub struct AviraCollector;

#[async_trait]
impl Collector for AviraCollector {
    async fn collect(
        &self,
        guest: &GuestOps,
        window: &CollectionWindow,
        _hints: &SampleHints,
    ) -> Result<Collection, SandboxError> {
        // An absent quarantine directory means nothing was ever detected.
        if !guest.path_exists(QUARANTINE_DIR).await? {
            debug!(vm = guest.vm_name(), "no Avira quarantine directory, no detections");
            return Ok(Collection::default());
        }

        let files = guest.list_files(QUARANTINE_DIR, false).await?;
        let mut alerts = Vec::new();

        for file in files {
            if !file.ends_with(".qua") {
                debug!(vm = guest.vm_name(), %file, "non-quarantine file skipped");
                continue;
            }
            let qua_path = format!("{QUARANTINE_DIR}\\{file}");
            let decode_cmd = GuestCommand::raw(
                "get_report",
                format!(
                    "& {} -FilePath {}",
                    ps_quote(HEADER_SCRIPT),
                    ps_quote(&qua_path)
                ),
            );
            let exec = guest.run(&decode_cmd, READ_TIMEOUT).await?;
            if !exec.success() {
                // The helper script is part of the baseline; if it cannot
                // run, the agent environment is broken, not empty.
                return Err(SandboxError::new(
                    ErrorKind::AgentUnavailable,
                    format!(
                        "quarantine header script failed on {}: {}",
                        guest.vm_name(),
                        exec.stderr.trim()
                    ),
                ));
            }
            match parse_quarantine_header(&exec.stdout) {
                Some(header) => {
                    let ts = header.local_time();
                    if window.contains(ts) {
                        alerts.push(header_alert(&header, ts, &file));
                    }
                }
                None => {
                    warn!(vm = guest.vm_name(), %file, "unparseable quarantine header")
                }
            }
        }

        Ok(Collection {
            alerts,
            events: Vec::new(),
        })
    }
}

// ---------------------------------------------------------------------------
// Header parsing
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct QuarantineHeader {
    pub malware: String,
    pub path: String,
    /// Epoch seconds, UTC.
    pub utc: i64,
}

impl QuarantineHeader {
    pub fn local_time(&self) -> DateTime<Local> {
        chrono::Utc
            .timestamp_opt(self.utc, 0)
            .single()
            .unwrap_or_else(chrono::Utc::now)
            .with_timezone(&Local)
    }

    /// Quarantined paths arrive in extended-length form (`\\?\C:\…`).
    pub fn display_path(&self) -> &str {
        self.path.strip_prefix("\\\\?\\").unwrap_or(&self.path)
    }
}

/// The helper prints one JSON object; tolerate surrounding shell noise by
/// scanning for the outermost braces.
pub fn parse_quarantine_header(stdout: &str) -> Option<QuarantineHeader> {
    let start = stdout.find('{')?;
    let end = stdout.rfind('}')?;
    if end <= start {
        return None;
    }
    serde_json::from_str(&stdout[start..=end]).ok()
}

fn header_alert(header: &QuarantineHeader, ts: DateTime<Local>, qua_file: &str) -> Alert {
    let mut raw_fields = HashMap::new();
    raw_fields.insert("source".to_string(), "quarantine-header".to_string());
    raw_fields.insert("quarantineFile".to_string(), qua_file.to_string());
    Alert {
        alert_id: format!("avira-{}-{qua_file}", ts.timestamp()),
        timestamp: ts,
        severity: Severity::High,
        kind: "quarantine".to_string(),
        threat_name: Some(header.malware.clone()),
        file_hint: Some(header.display_path().to_string()),
        raw_fields,
    }
}

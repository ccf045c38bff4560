//! Windows Defender collector.
//!
//! Two sources, merged and deduplicated:
//!
//! 1. Quarantine listing via `MpCmdRun.exe -Restore -ListAll`. The 8.3 short
//!    path avoids the space in `Program Files` without another quoting layer.
//! 2. Threat history via `Get-MpThreatDetection`.
//!
//! Quarantine timestamps are reported in UTC and converted to local time.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Local, NaiveDateTime, TimeZone, Utc};
use tracing::{debug, warn};

use crate::error::{ErrorKind, SandboxError};
use crate::model::{Alert, Severity};
use crate::vm::{GuestCommand, GuestOps};

use super::{dedup_alerts, Collection, CollectionWindow, Collector, SampleHints};

/// 8.3 short path for `C:\Program Files\Windows Defender\MpCmdRun.exe`.
const MPCMDRUN: &str = "C:\\Progra~1\\Window~1\\MpCmdRun.exe";

const QUERY_TIMEOUT: Duration = Duration::from_secs(60);

pub struct DefenderCollector;

#[async_trait]
impl Collector for DefenderCollector {
    async fn collect(
        &self,
        guest: &GuestOps,
        window: &CollectionWindow,
        hints: &SampleHints,
    ) -> Result<Collection, SandboxError> {
        let mut alerts = Vec::new();

        // Source 1: quarantine listing.
        let list_cmd = GuestCommand::raw(
            "MpCmdRun",
            format!("& {} -Restore -ListAll", crate::vm::guest::ps_quote(MPCMDRUN)),
        );
        let listing = guest.run(&list_cmd, QUERY_TIMEOUT).await?;
        if !listing.success() && listing.stdout.trim().is_empty() {
            // The agent binary itself is unreachable — not a "no data" case.
            return Err(SandboxError::new(
                ErrorKind::AgentUnavailable,
                format!(
                    "MpCmdRun not reachable on {}: {}",
                    guest.vm_name(),
                    listing.stderr.trim()
                ),
            ));
        }
        for entry in parse_quarantine_listing(&listing.stdout) {
            if !window.contains(entry.quarantined_at) {
                continue;
            }
            if !hints.matches_file(&entry.file_path) {
                debug!(file = %entry.file_path, "quarantine entry does not match sample, skipping");
                continue;
            }
            alerts.push(quarantine_alert(&entry));
        }

        // Source 2: threat history.
        let history_cmd = GuestCommand::raw(
            "Get-MpThreatDetection",
            "Get-MpThreatDetection | Select-Object InitialDetectionTime, ThreatID, Resources \
             | Format-List",
        );
        match guest.run(&history_cmd, QUERY_TIMEOUT).await {
            Ok(exec) if exec.success() => {
                for entry in parse_threat_history(&exec.stdout) {
                    let Some(ts) = entry.detected_at else { continue };
                    if !window.contains(ts) {
                        continue;
                    }
                    if !entry.resource.is_empty() && !hints.matches_file(&entry.resource) {
                        continue;
                    }
                    alerts.push(history_alert(&entry, ts));
                }
            }
            Ok(exec) => {
                debug!(
                    vm = guest.vm_name(),
                    exit = exec.exit_code,
                    "Get-MpThreatDetection returned non-zero, relying on quarantine data"
                );
            }
            Err(e) => warn!(vm = guest.vm_name(), error = %e, "threat history query failed"),
        }

        Ok(Collection {
            alerts: dedup_alerts(alerts),
            events: Vec::new(),
        })
    }
}

// ---------------------------------------------------------------------------
// Quarantine listing parser
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct QuarantineEntry {
    pub threat_name: String,
    pub file_path: String,
    pub quarantined_at: DateTime<Local>,
}

/// Parse `MpCmdRun -Restore -ListAll` output. Blocks look like:
///
/// ```text
/// ThreatName = Virus:DOS/EICAR_Test_File
///      file:C:\Users\vboxuser\Desktop\eicar.com quarantined at 2026/03/14 09:12:45 (UTC)
/// ```
pub fn parse_quarantine_listing(output: &str) -> Vec<QuarantineEntry> {
    let mut entries = Vec::new();
    let mut current_threat: Option<String> = None;

    for line in output.lines() {
        let line = line.trim();
        if let Some(name) = line.strip_prefix("ThreatName = ") {
            current_threat = Some(name.trim().to_string());
            continue;
        }
        let Some(threat) = &current_threat else {
            continue;
        };
        let Some(rest) = line.strip_prefix("file:") else {
            continue;
        };
        let Some((path, time_part)) = rest.split_once(" quarantined at ") else {
            continue;
        };
        let Some(ts) = parse_utc_timestamp(time_part.trim()) else {
            warn!(raw = time_part, "unparseable quarantine timestamp, entry skipped");
            continue;
        };
        entries.push(QuarantineEntry {
            threat_name: threat.clone(),
            file_path: path.trim().to_string(),
            quarantined_at: ts,
        });
    }

    entries
}

/// `2026/03/14 09:12:45 (UTC)` → local time.
fn parse_utc_timestamp(raw: &str) -> Option<DateTime<Local>> {
    let stripped = raw.strip_suffix("(UTC)").unwrap_or(raw).trim();
    let naive = NaiveDateTime::parse_from_str(stripped, "%Y/%m/%d %H:%M:%S").ok()?;
    Some(Utc.from_utc_datetime(&naive).with_timezone(&Local))
}

fn quarantine_alert(entry: &QuarantineEntry) -> Alert {
    let mut raw_fields = HashMap::new();
    raw_fields.insert("source".to_string(), "quarantine-listing".to_string());
    Alert {
        alert_id: format!(
            "defender-quarantine-{}-{}",
            entry.quarantined_at.timestamp(),
            entry.threat_name
        ),
        timestamp: entry.quarantined_at,
        severity: Severity::High,
        kind: "quarantine".to_string(),
        threat_name: Some(entry.threat_name.clone()),
        file_hint: Some(entry.file_path.clone()),
        raw_fields,
    }
}

// ---------------------------------------------------------------------------
// Threat history parser
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default)]
pub struct ThreatHistoryEntry {
    pub detected_at: Option<DateTime<Local>>,
    pub threat_id: String,
    pub resource: String,
}

/// Parse `Get-MpThreatDetection | Format-List` records separated by blank
/// lines. Field timestamps are already local.
pub fn parse_threat_history(output: &str) -> Vec<ThreatHistoryEntry> {
    let mut entries = Vec::new();
    let mut current = ThreatHistoryEntry::default();
    let mut saw_field = false;

    for line in output.lines().chain(std::iter::once("")) {
        let line = line.trim();
        if line.is_empty() {
            if saw_field {
                entries.push(std::mem::take(&mut current));
                saw_field = false;
            }
            continue;
        }
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let value = value.trim();
        match key.trim() {
            "InitialDetectionTime" => {
                saw_field = true;
                current.detected_at = parse_local_timestamp(value);
            }
            "ThreatID" => {
                saw_field = true;
                current.threat_id = value.to_string();
            }
            "Resources" => {
                saw_field = true;
                current.resource = value
                    .strip_prefix("{file:_")
                    .and_then(|v| v.strip_suffix('}'))
                    .unwrap_or(value)
                    .to_string();
            }
            _ => {}
        }
    }

    entries
}

fn parse_local_timestamp(raw: &str) -> Option<DateTime<Local>> {
    for format in ["%Y/%m/%d %H:%M:%S", "%m/%d/%Y %H:%M:%S", "%d/%m/%Y %H:%M:%S"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, format) {
            return Local.from_local_datetime(&naive).single();
        }
    }
    None
}

fn history_alert(entry: &ThreatHistoryEntry, ts: DateTime<Local>) -> Alert {
    let mut raw_fields = HashMap::new();
    raw_fields.insert("source".to_string(), "threat-history".to_string());
    if !entry.threat_id.is_empty() {
        raw_fields.insert("threatId".to_string(), entry.threat_id.clone());
    }
    Alert {
        alert_id: format!("defender-history-{}-{}", ts.timestamp(), entry.threat_id),
        timestamp: ts,
        severity: Severity::Critical,
        kind: "threat-detection".to_string(),
        threat_name: None,
        file_hint: if entry.resource.is_empty() {
            None
        } else {
            Some(entry.resource.clone())
        },
        raw_fields,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LISTING: &str = "\
ThreatName = Virus:DOS/EICAR_Test_File\r
     file:C:\\Users\\vboxuser\\Desktop\\eicar.com quarantined at 2026/03/14 09:12:45 (UTC)\r
ThreatName = Trojan:Win32/Wacatac.B!ml\r
     file:C:\\Users\\vboxuser\\Desktop\\sample.exe quarantined at 2026/03/14 09:13:02 (UTC)\r
";

    #[test]
    fn quarantine_listing_parses_threat_blocks() {
        let entries = parse_quarantine_listing(LISTING);
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].threat_name, "Virus:DOS/EICAR_Test_File");
        assert_eq!(
            entries[0].file_path,
            "C:\\Users\\vboxuser\\Desktop\\eicar.com"
        );
        assert_eq!(entries[1].threat_name, "Trojan:Win32/Wacatac.B!ml");
    }

    #[test]
    fn quarantine_timestamps_convert_utc_to_local() {
        let entries = parse_quarantine_listing(LISTING);
        let expected = Utc
            .with_ymd_and_hms(2026, 3, 14, 9, 12, 45)
            .unwrap()
            .with_timezone(&Local);
        assert_eq!(entries[0].quarantined_at, expected);
    }

    #[test]
    fn quarantine_listing_tolerates_noise() {
        let noisy = "MpCmdRun.exe started\r\nnothing here\r\n";
        assert!(parse_quarantine_listing(noisy).is_empty());
    }

    #[test]
    fn threat_history_parses_format_list_records() {
        let output = "\
InitialDetectionTime : 2026/03/14 10:02:11\r
ThreatID             : 2147519003\r
Resources            : {file:_C:\\Users\\vboxuser\\Desktop\\sample.exe}\r
\r
InitialDetectionTime : 2026/03/14 10:05:40\r
ThreatID             : 2147519004\r
Resources            : {file:_C:\\tmp\\other.exe}\r
";
        let entries = parse_threat_history(output);
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].threat_id, "2147519003");
        assert_eq!(
            entries[0].resource,
            "C:\\Users\\vboxuser\\Desktop\\sample.exe"
        );
        assert!(entries[0].detected_at.is_some());
    }

    #[test]
    fn threat_history_handles_empty_output() {
        assert!(parse_threat_history("").is_empty());
        assert!(parse_threat_history("\r\n\r\n").is_empty());
    }
}

//! Kaspersky collector.
//!
//! The product CLI (`avp.com`) exports the file-monitor report to a text
//! file inside the guest; the report is then read back with `Get-Content`
//! and parsed. Rows are tab-separated; detection rows carry a `Detected`
//! verdict column. Export and read-back are two separate guest calls because
//! `avp.com` writes asynchronously and returns before the file is complete
//! on large histories.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Local, NaiveDateTime, TimeZone};
use tracing::{debug, warn};

use crate::error::{ErrorKind, SandboxError};
use crate::model::{Alert, Severity};
use crate::vm::guest::ps_quote;
use crate::vm::{GuestCommand, GuestOps};

use super::{dedup_alerts, Collection, CollectionWindow, Collector, SampleHints};

const AVP: &str = "C:\\Program Files (x86)\\Kaspersky Lab\\Kaspersky 21.15\\avp.com";

/// Where the exported report lands inside the guest.
const REPORT_PATH: &str = "C:\\Users\\Public\\kes-report.txt";

const EXPORT_TIMEOUT: Duration = Duration::from_secs(180);
const READ_TIMEOUT: Duration = Duration::from_secs(60);

pub struct KasperskyCollector;

#[async_trait]
impl Collector for KasperskyCollector {
    async fn collect(
        &self,
        guest: &GuestOps,
        window: &CollectionWindow,
        hints: &SampleHints,
    ) -> Result<Collection, SandboxError> {
        // Export the file-monitor report.
        let export_cmd = GuestCommand::raw(
            "avp",
            format!("& {} report FM /RA:{}", ps_quote(AVP), ps_quote(REPORT_PATH)),
        );
        let export = guest.run(&export_cmd, EXPORT_TIMEOUT).await?;
        if !export.success() {
            return Err(SandboxError::new(
                ErrorKind::AgentUnavailable,
                format!(
                    "avp.com report export failed on {}: exit {}",
                    guest.vm_name(),
                    export.exit_code
                ),
            ));
        }

        // Read it back.
        let read_cmd = GuestCommand::get_content(REPORT_PATH);
        let report = guest.run(&read_cmd, READ_TIMEOUT).await?;
        if !report.success() {
            // Export succeeded but no report file: the monitor had nothing
            // to say, which is a legitimate empty result.
            debug!(vm = guest.vm_name(), "no Kaspersky report file, no detections");
            return Ok(Collection::default());
        }

        let mut alerts = Vec::new();
        for row in parse_report_rows(&report.stdout) {
            if !window.contains(row.detected_at) {
                continue;
            }
            if !hints.matches_file(&row.object) {
                debug!(object = %row.object, "Kaspersky row does not match sample, skipping");
                continue;
            }
            alerts.push(row_alert(&row));
        }

        // Leave the guest tidy for operators who reuse the snapshot.
        if let Err(e) = guest.delete_path(REPORT_PATH).await {
            warn!(vm = guest.vm_name(), error = %e, "failed to remove exported report");
        }

        Ok(Collection {
            alerts: dedup_alerts(alerts),
            events: Vec::new(),
        })
    }
}

// ---------------------------------------------------------------------------
// Report parsing
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct ReportRow {
    pub detected_at: DateTime<Local>,
    pub object: String,
    pub threat_name: String,
}

/// Parse tab-separated report rows, keeping only `Detected` verdicts.
///
/// Row layout (columns that matter):
/// `time \t object \t … \t Detected \t … \t threat name`
/// The time column may carry a `Today, ` prefix instead of a date.
pub fn parse_report_rows(report: &str) -> Vec<ReportRow> {
    let mut rows = Vec::new();

    for line in report.lines() {
        let cells: Vec<&str> = line
            .split('\t')
            .map(|c| c.trim())
            .filter(|c| !c.is_empty())
            .collect();
        if cells.len() < 3 {
            continue;
        }
        let Some(verdict_idx) = cells.iter().position(|c| *c == "Detected") else {
            continue;
        };
        let Some(ts) = parse_report_time(cells[0]) else {
            warn!(raw = cells[0], "unparseable Kaspersky report time, row skipped");
            continue;
        };
        // The threat name follows the verdict column; the object is the
        // second column.
        let threat_name = cells
            .get(verdict_idx + 1)
            .map(|s| s.to_string())
            .unwrap_or_default();
        rows.push(ReportRow {
            detected_at: ts,
            object: cells[1].to_string(),
            threat_name,
        });
    }

    rows
}

/// `2026/03/14 09:12:45` or `Today, 09:12:45`, already in guest-local time.
fn parse_report_time(raw: &str) -> Option<DateTime<Local>> {
    if let Some(time_only) = raw.strip_prefix("Today, ") {
        let time = chrono::NaiveTime::parse_from_str(time_only.trim(), "%H:%M:%S").ok()?;
        let today = Local::now().date_naive();
        return Local.from_local_datetime(&today.and_time(time)).single();
    }
    let naive = NaiveDateTime::parse_from_str(raw, "%Y/%m/%d %H:%M:%S").ok()?;
    Local.from_local_datetime(&naive).single()
}

fn row_alert(row: &ReportRow) -> Alert {
    let mut raw_fields = HashMap::new();
    raw_fields.insert("source".to_string(), "file-monitor-report".to_string());
    Alert {
        alert_id: format!(
            "kaspersky-{}-{}",
            row.detected_at.timestamp(),
            row.threat_name
        ),
        timestamp: row.detected_at,
        severity: Severity::Critical,
        kind: "threat-detection".to_string(),
        threat_name: if row.threat_name.is_empty() {
            None
        } else {
            Some(row.threat_name.clone())
        },
        file_hint: Some(row.object.clone()),
        raw_fields,
    }
}

//! Trend Micro collector.
//!
//! The agent writes one root-cause-analysis XML report per detection under
//! `C:\ProgramData\Trend Micro\AMSP\report\10009\` named `rca*.xml`. When no
//! detection fired, the directory (or the whole report tree) does not exist —
//! that is the legitimate "no data" case.
//!
//! The reports are small and flatly structured, so the fields are extracted
//! with a tag scanner rather than a full XML parser.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Local, TimeZone};
use tracing::{debug, warn};

use crate::error::SandboxError;
use crate::model::{Alert, Severity};
use crate::vm::{GuestCommand, GuestOps};

use super::{Collection, CollectionWindow, Collector, SampleHints};

const REPORT_DIR: &str = "C:\\ProgramData\\Trend Micro\\AMSP\\report\\10009";

const READ_TIMEOUT: Duration = Duration::from_secs(60);

pub struct TrendCollector;

#[async_trait]
impl Collector for TrendCollector {
    async fn collect(
        &self,
        guest: &GuestOps,
        window: &CollectionWindow,
        _hints: &SampleHints,
    ) -> Result<Collection, SandboxError> {
        if !guest.path_exists(REPORT_DIR).await? {
            debug!(vm = guest.vm_name(), "no Trend report directory, no detections");
            return Ok(Collection::default());
        }

        let files = guest.list_files(REPORT_DIR, false).await?;
        let mut alerts = Vec::new();

        for file in files {
            if !(file.starts_with("rca") && file.ends_with(".xml")) {
                continue;
            }
            let path = format!("{REPORT_DIR}\\{file}");
            let exec = guest
                .run(&GuestCommand::get_content(&path), READ_TIMEOUT)
                .await?;
            if !exec.success() {
                warn!(vm = guest.vm_name(), %file, "failed to read Trend report");
                continue;
            }
            match parse_rca_report(&exec.stdout) {
                Some(report) => {
                    if window.contains(report.triggered_at) {
                        alerts.push(report_alert(&report, &file));
                    }
                }
                None => warn!(vm = guest.vm_name(), %file, "unparseable Trend report"),
            }
        }

        Ok(Collection {
            alerts,
            events: Vec::new(),
        })
    }
}

// ---------------------------------------------------------------------------
// RCA report parsing
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct RcaReport {
    pub virus_name: String,
    pub file_name: String,
    pub triggered_at: DateTime<Local>,
}

/// Extract the text content of the first `<tag>…</tag>` occurrence.
pub fn xml_text<'a>(xml: &'a str, tag: &str) -> Option<&'a str> {
    let open = format!("<{tag}>");
    let close = format!("</{tag}>");
    let start = xml.find(&open)? + open.len();
    let end = xml[start..].find(&close)? + start;
    Some(xml[start..end].trim())
}

/// Pull `VirusName`, `FileName`, and the epoch-seconds `TriggerTime` out of
/// one RCA report.
pub fn parse_rca_report(xml: &str) -> Option<RcaReport> {
    let virus_name = xml_text(xml, "VirusName")?.to_string();
    let file_name = xml_text(xml, "FileName")?.to_string();
    let trigger_epoch: i64 = xml_text(xml, "TriggerTime")?.parse().ok()?;
    let triggered_at = Local.timestamp_opt(trigger_epoch, 0).single()?;
    Some(RcaReport {
        virus_name,
        file_name,
        triggered_at,
    })
}

fn report_alert(report: &RcaReport, rca_file: &str) -> Alert {
    let mut raw_fields = HashMap::new();
    raw_fields.insert("source".to_string(), "rca-report".to_string());
    raw_fields.insert("reportFile".to_string(), rca_file.to_string());
    Alert {
        alert_id: format!("trend-{}-{rca_file}", report.triggered_at.timestamp()),
        timestamp: report.triggered_at,
        severity: Severity::Critical,
        kind: "threat-detection".to_string(),
        threat_name: Some(report.virus_name.clone()),
        file_hint: Some(report.file_name.clone()),
        raw_fields,
    }
}

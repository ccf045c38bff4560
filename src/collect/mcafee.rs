//! McAfee collector.
//!
//! The agent writes detection records as JSON to
//! `C:\ProgramData\McAfee\wps\Detection.log`. The collector reads the file
//! back with `Get-Content` and lifts the records into alerts. When nothing
//! was detected the log file does not exist — the legitimate "no data"
//! case.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Local, NaiveDateTime, TimeZone};
use serde::Deserialize;
use tracing::{debug, warn};

use crate::error::SandboxError;
use crate::model::{Alert, Severity};
use crate::vm::{GuestCommand, GuestOps};

use super::{dedup_alerts, Collection, CollectionWindow, Collector, SampleHints};

const DETECTION_LOG: &str = "C:\\ProgramData\\McAfee\\wps\\Detection.log";

const READ_TIMEOUT: Duration = Duration::from_secs(60);

pub struct McafeeCollector;

#[async_trait]
impl Collector for McafeeCollector {
    async fn collect(
        &self,
        guest: &GuestOps,
        window: &CollectionWindow,
        hints: &SampleHints,
    ) -> Result<Collection, SandboxError> {
        if !guest.path_exists(DETECTION_LOG).await? {
            debug!(vm = guest.vm_name(), "no McAfee detection log, no detections");
            return Ok(Collection::default());
        }

        let exec = guest
            .run(&GuestCommand::get_content(DETECTION_LOG), READ_TIMEOUT)
            .await?;
        let body = exec.stdout.trim();
        if !exec.success() || body.is_empty() {
            debug!(vm = guest.vm_name(), "McAfee detection log unreadable or empty");
            return Ok(Collection::default());
        }

        let records = match parse_detection_log(body) {
            Some(r) => r,
            None => {
                warn!(vm = guest.vm_name(), "unparseable McAfee detection log");
                return Ok(Collection::default());
            }
        };

        let mut alerts = Vec::new();
        for record in records {
            let Some(ts) = record.local_time() else {
                warn!(
                    vm = guest.vm_name(),
                    raw = %record.timestamp,
                    "unparseable McAfee detection timestamp, record skipped"
                );
                continue;
            };
            if !window.contains(ts) {
                continue;
            }
            if !record.target_name.is_empty() && !hints.matches_file(&record.target_name) {
                debug!(target = %record.target_name, "McAfee record does not match sample, skipping");
                continue;
            }
            alerts.push(detection_alert(&record, ts));
        }

        Ok(Collection {
            alerts: dedup_alerts(alerts),
            events: Vec::new(),
        })
    }
}

// ---------------------------------------------------------------------------
// Detection log parsing
// ---------------------------------------------------------------------------

/// One record from the detection log.
#[derive(Debug, Clone, Deserialize)]
pub struct DetectionRecord {
    #[serde(default)]
    pub detection_name: String,
    #[serde(default)]
    pub target_name: String,
    #[serde(default)]
    pub initiator_name: String,
    #[serde(default)]
    pub timestamp: String,
    #[serde(default, rename = "ThreatID")]
    pub threat_id: Option<serde_json::Value>,
}

impl DetectionRecord {
    pub fn local_time(&self) -> Option<DateTime<Local>> {
        parse_detection_time(&self.timestamp)
    }
}

/// The log holds one JSON object per detection; newer agent builds write an
/// array. Accept both.
pub fn parse_detection_log(body: &str) -> Option<Vec<DetectionRecord>> {
    if let Ok(list) = serde_json::from_str::<Vec<DetectionRecord>>(body) {
        return Some(list);
    }
    serde_json::from_str::<DetectionRecord>(body)
        .ok()
        .map(|r| vec![r])
}

/// Detection timestamps are local time, written either as ISO-8601 (with or
/// without an offset) or as `Y-m-d H:M:S`.
fn parse_detection_time(raw: &str) -> Option<DateTime<Local>> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(trimmed) {
        return Some(dt.with_timezone(&Local));
    }
    for format in ["%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M:%S", "%Y/%m/%d %H:%M:%S"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(trimmed, format) {
            return Local.from_local_datetime(&naive).single();
        }
    }
    None
}

fn detection_alert(record: &DetectionRecord, ts: DateTime<Local>) -> Alert {
    let mut raw_fields = HashMap::new();
    raw_fields.insert("source".to_string(), "detection-log".to_string());
    if !record.initiator_name.is_empty() {
        raw_fields.insert("initiatorName".to_string(), record.initiator_name.clone());
    }
    let threat_id = record
        .threat_id
        .as_ref()
        .map(|v| v.to_string().trim_matches('"').to_string());
    if let Some(id) = &threat_id {
        raw_fields.insert("threatId".to_string(), id.clone());
    }

    Alert {
        alert_id: format!(
            "mcafee-{}-{}",
            ts.timestamp(),
            threat_id.unwrap_or_else(|| record.detection_name.clone())
        ),
        timestamp: ts,
        severity: Severity::Critical,
        kind: "threat-detection".to_string(),
        threat_name: if record.detection_name.is_empty() {
            None
        } else {
            Some(record.detection_name.clone())
        },
        file_hint: if record.target_name.is_empty() {
            None
        } else {
            Some(record.target_name.clone())
        },
        raw_fields,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RECORD: &str = r#"{
        "ThreatID": 9981,
        "detection_name": "EICAR test file",
        "initiator_name": "explorer.exe",
        "timestamp": "2026-03-14 09:12:45",
        "target_name": "C:\\Users\\vboxuser\\Desktop\\eicar.com"
    }"#;

    #[test]
    fn single_record_log_parses() {
        let records = parse_detection_log(RECORD).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].detection_name, "EICAR test file");
        assert_eq!(records[0].initiator_name, "explorer.exe");
        assert_eq!(
            records[0].target_name,
            "C:\\Users\\vboxuser\\Desktop\\eicar.com"
        );
    }

    #[test]
    fn array_log_parses() {
        let body = format!("[{RECORD},{RECORD}]");
        let records = parse_detection_log(&body).unwrap();
        assert_eq!(records.len(), 2);
    }

    #[test]
    fn garbage_log_yields_none() {
        assert!(parse_detection_log("not json at all").is_none());
    }

    #[test]
    fn detection_time_formats_parse() {
        let naive = parse_detection_time("2026-03-14 09:12:45").unwrap();
        let expected = Local
            .from_local_datetime(
                &NaiveDateTime::parse_from_str("2026-03-14 09:12:45", "%Y-%m-%d %H:%M:%S")
                    .unwrap(),
            )
            .single()
            .unwrap();
        assert_eq!(naive, expected);

        assert!(parse_detection_time("2026-03-14T09:12:45").is_some());
        assert!(parse_detection_time("2026-03-14T09:12:45+08:00").is_some());
        assert!(parse_detection_time("yesterday").is_none());
        assert!(parse_detection_time("").is_none());
    }

    #[test]
    fn missing_fields_default_to_empty() {
        let records = parse_detection_log(r#"{"timestamp":"2026-03-14 09:12:45"}"#).unwrap();
        assert_eq!(records[0].detection_name, "");
        assert_eq!(records[0].target_name, "");
        assert!(records[0].threat_id.is_none());
    }

    #[test]
    fn alert_carries_initiator_and_threat_id() {
        let record = &parse_detection_log(RECORD).unwrap()[0];
        let ts = record.local_time().unwrap();
        let alert = detection_alert(record, ts);

        assert_eq!(alert.severity, Severity::Critical);
        assert_eq!(alert.kind, "threat-detection");
        assert_eq!(alert.threat_name.as_deref(), Some("EICAR test file"));
        assert_eq!(alert.raw_fields["initiatorName"], "explorer.exe");
        assert_eq!(alert.raw_fields["threatId"], "9981");
    }
}

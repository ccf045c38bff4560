//! Behavioral-monitor collector.
//!
//! Reads the in-guest event monitor's operational channel
//! (`Microsoft-Windows-Sysmon/Operational`) via `Get-WinEvent |
//! ConvertTo-Json`, maps the numeric event ids onto the closed
//! [`EventType`] vocabulary, and lifts the colon-separated message body
//! into structured fields. Returns events only; `alerts` stays empty.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Local, TimeZone};
use serde::Deserialize;
use tracing::debug;

use crate::error::{ErrorKind, SandboxError};
use crate::model::{Event, EventType};
use crate::vm::{GuestCommand, GuestOps};

use super::{Collection, CollectionWindow, Collector, SampleHints};

const CHANNEL: &str = "Microsoft-Windows-Sysmon/Operational";

const QUERY_TIMEOUT: Duration = Duration::from_secs(120);

pub struct BehavioralCollector {
    max_events: usize,
}

impl Default for BehavioralCollector {
    fn default() -> Self {
        Self { max_events: 1000 }
    }
}

#[async_trait]
impl Collector for BehavioralCollector {
    async fn collect(
        &self,
        guest: &GuestOps,
        window: &CollectionWindow,
        _hints: &SampleHints,
    ) -> Result<Collection, SandboxError> {
        let cmd = GuestCommand::raw(
            "Get-WinEvent",
            format!(
                "Get-WinEvent -LogName '{CHANNEL}' -MaxEvents {} \
                 -ErrorAction SilentlyContinue \
                 | Select-Object TimeCreated, Id, Message | ConvertTo-Json -Depth 3",
                self.max_events
            ),
        );
        let exec = guest.run(&cmd, QUERY_TIMEOUT).await?;

        let body = exec.stdout.trim();
        if body.is_empty() || body == "null" {
            // No events in the window is a legitimate (if unusual) outcome
            // for an idle sample, but an absent channel means the monitor
            // is not installed or its service is down.
            if !exec.success() {
                return Err(SandboxError::new(
                    ErrorKind::AgentUnavailable,
                    format!("event monitor channel unreadable on {}", guest.vm_name()),
                ));
            }
            debug!(vm = guest.vm_name(), "event monitor returned no events");
            return Ok(Collection::default());
        }

        let raw_events = match parse_raw_events(body) {
            Some(events) => events,
            None => {
                return Err(SandboxError::new(
                    ErrorKind::CollectionFailed,
                    format!("event monitor JSON unparseable on {}", guest.vm_name()),
                ));
            }
        };

        let mut events = Vec::new();
        for raw in &raw_events {
            let Some(event) = structure_event(raw) else {
                continue;
            };
            if window.contains(event.timestamp) {
                events.push(event);
            }
        }
        debug!(
            vm = guest.vm_name(),
            total = raw_events.len(),
            in_window = events.len(),
            "behavioral events collected"
        );

        Ok(Collection {
            alerts: Vec::new(),
            events,
        })
    }
}

// ---------------------------------------------------------------------------
// Raw record shape
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct RawEvent {
    pub time_created: Option<String>,
    pub id: u32,
    #[serde(default)]
    pub message: String,
}

/// Accept both the bare-object (single event) and array forms of
/// `ConvertTo-Json`.
pub fn parse_raw_events(json: &str) -> Option<Vec<RawEvent>> {
    if let Ok(list) = serde_json::from_str::<Vec<RawEvent>>(json) {
        return Some(list);
    }
    serde_json::from_str::<RawEvent>(json).ok().map(|e| vec![e])
}

/// PowerShell serializes `DateTime` either as `/Date(<epoch millis>)/` or,
/// with newer hosts, as an ISO-8601 string. Accept both.
pub fn parse_ps_timestamp(raw: &str) -> Option<DateTime<Local>> {
    let trimmed = raw.trim().trim_matches('"');
    if let Some(rest) = trimmed
        .trim_start_matches('\\')
        .strip_prefix("/Date(")
    {
        let millis: i64 = rest
            .trim_end_matches('/')
            .trim_end_matches('\\')
            .trim_end_matches(')')
            .parse()
            .ok()?;
        return Local.timestamp_millis_opt(millis).single();
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(trimmed) {
        return Some(dt.with_timezone(&Local));
    }
    None
}

// ---------------------------------------------------------------------------
// Event-id mapping
// ---------------------------------------------------------------------------

/// Map the monitor's numeric event id onto the event vocabulary. Ids follow
/// the monitor's published operational schema; anything outside it is
/// preserved as `Other` with the raw id kept in `raw_fields`.
pub fn event_type_for_id(id: u32) -> EventType {
    match id {
        1 => EventType::ProcessCreate,
        2 => EventType::FileCreateTimeChange,
        3 => EventType::NetConnect,
        4 => EventType::SvcStateChange,
        5 => EventType::ProcessExit,
        6 => EventType::DriverLoad,
        7 => EventType::ImageLoad,
        8 => EventType::RemoteThread,
        9 => EventType::RawRead,
        10 => EventType::ProcessAccess,
        11 => EventType::FileCreate,
        12 => EventType::RegKeyChange,
        13 => EventType::RegValueSet,
        14 => EventType::RegRename,
        15 => EventType::FileStreamCreate,
        16 => EventType::ServiceConfigChange,
        17 => EventType::PipeCreate,
        18 => EventType::PipeConnect,
        19 => EventType::WmiFilter,
        20 => EventType::WmiConsumer,
        21 => EventType::WmiBinding,
        22 => EventType::DnsQuery,
        // 23 is an archived delete, 26 the delete-detected variant; both
        // are deletions from the analysis perspective.
        23 | 26 => EventType::FileDelete,
        24 => EventType::ClipboardChange,
        25 => EventType::ProcessTampering,
        27 => EventType::FileBlockExec,
        28 => EventType::FileBlockShred,
        _ => EventType::Other,
    }
}

// ---------------------------------------------------------------------------
// Message structuring
// ---------------------------------------------------------------------------

/// Parse the `Key: value` lines of an event message body.
pub fn parse_message_fields(message: &str) -> HashMap<String, String> {
    let mut fields = HashMap::new();
    for line in message.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with("RuleName") {
            continue;
        }
        if let Some((key, value)) = line.split_once(':') {
            let key = key.trim();
            // Keys are single words; anything with spaces is prose, like
            // the first line of the message.
            if key.is_empty() || key.contains(' ') {
                continue;
            }
            fields.insert(key.to_string(), value.trim().to_string());
        }
    }
    fields
}

/// Targets that characterize an event, per type: touched file, registry
/// object, remote endpoint, queried name, loaded image, target process.
fn targets_for(event_type: EventType, fields: &HashMap<String, String>) -> Vec<String> {
    let keys: &[&str] = match event_type {
        EventType::FileCreate
        | EventType::FileDelete
        | EventType::FileStreamCreate
        | EventType::FileCreateTimeChange
        | EventType::FileBlockExec
        | EventType::FileBlockShred => &["TargetFilename"],
        EventType::RegKeyChange | EventType::RegValueSet | EventType::RegRename => {
            &["TargetObject"]
        }
        EventType::NetConnect => &["DestinationIp", "DestinationPort"],
        EventType::DnsQuery => &["QueryName"],
        EventType::DriverLoad | EventType::ImageLoad => &["ImageLoaded"],
        EventType::RemoteThread | EventType::ProcessAccess => &["TargetImage"],
        EventType::PipeCreate | EventType::PipeConnect => &["PipeName"],
        EventType::RawRead => &["Device"],
        _ => &[],
    };
    keys.iter()
        .filter_map(|k| fields.get(*k))
        .filter(|v| !v.is_empty())
        .cloned()
        .collect()
}

/// Build one structured [`Event`] from a raw record. Records without a
/// parseable timestamp are dropped — an event that cannot be placed in the
/// window cannot be attributed to the detonation.
pub fn structure_event(raw: &RawEvent) -> Option<Event> {
    let ts = parse_ps_timestamp(raw.time_created.as_deref()?)?;
    let event_type = event_type_for_id(raw.id);
    let fields = parse_message_fields(&raw.message);

    let pid = fields.get("ProcessId").and_then(|v| v.parse().ok());
    let ppid = fields
        .get("ParentProcessId")
        .and_then(|v| v.parse().ok());
    let image = fields
        .get("Image")
        .or_else(|| fields.get("SourceImage"))
        .cloned();
    let command_line = fields.get("CommandLine").cloned();
    let targets = targets_for(event_type, &fields);

    let mut raw_fields = fields;
    raw_fields.insert("EventId".to_string(), raw.id.to_string());

    Some(Event {
        event_type,
        timestamp: ts,
        pid,
        ppid,
        image,
        command_line,
        targets,
        raw_fields,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_ids_map_to_their_types() {
        assert_eq!(event_type_for_id(1), EventType::ProcessCreate);
        assert_eq!(event_type_for_id(3), EventType::NetConnect);
        assert_eq!(event_type_for_id(5), EventType::ProcessExit);
        assert_eq!(event_type_for_id(12), EventType::RegKeyChange);
        assert_eq!(event_type_for_id(22), EventType::DnsQuery);
        assert_eq!(event_type_for_id(23), EventType::FileDelete);
        assert_eq!(event_type_for_id(26), EventType::FileDelete);
        assert_eq!(event_type_for_id(28), EventType::FileBlockShred);
    }

    #[test]
    fn unknown_ids_map_to_other() {
        assert_eq!(event_type_for_id(0), EventType::Other);
        assert_eq!(event_type_for_id(255), EventType::Other);
    }

    #[test]
    fn ps_date_millis_form_parses() {
        let ts = parse_ps_timestamp("/Date(1773652800000)/").unwrap();
        assert_eq!(ts, Local.timestamp_millis_opt(1_773_652_800_000).unwrap());
    }

    #[test]
    fn ps_escaped_date_form_parses() {
        let ts = parse_ps_timestamp("\\/Date(1773652800000)\\/").unwrap();
        assert_eq!(ts, Local.timestamp_millis_opt(1_773_652_800_000).unwrap());
    }

    #[test]
    fn iso_form_parses() {
        let raw = "2026-03-14T09:12:45+08:00";
        let ts = parse_ps_timestamp(raw).unwrap();
        let expected = DateTime::parse_from_rfc3339(raw).unwrap();
        assert_eq!(ts.timestamp(), expected.timestamp());
        assert!(parse_ps_timestamp("not a date").is_none());
    }

    #[test]
    fn message_fields_parse_key_value_lines() {
        let message = "Process Create:\r\nRuleName: -\r\nProcessId: 4242\r\nImage: C:\\evil.exe\r\nCommandLine: C:\\evil.exe -x\r\nParentProcessId: 1000\r\n";
        let fields = parse_message_fields(message);
        assert_eq!(fields.get("ProcessId").unwrap(), "4242");
        assert_eq!(fields.get("Image").unwrap(), "C:\\evil.exe");
        assert!(!fields.contains_key("RuleName"));
        // "Process Create" carries a space and is prose, not a field.
        assert!(!fields.contains_key("Process Create"));
    }

    #[test]
    fn structure_event_extracts_process_fields() {
        let raw = RawEvent {
            time_created: Some("/Date(1773652800000)/".to_string()),
            id: 1,
            message: "Process Create:\r\nProcessId: 4242\r\nParentProcessId: 1000\r\nImage: C:\\evil.exe\r\nCommandLine: C:\\evil.exe -x\r\n".to_string(),
        };
        let event = structure_event(&raw).unwrap();
        assert_eq!(event.event_type, EventType::ProcessCreate);
        assert_eq!(event.pid, Some(4242));
        assert_eq!(event.ppid, Some(1000));
        assert_eq!(event.image.as_deref(), Some("C:\\evil.exe"));
        assert_eq!(event.command_line.as_deref(), Some("C:\\evil.exe -x"));
        assert_eq!(event.raw_fields.get("EventId").unwrap(), "1");
    }

    #[test]
    fn structure_event_targets_follow_event_type() {
        let raw = RawEvent {
            time_created: Some("/Date(1773652800000)/".to_string()),
            id: 22,
            message: "Dns query:\r\nProcessId: 7\r\nQueryName: evil.example.com\r\nImage: C:\\evil.exe\r\n".to_string(),
        };
        let event = structure_event(&raw).unwrap();
        assert_eq!(event.event_type, EventType::DnsQuery);
        assert_eq!(event.targets, vec!["evil.example.com".to_string()]);
    }

    #[test]
    fn event_without_timestamp_is_dropped() {
        let raw = RawEvent {
            time_created: None,
            id: 1,
            message: String::new(),
        };
        assert!(structure_event(&raw).is_none());
    }

    #[test]
    fn json_array_and_single_object_both_parse() {
        let single = r#"{"TimeCreated":"/Date(1773652800000)/","Id":1,"Message":"m"}"#;
        assert_eq!(parse_raw_events(single).unwrap().len(), 1);

        let array = r#"[{"TimeCreated":"/Date(1)/","Id":1,"Message":"a"},
                        {"TimeCreated":"/Date(2)/","Id":3,"Message":"b"}]"#;
        assert_eq!(parse_raw_events(array).unwrap().len(), 2);
    }
}

//! Per-agent collectors: extract structured alerts or behavioral events
//! from a guest after detonation.
//!
//! One collector per [`AgentKind`]. Each is free in its mechanism (log
//! export, quarantine listing, event-log query) but bound by a common
//! contract: confine results to the collection window plus grace, normalize
//! timestamps to local time with offset, and treat "no data" as an empty
//! result — never as an error. `AgentUnavailable` is reserved for an
//! in-guest tool that cannot be reached at all.

pub mod avira;
pub mod behavioral;
pub mod defender;
pub mod kaspersky;
pub mod mcafee;
pub mod trend;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Local};

use crate::config::AgentKind;
use crate::error::SandboxError;
use crate::model::{Alert, Event};
use crate::vm::GuestOps;

// ---------------------------------------------------------------------------
// Window and hints
// ---------------------------------------------------------------------------

/// The detonation interval alerts and events must fall into, widened by a
/// configured grace on both ends.
#[derive(Debug, Clone, Copy)]
pub struct CollectionWindow {
    pub start: DateTime<Local>,
    pub end: DateTime<Local>,
    pub grace: Duration,
}

impl CollectionWindow {
    pub fn new(start: DateTime<Local>, end: DateTime<Local>, grace: Duration) -> Self {
        Self { start, end, grace }
    }

    pub fn contains(&self, ts: DateTime<Local>) -> bool {
        ts >= self.start - self.grace && ts <= self.end + self.grace
    }
}

/// Sample identity passed to collectors so they can narrow noisy sources.
#[derive(Debug, Clone)]
pub struct SampleHints {
    pub file_name: String,
    pub hash_hex: String,
}

impl SampleHints {
    /// Loose filename match: agents report full paths, short names, or
    /// renamed quarantine entries, so any containment either way counts.
    pub fn matches_file(&self, reported: &str) -> bool {
        if reported.is_empty() {
            return false;
        }
        let reported_base = reported
            .rsplit(['\\', '/'])
            .next()
            .unwrap_or(reported)
            .to_ascii_lowercase();
        let hinted = self.file_name.to_ascii_lowercase();
        reported_base.contains(&hinted) || hinted.contains(&reported_base)
    }
}

/// What a collector produced. Security agents fill `alerts`; the behavioral
/// monitor fills `events` and leaves `alerts` empty.
#[derive(Debug, Clone, Default)]
pub struct Collection {
    pub alerts: Vec<Alert>,
    pub events: Vec<Event>,
}

// ---------------------------------------------------------------------------
// Trait and registry
// ---------------------------------------------------------------------------

#[async_trait]
pub trait Collector: Send + Sync {
    async fn collect(
        &self,
        guest: &GuestOps,
        window: &CollectionWindow,
        hints: &SampleHints,
    ) -> Result<Collection, SandboxError>;
}

/// Maps each agent kind to its collector. Built once at startup; tests build
/// their own with fakes.
pub struct CollectorRegistry {
    collectors: HashMap<AgentKind, Arc<dyn Collector>>,
}

impl CollectorRegistry {
    /// The production set: every supported agent kind.
    pub fn standard() -> Self {
        let mut collectors: HashMap<AgentKind, Arc<dyn Collector>> = HashMap::new();
        collectors.insert(AgentKind::Defender, Arc::new(defender::DefenderCollector));
        collectors.insert(
            AgentKind::Kaspersky,
            Arc::new(kaspersky::KasperskyCollector),
        );
        collectors.insert(AgentKind::Mcafee, Arc::new(mcafee::McafeeCollector));
        collectors.insert(AgentKind::Avira, Arc::new(avira::AviraCollector));
        collectors.insert(AgentKind::Trend, Arc::new(trend::TrendCollector));
        collectors.insert(
            AgentKind::BehavioralMonitor,
            Arc::new(behavioral::BehavioralCollector::default()),
        );
        Self { collectors }
    }

    pub fn with_collectors(collectors: HashMap<AgentKind, Arc<dyn Collector>>) -> Self {
        Self { collectors }
    }

    pub fn for_agent(&self, kind: AgentKind) -> Option<Arc<dyn Collector>> {
        self.collectors.get(&kind).cloned()
    }
}

/// Keep only the latest alert per (kind, threat, file) triple. Agents report
/// the same quarantine entry through several channels; the report should
/// carry it once.
pub fn dedup_alerts(mut alerts: Vec<Alert>) -> Vec<Alert> {
    use std::collections::hash_map::Entry;

    let mut newest: HashMap<(String, String, String), Alert> = HashMap::new();
    for alert in alerts.drain(..) {
        let key = (
            alert.kind.clone(),
            alert.threat_name.clone().unwrap_or_default(),
            alert.file_hint.clone().unwrap_or_default(),
        );
        match newest.entry(key) {
            Entry::Vacant(slot) => {
                slot.insert(alert);
            }
            Entry::Occupied(mut slot) => {
                if alert.timestamp > slot.get().timestamp {
                    slot.insert(alert);
                }
            }
        }
    }

    let mut out: Vec<Alert> = newest.into_values().collect();
    out.sort_by_key(|a| a.timestamp);
    out
}

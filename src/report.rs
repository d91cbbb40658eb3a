//! Job report returned by the scheduler.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::counter::TransitionCounts;
use crate::scope::StreamId;

/// Outcome of one stream slot
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StreamStats {
    pub stream: usize,
    pub events: u64,
    /// Events accepted by every module of the path
    pub accepted: u64,
}

impl StreamStats {
    pub fn new(stream: StreamId) -> Self {
        Self {
            stream: stream.value(),
            ..Default::default()
        }
    }
}

/// Hook invocations and filter decisions of one module
#[derive(Debug, Clone, Serialize)]
pub struct ModuleReport {
    pub label: String,
    pub passed: u64,
    pub rejected: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub concurrency_limit: Option<usize>,
    /// Most `filter` calls observed in flight at once
    pub peak_concurrency: usize,
    pub transitions: TransitionCounts,
}

#[derive(Debug, Clone, Serialize)]
pub struct JobReport {
    pub process_name: String,
    pub streams: usize,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub events_seen: u64,
    pub events_accepted: u64,
    pub scopes_retired: u64,
    pub transitions: TransitionCounts,
    pub modules: Vec<ModuleReport>,
    pub per_stream: Vec<StreamStats>,
}

impl JobReport {
    pub fn module(&self, label: &str) -> Option<&ModuleReport> {
        self.modules.iter().find(|m| m.label == label)
    }

    /// One-line summary for terminal output
    pub fn summary_line(&self) -> String {
        format!(
            "{}: {} events on {} streams, {} accepted, {} scopes retired in {} ms",
            self.process_name, self.events_seen, self.streams, self.events_accepted, self.scopes_retired, self.duration_ms
        )
    }
}

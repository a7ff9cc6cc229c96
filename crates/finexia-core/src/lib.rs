use chrono::{DateTime, Local, NaiveDate, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::str::FromStr;

pub mod progress;
pub mod wire;

pub use progress::compute_progress;
pub use wire::RawPipelineStatus;

pub const MAX_LOG_ENTRIES: usize = 100;
/// Ceiling for a non-terminal run; only a terminal status reports 100.
pub const MAX_ACTIVE_PROGRESS: f64 = 99.0;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PipelineState {
    Idle,
    /// Run requested locally, not yet confirmed by a push or poll.
    Pending,
    Running,
    Succeeded,
    Failed,
}

impl Default for PipelineState {
    fn default() -> Self {
        Self::Idle
    }
}

impl PipelineState {
    pub fn as_str(&self) -> &'static str {
        match self {
            PipelineState::Idle => "idle",
            PipelineState::Pending => "pending",
            PipelineState::Running => "running",
            PipelineState::Succeeded => "succeeded",
            PipelineState::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, PipelineState::Succeeded | PipelineState::Failed)
    }

    pub fn is_active(&self) -> bool {
        matches!(self, PipelineState::Pending | PipelineState::Running)
    }
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PipelineState {
    type Err = String;

    /// Parses a backend status string. Queue-like states count as running:
    /// only the client itself produces `Pending`.
    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let normalized = input.trim().to_lowercase();
        match normalized.as_str() {
            "idle" | "" => Ok(PipelineState::Idle),
            "running" | "started" | "in_progress" | "in-progress" | "queued" | "pending" => {
                Ok(PipelineState::Running)
            }
            "succeeded" | "success" | "completed" | "complete" | "done" => {
                Ok(PipelineState::Succeeded)
            }
            "failed" | "failure" | "error" | "errored" => Ok(PipelineState::Failed),
            other => Err(format!("Unknown pipeline status: {other}")),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SystemStats {
    #[serde(default = "default_server_status")]
    pub status: String,
    #[serde(default, deserialize_with = "deserialize_opt_timestamp")]
    pub server_time: Option<DateTime<Utc>>,
    #[serde(default = "default_database_status")]
    pub database_status: String,
    #[serde(default)]
    pub total_predictions: u64,
    #[serde(default)]
    pub today_predictions: u64,
    #[serde(default)]
    pub yesterday_predictions: u64,
    #[serde(default)]
    pub verified_predictions: u64,
    #[serde(default)]
    pub verified_prediction_percent: f64,
    #[serde(default)]
    pub direction_predictions: u64,
    #[serde(default)]
    pub recent_model_training_count: u64,
    #[serde(default)]
    pub model_directory_size_mb: f64,
    #[serde(default)]
    pub model_file_count: u64,
}

impl Default for SystemStats {
    fn default() -> Self {
        Self {
            status: default_server_status(),
            server_time: None,
            database_status: default_database_status(),
            total_predictions: 0,
            today_predictions: 0,
            yesterday_predictions: 0,
            verified_predictions: 0,
            verified_prediction_percent: 0.0,
            direction_predictions: 0,
            recent_model_training_count: 0,
            model_directory_size_mb: 0.0,
            model_file_count: 0,
        }
    }
}

fn default_server_status() -> String {
    "offline".to_string()
}

fn default_database_status() -> String {
    "disconnected".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LogEntry {
    #[serde(default)]
    pub timestamp: String,
    #[serde(default = "default_log_level")]
    pub level: String,
    pub message: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Most-recent-first log window, capped at a fixed size.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct LogBuffer {
    entries: VecDeque<LogEntry>,
    cap: usize,
}

impl Default for LogBuffer {
    fn default() -> Self {
        Self::with_capacity(MAX_LOG_ENTRIES)
    }
}

impl LogBuffer {
    pub fn with_capacity(cap: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(cap.min(MAX_LOG_ENTRIES)),
            cap: cap.max(1),
        }
    }

    /// Prepends one entry, evicting the oldest past the cap.
    pub fn push(&mut self, entry: LogEntry) {
        self.entries.push_front(entry);
        self.entries.truncate(self.cap);
    }

    /// Replaces the window with a full list, which is expected newest-first.
    pub fn replace(&mut self, entries: Vec<LogEntry>) {
        self.entries = entries.into_iter().take(self.cap).collect();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn newest(&self) -> Option<&LogEntry> {
        self.entries.front()
    }

    pub fn iter(&self) -> impl Iterator<Item = &LogEntry> {
        self.entries.iter()
    }
}

#[derive(Debug, Clone, Serialize, PartialEq, Default)]
pub struct PipelineStatus {
    pub state: PipelineState,
    pub message: Option<String>,
    pub current_step: Option<String>,
    pub progress: f64,
    pub requested_by: Option<String>,
    pub estimated_duration_minutes: Option<f64>,
    pub start_time: Option<DateTime<Utc>>,
    pub last_run: Option<DateTime<Utc>>,
    pub steps: Vec<String>,
}

impl PipelineStatus {
    /// Builds the domain view of a backend report. A report without a
    /// status field describes an in-flight run.
    pub fn from_raw(raw: RawPipelineStatus, now: DateTime<Utc>) -> Self {
        let state = raw.state().unwrap_or(PipelineState::Running);
        let mut progress = compute_progress(&raw, now);
        if !state.is_terminal() {
            progress = progress.min(MAX_ACTIVE_PROGRESS);
        }
        Self {
            state,
            progress,
            message: raw.message,
            current_step: raw.current_step,
            requested_by: raw.requested_by,
            estimated_duration_minutes: raw.estimated_duration_minutes,
            start_time: raw.start_time,
            last_run: raw.last_run,
            steps: raw.steps,
        }
    }

    /// Merges a newer report into this one. Returns false when the report is
    /// stale and was dropped: it belongs to an earlier run, or it would move
    /// a terminal run back to a non-terminal state without starting a new run.
    ///
    /// A terminal run without a known start is anchored at `last_run`, so only
    /// a report that started after it counts as a new run.
    pub fn merge(&mut self, incoming: PipelineStatus) -> bool {
        if let (Some(current), Some(next)) = (self.start_time, incoming.start_time) {
            if next < current {
                return false;
            }
        }
        let anchor = if self.state.is_terminal() {
            self.start_time.or(self.last_run)
        } else {
            self.start_time
        };
        let newer_run = match (anchor, incoming.start_time) {
            (Some(current), Some(next)) => next > current,
            (None, Some(_)) => true,
            _ => false,
        };
        if self.state.is_terminal() && !incoming.state.is_terminal() && !newer_run {
            return false;
        }

        let mut next = incoming;
        if !newer_run && next.state != PipelineState::Idle {
            if next.state == PipelineState::Running && self.state.is_active() {
                next.progress = next.progress.max(self.progress);
            }
            next.message = next.message.or_else(|| self.message.take());
            next.current_step = next.current_step.or_else(|| self.current_step.take());
            next.requested_by = next.requested_by.or_else(|| self.requested_by.take());
            next.estimated_duration_minutes = next
                .estimated_duration_minutes
                .or(self.estimated_duration_minutes);
            next.start_time = next.start_time.or(self.start_time);
            if next.steps.is_empty() {
                next.steps = std::mem::take(&mut self.steps);
            }
        }
        next.last_run = next.last_run.or(self.last_run);
        *self = next;
        true
    }
}

/// Parses the timestamp shapes the backend emits: RFC 3339, naive ISO 8601,
/// or a bare date. Naive values are server wall-clock time and are read in
/// the local timezone.
pub fn parse_timestamp(input: &str) -> Option<DateTime<Utc>> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return None;
    }
    if let Ok(parsed) = DateTime::parse_from_rfc3339(trimmed) {
        return Some(parsed.with_timezone(&Utc));
    }
    for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(trimmed, format) {
            return Some(local_to_utc(naive));
        }
    }
    NaiveDate::parse_from_str(trimmed, "%Y-%m-%d")
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(local_to_utc)
}

fn local_to_utc(naive: NaiveDateTime) -> DateTime<Utc> {
    Local
        .from_local_datetime(&naive)
        .earliest()
        .map(|local| local.with_timezone(&Utc))
        .unwrap_or_else(|| naive.and_utc())
}

/// Deserialize an optional timestamp, treating unparseable values as absent
pub(crate) fn deserialize_opt_timestamp<'de, D>(
    deserializer: D,
) -> Result<Option<DateTime<Utc>>, D::Error>
where
    D: Deserializer<'de>,
{
    let val: Option<serde_json::Value> = Option::deserialize(deserializer)?;
    match val {
        Some(serde_json::Value::String(s)) => Ok(parse_timestamp(&s)),
        Some(serde_json::Value::Null) | None => Ok(None),
        Some(_) => Err(serde::de::Error::custom("expected timestamp string")),
    }
}

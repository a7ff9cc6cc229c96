use crate::{deserialize_opt_timestamp, LogEntry, PipelineState, SystemStats};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

pub const CLOSE_NORMAL: u16 = 1000;
pub const CLOSE_GOING_AWAY: u16 = 1001;
/// Close frame that carried no status code.
pub const CLOSE_NO_STATUS: u16 = 1005;
pub const CLOSE_ABNORMAL: u16 = 1006;
/// Synthetic code reported when a connect attempt never reaches open.
pub const CLOSE_CONNECT_TIMEOUT: u16 = 4000;
pub const CONNECT_TIMEOUT_REASON: &str = "Connection timeout";

/// Close codes that end a session on purpose and must not trigger reconnect.
pub fn is_normal_close(code: u16) -> bool {
    matches!(code, CLOSE_NORMAL | CLOSE_GOING_AWAY)
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct RawPipelineStatus {
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub current_step: Option<String>,
    #[serde(default)]
    pub progress: Option<f64>,
    #[serde(default)]
    pub completed_steps: Option<u32>,
    #[serde(default)]
    pub total_steps: Option<u32>,
    #[serde(default)]
    pub requested_by: Option<String>,
    #[serde(default)]
    pub estimated_duration_minutes: Option<f64>,
    #[serde(default, deserialize_with = "deserialize_opt_timestamp")]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default, deserialize_with = "deserialize_opt_timestamp")]
    pub last_run: Option<DateTime<Utc>>,
    #[serde(default)]
    pub steps: Vec<String>,
}

impl RawPipelineStatus {
    /// Parsed status; `None` when the field is absent or not a known value.
    pub fn state(&self) -> Option<PipelineState> {
        self.status.as_deref().and_then(|value| value.parse().ok())
    }
}

/// `GET /system/status`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct SystemStatusResponse {
    #[serde(flatten)]
    pub stats: SystemStats,
    #[serde(default)]
    pub pipeline_status: Option<RawPipelineStatus>,
    #[serde(default)]
    pub logs: Option<Vec<LogEntry>>,
}

/// `POST /system/run-pipeline` body. `steps: null` runs every default step.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct PipelineRunRequest {
    pub force: bool,
    pub steps: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_symbols: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct PipelineRunResponse {
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub message: String,
    #[serde(default, deserialize_with = "deserialize_opt_timestamp")]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub requested_by: Option<String>,
    #[serde(default)]
    pub estimated_duration_minutes: Option<f64>,
    #[serde(default)]
    pub steps: Vec<String>,
}

/// `GET /system/logs?limit=N`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct LogsResponse {
    #[serde(default)]
    pub logs: Vec<LogEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct StatusUpdatePayload {
    #[serde(default)]
    pub status: Option<SystemStats>,
    #[serde(default)]
    pub pipeline_status: Option<RawPipelineStatus>,
    #[serde(default)]
    pub logs: Option<Vec<LogEntry>>,
    #[serde(default)]
    pub log_entry: Option<LogEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct PipelineUpdatePayload {
    #[serde(default)]
    pub pipeline_status: Option<RawPipelineStatus>,
    #[serde(default)]
    pub log_entry: Option<LogEntry>,
}

/// A message pushed over the status channel, discriminated by `type`.
#[derive(Debug, Clone, PartialEq)]
pub enum PushEvent {
    StatusUpdate(StatusUpdatePayload),
    PipelineUpdate(PipelineUpdatePayload),
    /// Greeting the backend sends right after a socket is accepted.
    Connected { message: Option<String> },
    Unknown(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WireError {
    #[error("push message is not an object with a string `type`")]
    MissingType,
    #[error("push message `{kind}` decode failed: {message}")]
    Decode { kind: String, message: String },
}

impl PushEvent {
    pub fn from_value(value: &Value) -> Result<Self, WireError> {
        let kind = value
            .get("type")
            .and_then(Value::as_str)
            .ok_or(WireError::MissingType)?;
        let decode_err = |err: serde_json::Error| WireError::Decode {
            kind: kind.to_string(),
            message: err.to_string(),
        };
        match kind {
            "status_update" => StatusUpdatePayload::deserialize(value)
                .map(PushEvent::StatusUpdate)
                .map_err(decode_err),
            "pipeline_update" => PipelineUpdatePayload::deserialize(value)
                .map(PushEvent::PipelineUpdate)
                .map_err(decode_err),
            "connected" => Ok(PushEvent::Connected {
                message: value
                    .get("message")
                    .and_then(Value::as_str)
                    .map(str::to_string),
            }),
            other => Ok(PushEvent::Unknown(other.to_string())),
        }
    }

    pub fn kind(&self) -> &str {
        match self {
            PushEvent::StatusUpdate(_) => "status_update",
            PushEvent::PipelineUpdate(_) => "pipeline_update",
            PushEvent::Connected { .. } => "connected",
            PushEvent::Unknown(kind) => kind,
        }
    }
}

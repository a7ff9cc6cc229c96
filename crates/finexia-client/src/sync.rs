//! Canonical client-side view of system and pipeline state.
//!
//! Push events from the channel and snapshots from polling both land here.
//! Every mutation goes through a single `watch::Sender::send_modify`, so
//! concurrent writers are serialized and subscribers see whole updates.

use crate::api::{ApiError, StatusApi};
use crate::channel::{ChannelSubscriber, Frame};
use chrono::{DateTime, Utc};
use finexia_core::wire::{
    PipelineRunRequest, PipelineRunResponse, PushEvent, SystemStatusResponse,
};
use finexia_core::{
    LogBuffer, LogEntry, PipelineState, PipelineStatus, RawPipelineStatus, SystemStats,
};
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, warn};

#[derive(Debug, Clone, Serialize, PartialEq, Default)]
pub struct SystemView {
    pub stats: SystemStats,
    pub pipeline: PipelineStatus,
    pub logs: LogBuffer,
    pub last_updated: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

impl SystemView {
    pub fn is_pipeline_running(&self) -> bool {
        self.pipeline.state.is_active()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogUpdate {
    /// Full list, newest first.
    Replace(Vec<LogEntry>),
    Append(LogEntry),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PipelineRunConfig {
    pub force: bool,
    /// `None` runs every default step; otherwise a non-empty ordered list.
    pub steps: Option<Vec<String>>,
    pub max_symbols: Option<u32>,
}

impl PipelineRunConfig {
    fn into_request(self) -> Result<PipelineRunRequest, SyncError> {
        if let Some(steps) = &self.steps {
            if steps.is_empty() {
                return Err(SyncError::InvalidRunConfig(
                    "steps must be omitted or non-empty".to_string(),
                ));
            }
            if steps.iter().any(|step| step.trim().is_empty()) {
                return Err(SyncError::InvalidRunConfig(
                    "step names must not be blank".to_string(),
                ));
            }
        }
        Ok(PipelineRunRequest {
            force: self.force,
            steps: self.steps,
            max_symbols: self.max_symbols,
        })
    }
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("invalid pipeline run config: {0}")]
    InvalidRunConfig(String),
    #[error(transparent)]
    Api(#[from] ApiError),
}

pub struct StatusSynchronizer {
    view: watch::Sender<SystemView>,
}

impl Default for StatusSynchronizer {
    fn default() -> Self {
        Self::new()
    }
}

impl StatusSynchronizer {
    pub fn new() -> Self {
        let (view, _) = watch::channel(SystemView::default());
        Self { view }
    }

    pub fn subscribe(&self) -> watch::Receiver<SystemView> {
        self.view.subscribe()
    }

    /// Copy of the current view.
    pub fn view(&self) -> SystemView {
        self.view.borrow().clone()
    }

    pub fn pipeline(&self) -> PipelineStatus {
        self.view.borrow().pipeline.clone()
    }

    pub fn is_pipeline_running(&self) -> bool {
        self.view.borrow().is_pipeline_running()
    }

    /// Full-state merge: stats are replaced outright, the pipeline report is
    /// merged only if it is not stale, and logs follow `logs`.
    pub fn apply_snapshot(
        &self,
        stats: SystemStats,
        pipeline: Option<RawPipelineStatus>,
        logs: Option<LogUpdate>,
    ) {
        self.apply(Some(stats), pipeline, logs);
    }

    pub fn apply_status_response(&self, response: SystemStatusResponse) {
        self.apply_snapshot(
            response.stats,
            response.pipeline_status,
            response.logs.map(LogUpdate::Replace),
        );
    }

    pub fn apply_push_event(&self, event: PushEvent) {
        match event {
            PushEvent::StatusUpdate(payload) => {
                let logs = payload
                    .logs
                    .map(LogUpdate::Replace)
                    .or(payload.log_entry.map(LogUpdate::Append));
                self.apply(payload.status, payload.pipeline_status, logs);
            }
            PushEvent::PipelineUpdate(payload) => {
                self.apply(
                    None,
                    payload.pipeline_status,
                    payload.log_entry.map(LogUpdate::Append),
                );
            }
            PushEvent::Connected { message } => {
                debug!(
                    event = "sync_channel_greeting",
                    message = message.as_deref().unwrap_or("")
                );
            }
            PushEvent::Unknown(kind) => {
                debug!(event = "sync_unknown_event", kind = %kind);
            }
        }
    }

    /// Decodes and applies one push message. Returns false when the message
    /// could not be decoded.
    pub fn apply_push_value(&self, value: &Value) -> bool {
        match PushEvent::from_value(value) {
            Ok(event) => {
                self.apply_push_event(event);
                true
            }
            Err(err) => {
                warn!(event = "sync_push_decode_error", error = %err);
                false
            }
        }
    }

    pub fn record_error(&self, message: impl Into<String>) {
        let message = message.into();
        self.view.send_modify(|view| view.last_error = Some(message));
    }

    /// Asks the backend to start a run. On success the pipeline moves to
    /// `Pending` until the first explicit report arrives; on failure the view
    /// keeps its pipeline state and only `last_error` is set. `start_time`
    /// stays unset when the response omits it.
    pub async fn start_pipeline_run<A: StatusApi>(
        &self,
        api: &A,
        config: PipelineRunConfig,
    ) -> Result<PipelineRunResponse, SyncError> {
        let request = config.into_request()?;
        let response = match api.run_pipeline(&request).await {
            Ok(response) => response,
            Err(err) => {
                warn!(event = "pipeline_start_failed", error = %err);
                self.record_error(err.to_string());
                return Err(err.into());
            }
        };

        let now = Utc::now();
        let steps = if response.steps.is_empty() {
            request.steps.clone().unwrap_or_default()
        } else {
            response.steps.clone()
        };
        let message = Some(response.message.clone()).filter(|message| !message.is_empty());
        self.view.send_modify(|view| {
            view.pipeline = PipelineStatus {
                state: PipelineState::Pending,
                message,
                current_step: steps.first().cloned(),
                progress: 0.0,
                requested_by: response.requested_by.clone(),
                estimated_duration_minutes: response.estimated_duration_minutes,
                start_time: response.start_time,
                last_run: view.pipeline.last_run,
                steps,
            };
            view.last_updated = Some(now);
            view.last_error = None;
        });
        debug!(
            event = "pipeline_start_requested",
            force = request.force,
            requested_by = response.requested_by.as_deref().unwrap_or("")
        );
        Ok(response)
    }

    /// Fetches a full snapshot and applies it. Failures are recorded in
    /// `last_error` and returned.
    pub async fn refresh<A: StatusApi>(&self, api: &A) -> Result<(), ApiError> {
        match api.fetch_status().await {
            Ok(response) => {
                self.apply_status_response(response);
                Ok(())
            }
            Err(err) => {
                self.record_error(err.to_string());
                Err(err)
            }
        }
    }

    pub async fn refresh_logs<A: StatusApi>(&self, api: &A, limit: u32) -> Result<(), ApiError> {
        match api.fetch_logs(limit).await {
            Ok(entries) => {
                self.view.send_modify(|view| view.logs.replace(entries));
                Ok(())
            }
            Err(err) => {
                self.record_error(err.to_string());
                Err(err)
            }
        }
    }

    fn apply(
        &self,
        stats: Option<SystemStats>,
        pipeline: Option<RawPipelineStatus>,
        logs: Option<LogUpdate>,
    ) {
        let now = Utc::now();
        self.view.send_modify(|view| {
            if let Some(stats) = stats {
                view.stats = stats;
            }
            if let Some(raw) = pipeline {
                merge_pipeline(&mut view.pipeline, raw, now);
            }
            match logs {
                Some(LogUpdate::Replace(entries)) => view.logs.replace(entries),
                Some(LogUpdate::Append(entry)) => view.logs.push(entry),
                None => {}
            }
            view.last_updated = Some(now);
            view.last_error = None;
        });
    }
}

fn merge_pipeline(current: &mut PipelineStatus, raw: RawPipelineStatus, now: DateTime<Utc>) {
    let incoming = PipelineStatus::from_raw(raw, now);
    let incoming_state = incoming.state;
    if !current.merge(incoming) {
        debug!(
            event = "pipeline_report_stale",
            current = %current.state,
            incoming = %incoming_state
        );
        return;
    }
    if current.state.is_terminal() && current.last_run.is_none() {
        current.last_run = Some(now);
    }
}

impl ChannelSubscriber for StatusSynchronizer {
    fn on_message(&self, frame: &Frame, _raw: &str) {
        if let Frame::Json(value) = frame {
            self.apply_push_value(value);
        }
    }
}

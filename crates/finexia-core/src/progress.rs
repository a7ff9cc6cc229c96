use crate::{PipelineState, RawPipelineStatus, MAX_ACTIVE_PROGRESS};
use chrono::{DateTime, Utc};

/// Progress percentage for a backend pipeline report.
///
/// Sources, first match wins: an explicit terminal status, the explicit
/// `progress` field, the completed/total step ratio, then elapsed time over
/// the estimated duration. A time estimate never reaches 100; it stops at
/// [`MAX_ACTIVE_PROGRESS`]. With none of these the run is indeterminate
/// and reports 0.
pub fn compute_progress(raw: &RawPipelineStatus, now: DateTime<Utc>) -> f64 {
    match raw.state() {
        Some(PipelineState::Succeeded) => return 100.0,
        Some(PipelineState::Failed) => return 0.0,
        _ => {}
    }

    if let Some(progress) = raw.progress.filter(|value| value.is_finite()) {
        return progress.clamp(0.0, 100.0);
    }

    if let (Some(completed), Some(total)) = (raw.completed_steps, raw.total_steps) {
        if total > 0 {
            return (f64::from(completed) / f64::from(total) * 100.0).clamp(0.0, 100.0);
        }
    }

    if let (Some(start), Some(minutes)) = (raw.start_time, raw.estimated_duration_minutes) {
        if minutes > 0.0 {
            let total_ms = minutes * 60_000.0;
            let elapsed_ms = (now - start).num_milliseconds().max(0) as f64;
            return (elapsed_ms / total_ms * 100.0).min(MAX_ACTIVE_PROGRESS);
        }
    }

    0.0
}

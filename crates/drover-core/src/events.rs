//! Audit-event types appended to the run event log.

use serde::{Deserialize, Serialize};

use crate::types::{Id, PatchState, RunState};

/// Event type names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventType {
    RunCreated,
    RunStarted,
    StepStarted,
    StepFinished,
    StepTimedOut,
    StepRetried,
    RunCompleted,
    RunFailed,
    PatchStateChanged,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RunCreated => "RUN_CREATED",
            Self::RunStarted => "RUN_STARTED",
            Self::StepStarted => "STEP_STARTED",
            Self::StepFinished => "STEP_FINISHED",
            Self::StepTimedOut => "STEP_TIMED_OUT",
            Self::StepRetried => "STEP_RETRIED",
            Self::RunCompleted => "RUN_COMPLETED",
            Self::RunFailed => "RUN_FAILED",
            Self::PatchStateChanged => "PATCH_STATE_CHANGED",
        }
    }
}

/// Payload for RUN_CREATED.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunCreatedPayload {
    pub run_id: Id,
    pub project_id: String,
    pub phase_id: String,
    pub plan_id: Option<String>,
}

/// Payload for RUN_STARTED.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunStartedPayload {
    pub run_id: Id,
}

/// Payload for STEP_STARTED.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepStartedPayload {
    pub step_attempt_id: Id,
    pub step_id: String,
    pub attempt: u32,
    pub tool_id: String,
}

/// Payload for STEP_FINISHED.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepFinishedPayload {
    pub step_attempt_id: Id,
    pub step_id: String,
    pub exit_code: i32,
    pub duration_ms: u64,
}

/// Payload for STEP_TIMED_OUT.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepTimedOutPayload {
    pub step_attempt_id: Id,
    pub step_id: String,
    pub timeout_sec: u64,
}

/// Payload for STEP_RETRIED.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepRetriedPayload {
    pub step_id: String,
    pub attempt: u32,
    pub delay_sec: u64,
    pub reason: String,
}

/// Payload for RUN_COMPLETED.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunCompletedPayload {
    pub run_id: Id,
    pub state: RunState,
}

/// Payload for RUN_FAILED.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunFailedPayload {
    pub run_id: Id,
    pub reason: String,
}

/// Payload for PATCH_STATE_CHANGED.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatchStateChangedPayload {
    pub ledger_id: Id,
    pub patch_id: String,
    pub from: PatchState,
    pub to: PatchState,
    pub reason: String,
}

/// Union type for all event payloads.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EventPayload {
    RunCreated(RunCreatedPayload),
    RunStarted(RunStartedPayload),
    StepStarted(StepStartedPayload),
    StepFinished(StepFinishedPayload),
    StepTimedOut(StepTimedOutPayload),
    StepRetried(StepRetriedPayload),
    RunCompleted(RunCompletedPayload),
    RunFailed(RunFailedPayload),
    PatchStateChanged(PatchStateChangedPayload),
}

impl EventPayload {
    pub fn event_type(&self) -> EventType {
        match self {
            Self::RunCreated(_) => EventType::RunCreated,
            Self::RunStarted(_) => EventType::RunStarted,
            Self::StepStarted(_) => EventType::StepStarted,
            Self::StepFinished(_) => EventType::StepFinished,
            Self::StepTimedOut(_) => EventType::StepTimedOut,
            Self::StepRetried(_) => EventType::StepRetried,
            Self::RunCompleted(_) => EventType::RunCompleted,
            Self::RunFailed(_) => EventType::RunFailed,
            Self::PatchStateChanged(_) => EventType::PatchStateChanged,
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// A persisted event record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: Id,
    pub run_id: Id,
    pub event_type: String,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub payload_json: String,
}

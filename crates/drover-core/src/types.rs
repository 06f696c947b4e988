//! Core entity types for the orchestration engine.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Unique identifier for runs, step attempts, ledger entries, and events.
/// ULID-style: 26 uppercase Crockford base32 characters, lexicographically
/// time-ordered. Generated by the engine, never by the store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Id(pub String);

impl Id {
    pub fn new() -> Self {
        Self(ulid::Ulid::new().to_string())
    }

    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }
}

impl Default for Id {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for Id {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for Id {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

// --- Lifecycle states ---

/// Run lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Pending,
    Running,
    Succeeded,
    Failed,
    Quarantined,
    Canceled,
}

impl RunState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Quarantined => "quarantined",
            Self::Canceled => "canceled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "running" => Some(Self::Running),
            "succeeded" => Some(Self::Succeeded),
            "failed" => Some(Self::Failed),
            "quarantined" => Some(Self::Quarantined),
            "canceled" => Some(Self::Canceled),
            _ => None,
        }
    }
}

/// Step-attempt lifecycle state. Attempts are created already running;
/// every other state is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptState {
    Running,
    Succeeded,
    Failed,
    Canceled,
}

impl AttemptState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Canceled => "canceled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "running" => Some(Self::Running),
            "succeeded" => Some(Self::Succeeded),
            "failed" => Some(Self::Failed),
            "canceled" => Some(Self::Canceled),
            _ => None,
        }
    }
}

/// Patch-ledger lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PatchState {
    Created,
    Validated,
    Queued,
    Applied,
    ApplyFailed,
    Verified,
    Committed,
    RolledBack,
    Quarantined,
    Dropped,
}

impl PatchState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Validated => "validated",
            Self::Queued => "queued",
            Self::Applied => "applied",
            Self::ApplyFailed => "apply_failed",
            Self::Verified => "verified",
            Self::Committed => "committed",
            Self::RolledBack => "rolled_back",
            Self::Quarantined => "quarantined",
            Self::Dropped => "dropped",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "created" => Some(Self::Created),
            "validated" => Some(Self::Validated),
            "queued" => Some(Self::Queued),
            "applied" => Some(Self::Applied),
            "apply_failed" => Some(Self::ApplyFailed),
            "verified" => Some(Self::Verified),
            "committed" => Some(Self::Committed),
            "rolled_back" => Some(Self::RolledBack),
            "quarantined" => Some(Self::Quarantined),
            "dropped" => Some(Self::Dropped),
            _ => None,
        }
    }
}

/// Worker lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    Idle,
    Busy,
    Draining,
    Offline,
}

/// Workstream lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkstreamState {
    Planned,
    Active,
    Merged,
    Abandoned,
}

/// Test-gate lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GateState {
    Pending,
    Running,
    Passed,
    Failed,
}

/// Circuit-breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

/// Task progress flag. Deliberately not a full state machine: tasks carry
/// none of the terminal/retry semantics that runs and patches do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

// --- Core records ---

/// One end-to-end execution of a plan or workstream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    pub id: Id,
    pub project_id: String,
    pub phase_id: String,
    pub workstream_id: Option<String>,
    pub state: RunState,
    pub exit_code: Option<i32>,
    pub error_message: Option<String>,
    /// Open key/value metadata (description, plan id, operator notes).
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
}

impl Run {
    /// Create a new pending run.
    pub fn new(project_id: impl Into<String>, phase_id: impl Into<String>) -> Self {
        Self {
            id: Id::new(),
            project_id: project_id.into(),
            phase_id: phase_id.into(),
            workstream_id: None,
            state: RunState::Pending,
            exit_code: None,
            error_message: None,
            metadata: serde_json::Value::Object(serde_json::Map::new()),
            created_at: Utc::now(),
            started_at: None,
            ended_at: None,
        }
    }
}

/// A persisted record of one execution of a single step within a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepAttempt {
    pub id: Id,
    pub run_id: Id,
    /// Monotonic order within the run.
    pub sequence: u32,
    pub tool_id: String,
    pub state: AttemptState,
    pub exit_code: Option<i32>,
    pub output_patch_id: Option<Id>,
    pub error_log: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
}

/// One entry in a patch ledger entry's append-only state history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateRecord {
    pub state: PatchState,
    pub at: DateTime<Utc>,
    pub reason: String,
}

/// Result of patch validation checks.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ValidationResult {
    pub format_ok: bool,
    pub scope_ok: bool,
    pub constraints_ok: bool,
    #[serde(default)]
    pub errors: Vec<String>,
}

impl ValidationResult {
    pub fn passing() -> Self {
        Self {
            format_ok: true,
            scope_ok: true,
            constraints_ok: true,
            errors: Vec::new(),
        }
    }

    pub fn is_valid(&self) -> bool {
        self.format_ok && self.scope_ok && self.constraints_ok
    }
}

/// Apply bookkeeping for a ledger entry. Attempts accumulate across
/// apply calls; the error fields hold only the most recent failure.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ApplyRecord {
    pub attempts: u32,
    pub workspace_path: Option<String>,
    #[serde(default)]
    pub applied_files: Vec<String>,
    pub last_error_code: Option<String>,
    pub last_error_message: Option<String>,
    pub last_attempt_at: Option<DateTime<Utc>>,
}

/// Quarantine metadata recorded when an entry is quarantined.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuarantineRecord {
    pub reason: String,
    pub path: Option<String>,
    pub at: DateTime<Utc>,
}

/// Full lifecycle record for one proposed patch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatchLedgerEntry {
    pub ledger_id: Id,
    pub patch_id: String,
    pub project_id: String,
    pub phase_id: Option<String>,
    pub workstream_id: Option<String>,
    pub execution_request_id: Option<String>,
    pub state: PatchState,
    /// Append-only; one record per transition, including creation.
    pub state_history: Vec<StateRecord>,
    pub validation: Option<ValidationResult>,
    pub apply: ApplyRecord,
    pub quarantine: Option<QuarantineRecord>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Immutable audit record of one routing call. Appended to the decision
/// log on every call, including calls that select no tool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingDecision {
    pub timestamp: DateTime<Utc>,
    pub task_kind: String,
    pub selected_tool: Option<String>,
    /// Strategy that produced the selection ("fixed", "round_robin",
    /// "metrics", "fallback", or "none").
    pub strategy: String,
    pub rule_id: Option<String>,
    pub risk_tier: Option<String>,
    pub complexity: Option<String>,
    pub domain: Option<String>,
}

/// A unit of routable, executable work with declared dependencies.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    /// Capability tag used for routing (e.g. "code_edit").
    pub kind: String,
    #[serde(default)]
    pub depends_on: BTreeSet<String>,
    pub status: TaskStatus,
    pub selected_tool: Option<String>,
    /// Open hints: description, constraints, risk/complexity/domain.
    #[serde(default)]
    pub metadata: BTreeMap<String, serde_json::Value>,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
}

impl Task {
    pub fn new(id: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind: kind.into(),
            depends_on: BTreeSet::new(),
            status: TaskStatus::Pending,
            selected_tool: None,
            metadata: BTreeMap::new(),
            result: None,
            error: None,
        }
    }

    pub fn with_dependencies<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.depends_on = deps.into_iter().map(Into::into).collect();
        self
    }

    /// String-valued metadata accessor used for routing hints.
    pub fn hint(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).and_then(|v| v.as_str())
    }
}

// --- Tool collaborator contract ---

/// Request handed to the external tool collaborator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolRequest {
    pub task_kind: String,
    pub tool_id: String,
    pub command: String,
    pub prompt: Option<String>,
    pub constraints: Option<serde_json::Value>,
    pub timeout_seconds: u32,
}

/// Outcome returned by the external tool collaborator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolOutcome {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub output_artifact_id: Option<Id>,
    pub error_message: Option<String>,
}

impl ToolOutcome {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

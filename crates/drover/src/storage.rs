//! SQLite persistence for runs, step attempts, events, and the patch
//! ledger.
//!
//! State updates are validated through the lifecycle machines before
//! they touch the database, so an illegal transition is never persisted.

use std::path::Path;

use chrono::{DateTime, Utc};
use drover_core::machine::{patch_machine, run_machine, step_attempt_machine};
use drover_core::{
    ApplyRecord, AttemptState, Event, EventPayload, Id, PatchLedgerEntry, PatchState,
    QuarantineRecord, Run, RunState, StateRecord, StepAttempt, TransitionError, ValidationResult,
};
use sqlx::{sqlite::SqlitePoolOptions, Pool, Sqlite};
use thiserror::Error;

/// Explicit column list for runs table queries.
/// Using explicit columns instead of SELECT * ensures correct mapping
/// regardless of column order in the database (important for ALTER TABLE migrations).
const RUNS_COLUMNS: &str = "run_id, project_id, phase_id, workstream_id, state, exit_code, \
    error_message, metadata_json, created_at, started_at, ended_at";

const STEP_ATTEMPTS_COLUMNS: &str = "step_attempt_id, run_id, sequence, tool_id, state, \
    exit_code, output_patch_id, error_log, started_at, ended_at";

const PATCH_LEDGER_COLUMNS: &str = "ledger_id, patch_id, project_id, phase_id, workstream_id, \
    execution_request_id, state, state_history_json, validation_json, apply_json, \
    quarantine_json, created_at, updated_at";

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("run not found: {0}")]
    RunNotFound(String),
    #[error("step attempt not found: {0}")]
    AttemptNotFound(String),
    #[error("ledger entry not found: {0}")]
    LedgerEntryNotFound(String),
    #[error("rejected transition: {0}")]
    Transition(#[from] TransitionError),
    #[error("unknown state in database: {0}")]
    UnknownState(String),
}

pub type Result<T> = std::result::Result<T, StorageError>;

/// Storage backend for the engine.
pub struct Storage {
    pool: Pool<Sqlite>,
}

impl Storage {
    /// Create a new storage instance with the given database path.
    pub async fn new(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).ok();
        }

        let db_url = format!("sqlite://{}?mode=rwc", db_path.display());
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(&db_url)
            .await?;

        // Enable WAL mode
        sqlx::query("PRAGMA journal_mode = WAL")
            .execute(&pool)
            .await?;

        Ok(Self { pool })
    }

    /// Run embedded migrations (compiled into the binary).
    pub async fn migrate_embedded(&self) -> Result<()> {
        let migrations = [include_str!("../../../migrations/0001_init.sql")];

        for migration_sql in migrations {
            // Remove comment lines before splitting.
            let cleaned: String = migration_sql
                .lines()
                .filter(|line| !line.trim().starts_with("--"))
                .collect::<Vec<_>>()
                .join("\n");

            for statement in cleaned.split(';') {
                let trimmed = statement.trim();
                if !trimmed.is_empty() {
                    match sqlx::query(trimmed).execute(&self.pool).await {
                        Ok(_) => {}
                        Err(e) => {
                            let msg = e.to_string();
                            // Ignore expected idempotent errors (duplicate column, table exists).
                            if !msg.contains("duplicate column") && !msg.contains("already exists")
                            {
                                return Err(e.into());
                            }
                        }
                    }
                }
            }
        }
        Ok(())
    }

    // --- Run operations ---

    /// Insert a new run.
    pub async fn insert_run(&self, run: &Run) -> Result<()> {
        let metadata_json = serde_json::to_string(&run.metadata)?;

        sqlx::query(
            r#"
            INSERT INTO runs (run_id, project_id, phase_id, workstream_id, state, exit_code,
                              error_message, metadata_json, created_at, started_at, ended_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
            "#,
        )
        .bind(run.id.as_ref())
        .bind(&run.project_id)
        .bind(&run.phase_id)
        .bind(&run.workstream_id)
        .bind(run.state.as_str())
        .bind(run.exit_code)
        .bind(&run.error_message)
        .bind(&metadata_json)
        .bind(run.created_at.timestamp_millis())
        .bind(run.started_at.map(|t| t.timestamp_millis()))
        .bind(run.ended_at.map(|t| t.timestamp_millis()))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Get a run by ID.
    pub async fn get_run(&self, id: &Id) -> Result<Run> {
        let query = format!("SELECT {RUNS_COLUMNS} FROM runs WHERE run_id = ?1");
        let row = sqlx::query_as::<_, RunRow>(&query)
            .bind(id.as_ref())
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StorageError::RunNotFound(id.to_string()))?;

        row.into_run()
    }

    /// List runs for a project, newest first.
    pub async fn list_runs(&self, project_id: Option<&str>) -> Result<Vec<Run>> {
        let rows = match project_id {
            Some(project) => {
                let query = format!(
                    "SELECT {RUNS_COLUMNS} FROM runs WHERE project_id = ?1 ORDER BY created_at DESC"
                );
                sqlx::query_as::<_, RunRow>(&query)
                    .bind(project)
                    .fetch_all(&self.pool)
                    .await?
            }
            None => {
                let query = format!("SELECT {RUNS_COLUMNS} FROM runs ORDER BY created_at DESC");
                sqlx::query_as::<_, RunRow>(&query)
                    .fetch_all(&self.pool)
                    .await?
            }
        };

        rows.into_iter().map(|r| r.into_run()).collect()
    }

    /// Update run state, validating the transition against the run
    /// lifecycle first. `started_at` is stamped on entering `running`,
    /// `ended_at` on entering any terminal state.
    pub async fn update_run_state(&self, id: &Id, to: RunState) -> Result<()> {
        let current = self.get_run(id).await?;
        let machine = run_machine();
        machine.validate_transition(current.state, to)?;

        let now = Utc::now().timestamp_millis();
        let started_at = if to == RunState::Running {
            Some(now)
        } else {
            current.started_at.map(|t| t.timestamp_millis())
        };
        // `failed` is non-terminal (it may still move to `quarantined`),
        // but it still marks the end of execution, so it gets `ended_at`
        // like the terminal states do.
        let ended_at = if machine.is_terminal(to) || to == RunState::Failed {
            Some(now)
        } else {
            current.ended_at.map(|t| t.timestamp_millis())
        };

        let result = sqlx::query(
            "UPDATE runs SET state = ?1, started_at = ?2, ended_at = ?3 WHERE run_id = ?4",
        )
        .bind(to.as_str())
        .bind(started_at)
        .bind(ended_at)
        .bind(id.as_ref())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StorageError::RunNotFound(id.to_string()));
        }
        Ok(())
    }

    /// Record the final outcome fields on a run without changing state.
    pub async fn update_run_outcome(
        &self,
        id: &Id,
        exit_code: Option<i32>,
        error_message: Option<&str>,
    ) -> Result<()> {
        let result =
            sqlx::query("UPDATE runs SET exit_code = ?1, error_message = ?2 WHERE run_id = ?3")
                .bind(exit_code)
                .bind(error_message)
                .bind(id.as_ref())
                .execute(&self.pool)
                .await?;

        if result.rows_affected() == 0 {
            return Err(StorageError::RunNotFound(id.to_string()));
        }
        Ok(())
    }

    // --- Step attempt operations ---

    /// Insert a new step attempt.
    pub async fn insert_step_attempt(&self, attempt: &StepAttempt) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO step_attempts (step_attempt_id, run_id, sequence, tool_id, state,
                                       exit_code, output_patch_id, error_log, started_at, ended_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
            "#,
        )
        .bind(attempt.id.as_ref())
        .bind(attempt.run_id.as_ref())
        .bind(attempt.sequence as i64)
        .bind(&attempt.tool_id)
        .bind(attempt.state.as_str())
        .bind(attempt.exit_code)
        .bind(attempt.output_patch_id.as_ref().map(|p| p.as_ref()))
        .bind(&attempt.error_log)
        .bind(attempt.started_at.map(|t| t.timestamp_millis()))
        .bind(attempt.ended_at.map(|t| t.timestamp_millis()))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Get a step attempt by ID.
    pub async fn get_step_attempt(&self, id: &Id) -> Result<StepAttempt> {
        let query =
            format!("SELECT {STEP_ATTEMPTS_COLUMNS} FROM step_attempts WHERE step_attempt_id = ?1");
        let row = sqlx::query_as::<_, StepAttemptRow>(&query)
            .bind(id.as_ref())
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StorageError::AttemptNotFound(id.to_string()))?;

        row.into_attempt()
    }

    /// List step attempts for a run in sequence order.
    pub async fn list_step_attempts(&self, run_id: &Id) -> Result<Vec<StepAttempt>> {
        let query = format!(
            "SELECT {STEP_ATTEMPTS_COLUMNS} FROM step_attempts WHERE run_id = ?1 ORDER BY sequence ASC"
        );
        let rows = sqlx::query_as::<_, StepAttemptRow>(&query)
            .bind(run_id.as_ref())
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter().map(|r| r.into_attempt()).collect()
    }

    /// Finish a step attempt: validate the transition, stamp `ended_at`,
    /// and record the outcome fields.
    pub async fn finish_step_attempt(
        &self,
        id: &Id,
        to: AttemptState,
        exit_code: Option<i32>,
        output_patch_id: Option<&Id>,
        error_log: Option<&str>,
    ) -> Result<()> {
        let current = self.get_step_attempt(id).await?;
        step_attempt_machine().validate_transition(current.state, to)?;

        let now = Utc::now().timestamp_millis();
        let result = sqlx::query(
            "UPDATE step_attempts SET state = ?1, exit_code = ?2, output_patch_id = ?3, \
             error_log = ?4, ended_at = ?5 WHERE step_attempt_id = ?6",
        )
        .bind(to.as_str())
        .bind(exit_code)
        .bind(output_patch_id.map(|p| p.as_ref()))
        .bind(error_log)
        .bind(now)
        .bind(id.as_ref())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StorageError::AttemptNotFound(id.to_string()));
        }
        Ok(())
    }

    /// Next sequence number for a run's step attempts, starting at 1.
    pub async fn next_attempt_sequence(&self, run_id: &Id) -> Result<u32> {
        let max: (Option<i64>,) =
            sqlx::query_as("SELECT MAX(sequence) FROM step_attempts WHERE run_id = ?1")
                .bind(run_id.as_ref())
                .fetch_one(&self.pool)
                .await?;
        Ok(max.0.unwrap_or(0) as u32 + 1)
    }

    // --- Event operations ---

    /// Append an event to the audit log.
    pub async fn append_event(&self, run_id: &Id, payload: &EventPayload) -> Result<Event> {
        let id = Id::new();
        let now = Utc::now();
        let event_type = payload.event_type().as_str().to_string();
        let payload_json = payload.to_json()?;

        sqlx::query(
            "INSERT INTO events (id, run_id, type, ts, payload_json) VALUES (?1, ?2, ?3, ?4, ?5)",
        )
        .bind(id.as_ref())
        .bind(run_id.as_ref())
        .bind(&event_type)
        .bind(now.timestamp_millis())
        .bind(&payload_json)
        .execute(&self.pool)
        .await?;

        Ok(Event {
            id,
            run_id: run_id.clone(),
            event_type,
            timestamp: now,
            payload_json,
        })
    }

    /// List events for a run in append order.
    pub async fn list_events(&self, run_id: &Id) -> Result<Vec<Event>> {
        let rows = sqlx::query_as::<_, EventRow>(
            "SELECT id, run_id, type, ts, payload_json FROM events WHERE run_id = ?1 ORDER BY ts ASC, id ASC",
        )
        .bind(run_id.as_ref())
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(|r| r.into_event()).collect())
    }

    // --- Patch ledger operations ---

    /// Insert a new ledger entry.
    pub async fn insert_ledger_entry(&self, entry: &PatchLedgerEntry) -> Result<()> {
        let state_history_json = serde_json::to_string(&entry.state_history)?;
        let validation_json = entry
            .validation
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        let apply_json = serde_json::to_string(&entry.apply)?;
        let quarantine_json = entry
            .quarantine
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        sqlx::query(
            r#"
            INSERT INTO patch_ledger (ledger_id, patch_id, project_id, phase_id, workstream_id,
                                      execution_request_id, state, state_history_json,
                                      validation_json, apply_json, quarantine_json,
                                      created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
            "#,
        )
        .bind(entry.ledger_id.as_ref())
        .bind(&entry.patch_id)
        .bind(&entry.project_id)
        .bind(&entry.phase_id)
        .bind(&entry.workstream_id)
        .bind(&entry.execution_request_id)
        .bind(entry.state.as_str())
        .bind(&state_history_json)
        .bind(&validation_json)
        .bind(&apply_json)
        .bind(&quarantine_json)
        .bind(entry.created_at.timestamp_millis())
        .bind(entry.updated_at.timestamp_millis())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Get a ledger entry by ID.
    pub async fn get_ledger_entry(&self, id: &Id) -> Result<PatchLedgerEntry> {
        let query = format!("SELECT {PATCH_LEDGER_COLUMNS} FROM patch_ledger WHERE ledger_id = ?1");
        let row = sqlx::query_as::<_, PatchLedgerRow>(&query)
            .bind(id.as_ref())
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StorageError::LedgerEntryNotFound(id.to_string()))?;

        row.into_entry()
    }

    /// List ledger entries, optionally scoped to a project, newest first.
    pub async fn list_ledger_entries(
        &self,
        project_id: Option<&str>,
    ) -> Result<Vec<PatchLedgerEntry>> {
        let rows = match project_id {
            Some(project) => {
                let query = format!(
                    "SELECT {PATCH_LEDGER_COLUMNS} FROM patch_ledger WHERE project_id = ?1 \
                     ORDER BY created_at DESC, ledger_id DESC"
                );
                sqlx::query_as::<_, PatchLedgerRow>(&query)
                    .bind(project)
                    .fetch_all(&self.pool)
                    .await?
            }
            None => {
                let query = format!(
                    "SELECT {PATCH_LEDGER_COLUMNS} FROM patch_ledger \
                     ORDER BY created_at DESC, ledger_id DESC"
                );
                sqlx::query_as::<_, PatchLedgerRow>(&query)
                    .fetch_all(&self.pool)
                    .await?
            }
        };

        rows.into_iter().map(|r| r.into_entry()).collect()
    }

    /// Persist a full ledger entry after a transition. The caller (the
    /// ledger module) has already validated the transition through the
    /// patch machine; this re-checks against the stored state so a stale
    /// in-memory copy cannot skip states.
    pub async fn update_ledger_entry(&self, entry: &PatchLedgerEntry) -> Result<()> {
        let stored = self.get_ledger_entry(&entry.ledger_id).await?;
        if stored.state != entry.state {
            patch_machine().validate_transition(stored.state, entry.state)?;
        }

        let state_history_json = serde_json::to_string(&entry.state_history)?;
        let validation_json = entry
            .validation
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        let apply_json = serde_json::to_string(&entry.apply)?;
        let quarantine_json = entry
            .quarantine
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        let result = sqlx::query(
            "UPDATE patch_ledger SET state = ?1, state_history_json = ?2, validation_json = ?3, \
             apply_json = ?4, quarantine_json = ?5, updated_at = ?6 WHERE ledger_id = ?7",
        )
        .bind(entry.state.as_str())
        .bind(&state_history_json)
        .bind(&validation_json)
        .bind(&apply_json)
        .bind(&quarantine_json)
        .bind(entry.updated_at.timestamp_millis())
        .bind(entry.ledger_id.as_ref())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StorageError::LedgerEntryNotFound(entry.ledger_id.to_string()));
        }
        Ok(())
    }
}

// --- Row types for SQLx ---

#[derive(sqlx::FromRow)]
struct RunRow {
    run_id: String,
    project_id: String,
    phase_id: String,
    workstream_id: Option<String>,
    state: String,
    exit_code: Option<i32>,
    error_message: Option<String>,
    metadata_json: String,
    created_at: i64,
    started_at: Option<i64>,
    ended_at: Option<i64>,
}

impl RunRow {
    fn into_run(self) -> Result<Run> {
        let state =
            RunState::parse(&self.state).ok_or_else(|| StorageError::UnknownState(self.state))?;
        let metadata = serde_json::from_str(&self.metadata_json)?;

        Ok(Run {
            id: Id::from_string(self.run_id),
            project_id: self.project_id,
            phase_id: self.phase_id,
            workstream_id: self.workstream_id,
            state,
            exit_code: self.exit_code,
            error_message: self.error_message,
            metadata,
            created_at: DateTime::from_timestamp_millis(self.created_at).unwrap_or_default(),
            started_at: self.started_at.and_then(DateTime::from_timestamp_millis),
            ended_at: self.ended_at.and_then(DateTime::from_timestamp_millis),
        })
    }
}

#[derive(sqlx::FromRow)]
struct StepAttemptRow {
    step_attempt_id: String,
    run_id: String,
    sequence: i64,
    tool_id: String,
    state: String,
    exit_code: Option<i32>,
    output_patch_id: Option<String>,
    error_log: Option<String>,
    started_at: Option<i64>,
    ended_at: Option<i64>,
}

impl StepAttemptRow {
    fn into_attempt(self) -> Result<StepAttempt> {
        let state = AttemptState::parse(&self.state)
            .ok_or_else(|| StorageError::UnknownState(self.state))?;

        Ok(StepAttempt {
            id: Id::from_string(self.step_attempt_id),
            run_id: Id::from_string(self.run_id),
            sequence: self.sequence as u32,
            tool_id: self.tool_id,
            state,
            exit_code: self.exit_code,
            output_patch_id: self.output_patch_id.map(Id::from_string),
            error_log: self.error_log,
            started_at: self.started_at.and_then(DateTime::from_timestamp_millis),
            ended_at: self.ended_at.and_then(DateTime::from_timestamp_millis),
        })
    }
}

#[derive(sqlx::FromRow)]
struct EventRow {
    id: String,
    run_id: String,
    #[sqlx(rename = "type")]
    event_type: String,
    ts: i64,
    payload_json: String,
}

impl EventRow {
    fn into_event(self) -> Event {
        Event {
            id: Id::from_string(self.id),
            run_id: Id::from_string(self.run_id),
            event_type: self.event_type,
            timestamp: DateTime::from_timestamp_millis(self.ts).unwrap_or_default(),
            payload_json: self.payload_json,
        }
    }
}

#[derive(sqlx::FromRow)]
struct PatchLedgerRow {
    ledger_id: String,
    patch_id: String,
    project_id: String,
    phase_id: Option<String>,
    workstream_id: Option<String>,
    execution_request_id: Option<String>,
    state: String,
    state_history_json: String,
    validation_json: Option<String>,
    apply_json: String,
    quarantine_json: Option<String>,
    created_at: i64,
    updated_at: i64,
}

impl PatchLedgerRow {
    fn into_entry(self) -> Result<PatchLedgerEntry> {
        let state = PatchState::parse(&self.state)
            .ok_or_else(|| StorageError::UnknownState(self.state))?;
        let state_history: Vec<StateRecord> = serde_json::from_str(&self.state_history_json)?;
        let validation: Option<ValidationResult> = self
            .validation_json
            .as_deref()
            .map(serde_json::from_str)
            .transpose()?;
        let apply: ApplyRecord = serde_json::from_str(&self.apply_json)?;
        let quarantine: Option<QuarantineRecord> = self
            .quarantine_json
            .as_deref()
            .map(serde_json::from_str)
            .transpose()?;

        Ok(PatchLedgerEntry {
            ledger_id: Id::from_string(self.ledger_id),
            patch_id: self.patch_id,
            project_id: self.project_id,
            phase_id: self.phase_id,
            workstream_id: self.workstream_id,
            execution_request_id: self.execution_request_id,
            state,
            state_history,
            validation,
            apply,
            quarantine,
            created_at: DateTime::from_timestamp_millis(self.created_at).unwrap_or_default(),
            updated_at: DateTime::from_timestamp_millis(self.updated_at).unwrap_or_default(),
        })
    }
}

//! Patch lifecycle tracking.
//!
//! Every proposed code change gets a ledger entry that moves through
//! created -> validated -> queued -> applied -> verified -> committed,
//! with rollback, quarantine, and drop as escape hatches. Each operation
//! validates the transition against the patch machine before mutating,
//! appends a record to the entry's state history, and persists the
//! updated entry.

use std::sync::Arc;

use chrono::Utc;
use drover_core::machine::patch_machine;
use drover_core::{
    Id, PatchLedgerEntry, PatchState, QuarantineRecord, StateRecord, TransitionError,
    ValidationResult,
};
use thiserror::Error;
use tracing::info;

use crate::storage::{Storage, StorageError};

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("rejected transition: {0}")]
    Transition(#[from] TransitionError),
    #[error("cannot queue patch from state {0}")]
    CannotQueue(&'static str),
}

pub type Result<T> = std::result::Result<T, LedgerError>;

/// Parameters for a new ledger entry.
#[derive(Debug, Clone)]
pub struct NewPatch {
    pub patch_id: String,
    pub project_id: String,
    pub phase_id: Option<String>,
    pub workstream_id: Option<String>,
    pub execution_request_id: Option<String>,
    pub validation: Option<ValidationResult>,
}

impl NewPatch {
    pub fn new(patch_id: impl Into<String>, project_id: impl Into<String>) -> Self {
        Self {
            patch_id: patch_id.into(),
            project_id: project_id.into(),
            phase_id: None,
            workstream_id: None,
            execution_request_id: None,
            validation: None,
        }
    }
}

/// Conjunctive filter for `list_entries`. Empty filter matches all.
#[derive(Debug, Clone, Default)]
pub struct LedgerFilter {
    pub project_id: Option<String>,
    pub state: Option<PatchState>,
    pub workstream_id: Option<String>,
}

/// Patch ledger over persistent storage.
pub struct PatchLedger {
    storage: Arc<Storage>,
}

impl PatchLedger {
    pub fn new(storage: Arc<Storage>) -> Self {
        Self { storage }
    }

    /// Create an entry in `created` with a seeded history record.
    pub async fn create_entry(&self, new: NewPatch) -> Result<PatchLedgerEntry> {
        let now = Utc::now();
        let entry = PatchLedgerEntry {
            ledger_id: Id::new(),
            patch_id: new.patch_id,
            project_id: new.project_id,
            phase_id: new.phase_id,
            workstream_id: new.workstream_id,
            execution_request_id: new.execution_request_id,
            state: PatchState::Created,
            state_history: vec![StateRecord {
                state: PatchState::Created,
                at: now,
                reason: "Initial creation".to_string(),
            }],
            validation: new.validation,
            apply: Default::default(),
            quarantine: None,
            created_at: now,
            updated_at: now,
        };

        self.storage.insert_ledger_entry(&entry).await?;
        info!(ledger_id = %entry.ledger_id, patch_id = %entry.patch_id, "ledger entry created");
        Ok(entry)
    }

    pub async fn get_entry(&self, ledger_id: &Id) -> Result<PatchLedgerEntry> {
        Ok(self.storage.get_ledger_entry(ledger_id).await?)
    }

    /// Record a validation outcome: `validated` when all checks pass,
    /// `apply_failed` otherwise.
    pub async fn validate_patch(
        &self,
        ledger_id: &Id,
        validation: ValidationResult,
    ) -> Result<PatchLedgerEntry> {
        let target = if validation.is_valid() {
            PatchState::Validated
        } else {
            PatchState::ApplyFailed
        };
        let reason = if validation.is_valid() {
            "Validation passed".to_string()
        } else {
            format!("Validation failed: {}", validation.errors.join("; "))
        };

        self.transition(ledger_id, target, reason, |entry| {
            entry.validation = Some(validation.clone());
        })
        .await
    }

    /// Queue a validated patch for application. Only `validated` entries
    /// may be queued.
    pub async fn queue_patch(&self, ledger_id: &Id) -> Result<PatchLedgerEntry> {
        let entry = self.storage.get_ledger_entry(ledger_id).await?;
        if entry.state != PatchState::Validated {
            return Err(LedgerError::CannotQueue(entry.state.as_str()));
        }
        self.transition(ledger_id, PatchState::Queued, "Queued for apply".to_string(), |_| {})
            .await
    }

    /// Put a failed apply back in the queue for another attempt. Only
    /// `apply_failed` entries may be requeued.
    pub async fn requeue_patch(&self, ledger_id: &Id) -> Result<PatchLedgerEntry> {
        let entry = self.storage.get_ledger_entry(ledger_id).await?;
        if entry.state != PatchState::ApplyFailed {
            return Err(LedgerError::CannotQueue(entry.state.as_str()));
        }
        self.transition(
            ledger_id,
            PatchState::Queued,
            "Requeued after failed apply".to_string(),
            |_| {},
        )
        .await
    }

    /// Record an apply attempt. The attempt counter and `last_attempt_at`
    /// advance regardless of outcome; error fields hold only the most
    /// recent failure.
    #[allow(clippy::too_many_arguments)]
    pub async fn apply_patch(
        &self,
        ledger_id: &Id,
        success: bool,
        workspace_path: Option<String>,
        applied_files: Vec<String>,
        error_code: Option<String>,
        error_message: Option<String>,
    ) -> Result<PatchLedgerEntry> {
        let target = if success {
            PatchState::Applied
        } else {
            PatchState::ApplyFailed
        };
        let reason = if success {
            "Apply succeeded".to_string()
        } else {
            format!(
                "Apply failed: {}",
                error_message.as_deref().unwrap_or("unknown error")
            )
        };

        self.transition(ledger_id, target, reason, |entry| {
            entry.apply.attempts += 1;
            entry.apply.last_attempt_at = Some(Utc::now());
            if success {
                entry.apply.workspace_path = workspace_path.clone();
                entry.apply.applied_files = applied_files.clone();
            } else {
                entry.apply.last_error_code = error_code.clone();
                entry.apply.last_error_message = error_message.clone();
            }
        })
        .await
    }

    /// Record a verification outcome: `verified` when the tests passed,
    /// `apply_failed` otherwise.
    pub async fn verify_patch(
        &self,
        ledger_id: &Id,
        tests_passed: bool,
    ) -> Result<PatchLedgerEntry> {
        let (target, reason) = if tests_passed {
            (PatchState::Verified, "Verification passed")
        } else {
            (PatchState::ApplyFailed, "Verification failed")
        };
        self.transition(ledger_id, target, reason.to_string(), |_| {})
            .await
    }

    /// Commit a verified patch. Any other source state is rejected by
    /// the patch machine.
    pub async fn commit_patch(&self, ledger_id: &Id) -> Result<PatchLedgerEntry> {
        self.transition(ledger_id, PatchState::Committed, "Committed".to_string(), |_| {})
            .await
    }

    /// Roll back an applied or verified patch.
    pub async fn rollback_patch(&self, ledger_id: &Id, reason: &str) -> Result<PatchLedgerEntry> {
        self.transition(
            ledger_id,
            PatchState::RolledBack,
            format!("Rolled back: {reason}"),
            |_| {},
        )
        .await
    }

    /// Quarantine an entry from any non-terminal state, recording why and
    /// where the patch artifact was moved.
    pub async fn quarantine_patch(
        &self,
        ledger_id: &Id,
        reason: &str,
        quarantine_path: Option<String>,
    ) -> Result<PatchLedgerEntry> {
        let record = QuarantineRecord {
            reason: reason.to_string(),
            path: quarantine_path,
            at: Utc::now(),
        };
        self.transition(
            ledger_id,
            PatchState::Quarantined,
            format!("Quarantined: {reason}"),
            |entry| entry.quarantine = Some(record.clone()),
        )
        .await
    }

    /// Drop an entry from any non-terminal state, quarantined included.
    pub async fn drop_patch(&self, ledger_id: &Id, reason: &str) -> Result<PatchLedgerEntry> {
        self.transition(
            ledger_id,
            PatchState::Dropped,
            format!("Dropped: {reason}"),
            |_| {},
        )
        .await
    }

    /// List entries matching the filter, newest first.
    pub async fn list_entries(&self, filter: &LedgerFilter) -> Result<Vec<PatchLedgerEntry>> {
        let entries = self
            .storage
            .list_ledger_entries(filter.project_id.as_deref())
            .await?;

        Ok(entries
            .into_iter()
            .filter(|entry| {
                filter.state.is_none_or(|state| entry.state == state)
                    && filter
                        .workstream_id
                        .as_deref()
                        .is_none_or(|ws| entry.workstream_id.as_deref() == Some(ws))
            })
            .collect())
    }

    /// Shared transition path: validate against the machine, apply the
    /// entry mutation, append the history record, persist.
    async fn transition(
        &self,
        ledger_id: &Id,
        to: PatchState,
        reason: String,
        mutate: impl FnOnce(&mut PatchLedgerEntry),
    ) -> Result<PatchLedgerEntry> {
        let mut entry = self.storage.get_ledger_entry(ledger_id).await?;
        patch_machine().validate_transition(entry.state, to)?;

        let from = entry.state;
        let now = Utc::now();
        mutate(&mut entry);
        entry.state = to;
        entry.state_history.push(StateRecord {
            state: to,
            at: now,
            reason: reason.clone(),
        });
        entry.updated_at = now;

        self.storage.update_ledger_entry(&entry).await?;
        info!(
            ledger_id = %entry.ledger_id,
            from = from.as_str(),
            to = to.as_str(),
            reason = %reason,
            "patch transition"
        );
        Ok(entry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    struct TestLedger {
        ledger: PatchLedger,
        _dir: TempDir,
    }

    async fn create_test_ledger() -> TestLedger {
        let dir = TempDir::new().unwrap();
        let storage = Storage::new(&dir.path().join("test.db")).await.unwrap();
        storage.migrate_embedded().await.unwrap();
        TestLedger {
            ledger: PatchLedger::new(Arc::new(storage)),
            _dir: dir,
        }
    }

    #[tokio::test]
    async fn new_entry_seeds_history() {
        let tl = create_test_ledger().await;
        let entry = tl
            .ledger
            .create_entry(NewPatch::new("patch-1", "proj-a"))
            .await
            .unwrap();

        assert_eq!(entry.state, PatchState::Created);
        assert_eq!(entry.state_history.len(), 1);
        assert_eq!(entry.state_history[0].state, PatchState::Created);
        assert_eq!(entry.state_history[0].reason, "Initial creation");
    }

    #[tokio::test]
    async fn happy_path_reaches_committed() {
        let tl = create_test_ledger().await;
        let entry = tl
            .ledger
            .create_entry(NewPatch::new("patch-1", "proj-a"))
            .await
            .unwrap();
        let id = entry.ledger_id;

        tl.ledger
            .validate_patch(&id, ValidationResult::passing())
            .await
            .unwrap();
        tl.ledger.queue_patch(&id).await.unwrap();
        tl.ledger
            .apply_patch(&id, true, Some("/ws".to_string()), vec!["a.rs".to_string()], None, None)
            .await
            .unwrap();
        tl.ledger.verify_patch(&id, true).await.unwrap();
        let done = tl.ledger.commit_patch(&id).await.unwrap();

        assert_eq!(done.state, PatchState::Committed);
        // created + validated + queued + applied + verified + committed.
        assert_eq!(done.state_history.len(), 6);
        assert_eq!(done.apply.attempts, 1);
        assert_eq!(done.apply.applied_files, vec!["a.rs".to_string()]);
    }

    #[tokio::test]
    async fn failed_validation_lands_in_apply_failed() {
        let tl = create_test_ledger().await;
        let entry = tl
            .ledger
            .create_entry(NewPatch::new("patch-1", "proj-a"))
            .await
            .unwrap();

        let result = ValidationResult {
            format_ok: true,
            scope_ok: false,
            constraints_ok: true,
            errors: vec!["touches file outside scope".to_string()],
        };
        let updated = tl
            .ledger
            .validate_patch(&entry.ledger_id, result)
            .await
            .unwrap();

        assert_eq!(updated.state, PatchState::ApplyFailed);
        assert!(updated.state_history[1].reason.contains("outside scope"));
    }

    #[tokio::test]
    async fn queue_requires_validated() {
        let tl = create_test_ledger().await;
        let entry = tl
            .ledger
            .create_entry(NewPatch::new("patch-1", "proj-a"))
            .await
            .unwrap();

        let err = tl.ledger.queue_patch(&entry.ledger_id).await.unwrap_err();
        assert!(matches!(err, LedgerError::CannotQueue("created")));
    }

    #[tokio::test]
    async fn apply_attempts_accumulate_across_retries() {
        let tl = create_test_ledger().await;
        let entry = tl
            .ledger
            .create_entry(NewPatch::new("patch-1", "proj-a"))
            .await
            .unwrap();
        let id = entry.ledger_id;

        tl.ledger
            .validate_patch(&id, ValidationResult::passing())
            .await
            .unwrap();
        tl.ledger.queue_patch(&id).await.unwrap();

        // First apply fails.
        let failed = tl
            .ledger
            .apply_patch(
                &id,
                false,
                None,
                vec![],
                Some("CONFLICT".to_string()),
                Some("hunk mismatch".to_string()),
            )
            .await
            .unwrap();
        assert_eq!(failed.state, PatchState::ApplyFailed);
        assert_eq!(failed.apply.attempts, 1);
        assert_eq!(failed.apply.last_error_code.as_deref(), Some("CONFLICT"));

        // Requeue and succeed; attempts keep counting.
        tl.ledger.requeue_patch(&id).await.unwrap();
        let applied = tl
            .ledger
            .apply_patch(&id, true, Some("/ws".to_string()), vec![], None, None)
            .await
            .unwrap();
        assert_eq!(applied.state, PatchState::Applied);
        assert_eq!(applied.apply.attempts, 2);
        assert!(applied.apply.last_attempt_at.is_some());
    }

    #[tokio::test]
    async fn commit_from_non_verified_is_invalid_transition() {
        let tl = create_test_ledger().await;
        let entry = tl
            .ledger
            .create_entry(NewPatch::new("patch-1", "proj-a"))
            .await
            .unwrap();

        let err = tl.ledger.commit_patch(&entry.ledger_id).await.unwrap_err();
        assert!(matches!(err, LedgerError::Transition(_)));
    }

    #[tokio::test]
    async fn failed_verification_returns_to_apply_failed() {
        let tl = create_test_ledger().await;
        let entry = tl
            .ledger
            .create_entry(NewPatch::new("patch-1", "proj-a"))
            .await
            .unwrap();
        let id = entry.ledger_id;

        tl.ledger
            .validate_patch(&id, ValidationResult::passing())
            .await
            .unwrap();
        tl.ledger.queue_patch(&id).await.unwrap();
        tl.ledger
            .apply_patch(&id, true, None, vec![], None, None)
            .await
            .unwrap();

        let updated = tl.ledger.verify_patch(&id, false).await.unwrap();
        assert_eq!(updated.state, PatchState::ApplyFailed);
    }

    #[tokio::test]
    async fn quarantine_records_metadata_and_allows_drop() {
        let tl = create_test_ledger().await;
        let entry = tl
            .ledger
            .create_entry(NewPatch::new("patch-1", "proj-a"))
            .await
            .unwrap();
        let id = entry.ledger_id;

        let quarantined = tl
            .ledger
            .quarantine_patch(&id, "suspicious diff", Some("/quarantine/patch-1".to_string()))
            .await
            .unwrap();
        assert_eq!(quarantined.state, PatchState::Quarantined);
        let record = quarantined.quarantine.unwrap();
        assert_eq!(record.reason, "suspicious diff");
        assert_eq!(record.path.as_deref(), Some("/quarantine/patch-1"));

        // Quarantined entries can still be dropped, but nothing else.
        let dropped = tl.ledger.drop_patch(&id, "operator decision").await.unwrap();
        assert_eq!(dropped.state, PatchState::Dropped);
    }

    #[tokio::test]
    async fn terminal_entries_reject_all_operations() {
        let tl = create_test_ledger().await;
        let entry = tl
            .ledger
            .create_entry(NewPatch::new("patch-1", "proj-a"))
            .await
            .unwrap();
        let id = entry.ledger_id;
        tl.ledger.drop_patch(&id, "abandoned").await.unwrap();

        assert!(tl
            .ledger
            .validate_patch(&id, ValidationResult::passing())
            .await
            .is_err());
        assert!(tl.ledger.quarantine_patch(&id, "x", None).await.is_err());
        assert!(tl.ledger.drop_patch(&id, "again").await.is_err());
    }

    #[tokio::test]
    async fn rollback_allowed_from_applied() {
        let tl = create_test_ledger().await;
        let entry = tl
            .ledger
            .create_entry(NewPatch::new("patch-1", "proj-a"))
            .await
            .unwrap();
        let id = entry.ledger_id;

        tl.ledger
            .validate_patch(&id, ValidationResult::passing())
            .await
            .unwrap();
        tl.ledger.queue_patch(&id).await.unwrap();
        tl.ledger
            .apply_patch(&id, true, None, vec![], None, None)
            .await
            .unwrap();

        let rolled = tl
            .ledger
            .rollback_patch(&id, "broke the build")
            .await
            .unwrap();
        assert_eq!(rolled.state, PatchState::RolledBack);
        assert!(rolled
            .state_history
            .last()
            .unwrap()
            .reason
            .contains("broke the build"));
    }

    #[tokio::test]
    async fn list_entries_applies_conjunctive_filter() {
        let tl = create_test_ledger().await;

        let a = tl
            .ledger
            .create_entry(NewPatch {
                workstream_id: Some("ws-1".to_string()),
                ..NewPatch::new("patch-a", "proj-a")
            })
            .await
            .unwrap();
        tl.ledger
            .create_entry(NewPatch::new("patch-b", "proj-a"))
            .await
            .unwrap();
        tl.ledger
            .create_entry(NewPatch::new("patch-c", "proj-b"))
            .await
            .unwrap();
        tl.ledger
            .validate_patch(&a.ledger_id, ValidationResult::passing())
            .await
            .unwrap();

        let all = tl.ledger.list_entries(&LedgerFilter::default()).await.unwrap();
        assert_eq!(all.len(), 3);

        let proj_a = tl
            .ledger
            .list_entries(&LedgerFilter {
                project_id: Some("proj-a".to_string()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(proj_a.len(), 2);

        let validated_ws1 = tl
            .ledger
            .list_entries(&LedgerFilter {
                project_id: Some("proj-a".to_string()),
                state: Some(PatchState::Validated),
                workstream_id: Some("ws-1".to_string()),
            })
            .await
            .unwrap();
        assert_eq!(validated_ws1.len(), 1);
        assert_eq!(validated_ws1[0].patch_id, "patch-a");
    }
}

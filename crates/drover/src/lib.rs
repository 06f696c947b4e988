//! drover - orchestration engine
//!
//! Library components for the engine binary: plan execution, task
//! routing and scheduling, patch lifecycle tracking, and SQLite
//! persistence.

pub mod engine;
pub mod executor;
pub mod ledger;
pub mod router;
pub mod scheduler;
pub mod storage;

use std::path::PathBuf;
use std::sync::Arc;

use engine::{PlanRunner, RunOptions};
use ledger::PatchLedger;
use storage::Storage;

/// Engine configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Path to the SQLite database.
    pub db_path: PathBuf,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
        }
    }
}

/// Default database path (~/.local/share/drover/drover.db).
fn default_db_path() -> PathBuf {
    let data_dir = std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            std::env::var("HOME")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("."))
                .join(".local/share")
        });
    data_dir.join("drover").join("drover.db")
}

/// Top-level engine state: shared storage plus the plan runner and
/// patch ledger built over it.
pub struct Engine {
    storage: Arc<Storage>,
    runner: PlanRunner,
    ledger: PatchLedger,
}

impl Engine {
    /// Open (or create) the database and wire up the components.
    pub async fn new(config: EngineConfig) -> storage::Result<Self> {
        let storage = Storage::new(&config.db_path).await?;
        storage.migrate_embedded().await?;
        let storage = Arc::new(storage);

        Ok(Self {
            runner: PlanRunner::new(Arc::clone(&storage)),
            ledger: PatchLedger::new(Arc::clone(&storage)),
            storage,
        })
    }

    pub fn storage(&self) -> &Arc<Storage> {
        &self.storage
    }

    pub fn ledger(&self) -> &PatchLedger {
        &self.ledger
    }

    /// Execute a plan to completion.
    pub async fn run_plan(
        &self,
        plan: &drover_core::plan::Plan,
        options: &RunOptions,
    ) -> engine::Result<drover_core::Run> {
        self.runner.execute(plan, options).await
    }
}

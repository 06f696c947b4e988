//! Plan execution.
//!
//! Runs a validated plan's steps as external processes under a
//! concurrency budget, with per-step timeouts, retries, and failure
//! policies. Each spawned process gets a watcher task that posts an exit
//! notification to a completion channel, so the control loop waits on
//! real events instead of blind sleeping; the poll interval only bounds
//! how long the loop waits when retry backoff is the next thing due.
//!
//! Plan-step execution states are engine-local and independent of the
//! persisted Run/StepAttempt lifecycles, which are driven alongside.

use std::collections::BTreeMap;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use drover_core::events::{
    EventPayload, RunCompletedPayload, RunCreatedPayload, RunFailedPayload, RunStartedPayload,
    StepFinishedPayload, StepRetriedPayload, StepStartedPayload, StepTimedOutPayload,
};
use drover_core::plan::{OnFailure, Plan, PlanError, PlanStep};
use drover_core::{AttemptState, Id, Run, RunState, StepAttempt};
use thiserror::Error;
use tokio::io::AsyncReadExt;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::storage::{Storage, StorageError};

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("plan error: {0}")]
    Plan(#[from] PlanError),
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
}

pub type Result<T> = std::result::Result<T, EngineError>;

/// Engine-local execution state of one plan step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ExecState {
    Pending,
    Running,
    Success,
    Failed,
    Skipped,
    Canceled,
}

/// Per-step bookkeeping during a run.
struct StepExec {
    state: ExecState,
    attempt: u32,
    /// Earliest time the next retry attempt may start.
    not_before: Option<tokio::time::Instant>,
    /// Persisted attempt row for the in-flight execution.
    attempt_id: Option<Id>,
    started_at: Option<tokio::time::Instant>,
}

impl StepExec {
    fn new() -> Self {
        Self {
            state: ExecState::Pending,
            attempt: 0,
            not_before: None,
            attempt_id: None,
            started_at: None,
        }
    }
}

/// What a watcher task reports back for one spawned process.
#[derive(Debug)]
enum StepOutcome {
    Exited {
        exit_code: i32,
        stderr: String,
    },
    TimedOut {
        timeout_sec: u64,
    },
}

#[derive(Debug)]
struct StepCompletion {
    step_id: String,
    outcome: StepOutcome,
}

/// Options for one plan execution.
#[derive(Debug, Clone)]
pub struct RunOptions {
    pub project_id: String,
    pub phase_id: String,
    /// Overrides the plan's `maxConcurrency` when set.
    pub max_concurrency: Option<usize>,
    pub poll_interval: Duration,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            project_id: "default".to_string(),
            phase_id: "default".to_string(),
            max_concurrency: None,
            poll_interval: Duration::from_millis(500),
        }
    }
}

/// Executes plans against persistent run/attempt/event records.
pub struct PlanRunner {
    storage: Arc<Storage>,
}

impl PlanRunner {
    pub fn new(storage: Arc<Storage>) -> Self {
        Self { storage }
    }

    /// Execute a plan to completion and return the final run record.
    ///
    /// The returned run is `succeeded`, `failed`, or `quarantined`;
    /// execution errors inside steps never surface as an `Err` here,
    /// only infrastructure failures (storage, invalid plan) do.
    pub async fn execute(&self, plan: &Plan, options: &RunOptions) -> Result<Run> {
        plan.validate()?;

        let mut run = Run::new(&options.project_id, &options.phase_id);
        run.metadata = serde_json::json!({ "planId": plan.plan_id });
        self.storage.insert_run(&run).await?;
        self.storage
            .append_event(
                &run.id,
                &EventPayload::RunCreated(RunCreatedPayload {
                    run_id: run.id.clone(),
                    project_id: run.project_id.clone(),
                    phase_id: run.phase_id.clone(),
                    plan_id: Some(plan.plan_id.clone()),
                }),
            )
            .await?;

        self.storage
            .update_run_state(&run.id, RunState::Running)
            .await?;
        self.storage
            .append_event(
                &run.id,
                &EventPayload::RunStarted(RunStartedPayload {
                    run_id: run.id.clone(),
                }),
            )
            .await?;
        info!(run_id = %run.id, plan_id = %plan.plan_id, steps = plan.steps.len(), "run started");

        let final_state = self.run_loop(plan, options, &run.id).await?;

        let (exit_code, error_message) = match final_state {
            RunState::Succeeded => (0, None),
            _ => (1, Some("one or more steps failed".to_string())),
        };
        self.storage
            .update_run_outcome(&run.id, Some(exit_code), error_message.as_deref())
            .await?;
        self.storage.update_run_state(&run.id, final_state).await?;

        let completion = match final_state {
            RunState::Failed => EventPayload::RunFailed(RunFailedPayload {
                run_id: run.id.clone(),
                reason: "one or more steps failed".to_string(),
            }),
            _ => EventPayload::RunCompleted(RunCompletedPayload {
                run_id: run.id.clone(),
                state: final_state,
            }),
        };
        self.storage.append_event(&run.id, &completion).await?;
        info!(run_id = %run.id, state = final_state.as_str(), "run finished");

        Ok(self.storage.get_run(&run.id).await?)
    }

    /// The control loop: start runnable steps, wait for completions,
    /// apply retry and failure policies, until no step is pending or
    /// running.
    async fn run_loop(&self, plan: &Plan, options: &RunOptions, run_id: &Id) -> Result<RunState> {
        let max_concurrency = options
            .max_concurrency
            .unwrap_or(plan.globals.max_concurrency)
            .max(1);

        let mut execs: BTreeMap<String, StepExec> = plan
            .steps
            .iter()
            .map(|step| (step.id.clone(), StepExec::new()))
            .collect();

        let (tx, mut rx) = mpsc::unbounded_channel::<StepCompletion>();
        let mut aborted = false;

        loop {
            let running = execs
                .values()
                .filter(|e| e.state == ExecState::Running)
                .count();
            let pending = execs
                .values()
                .filter(|e| e.state == ExecState::Pending)
                .count();
            if running == 0 && pending == 0 {
                break;
            }

            // Start runnable steps up to the concurrency budget.
            if !aborted {
                let now = tokio::time::Instant::now();
                let runnable: Vec<String> = plan
                    .steps
                    .iter()
                    .filter(|step| {
                        let exec = &execs[&step.id];
                        exec.state == ExecState::Pending
                            && exec.not_before.is_none_or(|t| t <= now)
                            && self.dependencies_satisfied(plan, step, &execs)
                    })
                    .map(|step| step.id.clone())
                    .collect();

                let budget = max_concurrency.saturating_sub(running);
                for step_id in runnable.into_iter().take(budget) {
                    let Some(step) = plan.step(&step_id) else {
                        continue;
                    };
                    self.start_step(plan, step, run_id, &mut execs, &tx).await?;
                    self.handle_spawn_result(plan, step, run_id, &mut execs, &mut aborted)
                        .await?;
                }
            }

            // Wait for the next completion, bounded by the poll interval
            // so retry backoff deadlines are observed.
            match tokio::time::timeout(options.poll_interval, rx.recv()).await {
                Ok(Some(completion)) => {
                    self.handle_completion(plan, run_id, completion, &mut execs, &mut aborted)
                        .await?;
                    // Drain anything else that finished in the meantime.
                    while let Ok(completion) = rx.try_recv() {
                        self.handle_completion(plan, run_id, completion, &mut execs, &mut aborted)
                            .await?;
                    }
                }
                Ok(None) | Err(_) => {}
            }
        }

        Ok(final_plan_state(&execs))
    }

    /// A step may start when every dependency succeeded, or failed under
    /// the `continue` policy (which leaves dependents eligible).
    fn dependencies_satisfied(
        &self,
        plan: &Plan,
        step: &PlanStep,
        execs: &BTreeMap<String, StepExec>,
    ) -> bool {
        step.depends_on.iter().all(|dep| {
            let Some(exec) = execs.get(dep) else {
                return false;
            };
            match exec.state {
                ExecState::Success => true,
                ExecState::Failed => plan
                    .step(dep)
                    .map(|d| d.on_failure == OnFailure::Continue)
                    .unwrap_or(false),
                _ => false,
            }
        })
    }

    /// Spawn a step process and its watcher task. On spawn failure the
    /// step is recorded failed and the error kept for `handle_spawn_result`.
    async fn start_step(
        &self,
        plan: &Plan,
        step: &PlanStep,
        run_id: &Id,
        execs: &mut BTreeMap<String, StepExec>,
        tx: &mpsc::UnboundedSender<StepCompletion>,
    ) -> Result<()> {
        let attempt_number = execs[&step.id].attempt + 1;
        let sequence = self.storage.next_attempt_sequence(run_id).await?;
        let attempt = StepAttempt {
            id: Id::new(),
            run_id: run_id.clone(),
            sequence,
            tool_id: step.command.clone(),
            state: AttemptState::Running,
            exit_code: None,
            output_patch_id: None,
            error_log: None,
            started_at: Some(Utc::now()),
            ended_at: None,
        };
        self.storage.insert_step_attempt(&attempt).await?;
        self.storage
            .append_event(
                run_id,
                &EventPayload::StepStarted(StepStartedPayload {
                    step_attempt_id: attempt.id.clone(),
                    step_id: step.id.clone(),
                    attempt: attempt_number,
                    tool_id: step.command.clone(),
                }),
            )
            .await?;

        if let Some(exec) = execs.get_mut(&step.id) {
            exec.attempt = attempt_number;
            exec.attempt_id = Some(attempt.id.clone());
            exec.started_at = Some(tokio::time::Instant::now());
        }

        let mut command = if step.shell {
            let mut c = tokio::process::Command::new("sh");
            c.arg("-c").arg(&step.command);
            c
        } else {
            let mut c = tokio::process::Command::new(&step.command);
            c.args(&step.args);
            c
        };
        // stdout is discarded; only stderr is captured for the error log.
        command
            .envs(plan.env_for(step))
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(cwd) = &step.cwd {
            command.current_dir(cwd);
        }

        debug!(run_id = %run_id, step_id = %step.id, attempt = attempt_number, "starting step");

        match command.spawn() {
            Ok(child) => {
                if let Some(exec) = execs.get_mut(&step.id) {
                    exec.state = ExecState::Running;
                }
                let timeout_sec = plan.timeout_for(step);
                spawn_watcher(step.id.clone(), child, timeout_sec, tx.clone());
            }
            Err(e) => {
                // Spawn failure counts as an immediate execution failure.
                warn!(run_id = %run_id, step_id = %step.id, error = %e, "failed to spawn step");
                self.finish_attempt(
                    run_id,
                    &attempt.id,
                    AttemptState::Failed,
                    Some(1),
                    Some(&format!("spawn failed: {e}")),
                )
                .await?;
                if let Some(exec) = execs.get_mut(&step.id) {
                    exec.state = ExecState::Failed;
                    exec.attempt_id = None;
                }
            }
        }
        Ok(())
    }

    /// After `start_step`, apply failure handling if the spawn failed.
    async fn handle_spawn_result(
        &self,
        plan: &Plan,
        step: &PlanStep,
        run_id: &Id,
        execs: &mut BTreeMap<String, StepExec>,
        aborted: &mut bool,
    ) -> Result<()> {
        if execs[&step.id].state == ExecState::Failed {
            self.handle_failure(plan, step, run_id, execs, aborted, "spawn failed")
                .await?;
        }
        Ok(())
    }

    /// Process one exit notification from a watcher task.
    async fn handle_completion(
        &self,
        plan: &Plan,
        run_id: &Id,
        completion: StepCompletion,
        execs: &mut BTreeMap<String, StepExec>,
        aborted: &mut bool,
    ) -> Result<()> {
        let Some(step) = plan.step(&completion.step_id) else {
            return Ok(());
        };
        let (attempt_id, attempt_number, duration_ms) = {
            let exec = &execs[&completion.step_id];
            let duration = exec
                .started_at
                .map(|t| t.elapsed().as_millis() as u64)
                .unwrap_or(0);
            (exec.attempt_id.clone(), exec.attempt, duration)
        };

        match completion.outcome {
            StepOutcome::Exited { exit_code, stderr } => {
                let success = exit_code == 0;
                if let Some(attempt_id) = &attempt_id {
                    let state = if success {
                        AttemptState::Succeeded
                    } else {
                        AttemptState::Failed
                    };
                    let error_log = (!success).then_some(stderr.as_str());
                    self.finish_attempt(run_id, attempt_id, state, Some(exit_code), error_log)
                        .await?;
                    self.storage
                        .append_event(
                            run_id,
                            &EventPayload::StepFinished(StepFinishedPayload {
                                step_attempt_id: attempt_id.clone(),
                                step_id: step.id.clone(),
                                exit_code,
                                duration_ms,
                            }),
                        )
                        .await?;
                }

                if let Some(exec) = execs.get_mut(&step.id) {
                    exec.attempt_id = None;
                    exec.state = if success {
                        ExecState::Success
                    } else {
                        ExecState::Failed
                    };
                }
                if success {
                    debug!(run_id = %run_id, step_id = %step.id, "step succeeded");
                } else {
                    let reason = format!("exit code {exit_code}");
                    self.handle_failure(plan, step, run_id, execs, aborted, &reason)
                        .await?;
                }
            }
            StepOutcome::TimedOut { timeout_sec } => {
                if let Some(attempt_id) = &attempt_id {
                    self.finish_attempt(
                        run_id,
                        attempt_id,
                        AttemptState::Failed,
                        None,
                        Some(&format!("timed out after {timeout_sec}s")),
                    )
                    .await?;
                    self.storage
                        .append_event(
                            run_id,
                            &EventPayload::StepTimedOut(StepTimedOutPayload {
                                step_attempt_id: attempt_id.clone(),
                                step_id: step.id.clone(),
                                timeout_sec,
                            }),
                        )
                        .await?;
                }
                warn!(run_id = %run_id, step_id = %step.id, timeout_sec, attempt = attempt_number, "step timed out");

                if let Some(exec) = execs.get_mut(&step.id) {
                    exec.attempt_id = None;
                    exec.state = ExecState::Failed;
                }
                let reason = format!("timed out after {timeout_sec}s");
                self.handle_failure(plan, step, run_id, execs, aborted, &reason)
                    .await?;
            }
        }

        Ok(())
    }

    /// Retry-or-policy handling for a step that just failed.
    async fn handle_failure(
        &self,
        plan: &Plan,
        step: &PlanStep,
        run_id: &Id,
        execs: &mut BTreeMap<String, StepExec>,
        aborted: &mut bool,
        reason: &str,
    ) -> Result<()> {
        let retries = plan.retries_for(step);
        let attempt = execs[&step.id].attempt;

        if attempt < retries + 1 {
            let delay = Duration::from_secs(step.retry_delay_sec);
            if let Some(exec) = execs.get_mut(&step.id) {
                exec.state = ExecState::Pending;
                exec.not_before = Some(tokio::time::Instant::now() + delay);
            }

            self.storage
                .append_event(
                    run_id,
                    &EventPayload::StepRetried(StepRetriedPayload {
                        step_id: step.id.clone(),
                        attempt,
                        delay_sec: step.retry_delay_sec,
                        reason: reason.to_string(),
                    }),
                )
                .await?;
            info!(run_id = %run_id, step_id = %step.id, attempt, "retrying step");
            return Ok(());
        }

        match step.on_failure {
            OnFailure::Abort => {
                if step.critical {
                    warn!(run_id = %run_id, step_id = %step.id, "critical step failed, aborting plan");
                    *aborted = true;
                    for exec in execs.values_mut() {
                        if exec.state == ExecState::Pending {
                            exec.state = ExecState::Canceled;
                        }
                    }
                }
                // Non-critical abort: dependents behind the failed step
                // are settled by cancel_unreachable below.
            }
            OnFailure::SkipDependents => {
                let dependents = transitive_dependents(plan, &step.id);
                for dep_id in dependents {
                    if let Some(exec) = execs.get_mut(&dep_id) {
                        if exec.state == ExecState::Pending {
                            exec.state = ExecState::Skipped;
                        }
                    }
                }
            }
            OnFailure::Continue => {}
        }

        // Pending steps blocked forever behind this failure are settled
        // now so the loop can terminate.
        self.cancel_unreachable(plan, execs);
        Ok(())
    }

    /// Mark pending steps that can never run (a dependency failed without
    /// `continue`, was skipped, or canceled) as canceled.
    fn cancel_unreachable(&self, plan: &Plan, execs: &mut BTreeMap<String, StepExec>) {
        loop {
            let mut changed = false;
            for step in &plan.steps {
                if execs[&step.id].state != ExecState::Pending {
                    continue;
                }
                let blocked = step.depends_on.iter().any(|dep| {
                    let Some(dep_exec) = execs.get(dep) else {
                        return true;
                    };
                    match dep_exec.state {
                        ExecState::Failed => plan
                            .step(dep)
                            .map(|d| d.on_failure != OnFailure::Continue)
                            .unwrap_or(true),
                        ExecState::Skipped | ExecState::Canceled => true,
                        _ => false,
                    }
                });
                if blocked {
                    if let Some(exec) = execs.get_mut(&step.id) {
                        exec.state = ExecState::Canceled;
                        changed = true;
                    }
                }
            }
            if !changed {
                break;
            }
        }
    }

    async fn finish_attempt(
        &self,
        run_id: &Id,
        attempt_id: &Id,
        state: AttemptState,
        exit_code: Option<i32>,
        error_log: Option<&str>,
    ) -> Result<()> {
        if let Err(e) = self
            .storage
            .finish_step_attempt(attempt_id, state, exit_code, None, error_log)
            .await
        {
            // An attempt row that cannot be settled is a diagnostics gap,
            // not a reason to kill the run.
            error!(run_id = %run_id, attempt_id = %attempt_id, error = %e, "failed to record attempt outcome");
        }
        Ok(())
    }
}

/// Compute the final run state from settled step states. The
/// `quarantined` branch is an invariant-violation signal: no legitimate
/// path leaves a step outside the settled states.
fn final_plan_state(execs: &BTreeMap<String, StepExec>) -> RunState {
    if execs.values().any(|e| e.state == ExecState::Failed) {
        return RunState::Failed;
    }
    if execs
        .values()
        .all(|e| matches!(e.state, ExecState::Success | ExecState::Skipped))
    {
        return RunState::Succeeded;
    }
    error!("plan finished with residual step states; quarantining run");
    RunState::Quarantined
}

/// All transitive dependents of `step_id` in the plan.
fn transitive_dependents(plan: &Plan, step_id: &str) -> Vec<String> {
    let mut result: Vec<String> = Vec::new();
    let mut frontier = vec![step_id.to_string()];
    while let Some(current) = frontier.pop() {
        for step in &plan.steps {
            if step.depends_on.iter().any(|d| d == &current) && !result.contains(&step.id) {
                result.push(step.id.clone());
                frontier.push(step.id.clone());
            }
        }
    }
    result
}

/// Watch one spawned process: collect stderr, wait for exit or timeout,
/// kill on timeout, and post the outcome to the completion channel.
fn spawn_watcher(
    step_id: String,
    mut child: tokio::process::Child,
    timeout_sec: u64,
    tx: mpsc::UnboundedSender<StepCompletion>,
) {
    tokio::spawn(async move {
        let mut stderr_pipe = child.stderr.take();
        let stderr_task = tokio::spawn(async move {
            let mut buf = String::new();
            if let Some(pipe) = stderr_pipe.as_mut() {
                let _ = pipe.read_to_string(&mut buf).await;
            }
            buf
        });

        let status = if timeout_sec > 0 {
            match tokio::time::timeout(Duration::from_secs(timeout_sec), child.wait()).await {
                Ok(result) => Some(result),
                Err(_) => {
                    let _ = child.kill().await;
                    None
                }
            }
        } else {
            Some(child.wait().await)
        };

        let outcome = match status {
            Some(Ok(status)) => {
                let stderr = stderr_task.await.unwrap_or_default();
                StepOutcome::Exited {
                    exit_code: status.code().unwrap_or(1),
                    stderr,
                }
            }
            Some(Err(e)) => StepOutcome::Exited {
                exit_code: 1,
                stderr: format!("wait failed: {e}"),
            },
            None => {
                stderr_task.abort();
                StepOutcome::TimedOut { timeout_sec }
            }
        };

        let _ = tx.send(StepCompletion { step_id, outcome });
    });
}

//! Generic state-machine substrate and the concrete lifecycle tables.
//!
//! Every entity with a lifecycle (run, step attempt, patch ledger entry,
//! worker, workstream, test gate, circuit breaker) is an instance of the
//! same substrate: an allow-list of transitions plus a terminal-state set.
//! Terminal-means-immutable is enforced here, once, for all of them.

use std::collections::{HashMap, HashSet};
use std::fmt::Debug;
use std::hash::Hash;

use thiserror::Error;

use crate::types::{
    AttemptState, BreakerState, GateState, PatchState, RunState, WorkerState, WorkstreamState,
};

/// Illegal state-machine move. Always a programming or usage error on the
/// caller's side, never silently ignored.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransitionError {
    #[error("unrecognized state: {0}")]
    InvalidState(String),
    #[error("state {0} is terminal")]
    TerminalState(String),
    #[error("invalid transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },
}

/// Immutable transition table for one entity type.
#[derive(Debug, Clone)]
pub struct StateMachine<S> {
    transitions: HashMap<S, HashSet<S>>,
    terminal: HashSet<S>,
    known: HashSet<S>,
}

impl<S> StateMachine<S>
where
    S: Copy + Eq + Hash + Debug,
{
    /// Build a machine from `(state, allowed targets)` rows and a terminal set.
    /// A state is recognized if it appears anywhere in the table.
    pub fn new(transitions: &[(S, &[S])], terminal: &[S]) -> Self {
        let mut table: HashMap<S, HashSet<S>> = HashMap::new();
        let mut known: HashSet<S> = HashSet::new();
        for (from, targets) in transitions {
            known.insert(*from);
            let entry = table.entry(*from).or_default();
            for to in *targets {
                known.insert(*to);
                entry.insert(*to);
            }
        }
        for s in terminal {
            known.insert(*s);
        }
        Self {
            transitions: table,
            terminal: terminal.iter().copied().collect(),
            known,
        }
    }

    pub fn is_terminal(&self, state: S) -> bool {
        self.terminal.contains(&state)
    }

    pub fn can_transition(&self, from: S, to: S) -> bool {
        self.validate_transition(from, to).is_ok()
    }

    /// Fails with `InvalidState` if either state is unrecognized,
    /// `TerminalState` if `from` admits no further transitions, and
    /// `InvalidTransition` if `to` is not in the allowed set for `from`.
    pub fn validate_transition(&self, from: S, to: S) -> Result<(), TransitionError> {
        if !self.known.contains(&from) {
            return Err(TransitionError::InvalidState(format!("{from:?}")));
        }
        if !self.known.contains(&to) {
            return Err(TransitionError::InvalidState(format!("{to:?}")));
        }
        if self.terminal.contains(&from) {
            return Err(TransitionError::TerminalState(format!("{from:?}")));
        }
        let allowed = self
            .transitions
            .get(&from)
            .is_some_and(|targets| targets.contains(&to));
        if !allowed {
            return Err(TransitionError::InvalidTransition {
                from: format!("{from:?}"),
                to: format!("{to:?}"),
            });
        }
        Ok(())
    }
}

/// Run lifecycle. `failed` stays open solely so a failed run can still be
/// quarantined.
pub fn run_machine() -> StateMachine<RunState> {
    use RunState::*;
    StateMachine::new(
        &[
            (Pending, &[Running, Canceled]),
            (Running, &[Succeeded, Failed, Quarantined, Canceled]),
            (Failed, &[Quarantined]),
        ],
        &[Succeeded, Quarantined, Canceled],
    )
}

/// Step-attempt lifecycle: attempts start running and settle exactly once.
pub fn step_attempt_machine() -> StateMachine<AttemptState> {
    use AttemptState::*;
    StateMachine::new(
        &[(Running, &[Succeeded, Failed, Canceled])],
        &[Succeeded, Failed, Canceled],
    )
}

/// Patch-ledger lifecycle.
pub fn patch_machine() -> StateMachine<PatchState> {
    use PatchState::*;
    StateMachine::new(
        &[
            (Created, &[Validated, ApplyFailed, Quarantined, Dropped]),
            (Validated, &[Queued, Quarantined, Dropped]),
            (Queued, &[Applied, ApplyFailed, Quarantined, Dropped]),
            (
                Applied,
                &[Verified, ApplyFailed, RolledBack, Quarantined, Dropped],
            ),
            (ApplyFailed, &[Queued, Quarantined, Dropped]),
            (Verified, &[Committed, RolledBack, Quarantined, Dropped]),
            (Quarantined, &[Dropped]),
        ],
        &[Committed, RolledBack, Dropped],
    )
}

/// Worker lifecycle.
pub fn worker_machine() -> StateMachine<WorkerState> {
    use WorkerState::*;
    StateMachine::new(
        &[
            (Idle, &[Busy, Draining, Offline]),
            (Busy, &[Idle, Draining, Offline]),
            (Draining, &[Offline]),
        ],
        &[Offline],
    )
}

/// Workstream lifecycle.
pub fn workstream_machine() -> StateMachine<WorkstreamState> {
    use WorkstreamState::*;
    StateMachine::new(
        &[
            (Planned, &[Active, Abandoned]),
            (Active, &[Merged, Abandoned]),
        ],
        &[Merged, Abandoned],
    )
}

/// Test-gate lifecycle. A failed gate may be re-run.
pub fn test_gate_machine() -> StateMachine<GateState> {
    use GateState::*;
    StateMachine::new(
        &[
            (Pending, &[Running]),
            (Running, &[Passed, Failed]),
            (Failed, &[Running]),
        ],
        &[Passed],
    )
}

/// Circuit-breaker lifecycle. No terminal states: breakers cycle forever.
pub fn circuit_breaker_machine() -> StateMachine<BreakerState> {
    use BreakerState::*;
    StateMachine::new(
        &[
            (Closed, &[Open]),
            (Open, &[HalfOpen]),
            (HalfOpen, &[Closed, Open]),
        ],
        &[],
    )
}

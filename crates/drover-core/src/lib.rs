//! drover-core - domain types and pure logic for the drover orchestration engine.

pub mod events;
pub mod machine;
pub mod plan;
pub mod router_config;
pub mod types;

pub use events::{Event, EventPayload};
pub use machine::{StateMachine, TransitionError};
pub use types::{
    ApplyRecord, AttemptState, BreakerState, GateState, Id, PatchLedgerEntry, PatchState,
    QuarantineRecord, RoutingDecision, Run, RunState, StateRecord, StepAttempt, Task, TaskStatus,
    ToolOutcome, ToolRequest, ValidationResult, WorkerState, WorkstreamState,
};

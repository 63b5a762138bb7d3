//! Orchestration layer: stage-by-stage execution of a staged item set.
//!
//! The orchestrator dispatches a bounded pool of workers per stage, waits
//! on the heartbeat monitor, checkpoints each resolved stage and reduces
//! everything into a report at the end.

pub mod checkpoint;
pub mod heartbeat;
pub mod monitor;
pub mod orchestrator;
pub mod report;
pub mod shell;
pub mod state;
pub mod task;
pub mod worker;

pub use checkpoint::{Checkpoint, CheckpointStore, FileCheckpointStore, MemoryCheckpointStore, RunId};
pub use heartbeat::{Heartbeat, HeartbeatReader, HeartbeatRecord};
pub use monitor::{HeartbeatMonitor, InFlight, MonitorConfig, StageOutcome};
pub use orchestrator::{
    Orchestrator, OrchestratorConfig, RunContext, RunEvent, RunOutcome, DEFAULT_TASK_TIMEOUT,
};
pub use report::{FailedItem, Finding, ItemOutcome, OutcomeCounts, Report};
pub use shell::ShellHandler;
pub use state::{RunState, RunStateMachine};
pub use worker::PoolSlot;
pub use task::{
    HandlerRegistry, SharedContext, SharedContextProvider, TaskContext, TaskError, TaskHandler,
    TaskOutcome,
};

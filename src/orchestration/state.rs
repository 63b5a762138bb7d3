//! Run state machine with transition validation.
//!
//! Pending -> Staging -> RunningStage(0..n)* -> Aggregating -> Done, with
//! Aborted reachable from Staging (graph error) and from any running stage.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "state", content = "stage", rename_all = "snake_case")]
pub enum RunState {
    Pending,
    Staging,
    RunningStage(usize),
    Aggregating,
    Done,
    Aborted,
}

impl RunState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunState::Done | RunState::Aborted)
    }
}

impl std::fmt::Display for RunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunState::Pending => write!(f, "pending"),
            RunState::Staging => write!(f, "staging"),
            RunState::RunningStage(k) => write!(f, "running_stage({})", k),
            RunState::Aggregating => write!(f, "aggregating"),
            RunState::Done => write!(f, "done"),
            RunState::Aborted => write!(f, "aborted"),
        }
    }
}

/// A state with the time it was entered.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateHistoryEntry {
    pub state: RunState,
    pub entered_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct RunStateMachine {
    current: RunState,
    history: Vec<StateHistoryEntry>,
}

impl Default for RunStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl RunStateMachine {
    pub fn new() -> Self {
        Self {
            current: RunState::Pending,
            history: vec![StateHistoryEntry {
                state: RunState::Pending,
                entered_at: Utc::now(),
            }],
        }
    }

    /// Valid transitions:
    /// - Pending -> Staging
    /// - Staging -> RunningStage(0), or Aggregating when there are no stages,
    ///   or Aborted on a graph error
    /// - RunningStage(k) -> RunningStage(k + 1), Aggregating or Aborted
    /// - Aggregating -> Done
    ///
    /// Staging may also jump to a later stage when resuming.
    pub fn can_transition(&self, target: RunState) -> bool {
        matches!(
            (self.current, target),
            (RunState::Pending, RunState::Staging)
                | (RunState::Staging, RunState::RunningStage(_))
                | (RunState::Staging, RunState::Aggregating)
                | (RunState::Staging, RunState::Aborted)
                | (RunState::RunningStage(_), RunState::Aggregating)
                | (RunState::RunningStage(_), RunState::Aborted)
                | (RunState::Aggregating, RunState::Done)
        ) || matches!(
            (self.current, target),
            (RunState::RunningStage(k), RunState::RunningStage(next)) if next == k + 1
        )
    }

    pub fn transition(&mut self, target: RunState) -> Result<()> {
        if !self.can_transition(target) {
            return Err(Error::InvalidStateTransition {
                from: self.current.to_string(),
                to: target.to_string(),
            });
        }
        tracing::debug!(from = %self.current, to = %target, "run state transition");
        self.current = target;
        self.history.push(StateHistoryEntry {
            state: target,
            entered_at: Utc::now(),
        });
        Ok(())
    }

    pub fn current(&self) -> RunState {
        self.current
    }

    pub fn history(&self) -> &[StateHistoryEntry] {
        &self.history
    }

    pub fn states(&self) -> Vec<RunState> {
        self.history.iter().map(|e| e.state).collect()
    }
}

use std::fmt;

use tracing::{debug, warn};

use crate::error::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Read,
    Write,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operation::Read => f.write_str("read"),
            Operation::Write => f.write_str("write"),
        }
    }
}

/// Phases of a single read or write.
///
/// `Created -> PreHookRun -> (ShortCircuited | PipelineRunning) -> Placed ->
/// PostHookRun -> Completed`, with `Failed` reachable from any non-terminal
/// phase. A short-circuited read goes straight to `Completed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Created,
    PreHookRun,
    ShortCircuited,
    PipelineRunning,
    Placed,
    PostHookRun,
    Completed,
    Failed,
}

impl Phase {
    pub fn is_terminal(self) -> bool {
        matches!(self, Phase::Completed | Phase::Failed)
    }

    pub fn can_advance_to(self, next: Phase) -> bool {
        use Phase::*;
        match (self, next) {
            (from, Failed) => !from.is_terminal(),
            (Created, PreHookRun)
            | (PreHookRun, ShortCircuited)
            | (PreHookRun, PipelineRunning)
            | (ShortCircuited, Completed)
            | (PipelineRunning, Placed)
            | (Placed, PostHookRun)
            | (PostHookRun, Completed) => true,
            _ => false,
        }
    }
}

/// Tracks the phase of one operation, logging each transition.
#[derive(Debug)]
pub(crate) struct Lifecycle {
    operation: Operation,
    id: String,
    phase: Phase,
    history: Vec<Phase>,
}

impl Lifecycle {
    pub(crate) fn new(operation: Operation, id: &str) -> Self {
        Self {
            operation,
            id: id.to_string(),
            phase: Phase::Created,
            history: vec![Phase::Created],
        }
    }

    pub(crate) fn phase(&self) -> Phase {
        self.phase
    }

    pub(crate) fn history(&self) -> &[Phase] {
        &self.history
    }

    pub(crate) fn advance(&mut self, next: Phase) {
        debug_assert!(
            self.phase.can_advance_to(next),
            "invalid {} transition {:?} -> {:?}",
            self.operation,
            self.phase,
            next
        );
        debug!(op = %self.operation, id = %self.id, from = ?self.phase, to = ?next, "phase");
        self.phase = next;
        self.history.push(next);
    }

    pub(crate) fn fail(&mut self, err: &Error) {
        if self.phase.is_terminal() {
            return;
        }
        warn!(op = %self.operation, id = %self.id, phase = ?self.phase, "operation failed: {err}");
        self.phase = Phase::Failed;
        self.history.push(Phase::Failed);
    }
}

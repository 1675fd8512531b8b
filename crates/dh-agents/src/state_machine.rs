use dh_core::types::{TaskOutcome, TaskStatus};

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum StateMachineError {
    #[error("invalid transition: cannot move from {from} to {to}")]
    InvalidTransition { from: TaskStatus, to: TaskStatus },
}

// ---------------------------------------------------------------------------
// SupervisorStateMachine
// ---------------------------------------------------------------------------

/// Guards the supervisor's retry/fallback loop against illegal jumps.
#[derive(Debug, Clone)]
pub struct SupervisorStateMachine {
    current: TaskStatus,
    history: Vec<(TaskStatus, TaskStatus)>,
}

impl SupervisorStateMachine {
    /// Create a new state machine starting in `Initialize`.
    pub fn new() -> Self {
        Self {
            current: TaskStatus::Initialize,
            history: Vec::new(),
        }
    }

    pub fn state(&self) -> TaskStatus {
        self.current
    }

    /// Every transition taken so far, oldest first.
    pub fn history(&self) -> &[(TaskStatus, TaskStatus)] {
        &self.history
    }

    /// Move to `to`.
    ///
    /// Valid transitions:
    /// - Initialize    -> Launch | TerminalFail
    /// - Launch        -> Running | TerminalFail
    /// - Running       -> DetectExit
    /// - DetectExit    -> Success | ClassifyError | TerminalFail
    /// - ClassifyError -> Retry | SwitchAgent | TerminalFail
    /// - Retry         -> Launch | TerminalFail
    /// - SwitchAgent   -> Launch | TerminalFail
    /// - Success       -> Completed(Succeeded)
    /// - TerminalFail  -> Completed(Failed | Cancelled)
    pub fn transition(&mut self, to: TaskStatus) -> Result<TaskStatus, StateMachineError> {
        if !self.can_transition(to) {
            return Err(StateMachineError::InvalidTransition {
                from: self.current,
                to,
            });
        }
        let from = self.current;
        self.current = to;
        self.history.push((from, to));
        tracing::trace!(from = %from, to = %to, "task state transition");
        Ok(to)
    }

    /// Returns `true` if moving to `to` is valid from the current state.
    pub fn can_transition(&self, to: TaskStatus) -> bool {
        use TaskStatus::*;
        matches!(
            (self.current, to),
            (Initialize, Launch)
                | (Initialize, TerminalFail)
                | (Launch, Running)
                | (Launch, TerminalFail)
                | (Running, DetectExit)
                | (DetectExit, Success)
                | (DetectExit, ClassifyError)
                | (DetectExit, TerminalFail)
                | (ClassifyError, Retry)
                | (ClassifyError, SwitchAgent)
                | (ClassifyError, TerminalFail)
                | (Retry, Launch)
                | (Retry, TerminalFail)
                | (SwitchAgent, Launch)
                | (SwitchAgent, TerminalFail)
                | (Success, Completed(TaskOutcome::Succeeded))
                | (TerminalFail, Completed(TaskOutcome::Failed))
                | (TerminalFail, Completed(TaskOutcome::Cancelled))
        )
    }
}

impl Default for SupervisorStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

use serde::{Deserialize, Serialize};

use events::TriggerPhase;

use crate::error::{OrchestratorError, Result};

/// Progress of one StepRun through the trigger protocol.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TriggerState {
    Idle,
    WaitingStart,
    WaitingContinue,
    WaitingDone,
    Confirmed,
    TimedOut,
    Aborted,
}

impl TriggerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::WaitingStart => "waiting_start",
            Self::WaitingContinue => "waiting_continue",
            Self::WaitingDone => "waiting_done",
            Self::Confirmed => "confirmed",
            Self::TimedOut => "timed_out",
            Self::Aborted => "aborted",
        }
    }

    /// The phase a waiting state is blocked on.
    pub fn phase(&self) -> Option<TriggerPhase> {
        match self {
            Self::WaitingStart => Some(TriggerPhase::Start),
            Self::WaitingContinue => Some(TriggerPhase::Continue),
            Self::WaitingDone => Some(TriggerPhase::Done),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Confirmed | Self::TimedOut | Self::Aborted)
    }
}

pub struct TriggerStateMachine;

impl TriggerStateMachine {
    pub fn validate_transition(from: &TriggerState, to: &TriggerState) -> Result<()> {
        let allowed = Self::allowed_transitions(from);

        if allowed.contains(to) {
            Ok(())
        } else {
            Err(OrchestratorError::InvalidTransition {
                from: from.as_str().to_string(),
                to: to.as_str().to_string(),
            })
        }
    }

    fn allowed_transitions(from: &TriggerState) -> Vec<TriggerState> {
        match from {
            TriggerState::Idle => vec![TriggerState::WaitingStart, TriggerState::Aborted],
            TriggerState::WaitingStart => vec![
                TriggerState::WaitingContinue,
                TriggerState::TimedOut,
                TriggerState::Aborted,
            ],
            TriggerState::WaitingContinue => vec![
                TriggerState::WaitingDone,
                TriggerState::TimedOut,
                TriggerState::Aborted,
            ],
            TriggerState::WaitingDone => vec![
                TriggerState::Confirmed,
                TriggerState::TimedOut,
                TriggerState::Aborted,
            ],
            TriggerState::Confirmed | TriggerState::TimedOut | TriggerState::Aborted => vec![],
        }
    }

    pub fn can_transition(from: &TriggerState, to: &TriggerState) -> bool {
        Self::validate_transition(from, to).is_ok()
    }

    /// State entered once the current phase's line has been observed.
    pub fn next_state(current: &TriggerState) -> Option<TriggerState> {
        match current {
            TriggerState::Idle => Some(TriggerState::WaitingStart),
            TriggerState::WaitingStart => Some(TriggerState::WaitingContinue),
            TriggerState::WaitingContinue => Some(TriggerState::WaitingDone),
            TriggerState::WaitingDone => Some(TriggerState::Confirmed),
            _ => None,
        }
    }
}

/// Tracks one StepRun's trigger state, rejecting illegal moves.
#[derive(Debug, Clone)]
pub struct TriggerTracker {
    state: TriggerState,
}

impl TriggerTracker {
    pub fn new() -> Self {
        Self {
            state: TriggerState::Idle,
        }
    }

    pub fn state(&self) -> TriggerState {
        self.state
    }

    pub fn transition(&mut self, to: TriggerState) -> Result<()> {
        TriggerStateMachine::validate_transition(&self.state, &to)?;
        self.state = to;
        Ok(())
    }

    /// Move to the next state of the happy path.
    pub fn advance(&mut self) -> Result<TriggerState> {
        let next = TriggerStateMachine::next_state(&self.state).ok_or_else(|| {
            OrchestratorError::InvalidTransition {
                from: self.state.as_str().to_string(),
                to: "next".to_string(),
            }
        })?;
        self.transition(next)?;
        Ok(next)
    }
}

impl Default for TriggerTracker {
    fn default() -> Self {
        Self::new()
    }
}

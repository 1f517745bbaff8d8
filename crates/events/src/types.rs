//! Event types for the PAL orchestrator event system

use chrono::{DateTime, Utc};
use pal_core::ErrorKind;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Envelope wrapping all events with metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventEnvelope {
    /// Unique event ID
    pub id: Uuid,
    /// When the event occurred
    pub timestamp: DateTime<Utc>,
    /// The actual event
    pub event: Event,
}

impl EventEnvelope {
    /// Create a new event envelope with auto-generated ID and timestamp
    pub fn new(event: Event) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            event,
        }
    }
}

/// Trigger phases reported by the instrument.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TriggerPhase {
    Start,
    Continue,
    Done,
}

impl TriggerPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Continue => "continue",
            Self::Done => "done",
        }
    }

    /// Error kind reported when this phase times out.
    pub fn timeout_kind(&self) -> ErrorKind {
        match self {
            Self::Start => ErrorKind::StartTimeout,
            Self::Continue => ErrorKind::ContinueTimeout,
            Self::Done => ErrorKind::DoneTimeout,
        }
    }
}

impl std::fmt::Display for TriggerPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// All possible events in the system
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    // Job events
    /// A compiled job was handed to the instrument transport
    #[serde(rename = "job.submitted")]
    JobSubmitted {
        job_id: Uuid,
        run_count: usize,
        transport: String,
    },

    /// A trigger line fired for a step run
    #[serde(rename = "trigger.observed")]
    TriggerObserved {
        job_id: Uuid,
        run_id: Uuid,
        phase: TriggerPhase,
        at: DateTime<Utc>,
    },

    /// A step run was physically confirmed and committed
    #[serde(rename = "step_run.confirmed")]
    StepRunConfirmed {
        job_id: Uuid,
        run_id: Uuid,
        method: String,
        samples_out: Vec<String>,
    },

    /// A step run failed; the rest of the job is abandoned
    #[serde(rename = "step_run.failed")]
    StepRunFailed {
        job_id: Uuid,
        run_id: Uuid,
        kind: ErrorKind,
        message: String,
    },

    // Registry events
    /// The occupant of a position changed
    #[serde(rename = "position.updated")]
    PositionUpdated {
        position: String,
        sample: Option<String>,
    },

    // Scheduler events
    /// The scheduler dispatched one repetition of a template job
    #[serde(rename = "schedule.run_started")]
    ScheduledRunStarted {
        run_index: usize,
        total_runs: usize,
        delay_ms: u64,
    },

    // System events
    /// Generic error event
    #[serde(rename = "error")]
    Error {
        message: String,
        context: Option<String>,
    },
}

impl Event {
    /// Get the job ID associated with this event, if any
    pub fn job_id(&self) -> Option<Uuid> {
        match self {
            Event::JobSubmitted { job_id, .. } => Some(*job_id),
            Event::TriggerObserved { job_id, .. } => Some(*job_id),
            Event::StepRunConfirmed { job_id, .. } => Some(*job_id),
            Event::StepRunFailed { job_id, .. } => Some(*job_id),
            Event::PositionUpdated { .. } => None,
            Event::ScheduledRunStarted { .. } => None,
            Event::Error { .. } => None,
        }
    }
}

//! Broadcast bus for orchestrator events

use chrono::{DateTime, Utc};
use pal_core::ErrorKind;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::types::{Event, EventEnvelope, TriggerPhase};

/// Events a slow listener may fall behind by before it starts lagging.
/// A job publishes a handful of events per step run.
const EVENT_BACKLOG: usize = 256;

/// Fan-out of job, trigger and registry events to listeners.
///
/// Publishing never blocks the dispatcher: with no listener the event is
/// dropped, and a listener that falls more than the backlog behind sees
/// `RecvError::Lagged`.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<EventEnvelope>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(EVENT_BACKLOG)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Stamp `event` and send it to every listener.
    ///
    /// Returns the number of listeners that received it.
    pub fn publish(&self, event: Event) -> usize {
        self.sender.send(EventEnvelope::new(event)).unwrap_or(0)
    }

    pub fn job_submitted(&self, job_id: Uuid, run_count: usize, transport: &str) -> usize {
        self.publish(Event::JobSubmitted {
            job_id,
            run_count,
            transport: transport.to_string(),
        })
    }

    pub fn trigger_observed(&self, job_id: Uuid, run_id: Uuid, phase: TriggerPhase, at: DateTime<Utc>) -> usize {
        self.publish(Event::TriggerObserved {
            job_id,
            run_id,
            phase,
            at,
        })
    }

    pub fn run_confirmed(&self, job_id: Uuid, run_id: Uuid, method: &str, samples_out: Vec<String>) -> usize {
        self.publish(Event::StepRunConfirmed {
            job_id,
            run_id,
            method: method.to_string(),
            samples_out,
        })
    }

    pub fn run_failed(&self, job_id: Uuid, run_id: Uuid, kind: ErrorKind, message: impl Into<String>) -> usize {
        self.publish(Event::StepRunFailed {
            job_id,
            run_id,
            kind,
            message: message.into(),
        })
    }

    /// A job ended without completing; emitted when its guard is released
    /// before the job finished.
    pub fn job_aborted(&self, job_id: Uuid, message: impl Into<String>) -> usize {
        self.publish(Event::Error {
            message: message.into(),
            context: Some(format!("job {}", job_id)),
        })
    }

    pub fn position_updated(&self, position: String, sample: Option<String>) -> usize {
        self.publish(Event::PositionUpdated { position, sample })
    }

    pub fn scheduled_run_started(&self, run_index: usize, total_runs: usize, delay_ms: u64) -> usize {
        self.publish(Event::ScheduledRunStarted {
            run_index,
            total_runs,
            delay_ms,
        })
    }

    /// Events published before this call are not received.
    pub fn subscribe(&self) -> broadcast::Receiver<EventEnvelope> {
        self.sender.subscribe()
    }

    pub fn listener_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("listeners", &self.listener_count())
            .field("queued", &self.sender.len())
            .finish()
    }
}

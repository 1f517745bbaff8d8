//! RAII guard for the single in-flight instrument job.
//!
//! Holding a [`JobGuard`] means owning the instrument. The guard clears the
//! busy flag on drop; a guard dropped before being marked completed also
//! emits an error event so a failed or cancelled job is never silent.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{debug, warn};
use uuid::Uuid;

use events::EventBus;

use crate::error::{OrchestratorError, Result};

pub struct JobGuard {
    job_id: Uuid,
    busy: Arc<AtomicBool>,
    event_bus: Option<EventBus>,
    completed: bool,
}

impl JobGuard {
    /// Claim the instrument for `job_id`, failing with `in_progress` when
    /// another job holds it.
    pub fn acquire(job_id: Uuid, busy: Arc<AtomicBool>, event_bus: Option<EventBus>) -> Result<Self> {
        if busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!(job_id = %job_id, "Instrument busy, rejecting job");
            return Err(OrchestratorError::InProgress);
        }

        debug!(job_id = %job_id, "Job guard acquired");
        Ok(Self {
            job_id,
            busy,
            event_bus,
            completed: false,
        })
    }

    pub fn mark_completed(&mut self) {
        debug!(job_id = %self.job_id, "Job marked as completed");
        self.completed = true;
    }

    /// Record a failure now instead of on drop.
    pub fn mark_failed(&mut self, error: &str) {
        debug!(job_id = %self.job_id, error = %error, "Job marked as failed");
        self.emit_failure(error);
        self.completed = true;
    }

    pub fn is_completed(&self) -> bool {
        self.completed
    }

    pub fn job_id(&self) -> Uuid {
        self.job_id
    }

    fn emit_failure(&self, error: &str) {
        if let Some(ref bus) = self.event_bus {
            bus.job_aborted(self.job_id, error);
        }
    }
}

impl Drop for JobGuard {
    fn drop(&mut self) {
        if !self.completed {
            warn!(
                job_id = %self.job_id,
                "Job guard dropped without completion - emitting failure"
            );
            self.emit_failure("Job terminated unexpectedly");
        }
        self.busy.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use events::Event;

    #[test]
    fn test_second_acquire_is_in_progress() {
        let busy = Arc::new(AtomicBool::new(false));
        let mut first = JobGuard::acquire(Uuid::new_v4(), busy.clone(), None).unwrap();

        let err = JobGuard::acquire(Uuid::new_v4(), busy.clone(), None).err().unwrap();
        assert!(matches!(err, OrchestratorError::InProgress));

        first.mark_completed();
        drop(first);
        assert!(JobGuard::acquire(Uuid::new_v4(), busy, None).is_ok());
    }

    #[tokio::test]
    async fn test_drop_without_completion_emits_error() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        let busy = Arc::new(AtomicBool::new(false));

        let guard = JobGuard::acquire(Uuid::new_v4(), busy.clone(), Some(bus)).unwrap();
        assert!(busy.load(Ordering::SeqCst));
        drop(guard);

        assert!(!busy.load(Ordering::SeqCst));
        let envelope = rx.recv().await.unwrap();
        assert!(matches!(envelope.event, Event::Error { .. }));
    }

    #[test]
    fn test_mark_failed_completes() {
        let busy = Arc::new(AtomicBool::new(false));
        let mut guard = JobGuard::acquire(Uuid::new_v4(), busy, None).unwrap();
        guard.mark_failed("continue trigger timed out");
        assert!(guard.is_completed());
    }
}

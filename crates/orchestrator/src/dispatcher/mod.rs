//! Dispatcher
//!
//! Submits a compiled Job to the instrument as a single command, follows
//! each StepRun through the trigger protocol and commits its effects to
//! the ledger and registry as soon as it is physically confirmed.

mod command;
mod commit;

pub use command::{aux_log_name, job_command, method_path, step_params};

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::watch;
use tracing::{error, info, warn};

use events::EventBus;
use ledger::{RunRecordRepository, SampleLedger};
use pal_core::{ErrorKind, Job, PositionRequest};
use registry::PositionRegistry;
use transport::{InstrumentTransport, JobCommand, TransportError};

use crate::config::{join_instrument_path, DispatcherConfig};
use crate::error::{OrchestratorError, Result};
use crate::resources::JobGuard;
use crate::triggers::{TriggerLines, TriggerOutcome, TriggerSynchronizer};

use self::commit::CommitState;

pub struct Dispatcher {
    registry: PositionRegistry,
    ledger: Arc<dyn SampleLedger>,
    transport: Arc<dyn InstrumentTransport>,
    run_records: Option<RunRecordRepository>,
    triggers: Option<TriggerLines>,
    config: DispatcherConfig,
    event_bus: Option<EventBus>,
    busy: Arc<AtomicBool>,
    abort_tx: watch::Sender<bool>,
}

impl Dispatcher {
    pub fn new(
        registry: PositionRegistry,
        ledger: Arc<dyn SampleLedger>,
        transport: Arc<dyn InstrumentTransport>,
        config: DispatcherConfig,
    ) -> Self {
        let (abort_tx, _) = watch::channel(false);
        Self {
            registry,
            ledger,
            transport,
            run_records: None,
            triggers: None,
            config,
            event_bus: None,
            busy: Arc::new(AtomicBool::new(false)),
            abort_tx,
        }
    }

    pub fn with_triggers(mut self, triggers: TriggerLines) -> Self {
        self.triggers = Some(triggers);
        self
    }

    pub fn with_run_records(mut self, run_records: RunRecordRepository) -> Self {
        self.run_records = Some(run_records);
        self
    }

    pub fn with_event_bus(mut self, event_bus: EventBus) -> Self {
        self.event_bus = Some(event_bus);
        self
    }

    pub fn registry(&self) -> &PositionRegistry {
        &self.registry
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }

    /// Emergency stop: interrupts any trigger or schedule wait and rejects
    /// new jobs until [`reset_abort`](Self::reset_abort) is called.
    pub fn abort(&self) {
        warn!("Abort requested");
        self.abort_tx.send_replace(true);
        if let Err(e) = self.transport.terminate() {
            warn!(error = %e, "Failed to stop the instrument job");
        }
    }

    pub fn reset_abort(&self) {
        info!("Abort latch cleared");
        self.abort_tx.send_replace(false);
    }

    pub fn is_aborted(&self) -> bool {
        *self.abort_tx.borrow()
    }

    pub fn abort_signal(&self) -> watch::Receiver<bool> {
        self.abort_tx.subscribe()
    }

    /// Transmit `job`, wait for each run's triggers and commit it.
    ///
    /// Timestamps and committed samples are written back into `job`, so the
    /// caller can inspect how far a failed job got. Runs after a failure are
    /// abandoned; runs already committed stay committed.
    ///
    /// A rejected job gives back the vials its compilation reserved.
    pub async fn submit(&self, job: &mut Job) -> Result<()> {
        let mut guard = match JobGuard::acquire(job.id, self.busy.clone(), self.event_bus.clone()) {
            Ok(guard) => guard,
            Err(e) => {
                warn!(job_id = %job.id, error = %e, "Job rejected");
                self.release_reservations(job, 0).await;
                return Err(e);
            }
        };

        if self.is_aborted() {
            let e = OrchestratorError::Estop("emergency stop is latched".to_string());
            warn!(job_id = %job.id, error = %e, "Job rejected");
            self.release_reservations(job, 0).await;
            guard.mark_failed(&e.to_string());
            return Err(e);
        }
        if job.is_empty() {
            let e = OrchestratorError::from(TransportError::EmptyJob);
            self.release_reservations(job, 0).await;
            guard.mark_failed(&e.to_string());
            return Err(e);
        }

        let submitted_at = Utc::now();
        job.submitted_at = Some(submitted_at);
        let logfile = join_instrument_path(&self.config.log_dir, &aux_log_name(job.id, submitted_at));
        job.aux_log_path = Some(logfile.clone());
        let command = job_command(job, &self.config.method_dir, &logfile);

        let mut sync = TriggerSynchronizer::new(
            self.triggers.clone(),
            self.config.triggers.clone(),
            self.abort_tx.subscribe(),
        )
        .with_event_bus(self.event_bus.clone())
        .with_transport(self.transport.clone());

        let mut committed = 0;
        match self
            .execute(job, &command, &logfile, &mut sync, &mut committed)
            .await
        {
            Ok(()) => {
                guard.mark_completed();
                info!(job_id = %job.id, runs = job.runs.len(), "Job completed");
                Ok(())
            }
            Err(e) => {
                self.handle_failure(job, committed, &e).await;
                guard.mark_failed(&e.to_string());
                Err(e)
            }
        }
    }

    async fn execute(
        &self,
        job: &mut Job,
        command: &JobCommand,
        logfile: &str,
        sync: &mut TriggerSynchronizer,
        committed: &mut usize,
    ) -> Result<()> {
        self.transport.prepare_aux_log(logfile).await?;
        sync.arm().await?;
        self.transport.transmit(command).await?;

        info!(
            job_id = %job.id,
            runs = job.runs.len(),
            transport = self.transport.name(),
            logfile = %logfile,
            "Job submitted"
        );
        if let Some(bus) = &self.event_bus {
            bus.job_submitted(job.id, job.runs.len(), self.transport.name());
        }

        let mut state = CommitState::default();
        for index in 0..job.runs.len() {
            let mut run = job.runs[index].clone();
            let outcome = sync.await_triggers(job.id, &mut run).await;
            // Keep observed timestamps even when a later phase failed.
            job.runs[index] = run.clone();

            if outcome? == TriggerOutcome::Skipped {
                let now = Utc::now();
                run.start_time = Some(now);
                run.continue_time = Some(now);
                run.done_time = Some(now);
                warn!(
                    job_id = %job.id,
                    run_id = %run.id,
                    "Trigger lines not configured, confirmation is not physical"
                );
            }

            self.commit_run(job, &mut run, &mut state).await?;
            job.runs[index] = run;
            *committed += 1;
        }
        Ok(())
    }

    async fn handle_failure(&self, job: &Job, committed: usize, e: &OrchestratorError) {
        let kind = e.kind();
        if kind == ErrorKind::Bug {
            error!(job_id = %job.id, error = %e, "Job failed");
        } else {
            warn!(job_id = %job.id, kind = %kind, error = %e, "Job failed");
        }

        if let (Some(bus), Some(run)) = (&self.event_bus, job.runs.get(committed)) {
            bus.run_failed(job.id, run.id, kind, e.to_string());
        }

        self.release_reservations(job, committed).await;
    }

    /// Release the "next empty vial" destinations of runs from `from` on
    /// whose vial is still empty.
    async fn release_reservations(&self, job: &Job, from: usize) {
        for run in job.runs.iter().skip(from) {
            if run.method.destination() != Some(PositionRequest::NextEmptyVial) {
                continue;
            }
            let Some(coord) = run.destination.as_ref().and_then(|d| d.position.coord()) else {
                continue;
            };
            match self.registry.query_tray(coord.tray, coord.slot, coord.vial).await {
                Ok(None) => {
                    if let Err(release_err) = self.registry.release_vial(coord).await {
                        warn!(vial = %coord, error = %release_err, "Failed to release vial reservation");
                    }
                }
                Ok(Some(_)) => {}
                Err(query_err) => {
                    warn!(vial = %coord, error = %query_err, "Failed to inspect reserved vial");
                }
            }
        }
    }
}

//! Trigger Synchronizer
//!
//! The instrument reports progress through three digital lines: start,
//! continue (the moment the sample physically moves) and done. Lines are
//! polled on a fixed interval; each phase has its own timeout and any wait
//! can be interrupted by the dispatcher's abort signal.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, warn};

use events::{EventBus, TriggerPhase};
use pal_core::StepRun;
use transport::{InstrumentTransport, JobState};

use crate::config::TriggerConfig;
use crate::error::{OrchestratorError, Result};
use crate::state_machine::{TriggerState, TriggerTracker};

/// One boolean input from the instrument.
#[async_trait]
pub trait TriggerLine: Send + Sync {
    async fn read(&self) -> Result<bool>;

    /// Clear a latched signal.
    async fn reset(&self) -> Result<()>;
}

/// Latched line held in memory, set by an IO driver or a test.
#[derive(Debug, Clone, Default)]
pub struct MemoryTrigger {
    state: Arc<AtomicBool>,
}

impl MemoryTrigger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fire(&self) {
        self.state.store(true, Ordering::SeqCst);
    }

    pub fn is_set(&self) -> bool {
        self.state.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TriggerLine for MemoryTrigger {
    async fn read(&self) -> Result<bool> {
        Ok(self.is_set())
    }

    async fn reset(&self) -> Result<()> {
        self.state.store(false, Ordering::SeqCst);
        Ok(())
    }
}

/// The three lines, in protocol order.
#[derive(Clone)]
pub struct TriggerLines {
    pub start: Arc<dyn TriggerLine>,
    pub continue_: Arc<dyn TriggerLine>,
    pub done: Arc<dyn TriggerLine>,
}

impl TriggerLines {
    pub fn new(
        start: Arc<dyn TriggerLine>,
        continue_: Arc<dyn TriggerLine>,
        done: Arc<dyn TriggerLine>,
    ) -> Self {
        Self {
            start,
            continue_,
            done,
        }
    }

    /// Three in-memory lines and handles to fire them.
    pub fn memory() -> (Self, [MemoryTrigger; 3]) {
        let handles = [MemoryTrigger::new(), MemoryTrigger::new(), MemoryTrigger::new()];
        let lines = Self::new(
            Arc::new(handles[0].clone()),
            Arc::new(handles[1].clone()),
            Arc::new(handles[2].clone()),
        );
        (lines, handles)
    }

    pub fn line(&self, phase: TriggerPhase) -> &Arc<dyn TriggerLine> {
        match phase {
            TriggerPhase::Start => &self.start,
            TriggerPhase::Continue => &self.continue_,
            TriggerPhase::Done => &self.done,
        }
    }

    /// Reset every line before the instrument is started.
    pub async fn arm(&self) -> Result<()> {
        for phase in [TriggerPhase::Start, TriggerPhase::Continue, TriggerPhase::Done] {
            self.line(phase).reset().await?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for TriggerLines {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TriggerLines").finish_non_exhaustive()
    }
}

/// How a StepRun's timestamps were obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerOutcome {
    /// All three lines fired.
    Confirmed,
    /// No lines configured; nothing was observed.
    Skipped,
}

/// Waits for the trigger sequence of successive StepRuns.
pub struct TriggerSynchronizer {
    lines: Option<TriggerLines>,
    config: TriggerConfig,
    abort: watch::Receiver<bool>,
    event_bus: Option<EventBus>,
    transport: Option<Arc<dyn InstrumentTransport>>,
}

impl TriggerSynchronizer {
    pub fn new(
        lines: Option<TriggerLines>,
        config: TriggerConfig,
        abort: watch::Receiver<bool>,
    ) -> Self {
        Self {
            lines,
            config,
            abort,
            event_bus: None,
            transport: None,
        }
    }

    pub fn with_event_bus(mut self, event_bus: Option<EventBus>) -> Self {
        self.event_bus = event_bus;
        self
    }

    /// Poll the launched job while waiting, so a job that dies early fails
    /// the wait instead of running into a trigger timeout.
    pub fn with_transport(mut self, transport: Arc<dyn InstrumentTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled && self.lines.is_some()
    }

    fn timeout(&self, phase: TriggerPhase) -> Duration {
        match phase {
            TriggerPhase::Start => self.config.start_timeout,
            TriggerPhase::Continue => self.config.continue_timeout,
            TriggerPhase::Done => self.config.done_timeout,
        }
    }

    /// Reset all lines so a stale latch from a previous job is not taken
    /// as this job's first signal.
    pub async fn arm(&self) -> Result<()> {
        match &self.lines {
            Some(lines) if self.config.enabled => lines.arm().await,
            _ => Ok(()),
        }
    }

    /// Block until start, continue and done fire for `run`, recording each
    /// timestamp on the run as it is observed.
    ///
    /// Without lines nothing can be observed: the wait only lasts until the
    /// launched job exits and the outcome is `Skipped`.
    pub async fn await_triggers(&mut self, job_id: uuid::Uuid, run: &mut StepRun) -> Result<TriggerOutcome> {
        let lines = match &self.lines {
            Some(lines) if self.config.enabled => lines.clone(),
            _ => {
                self.await_job_exit().await?;
                return Ok(TriggerOutcome::Skipped);
            }
        };

        let mut tracker = TriggerTracker::new();
        tracker.advance()?;

        while let Some(phase) = tracker.state().phase() {
            let line = lines.line(phase).clone();
            match self.wait_for(phase, line.as_ref()).await {
                Ok(at) => {
                    line.reset().await?;
                    match phase {
                        TriggerPhase::Start => run.start_time = Some(at),
                        TriggerPhase::Continue => run.continue_time = Some(at),
                        TriggerPhase::Done => run.done_time = Some(at),
                    }
                    debug!(run_id = %run.id, phase = %phase, "Trigger observed");
                    if let Some(bus) = &self.event_bus {
                        bus.trigger_observed(job_id, run.id, phase, at);
                    }
                    tracker.advance()?;
                }
                Err(e) => {
                    let terminal = match &e {
                        OrchestratorError::Estop(_) => TriggerState::Aborted,
                        _ => TriggerState::TimedOut,
                    };
                    tracker.transition(terminal)?;
                    return Err(e);
                }
            }
        }

        Ok(TriggerOutcome::Confirmed)
    }

    fn job_state(&self) -> Result<JobState> {
        match &self.transport {
            Some(transport) => Ok(transport.poll_job()?),
            None => Ok(JobState::Idle),
        }
    }

    async fn await_job_exit(&mut self) -> Result<()> {
        let timeout = self.config.done_timeout;
        let deadline = Instant::now() + timeout;
        let mut abort_open = true;

        loop {
            if *self.abort.borrow() {
                return Err(OrchestratorError::Estop("aborted while waiting for the job to exit".to_string()));
            }
            if self.job_state()? == JobState::Idle {
                return Ok(());
            }

            let now = Instant::now();
            if now >= deadline {
                warn!(timeout_secs = timeout.as_secs(), "Job did not exit in time");
                return Err(OrchestratorError::timeout(TriggerPhase::Done, timeout));
            }
            let pause = self.config.poll_interval.min(deadline - now);
            self.pause(pause, &mut abort_open).await;
        }
    }

    async fn pause(&mut self, pause: Duration, abort_open: &mut bool) {
        if *abort_open {
            tokio::select! {
                _ = tokio::time::sleep(pause) => {}
                changed = self.abort.changed() => {
                    if changed.is_err() {
                        *abort_open = false;
                    }
                }
            }
        } else {
            tokio::time::sleep(pause).await;
        }
    }

    async fn wait_for(&mut self, phase: TriggerPhase, line: &dyn TriggerLine) -> Result<DateTime<Utc>> {
        let timeout = self.timeout(phase);
        let deadline = Instant::now() + timeout;
        let mut abort_open = true;

        loop {
            if *self.abort.borrow() {
                return Err(OrchestratorError::Estop(format!(
                    "aborted while waiting for {} trigger",
                    phase
                )));
            }
            if line.read().await? {
                return Ok(Utc::now());
            }
            self.job_state()?;

            let now = Instant::now();
            if now >= deadline {
                warn!(phase = %phase, timeout_secs = timeout.as_secs(), "Trigger wait timed out");
                return Err(OrchestratorError::timeout(phase, timeout));
            }
            let pause = self.config.poll_interval.min(deadline - now);
            self.pause(pause, &mut abort_open).await;
        }
    }
}

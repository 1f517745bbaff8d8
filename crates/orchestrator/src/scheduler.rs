//! Run Scheduler
//!
//! Repeats a template of MicroSteps under a time-spacing law. Every run is
//! compiled fresh from the template and fully dispatched before the delay
//! to the next one starts, so runs never overlap.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{info, warn};

use events::EventBus;
use pal_core::{Job, MicroStep};

use crate::compiler::PlanCompiler;
use crate::dispatcher::Dispatcher;
use crate::error::{OrchestratorError, Result};

/// Time-spacing law between repetitions.
#[derive(Debug, Clone, PartialEq)]
pub enum Spacing {
    /// Run `i` waits `periods[i]` after the previous submission; the last
    /// period repeats.
    Linear { periods: Vec<Duration> },
    /// Run `i` is due `period * factor^i` after the first submission.
    Geometric { period: Duration, factor: f64 },
    /// Run `i` is due `offsets[i]` after the schedule started.
    Custom { offsets: Vec<Duration> },
}

impl Spacing {
    pub fn validate(&self, total_runs: usize) -> Result<()> {
        match self {
            Self::Linear { periods } if periods.is_empty() => Err(OrchestratorError::Critical(
                "linear spacing needs at least one period".to_string(),
            )),
            Self::Geometric { factor, .. } if !factor.is_finite() || *factor <= 0.0 => {
                Err(OrchestratorError::Numerical(format!(
                    "geometric factor must be positive, got {}",
                    factor
                )))
            }
            Self::Custom { offsets } if offsets.len() < total_runs => {
                Err(OrchestratorError::Critical(format!(
                    "custom spacing has {} offsets for {} runs",
                    offsets.len(),
                    total_runs
                )))
            }
            _ => Ok(()),
        }
    }

    /// Delay before submitting run `index`, never negative.
    pub fn delay(&self, index: usize, clock: &ScheduleClock, now: Instant, offset: Duration) -> Result<Duration> {
        let due = match self {
            Self::Linear { periods } => {
                let period = periods
                    .get(index)
                    .or_else(|| periods.last())
                    .copied()
                    .unwrap_or_default();
                let reference = clock.last_submit.unwrap_or(clock.started);
                reference + period
            }
            Self::Geometric { period, factor } => {
                let Some(first) = clock.first_submit else {
                    return Ok(Duration::ZERO);
                };
                let secs = period.as_secs_f64() * factor.powi(index as i32);
                let scaled = Duration::try_from_secs_f64(secs).map_err(|e| {
                    OrchestratorError::Numerical(format!(
                        "geometric delay for run {} is out of range: {}",
                        index, e
                    ))
                })?;
                first + scaled
            }
            Self::Custom { offsets } => {
                let at = offsets.get(index).copied().ok_or_else(|| {
                    OrchestratorError::Critical(format!("no custom offset for run {}", index))
                })?;
                clock.started + at
            }
        };

        Ok(due
            .checked_duration_since(now)
            .unwrap_or_default()
            .saturating_sub(offset))
    }
}

/// Reference instants of a running schedule.
#[derive(Debug, Clone, Copy)]
pub struct ScheduleClock {
    pub started: Instant,
    pub first_submit: Option<Instant>,
    pub last_submit: Option<Instant>,
}

impl ScheduleClock {
    pub fn new(started: Instant) -> Self {
        Self {
            started,
            first_submit: None,
            last_submit: None,
        }
    }

    pub fn record_submit(&mut self, at: Instant) {
        self.first_submit.get_or_insert(at);
        self.last_submit = Some(at);
    }
}

/// One completed repetition.
#[derive(Debug, Clone)]
pub struct ScheduledRun {
    pub index: usize,
    pub delay: Duration,
    pub offset_from_start: Duration,
    pub job: Job,
}

pub struct RunScheduler {
    compiler: PlanCompiler,
    dispatcher: Arc<Dispatcher>,
    event_bus: Option<EventBus>,
}

impl RunScheduler {
    pub fn new(compiler: PlanCompiler, dispatcher: Arc<Dispatcher>) -> Self {
        Self {
            compiler,
            dispatcher,
            event_bus: None,
        }
    }

    pub fn with_event_bus(mut self, event_bus: EventBus) -> Self {
        self.event_bus = Some(event_bus);
        self
    }

    /// Run `template` `total_runs` times. Stops at the first error; runs
    /// completed before it stay committed.
    pub async fn run_schedule(
        &self,
        template: &[MicroStep],
        total_runs: usize,
        spacing: &Spacing,
        offset: Duration,
    ) -> Result<Vec<ScheduledRun>> {
        spacing.validate(total_runs)?;

        let mut abort = self.dispatcher.abort_signal();
        let mut clock = ScheduleClock::new(Instant::now());
        let mut completed = Vec::with_capacity(total_runs);

        for index in 0..total_runs {
            let delay = spacing.delay(index, &clock, Instant::now(), offset)?;
            if !delay.is_zero() {
                info!(run = index + 1, total_runs, delay_secs = delay.as_secs_f64(), "Waiting for next run");
                wait(delay, &mut abort).await?;
            }
            if *abort.borrow() {
                return Err(OrchestratorError::Estop("schedule aborted".to_string()));
            }

            if let Some(bus) = &self.event_bus {
                bus.scheduled_run_started(index, total_runs, delay.as_millis() as u64);
            }

            let mut job = self.compiler.compile(template).await?;
            let submitted = Instant::now();
            clock.record_submit(submitted);
            if let Err(e) = self.dispatcher.submit(&mut job).await {
                warn!(run = index + 1, total_runs, error = %e, "Scheduled run failed, stopping schedule");
                return Err(e);
            }

            info!(run = index + 1, total_runs, job_id = %job.id, "Scheduled run completed");
            completed.push(ScheduledRun {
                index,
                delay,
                offset_from_start: submitted.duration_since(clock.started),
                job,
            });
        }

        Ok(completed)
    }
}

/// Sleep for `delay` unless the abort signal is raised first.
async fn wait(delay: Duration, abort: &mut watch::Receiver<bool>) -> Result<()> {
    let sleep = tokio::time::sleep(delay);
    tokio::pin!(sleep);

    loop {
        if *abort.borrow() {
            return Err(OrchestratorError::Estop("aborted between scheduled runs".to_string()));
        }
        tokio::select! {
            _ = &mut sleep => return Ok(()),
            changed = abort.changed() => {
                if changed.is_err() {
                    sleep.await;
                    return Ok(());
                }
            }
        }
    }
}

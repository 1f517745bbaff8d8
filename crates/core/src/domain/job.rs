use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::position::Position;
use super::sample::{Inheritance, Sample, SampleStatus};
use super::step::{Method, Tool, WashFlags};

/// How a consumed sample is affected by the step that consumes it.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Disposition {
    /// Volume leaves the source.
    Withdraw,
    /// Volume is added to an existing destination sample.
    Dilute,
    /// The sample is folded into a new assembly.
    Incorporate,
}

/// A sample consumed by a step, together with the volume change and the
/// provenance tags the step applies to it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SampleIn {
    pub sample: Sample,
    /// Signed volume change in millilitres.
    pub delta_ml: f64,
    pub disposition: Disposition,
    /// Inheritance for this step; `None` until the destination is resolved.
    #[serde(default)]
    pub inheritance: Option<Inheritance>,
    #[serde(default)]
    pub statuses: Vec<SampleStatus>,
}

impl SampleIn {
    fn new(sample: Sample, delta_ml: f64, disposition: Disposition) -> Self {
        Self {
            sample,
            delta_ml,
            disposition,
            inheritance: None,
            statuses: Vec::new(),
        }
    }

    pub fn withdraw(sample: Sample, volume_ml: f64) -> Self {
        Self::new(sample, -volume_ml, Disposition::Withdraw)
    }

    pub fn dilute(sample: Sample, volume_ml: f64) -> Self {
        Self::new(sample, volume_ml, Disposition::Dilute)
            .with_effect(Inheritance::AllowBoth, SampleStatus::Preserved)
    }

    pub fn incorporate(sample: Sample) -> Self {
        Self::new(sample, 0.0, Disposition::Incorporate)
            .with_effect(Inheritance::GiveOnly, SampleStatus::Incorporated)
    }

    pub fn with_effect(mut self, inheritance: Inheritance, status: SampleStatus) -> Self {
        self.inheritance = Some(inheritance);
        self.add_status(status);
        self
    }

    pub fn add_status(&mut self, status: SampleStatus) {
        if !self.statuses.contains(&status) {
            self.statuses.push(status);
        }
    }

    /// Give-only/preserved for entries the destination left unset.
    pub fn finalize(&mut self) {
        if self.inheritance.is_none() {
            self.inheritance = Some(Inheritance::GiveOnly);
            self.add_status(SampleStatus::Preserved);
        }
    }
}

/// A resolved position with its predicted content before and after a step.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PositionSnapshot {
    pub position: Position,
    pub before: Option<Sample>,
    pub after: Option<Sample>,
}

impl PositionSnapshot {
    pub fn new(position: Position, before: Option<Sample>) -> Self {
        Self {
            position,
            after: before.clone(),
            before,
        }
    }
}

/// One resolved autosampler invocation with its predicted effects and
/// trigger timestamps.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StepRun {
    pub id: Uuid,
    /// Index of the MicroStep this run came from.
    pub step_index: usize,
    pub repeat_index: u32,
    pub method: Method,
    pub tool: Tool,
    pub wash: WashFlags,
    pub volume_ul: f64,
    pub source: Option<PositionSnapshot>,
    pub destination: Option<PositionSnapshot>,
    pub samples_in: Vec<SampleIn>,
    pub samples_out: Vec<Sample>,
    pub start_time: Option<DateTime<Utc>>,
    pub continue_time: Option<DateTime<Utc>>,
    pub done_time: Option<DateTime<Utc>>,
}

impl StepRun {
    pub fn new(step_index: usize, repeat_index: u32, method: Method, tool: Tool, wash: WashFlags) -> Self {
        let volume_ul = method.volume_ul();
        Self {
            id: Uuid::new_v4(),
            step_index,
            repeat_index,
            method,
            tool,
            wash,
            volume_ul,
            source: None,
            destination: None,
            samples_in: Vec::new(),
            samples_out: Vec::new(),
            start_time: None,
            continue_time: None,
            done_time: None,
        }
    }

    pub fn is_confirmed(&self) -> bool {
        self.done_time.is_some()
    }
}

/// A compiled plan submitted to the instrument as one batch.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Job {
    pub id: Uuid,
    pub runs: Vec<StepRun>,
    pub submitted_at: Option<DateTime<Utc>>,
    pub aux_log_path: Option<String>,
}

impl Job {
    pub fn new(runs: Vec<StepRun>) -> Self {
        Self {
            id: Uuid::new_v4(),
            runs,
            submitted_at: None,
            aux_log_path: None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.runs.is_empty()
    }
}

//! Plan Compiler
//!
//! Turns MicroSteps into a Job of resolved StepRuns. Runs are compiled in
//! order against a planning overlay of the registry, so each run sees the
//! occupancy the runs before it will leave behind. Vials picked for
//! "next empty vial" are reserved in the registry; a failed compilation
//! releases every reservation it took.

mod resolve;
mod volume;

pub use resolve::{request_key, resolve_destination, resolve_source, ResolvedDestination, ResolvedSource};
pub use volume::{apply_entries, apply_entry, update_volume};

use pal_core::{Job, MicroStep, PositionKey, PositionRequest, SampleStatus, StepRun, TrayCoord};
use registry::{PositionRegistry, RegistrySnapshot};
use tracing::{debug, info, warn};

use crate::error::{OrchestratorError, Result};

/// Occupancy as it will be after the runs compiled so far.
struct Planning {
    overlay: RegistrySnapshot,
    reserved: Vec<TrayCoord>,
}

impl Planning {
    fn planned_vials(&self) -> Vec<TrayCoord> {
        self.overlay
            .vials()
            .filter(|(_, state, index)| state.vials[*index].is_some() || state.blocked[*index])
            .map(|(coord, _, _)| coord)
            .collect()
    }
}

#[derive(Debug, Clone)]
pub struct PlanCompiler {
    registry: PositionRegistry,
}

impl PlanCompiler {
    pub fn new(registry: PositionRegistry) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &PositionRegistry {
        &self.registry
    }

    pub async fn compile(&self, steps: &[MicroStep]) -> Result<Job> {
        let mut planning = Planning {
            overlay: self.registry.snapshot().await,
            reserved: Vec::new(),
        };

        match self.compile_steps(&mut planning, steps).await {
            Ok(runs) => {
                let job = Job::new(runs);
                info!(
                    job_id = %job.id,
                    steps = steps.len(),
                    runs = job.runs.len(),
                    reserved = planning.reserved.len(),
                    "Compiled job"
                );
                Ok(job)
            }
            Err(e) => {
                for coord in &planning.reserved {
                    if let Err(release_err) = self.registry.release_vial(*coord).await {
                        warn!(vial = %coord, error = %release_err, "Failed to release vial reservation");
                    }
                }
                warn!(error = %e, released = planning.reserved.len(), "Compilation failed");
                Err(e)
            }
        }
    }

    async fn compile_steps(&self, planning: &mut Planning, steps: &[MicroStep]) -> Result<Vec<StepRun>> {
        let mut runs = Vec::new();
        for (step_index, step) in steps.iter().enumerate() {
            step.validate()?;
            for repeat_index in 0..step.repeat {
                let run = self.compile_run(planning, step_index, repeat_index, step).await?;
                runs.push(run);
            }
        }
        Ok(runs)
    }

    async fn compile_run(
        &self,
        planning: &mut Planning,
        step_index: usize,
        repeat_index: u32,
        step: &MicroStep,
    ) -> Result<StepRun> {
        let mut run = StepRun::new(step_index, repeat_index, step.method.clone(), step.tool, step.wash);
        let Some(output_type) = step.method.output_type() else {
            return Ok(run);
        };
        let volume_ml = step.volume_ml()?;

        let source_request = step.method.source().ok_or_else(|| {
            OrchestratorError::bug(format!("{} has an output but no source", step.method.name()))
        })?;
        let destination_request = step.method.destination().ok_or_else(|| {
            OrchestratorError::bug(format!("{} has an output but no destination", step.method.name()))
        })?;

        let source = resolve_source(&planning.overlay, source_request, output_type, volume_ml)?;
        if let Some(key) = request_key(&destination_request) {
            if key == source.snapshot.position.key() {
                return Err(OrchestratorError::Critical(format!(
                    "source and destination are both {}",
                    key
                )));
            }
        }

        let (position, occupant, expect_dilution) = match &destination_request {
            PositionRequest::NextEmptyVial => {
                let position = self
                    .registry
                    .find_free_vial_excluding(volume_ml, &planning.planned_vials())
                    .await?;
                if let Some(coord) = position.coord() {
                    planning.reserved.push(coord);
                    planning.overlay.set_blocked(coord, true)?;
                }
                (position, None, false)
            }
            PositionRequest::NextFullVialAfter(after) => {
                let (coord, tray_kind) = planning.overlay.find_next_full_vial_after(*after)?;
                let key = PositionKey::Tray(coord);
                let occupant = planning.overlay.occupant(&key)?.cloned();
                (pal_core::Position::Tray { coord, tray_kind }, occupant, true)
            }
            explicit => {
                let key = request_key(explicit).ok_or_else(|| {
                    OrchestratorError::bug(format!("{} has no registry key", explicit))
                })?;
                let position = planning.overlay.position(&key)?;
                let occupant = planning.overlay.occupant(&key)?.cloned();
                (position, occupant, false)
            }
        };
        if position.key() == source.snapshot.position.key() {
            return Err(OrchestratorError::Critical(format!(
                "source and destination are both {}",
                position
            )));
        }

        let destination = resolve_destination(
            position,
            occupant,
            output_type,
            volume_ml,
            &source.withdrawn,
            expect_dilution,
        )?;
        let always_destroys = destination.snapshot.position.capabilities().always_destroys;

        let mut samples_in = vec![source.entry];
        samples_in.extend(destination.entries);
        for entry in samples_in.iter_mut() {
            entry.finalize();
            if always_destroys {
                entry.add_status(SampleStatus::Destroyed);
            }
        }
        let mut samples_out = destination.samples_out;
        if always_destroys {
            for sample in samples_out.iter_mut() {
                sample.for_each_mut(&mut |node| {
                    if !node.is_labeled() {
                        node.add_status(SampleStatus::Destroyed);
                    }
                });
            }
        }

        let mut source_snapshot = source.snapshot;
        if let Some(after) = source_snapshot.after.as_mut() {
            apply_entries(after, &samples_in)?;
        }
        let mut destination_snapshot = destination.snapshot;
        if let Some(after) = destination_snapshot.after.as_mut() {
            for created in &samples_out {
                after.replace(created);
            }
            apply_entries(after, &samples_in)?;
        }

        planning
            .overlay
            .set(&source_snapshot.position.key(), source_snapshot.after.clone())?;
        let landed = if always_destroys {
            None
        } else {
            destination_snapshot.after.clone()
        };
        planning
            .overlay
            .set(&destination_snapshot.position.key(), landed)?;

        debug!(
            step = step_index,
            repeat = repeat_index,
            method = step.method.name(),
            source = %source_snapshot.position,
            destination = %destination_snapshot.position,
            volume_ml,
            "Resolved step run"
        );

        run.source = Some(source_snapshot);
        run.destination = Some(destination_snapshot);
        run.samples_in = samples_in;
        run.samples_out = samples_out;
        Ok(run)
    }
}

//! Source and destination resolution against the planning overlay.

use pal_core::{
    AssemblySample, Inheritance, Position, PositionKey, PositionRequest, PositionSnapshot, Sample,
    SampleIn, SampleMeta, SampleStatus, SampleType,
};
use registry::RegistrySnapshot;

use crate::error::{OrchestratorError, Result};

/// The source side of a StepRun.
#[derive(Debug, Clone)]
pub struct ResolvedSource {
    pub snapshot: PositionSnapshot,
    /// The sample (or assembly part) liquid is drawn from.
    pub withdrawn: Sample,
    pub entry: SampleIn,
}

/// The destination side of a StepRun before effects are applied.
#[derive(Debug, Clone)]
pub struct ResolvedDestination {
    pub snapshot: PositionSnapshot,
    pub entries: Vec<SampleIn>,
    pub samples_out: Vec<Sample>,
}

/// Registry key of an explicit request; dynamic kinds have none.
pub fn request_key(request: &PositionRequest) -> Option<PositionKey> {
    match request {
        PositionRequest::Custom { name } => Some(PositionKey::Custom(name.clone())),
        PositionRequest::Tray(coord) => Some(PositionKey::Tray(*coord)),
        PositionRequest::NextEmptyVial | PositionRequest::NextFullVialAfter(_) => None,
    }
}

pub fn resolve_source(
    overlay: &RegistrySnapshot,
    request: &PositionRequest,
    output_type: SampleType,
    volume_ml: f64,
) -> Result<ResolvedSource> {
    let key = request_key(request).ok_or_else(|| {
        OrchestratorError::Critical(format!("{} is not a valid source", request))
    })?;
    let position = overlay.position(&key)?;
    let occupant = overlay
        .occupant(&key)?
        .cloned()
        .ok_or_else(|| OrchestratorError::NotAvailable(format!("source {} is empty", position)))?;

    let withdrawn = match occupant.as_assembly() {
        Some(assembly) => {
            let index = assembly.part_index(output_type).ok_or_else(|| {
                OrchestratorError::Critical(format!(
                    "assembly {} at {} has no {} part",
                    occupant.describe(),
                    position,
                    output_type.as_str()
                ))
            })?;
            assembly.parts()[index].clone()
        }
        None if occupant.sample_type() == output_type => occupant.clone(),
        None => {
            return Err(OrchestratorError::Critical(format!(
                "source {} holds {} {}, expected {}",
                position,
                occupant.sample_type().as_str(),
                occupant.describe(),
                output_type.as_str()
            )))
        }
    };

    let entry = SampleIn::withdraw(withdrawn.clone(), volume_ml);
    Ok(ResolvedSource {
        snapshot: PositionSnapshot::new(position, Some(occupant)),
        withdrawn,
        entry,
    })
}

/// Decide what happens at an already located destination.
///
/// `expect_dilution` is set for "next full vial" requests, which must land
/// on a single sample of the output type.
pub fn resolve_destination(
    position: Position,
    occupant: Option<Sample>,
    output_type: SampleType,
    volume_ml: f64,
    withdrawn: &Sample,
    expect_dilution: bool,
) -> Result<ResolvedDestination> {
    let capabilities = position.capabilities();
    if !capabilities.destination_allowed {
        return Err(OrchestratorError::Critical(format!(
            "{} does not accept samples",
            position
        )));
    }
    let assembly_allowed = matches!(position, Position::Custom(_)) && capabilities.assembly_allowed;

    if expect_dilution {
        match &occupant {
            Some(sample) if sample.sample_type() == output_type => {}
            Some(sample) => {
                return Err(OrchestratorError::Critical(format!(
                    "{} holds {} {}, expected a single {} sample",
                    position,
                    sample.sample_type().as_str(),
                    sample.describe(),
                    output_type.as_str()
                )))
            }
            None => {
                return Err(OrchestratorError::bug(format!(
                    "next full vial {} is empty",
                    position
                )))
            }
        }
    }

    let mut entries = Vec::new();
    let mut samples_out = Vec::new();

    let after = match occupant.clone() {
        None => {
            let created = new_sample(output_type, volume_ml, withdrawn)?;
            samples_out.push(created.clone());
            Some(created)
        }
        Some(Sample::Assembly(mut assembly)) => match assembly.part_index(output_type) {
            Some(index) => {
                let part = assembly.parts()[index].clone();
                entries.push(SampleIn::dilute(part, volume_ml));
                Some(Sample::Assembly(assembly))
            }
            None if assembly_allowed => {
                let created = new_sample(output_type, volume_ml, withdrawn)?;
                assembly.push_part(created.clone())?;
                samples_out.push(created);
                Some(Sample::Assembly(assembly))
            }
            None => {
                return Err(OrchestratorError::Critical(format!(
                    "{} cannot take a {} part into its assembly",
                    position,
                    output_type.as_str()
                )))
            }
        },
        Some(sample) if sample.sample_type() == output_type => {
            entries.push(SampleIn::dilute(sample.clone(), volume_ml));
            Some(sample)
        }
        Some(sample) if assembly_allowed => {
            let created = new_sample(output_type, volume_ml, withdrawn)?;
            let assembly = Sample::Assembly(AssemblySample::new(
                SampleMeta::new(),
                vec![sample.clone(), created],
            )?);
            entries.push(SampleIn::incorporate(sample));
            samples_out.push(assembly.clone());
            Some(assembly)
        }
        Some(sample) => {
            return Err(OrchestratorError::Critical(format!(
                "{} holds {} {} and does not allow assemblies",
                position,
                sample.sample_type().as_str(),
                sample.describe()
            )))
        }
    };

    Ok(ResolvedDestination {
        snapshot: PositionSnapshot {
            position,
            before: occupant,
            after,
        },
        entries,
        samples_out,
    })
}

/// Placeholder for a sample the step creates, inheriting composition and
/// provenance from the sample it was drawn from.
fn new_sample(output_type: SampleType, volume_ml: f64, withdrawn: &Sample) -> Result<Sample> {
    let mut sample = Sample::reference(output_type, volume_ml)?;
    let meta = sample.meta_mut();
    meta.composition = withdrawn.meta().composition.clone();
    meta.source = withdrawn.label().map(|l| vec![l.to_string()]).unwrap_or_default();
    meta.inheritance = Some(Inheritance::ReceiveOnly);
    sample.add_status(SampleStatus::Created);
    Ok(sample)
}

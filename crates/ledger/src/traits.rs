use async_trait::async_trait;
use pal_core::{Sample, SampleType};
use std::collections::HashMap;
use uuid::Uuid;

use crate::error::{LedgerError, Result};

/// Store of sample identity and provenance.
///
/// `put` assigns global labels of the form `<machine>__<type>__<n>`; passing
/// an already-labeled sample is a caller bug.
#[async_trait]
pub trait SampleLedger: Send + Sync {
    /// Machine name written into labels.
    fn machine_name(&self) -> &str;

    /// Fetch samples by label, in the order requested.
    async fn get(&self, labels: &[String]) -> Result<Vec<Sample>>;

    /// Persist new samples and return them labeled. Unlabeled assembly parts
    /// are labeled too.
    async fn put(&self, samples: Vec<Sample>) -> Result<Vec<Sample>>;

    /// Overwrite stored samples with the given state.
    async fn update(&self, samples: &[Sample]) -> Result<()>;
}

pub(crate) fn format_label(machine: &str, sample_type: SampleType, id: i64) -> String {
    format!("{}__{}__{}", machine, sample_type.as_str(), id)
}

/// Reject labeled samples and return the unlabeled nodes of each tree,
/// parts before their assembly.
pub(crate) fn unlabeled_nodes(samples: &[Sample]) -> Result<Vec<(Uuid, SampleType)>> {
    let mut nodes = Vec::new();
    for sample in samples {
        if let Some(label) = sample.label() {
            return Err(LedgerError::AlreadyLabeled(label.to_string()));
        }
        collect_unlabeled(sample, &mut nodes);
    }
    Ok(nodes)
}

fn collect_unlabeled(sample: &Sample, into: &mut Vec<(Uuid, SampleType)>) {
    if let Some(assembly) = sample.as_assembly() {
        for part in assembly.parts() {
            collect_unlabeled(part, into);
        }
    }
    if !sample.is_labeled() {
        into.push((sample.handle(), sample.sample_type()));
    }
}

/// Apply assigned labels and the ledger's machine name throughout a tree.
pub(crate) fn assign_labels(sample: &mut Sample, labels: &HashMap<Uuid, String>, machine: &str) {
    if let Some(assembly) = sample.as_assembly_mut() {
        for part in assembly.parts_mut() {
            assign_labels(part, labels, machine);
        }
    }
    let meta = sample.meta_mut();
    if let Some(label) = labels.get(&meta.handle) {
        meta.global_label = Some(label.clone());
        if meta.machine_name.is_none() {
            meta.machine_name = Some(machine.to_string());
        }
    }
}

/// Every labeled node of a tree, the root first.
pub(crate) fn labeled_nodes(sample: &Sample) -> Vec<&Sample> {
    let mut nodes = Vec::new();
    push_labeled(sample, &mut nodes);
    nodes
}

fn push_labeled<'a>(sample: &'a Sample, into: &mut Vec<&'a Sample>) {
    if sample.is_labeled() {
        into.push(sample);
    }
    if let Some(assembly) = sample.as_assembly() {
        for part in assembly.parts() {
            push_labeled(part, into);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pal_core::{AssemblySample, SampleMeta};

    #[test]
    fn test_unlabeled_nodes_order() {
        let occupant = Sample::solid(Vec::new()).with_label("lab__solid__1");
        let new_part = Sample::liquid(0.2, Vec::new());
        let assembly = Sample::Assembly(
            AssemblySample::new(SampleMeta::new(), vec![occupant, new_part.clone()]).unwrap(),
        );

        let nodes = unlabeled_nodes(&[assembly.clone()]).unwrap();
        assert_eq!(nodes.len(), 2);
        assert_eq!(nodes[0].0, new_part.handle());
        assert_eq!(nodes[1].0, assembly.handle());
    }

    #[test]
    fn test_labeled_root_rejected() {
        let sample = Sample::liquid(1.0, Vec::new()).with_label("lab__liquid__2");
        let err = unlabeled_nodes(&[sample]).unwrap_err();
        assert!(matches!(err, LedgerError::AlreadyLabeled(_)));
        assert_eq!(err.kind(), pal_core::ErrorKind::Bug);
    }

    #[test]
    fn test_format_label() {
        assert_eq!(format_label("lab", SampleType::Gas, 12), "lab__gas__12");
    }
}

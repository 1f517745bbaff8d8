use pal_core::{Disposition, Sample, SampleIn};
use tracing::warn;

use crate::error::{OrchestratorError, Result};

/// Change a sample's volume by `delta_ml`.
///
/// With `dilute`, partial molarities scale by old/new volume and the
/// dilution factor by new/old. Volume never drops below zero.
pub fn update_volume(sample: &mut Sample, delta_ml: f64, dilute: bool) -> Result<()> {
    if !delta_ml.is_finite() {
        return Err(OrchestratorError::Numerical(format!(
            "non-finite volume change {} for {}",
            delta_ml,
            sample.describe()
        )));
    }

    let label = sample.describe();
    let (old, new) = {
        let Some((volume, factor)) = sample.volume_parts_mut() else {
            return Err(OrchestratorError::Numerical(format!(
                "{} has no volume",
                label
            )));
        };
        let old = *volume;
        if !old.is_finite() || !factor.is_finite() {
            return Err(OrchestratorError::Numerical(format!(
                "{} has non-finite volume {}",
                label, old
            )));
        }

        let mut new = old + delta_ml;
        if new < 0.0 {
            warn!(
                sample = %label,
                volume_ml = old,
                delta_ml,
                "Volume would drop below zero, clamping"
            );
            new = 0.0;
        }
        *volume = new;
        if dilute && old > 0.0 && new > 0.0 {
            *factor *= new / old;
        }
        (old, new)
    };

    if dilute && old > 0.0 && new > 0.0 {
        let ratio = old / new;
        for component in sample.meta_mut().composition.iter_mut() {
            component.partial_molarity *= ratio;
        }
    }
    Ok(())
}

/// Apply one consumed-sample entry to the matching node of `sample`.
/// Returns whether a node matched.
pub fn apply_entry(sample: &mut Sample, entry: &SampleIn) -> Result<bool> {
    let Some(node) = sample.find_mut(entry.sample.handle()) else {
        return Ok(false);
    };

    match entry.disposition {
        Disposition::Withdraw => update_volume(node, entry.delta_ml, false)?,
        Disposition::Dilute => update_volume(node, entry.delta_ml, true)?,
        Disposition::Incorporate => {}
    }
    if let Some(inheritance) = entry.inheritance {
        node.meta_mut().inheritance = Some(inheritance);
    }
    for status in &entry.statuses {
        node.add_status(*status);
    }
    Ok(true)
}

/// Apply every entry that refers to a node of `sample`.
pub fn apply_entries(sample: &mut Sample, entries: &[SampleIn]) -> Result<()> {
    for entry in entries {
        apply_entry(sample, entry)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pal_core::{Component, ErrorKind, Inheritance, SampleStatus};

    #[test]
    fn test_dilution_rescales_composition() {
        let mut sample = Sample::liquid(1.0, vec![Component::new("KOH", 1.0)]);
        update_volume(&mut sample, 1.0, true).unwrap();

        assert_eq!(sample.volume_ml(), Some(2.0));
        assert!((sample.meta().composition[0].partial_molarity - 0.5).abs() < 1e-12);
        match &sample {
            Sample::Liquid(l) => assert!((l.dilution_factor - 2.0).abs() < 1e-12),
            other => panic!("unexpected sample {:?}", other),
        }
    }

    #[test]
    fn test_withdrawal_keeps_composition() {
        let mut sample = Sample::liquid(1.0, vec![Component::new("KOH", 1.0)]);
        update_volume(&mut sample, -0.2, false).unwrap();

        assert!((sample.volume_ml().unwrap() - 0.8).abs() < 1e-12);
        assert_eq!(sample.meta().composition[0].partial_molarity, 1.0);
    }

    #[test]
    fn test_underflow_clamps() {
        let mut sample = Sample::gas(0.5, Vec::new());
        update_volume(&mut sample, -2.0, false).unwrap();
        assert_eq!(sample.volume_ml(), Some(0.0));
    }

    #[test]
    fn test_numerical_errors() {
        let mut liquid = Sample::liquid(1.0, Vec::new());
        let err = update_volume(&mut liquid, f64::INFINITY, true).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Numerical);

        let mut solid = Sample::solid(Vec::new());
        let err = update_volume(&mut solid, 0.1, false).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Numerical);
    }

    #[test]
    fn test_apply_entry_sets_effect() {
        let sample = Sample::liquid(1.0, Vec::new());
        let mut entry = SampleIn::withdraw(sample.clone(), 0.25);
        entry.finalize();

        let mut target = sample;
        assert!(apply_entry(&mut target, &entry).unwrap());
        assert_eq!(target.volume_ml(), Some(0.75));
        assert_eq!(target.meta().inheritance, Some(Inheritance::GiveOnly));
        assert!(target.has_status(SampleStatus::Preserved));

        let mut other = Sample::liquid(1.0, Vec::new());
        assert!(!apply_entry(&mut other, &entry).unwrap());
    }
}

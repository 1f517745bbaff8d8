//! Commit of a confirmed StepRun.
//!
//! The compiled plan predicted every effect, but samples created by earlier
//! runs of the same job have since been labeled and other runs may have
//! touched the same samples. Each tree is therefore rebuilt from the current
//! versions of its samples before the run's entries are applied again.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use ledger::RunRecord;
use pal_core::{AssemblySample, Disposition, Job, Sample, SampleType, StepRun};
use tracing::{debug, info};
use uuid::Uuid;

use super::command::method_path;
use super::Dispatcher;
use crate::compiler::apply_entries;
use crate::error::{OrchestratorError, Result};

/// Latest committed version of every sample node touched by the job so far.
#[derive(Debug, Default)]
pub(crate) struct CommitState {
    committed: HashMap<Uuid, Sample>,
}

impl CommitState {
    fn record(&mut self, sample: &Sample) {
        for node in nodes(sample) {
            self.committed.insert(node.handle(), node.clone());
        }
    }
}

/// Every node of a tree, parents first.
fn nodes(sample: &Sample) -> Vec<&Sample> {
    let mut out = vec![sample];
    if let Some(assembly) = sample.as_assembly() {
        for part in assembly.parts() {
            out.extend(nodes(part));
        }
    }
    out
}

/// Maximal unlabeled subtrees, the ones the ledger has to create.
fn unlabeled_roots(sample: &Sample) -> Vec<Sample> {
    if !sample.is_labeled() {
        return vec![sample.clone()];
    }
    match sample.as_assembly() {
        Some(assembly) => assembly.parts().iter().flat_map(unlabeled_roots).collect(),
        None => Vec::new(),
    }
}

/// Rebuild a planned tree from current sample versions. Nodes with no
/// current version are new and kept as planned.
fn rebuild(node: &Sample, current: &HashMap<Uuid, Sample>) -> Result<Sample> {
    match node {
        Sample::Assembly(assembly) => {
            let meta = current
                .get(&node.handle())
                .map(|c| c.meta().clone())
                .unwrap_or_else(|| assembly.meta.clone());
            let parts = assembly
                .parts()
                .iter()
                .map(|part| rebuild(part, current))
                .collect::<Result<Vec<_>>>()?;
            Ok(Sample::Assembly(AssemblySample::new(meta, parts)?))
        }
        leaf => Ok(current
            .get(&leaf.handle())
            .cloned()
            .unwrap_or_else(|| leaf.clone())),
    }
}

/// Stamp creation time and provenance on samples the run created.
fn stamp_new(tree: &mut Sample, created_at: DateTime<Utc>, withdrawn: &[String], consumed: &[String]) {
    tree.for_each_mut(&mut |node| {
        if node.is_labeled() {
            return;
        }
        let is_assembly = node.sample_type() == SampleType::Assembly;
        let meta = node.meta_mut();
        meta.created_at = Some(created_at);
        meta.source = if is_assembly {
            consumed.to_vec()
        } else {
            withdrawn.to_vec()
        };
    });
}

impl Dispatcher {
    /// Current versions of every existing node in `tree`: from this job's
    /// commits first, then from the ledger by label.
    async fn fetch_current(&self, state: &CommitState, tree: &Sample) -> Result<HashMap<Uuid, Sample>> {
        let mut current = HashMap::new();
        let mut wanted: Vec<(Uuid, String)> = Vec::new();

        for node in nodes(tree) {
            if let Some(committed) = state.committed.get(&node.handle()) {
                current.insert(node.handle(), committed.clone());
            } else if let Some(label) = node.label() {
                wanted.push((node.handle(), label.to_string()));
            }
        }

        if !wanted.is_empty() {
            let labels: Vec<String> = wanted.iter().map(|(_, label)| label.clone()).collect();
            let fetched = self.ledger.get(&labels).await?;
            if fetched.len() != wanted.len() {
                return Err(OrchestratorError::bug(format!(
                    "ledger returned {} samples for {} labels",
                    fetched.len(),
                    wanted.len()
                )));
            }
            for ((handle, _), sample) in wanted.into_iter().zip(fetched) {
                current.insert(handle, sample);
            }
        }
        Ok(current)
    }

    /// Create the unlabeled parts of `tree` in the ledger and write back the
    /// existing ones. Returns the newly labeled subtrees.
    async fn persist(&self, tree: &mut Sample) -> Result<Vec<Sample>> {
        let root_was_labeled = tree.is_labeled();
        let roots = unlabeled_roots(tree);

        let stored = if roots.is_empty() {
            Vec::new()
        } else {
            let stored = self.ledger.put(roots).await?;
            for sample in &stored {
                if !tree.replace(sample) {
                    return Err(OrchestratorError::bug(format!(
                        "stored sample {} is not part of its tree",
                        sample.describe()
                    )));
                }
            }
            stored
        };

        if root_was_labeled {
            self.ledger.update(std::slice::from_ref(tree)).await?;
        }
        Ok(stored)
    }

    pub(crate) async fn commit_run(&self, job: &Job, run: &mut StepRun, state: &mut CommitState) -> Result<()> {
        let created_at = run.continue_time.or(run.done_time).unwrap_or_else(Utc::now);
        let mut created_labels = Vec::new();

        if let (Some(source), Some(destination)) = (run.source.clone(), run.destination.clone()) {
            let planned_source = source.before.clone().ok_or_else(|| {
                OrchestratorError::bug(format!("run {} has an empty source", run.id))
            })?;

            let mut current = self.fetch_current(state, &planned_source).await?;
            if let Some(planned) = &destination.after {
                current.extend(self.fetch_current(state, planned).await?);
            }
            for entry in run.samples_in.iter_mut() {
                if let Some(sample) = current.get(&entry.sample.handle()) {
                    entry.sample = sample.clone();
                }
            }

            let mut source_after = rebuild(&planned_source, &current)?;
            apply_entries(&mut source_after, &run.samples_in)?;
            let mut destination_after = match &destination.after {
                Some(planned) => {
                    let mut tree = rebuild(planned, &current)?;
                    apply_entries(&mut tree, &run.samples_in)?;
                    Some(tree)
                }
                None => None,
            };

            let withdrawn: Vec<String> = run
                .samples_in
                .iter()
                .filter(|e| e.disposition == Disposition::Withdraw)
                .filter_map(|e| e.sample.label().map(str::to_string))
                .collect();
            let consumed: Vec<String> = run
                .samples_in
                .iter()
                .filter_map(|e| e.sample.label().map(str::to_string))
                .collect();

            self.persist(&mut source_after).await?;
            let mut samples_out = Vec::new();
            if let Some(tree) = destination_after.as_mut() {
                stamp_new(tree, created_at, &withdrawn, &consumed);
                let created: HashSet<Uuid> = unlabeled_roots(tree)
                    .iter()
                    .flat_map(|root| nodes(root).into_iter().filter(|n| !n.is_labeled()).map(|n| n.handle()).collect::<Vec<_>>())
                    .collect();
                samples_out = self.persist(tree).await?;
                for root in &samples_out {
                    for node in nodes(root) {
                        if created.contains(&node.handle()) {
                            if let Some(label) = node.label() {
                                created_labels.push(label.to_string());
                            }
                        }
                    }
                }
            }

            self.registry
                .update(&source.position.key(), Some(source_after.clone()))
                .await?;
            let landed = if destination.position.capabilities().always_destroys {
                None
            } else {
                destination_after.clone()
            };
            self.registry.update(&destination.position.key(), landed).await?;

            state.record(&source_after);
            if let Some(tree) = &destination_after {
                state.record(tree);
            }

            if let Some(snapshot) = run.source.as_mut() {
                snapshot.before = current.get(&planned_source.handle()).cloned().or(snapshot.before.take());
                snapshot.after = Some(source_after);
            }
            if let Some(snapshot) = run.destination.as_mut() {
                snapshot.after = destination_after;
            }
            run.samples_out = samples_out;
        }

        let method_file = method_path(&self.config.method_dir, run);
        info!(
            target: "pal::steps",
            job_id = %job.id,
            run_id = %run.id,
            step = run.step_index,
            repeat = run.repeat_index,
            method = run.method.name(),
            tool = run.tool.as_str(),
            volume_ul = run.volume_ul,
            source = %run.source.as_ref().map(|s| s.position.to_string()).unwrap_or_default(),
            destination = %run.destination.as_ref().map(|s| s.position.to_string()).unwrap_or_default(),
            samples_out = ?created_labels,
            continue_time = ?run.continue_time,
            "Step run confirmed"
        );

        if let Some(repository) = &self.run_records {
            repository
                .create(&RunRecord::from_run(job, run, method_file))
                .await?;
            debug!(run_id = %run.id, "Run record written");
        }

        if let Some(bus) = &self.event_bus {
            bus.run_confirmed(job.id, run.id, run.method.name(), created_labels);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pal_core::SampleMeta;

    #[test]
    fn test_unlabeled_roots() {
        let labeled = Sample::solid(Vec::new()).with_label("lab__solid__1");
        let new_part = Sample::liquid(0.2, Vec::new());
        let assembly = Sample::Assembly(
            AssemblySample::new(SampleMeta::new(), vec![labeled.clone(), new_part.clone()]).unwrap(),
        );

        // A new assembly is created whole.
        let roots = unlabeled_roots(&assembly);
        assert_eq!(roots.len(), 1);
        assert_eq!(roots[0].handle(), assembly.handle());

        // An existing assembly only needs its new part.
        let existing = assembly.with_label("lab__assembly__2");
        let roots = unlabeled_roots(&existing);
        assert_eq!(roots.len(), 1);
        assert_eq!(roots[0].handle(), new_part.handle());
    }

    #[test]
    fn test_rebuild_uses_current_versions() {
        let occupant = Sample::liquid(1.0, Vec::new()).with_label("lab__liquid__1");
        let mut newer = occupant.clone();
        if let Some((volume, _)) = newer.volume_parts_mut() {
            *volume = 3.0;
        }
        let created = Sample::gas(0.5, Vec::new());
        let planned = Sample::Assembly(
            AssemblySample::new(SampleMeta::new(), vec![occupant.clone(), created.clone()]).unwrap(),
        );

        let mut current = HashMap::new();
        current.insert(occupant.handle(), newer);
        let rebuilt = rebuild(&planned, &current).unwrap();

        let parts = rebuilt.as_assembly().unwrap().parts();
        assert_eq!(parts[0].volume_ml(), Some(3.0));
        assert_eq!(parts[1], created);
        assert_eq!(rebuilt.handle(), planned.handle());
    }

    #[test]
    fn test_stamp_new_only_touches_unlabeled() {
        let at = Utc::now();
        let mut tree = Sample::Assembly(
            AssemblySample::new(
                SampleMeta::new(),
                vec![
                    Sample::solid(Vec::new()).with_label("lab__solid__1"),
                    Sample::liquid(0.2, Vec::new()),
                ],
            )
            .unwrap(),
        );
        stamp_new(
            &mut tree,
            at,
            &["lab__liquid__9".to_string()],
            &["lab__liquid__9".to_string(), "lab__solid__1".to_string()],
        );

        assert_eq!(tree.meta().created_at, Some(at));
        assert_eq!(tree.meta().source.len(), 2);
        let parts = tree.as_assembly().unwrap().parts();
        assert!(parts[0].meta().created_at.is_none());
        assert_eq!(parts[1].meta().source, vec!["lab__liquid__9".to_string()]);
    }
}

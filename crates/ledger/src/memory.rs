use async_trait::async_trait;
use pal_core::{Sample, SampleType};
use std::collections::HashMap;
use tokio::sync::Mutex;

use crate::error::{LedgerError, Result};
use crate::traits::{assign_labels, format_label, labeled_nodes, unlabeled_nodes, SampleLedger};

#[derive(Default)]
struct Inner {
    samples: HashMap<String, Sample>,
    last_ids: HashMap<SampleType, i64>,
}

/// Ledger kept in process memory, for tests and dry runs.
pub struct MemoryLedger {
    machine_name: String,
    inner: Mutex<Inner>,
}

impl MemoryLedger {
    pub fn new(machine_name: impl Into<String>) -> Self {
        Self {
            machine_name: machine_name.into(),
            inner: Mutex::new(Inner::default()),
        }
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.samples.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn all(&self) -> Vec<Sample> {
        let inner = self.inner.lock().await;
        let mut samples: Vec<Sample> = inner.samples.values().cloned().collect();
        samples.sort_by(|a, b| a.label().cmp(&b.label()));
        samples
    }
}

#[async_trait]
impl SampleLedger for MemoryLedger {
    fn machine_name(&self) -> &str {
        &self.machine_name
    }

    async fn get(&self, labels: &[String]) -> Result<Vec<Sample>> {
        let inner = self.inner.lock().await;
        labels
            .iter()
            .map(|label| {
                inner
                    .samples
                    .get(label)
                    .cloned()
                    .ok_or_else(|| LedgerError::NotFound(label.clone()))
            })
            .collect()
    }

    async fn put(&self, mut samples: Vec<Sample>) -> Result<Vec<Sample>> {
        let nodes = unlabeled_nodes(&samples)?;
        let mut inner = self.inner.lock().await;

        let mut labels = HashMap::new();
        for (handle, sample_type) in nodes {
            let n = inner.last_ids.entry(sample_type).or_insert(0);
            *n += 1;
            labels.insert(handle, format_label(&self.machine_name, sample_type, *n));
        }
        for sample in samples.iter_mut() {
            assign_labels(sample, &labels, &self.machine_name);
        }
        for sample in &samples {
            for node in labeled_nodes(sample) {
                if let Some(label) = node.label() {
                    inner.samples.insert(label.to_string(), node.clone());
                }
            }
        }
        Ok(samples)
    }

    async fn update(&self, samples: &[Sample]) -> Result<()> {
        let mut inner = self.inner.lock().await;
        for sample in samples {
            for node in labeled_nodes(sample) {
                let label = node
                    .label()
                    .ok_or_else(|| LedgerError::Unlabeled(node.describe()))?;
                if !inner.samples.contains_key(label) {
                    return Err(LedgerError::NotFound(label.to_string()));
                }
            }
            if !sample.is_labeled() {
                return Err(LedgerError::Unlabeled(sample.describe()));
            }
        }
        for sample in samples {
            for node in labeled_nodes(sample) {
                if let Some(label) = node.label() {
                    inner.samples.insert(label.to_string(), node.clone());
                }
            }
        }
        Ok(())
    }
}

use async_trait::async_trait;
use chrono::Utc;
use pal_core::Sample;
use sqlx::SqlitePool;
use std::collections::HashMap;
use tracing::debug;

use crate::error::{LedgerError, Result};
use crate::models::SampleRow;
use crate::traits::{assign_labels, format_label, labeled_nodes, unlabeled_nodes, SampleLedger};

/// Sample ledger backed by the local SQLite database.
#[derive(Clone)]
pub struct SqliteLedger {
    pool: SqlitePool,
    machine_name: String,
}

impl SqliteLedger {
    pub fn new(pool: SqlitePool, machine_name: impl Into<String>) -> Self {
        Self {
            pool,
            machine_name: machine_name.into(),
        }
    }

    pub async fn find_by_label(&self, label: &str) -> Result<Option<Sample>> {
        let row: Option<SampleRow> = sqlx::query_as(
            r#"
            SELECT id, label, sample_type, machine_name, body, created_at, updated_at
            FROM samples
            WHERE label = ?
            "#,
        )
        .bind(label)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|r| r.into_domain()).transpose()
    }

    pub async fn count(&self) -> Result<i64> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM samples")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }
}

#[async_trait]
impl SampleLedger for SqliteLedger {
    fn machine_name(&self) -> &str {
        &self.machine_name
    }

    async fn get(&self, labels: &[String]) -> Result<Vec<Sample>> {
        let mut samples = Vec::with_capacity(labels.len());
        for label in labels {
            let sample = self
                .find_by_label(label)
                .await?
                .ok_or_else(|| LedgerError::NotFound(label.clone()))?;
            samples.push(sample);
        }
        Ok(samples)
    }

    async fn put(&self, mut samples: Vec<Sample>) -> Result<Vec<Sample>> {
        let nodes = unlabeled_nodes(&samples)?;
        let now = Utc::now().timestamp_millis();
        let mut tx = self.pool.begin().await?;

        let mut labels = HashMap::new();
        for (handle, sample_type) in nodes {
            let (n,): (i64,) = sqlx::query_as(
                r#"
                INSERT INTO label_counters (sample_type, last_id) VALUES (?, 1)
                ON CONFLICT(sample_type) DO UPDATE SET last_id = last_id + 1
                RETURNING last_id
                "#,
            )
            .bind(sample_type.as_str())
            .fetch_one(&mut *tx)
            .await?;

            let label = format_label(&self.machine_name, sample_type, n);
            sqlx::query(
                r#"
                INSERT INTO samples (label, sample_type, machine_name, body, created_at, updated_at)
                VALUES (?, ?, ?, '{}', ?, ?)
                "#,
            )
            .bind(&label)
            .bind(sample_type.as_str())
            .bind(&self.machine_name)
            .bind(now)
            .bind(now)
            .execute(&mut *tx)
            .await?;
            labels.insert(handle, label);
        }

        for sample in samples.iter_mut() {
            assign_labels(sample, &labels, &self.machine_name);
        }

        for sample in &samples {
            for node in labeled_nodes(sample) {
                write_body(&mut tx, node, now).await?;
            }
        }

        tx.commit().await?;
        debug!(count = labels.len(), "Labeled new samples");
        Ok(samples)
    }

    async fn update(&self, samples: &[Sample]) -> Result<()> {
        let now = Utc::now().timestamp_millis();
        let mut tx = self.pool.begin().await?;

        for sample in samples {
            if !sample.is_labeled() {
                return Err(LedgerError::Unlabeled(sample.describe()));
            }
            for node in labeled_nodes(sample) {
                write_body(&mut tx, node, now).await?;
            }
        }

        tx.commit().await?;
        Ok(())
    }
}

async fn write_body(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    sample: &Sample,
    now: i64,
) -> Result<()> {
    let label = sample
        .label()
        .ok_or_else(|| LedgerError::Unlabeled(sample.describe()))?;
    let body = serde_json::to_string(sample)?;

    let result = sqlx::query("UPDATE samples SET body = ?, updated_at = ? WHERE label = ?")
        .bind(&body)
        .bind(now)
        .bind(label)
        .execute(&mut **tx)
        .await?;

    if result.rows_affected() == 0 {
        return Err(LedgerError::NotFound(label.to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::{create_memory_pool, run_migrations};
    use pal_core::{AssemblySample, Component, SampleMeta, SampleStatus};

    async fn ledger() -> SqliteLedger {
        let pool = create_memory_pool().await.unwrap();
        run_migrations(&pool).await.unwrap();
        SqliteLedger::new(pool, "lab")
    }

    #[tokio::test]
    async fn test_put_assigns_labels() {
        let ledger = ledger().await;

        let stored = ledger
            .put(vec![
                Sample::liquid(1.0, vec![Component::new("KOH", 1.0)]),
                Sample::gas(5.0, Vec::new()),
            ])
            .await
            .unwrap();

        assert_eq!(stored[0].label(), Some("lab__liquid__1"));
        assert_eq!(stored[1].label(), Some("lab__gas__1"));
        assert_eq!(stored[0].meta().machine_name.as_deref(), Some("lab"));
        assert_eq!(ledger.count().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_label_numbers_count_per_type() {
        let ledger = ledger().await;

        ledger.put(vec![Sample::liquid(1.0, Vec::new())]).await.unwrap();
        let stored = ledger
            .put(vec![
                Sample::solid(Vec::new()),
                Sample::liquid(2.0, Vec::new()),
                Sample::liquid(3.0, Vec::new()),
            ])
            .await
            .unwrap();

        let labels: Vec<_> = stored.iter().map(|s| s.label().unwrap()).collect();
        assert_eq!(labels, vec!["lab__solid__1", "lab__liquid__2", "lab__liquid__3"]);
    }

    #[tokio::test]
    async fn test_failed_put_does_not_consume_labels() {
        let ledger = ledger().await;

        // The labeled entry is rejected before the transaction starts.
        ledger
            .put(vec![
                Sample::liquid(1.0, Vec::new()),
                Sample::liquid(1.0, Vec::new()).with_label("lab__liquid__7"),
            ])
            .await
            .unwrap_err();

        let stored = ledger.put(vec![Sample::liquid(1.0, Vec::new())]).await.unwrap();
        assert_eq!(stored[0].label(), Some("lab__liquid__1"));
    }

    #[tokio::test]
    async fn test_put_labeled_is_bug() {
        let ledger = ledger().await;
        let err = ledger
            .put(vec![Sample::liquid(1.0, Vec::new()).with_label("lab__liquid__7")])
            .await
            .unwrap_err();
        assert_eq!(err.kind(), pal_core::ErrorKind::Bug);
        assert_eq!(ledger.count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_get_and_update() {
        let ledger = ledger().await;
        let mut stored = ledger.put(vec![Sample::liquid(1.0, Vec::new())]).await.unwrap();
        let label = stored[0].label().unwrap().to_string();

        if let Some((volume, _)) = stored[0].volume_parts_mut() {
            *volume = 0.8;
        }
        stored[0].add_status(SampleStatus::Preserved);
        ledger.update(&stored).await.unwrap();

        let fetched = ledger.get(&[label]).await.unwrap();
        assert_eq!(fetched[0].volume_ml(), Some(0.8));
        assert!(fetched[0].has_status(SampleStatus::Preserved));
    }

    #[tokio::test]
    async fn test_get_missing() {
        let ledger = ledger().await;
        let err = ledger.get(&["lab__liquid__99".to_string()]).await.unwrap_err();
        assert_eq!(err.kind(), pal_core::ErrorKind::NotAvailable);
    }

    #[tokio::test]
    async fn test_put_assembly_labels_parts() {
        let ledger = ledger().await;
        let solid = ledger.put(vec![Sample::solid(Vec::new())]).await.unwrap().remove(0);

        let assembly = Sample::Assembly(
            AssemblySample::new(SampleMeta::new(), vec![solid.clone(), Sample::liquid(0.2, Vec::new())])
                .unwrap(),
        );
        let stored = ledger.put(vec![assembly]).await.unwrap().remove(0);

        assert_eq!(stored.label(), Some("lab__assembly__1"));
        let parts = stored.as_assembly().unwrap().parts();
        assert_eq!(parts[0].label(), Some("lab__solid__1"));
        assert_eq!(parts[1].label(), Some("lab__liquid__1"));

        let part = ledger.get(&["lab__liquid__1".to_string()]).await.unwrap();
        assert_eq!(part[0].volume_ml(), Some(0.2));
    }
}

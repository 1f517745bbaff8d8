use sqlx::SqlitePool;
use uuid::Uuid;

use crate::error::Result;
use crate::models::{RunRecord, RunRecordRow};

#[derive(Clone)]
pub struct RunRecordRepository {
    pool: SqlitePool,
}

impl RunRecordRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn create(&self, record: &RunRecord) -> Result<RunRecord> {
        let row = RunRecordRow::from(record);

        sqlx::query(
            r#"
            INSERT INTO step_runs (
                id, job_id, method, method_file, tool, samples_in, samples_out,
                job_submitted_at, start_at, continue_at, done_at,
                source_position, source_coord, volume_ul,
                destination_position, destination_coord, logfile, created_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&row.id)
        .bind(&row.job_id)
        .bind(&row.method)
        .bind(&row.method_file)
        .bind(&row.tool)
        .bind(&row.samples_in)
        .bind(&row.samples_out)
        .bind(row.job_submitted_at)
        .bind(row.start_at)
        .bind(row.continue_at)
        .bind(row.done_at)
        .bind(&row.source_position)
        .bind(&row.source_coord)
        .bind(row.volume_ul)
        .bind(&row.destination_position)
        .bind(&row.destination_coord)
        .bind(&row.logfile)
        .bind(row.created_at)
        .execute(&self.pool)
        .await?;

        Ok(record.clone())
    }

    pub async fn find_by_job_id(&self, job_id: Uuid) -> Result<Vec<RunRecord>> {
        let rows: Vec<RunRecordRow> = sqlx::query_as(
            r#"
            SELECT id, job_id, method, method_file, tool, samples_in, samples_out,
                   job_submitted_at, start_at, continue_at, done_at,
                   source_position, source_coord, volume_ul,
                   destination_position, destination_coord, logfile, created_at
            FROM step_runs
            WHERE job_id = ?
            ORDER BY created_at ASC
            "#,
        )
        .bind(job_id.to_string())
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(|r| r.into_domain()).collect())
    }

    pub async fn find_recent(&self, limit: i64) -> Result<Vec<RunRecord>> {
        let rows: Vec<RunRecordRow> = sqlx::query_as(
            r#"
            SELECT id, job_id, method, method_file, tool, samples_in, samples_out,
                   job_submitted_at, start_at, continue_at, done_at,
                   source_position, source_coord, volume_ul,
                   destination_position, destination_coord, logfile, created_at
            FROM step_runs
            ORDER BY created_at DESC
            LIMIT ?
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(|r| r.into_domain()).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::{create_memory_pool, run_migrations};
    use chrono::{TimeZone, Utc};
    use pal_core::{
        Job, Method, Position, PositionRequest, PositionSnapshot, SampleIn, Sample, StepRun, Tool,
        TransferParams, TrayCoord, TrayKind, WashFlags,
    };

    #[tokio::test]
    async fn test_create_and_find() {
        let pool = create_memory_pool().await.unwrap();
        run_migrations(&pool).await.unwrap();
        let repo = RunRecordRepository::new(pool);

        let method = Method::Transfer(TransferParams {
            source: PositionRequest::tray(1, 1, 2),
            destination: PositionRequest::NextEmptyVial,
            volume_ul: 150.0,
        });
        let mut run = StepRun::new(0, 0, method, Tool::Ls3, WashFlags::default());
        let source = Sample::liquid(1.0, Vec::new()).with_label("lab__liquid__1");
        run.source = Some(PositionSnapshot::new(
            Position::Tray {
                coord: TrayCoord::new(1, 1, 2),
                tray_kind: TrayKind::Vt15,
            },
            Some(source.clone()),
        ));
        run.samples_in.push(SampleIn::withdraw(source, 0.15));
        run.start_time = Utc.timestamp_millis_opt(1_700_000_000_123).single();

        let mut job = Job::new(vec![run.clone()]);
        job.submitted_at = Utc.timestamp_millis_opt(1_700_000_000_000).single();
        job.aux_log_path = Some("C:/logs/aux.txt".to_string());

        let record = RunRecord::from_run(&job, &run, "C:/methods/lcfc_transfer.cam");
        repo.create(&record).await.unwrap();

        let found = repo.find_by_job_id(job.id).await.unwrap();
        assert_eq!(found.len(), 1);
        let stored = &found[0];
        assert_eq!(stored.samples_in, vec!["lab__liquid__1".to_string()]);
        assert_eq!(stored.source_position.as_deref(), Some("tray"));
        assert_eq!(stored.source_coord, Some(TrayCoord::new(1, 1, 2)));
        assert_eq!(stored.start_at, run.start_time);
        assert!(stored.destination_position.is_none());
        assert_eq!(stored.logfile.as_deref(), Some("C:/logs/aux.txt"));

        assert_eq!(repo.find_recent(10).await.unwrap().len(), 1);
    }
}

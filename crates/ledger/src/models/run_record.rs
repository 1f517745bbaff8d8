use chrono::{DateTime, TimeZone, Utc};
use pal_core::{Job, PositionSnapshot, StepRun, TrayCoord};
use serde_json::Value;
use uuid::Uuid;

/// Persisted summary of one confirmed step run.
#[derive(Debug, Clone, PartialEq)]
pub struct RunRecord {
    pub id: Uuid,
    pub job_id: Uuid,
    pub method: String,
    pub method_file: String,
    pub tool: String,
    pub samples_in: Vec<String>,
    pub samples_out: Vec<String>,
    pub job_submitted_at: Option<DateTime<Utc>>,
    pub start_at: Option<DateTime<Utc>>,
    pub continue_at: Option<DateTime<Utc>>,
    pub done_at: Option<DateTime<Utc>>,
    pub source_position: Option<String>,
    pub source_coord: Option<TrayCoord>,
    pub volume_ul: f64,
    pub destination_position: Option<String>,
    pub destination_coord: Option<TrayCoord>,
    pub logfile: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl RunRecord {
    /// Build the record for a committed run. `method_file` is the full path
    /// the instrument loaded.
    pub fn from_run(job: &Job, run: &StepRun, method_file: impl Into<String>) -> Self {
        let endpoint = |snapshot: &Option<PositionSnapshot>| {
            snapshot
                .as_ref()
                .map(|s| (s.position.name().to_string(), s.position.coord()))
        };
        let (source_position, source_coord) = match endpoint(&run.source) {
            Some((name, coord)) => (Some(name), coord),
            None => (None, None),
        };
        let (destination_position, destination_coord) = match endpoint(&run.destination) {
            Some((name, coord)) => (Some(name), coord),
            None => (None, None),
        };

        Self {
            id: run.id,
            job_id: job.id,
            method: run.method.name().to_string(),
            method_file: method_file.into(),
            tool: run.tool.as_str().to_string(),
            samples_in: run
                .samples_in
                .iter()
                .map(|s| s.sample.describe())
                .collect(),
            samples_out: run.samples_out.iter().map(|s| s.describe()).collect(),
            job_submitted_at: job.submitted_at,
            start_at: run.start_time,
            continue_at: run.continue_time,
            done_at: run.done_time,
            source_position,
            source_coord,
            volume_ul: run.volume_ul,
            destination_position,
            destination_coord,
            logfile: job.aux_log_path.clone(),
            created_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct RunRecordRow {
    pub id: String,
    pub job_id: String,
    pub method: String,
    pub method_file: String,
    pub tool: String,
    pub samples_in: String,
    pub samples_out: String,
    pub job_submitted_at: Option<i64>,
    pub start_at: Option<i64>,
    pub continue_at: Option<i64>,
    pub done_at: Option<i64>,
    pub source_position: Option<String>,
    pub source_coord: Option<String>,
    pub volume_ul: f64,
    pub destination_position: Option<String>,
    pub destination_coord: Option<String>,
    pub logfile: Option<String>,
    pub created_at: i64,
}

impl RunRecordRow {
    pub fn into_domain(self) -> RunRecord {
        RunRecord {
            id: Uuid::parse_str(&self.id).unwrap_or_default(),
            job_id: Uuid::parse_str(&self.job_id).unwrap_or_default(),
            method: self.method,
            method_file: self.method_file,
            tool: self.tool,
            samples_in: parse_labels(&self.samples_in),
            samples_out: parse_labels(&self.samples_out),
            job_submitted_at: self.job_submitted_at.and_then(millis_to_datetime),
            start_at: self.start_at.and_then(millis_to_datetime),
            continue_at: self.continue_at.and_then(millis_to_datetime),
            done_at: self.done_at.and_then(millis_to_datetime),
            source_position: self.source_position,
            source_coord: self.source_coord.as_deref().and_then(parse_coord),
            volume_ul: self.volume_ul,
            destination_position: self.destination_position,
            destination_coord: self.destination_coord.as_deref().and_then(parse_coord),
            logfile: self.logfile,
            created_at: millis_to_datetime(self.created_at).unwrap_or_default(),
        }
    }
}

impl From<&RunRecord> for RunRecordRow {
    fn from(record: &RunRecord) -> Self {
        Self {
            id: record.id.to_string(),
            job_id: record.job_id.to_string(),
            method: record.method.clone(),
            method_file: record.method_file.clone(),
            tool: record.tool.clone(),
            samples_in: Value::from(record.samples_in.clone()).to_string(),
            samples_out: Value::from(record.samples_out.clone()).to_string(),
            job_submitted_at: record.job_submitted_at.map(datetime_to_millis),
            start_at: record.start_at.map(datetime_to_millis),
            continue_at: record.continue_at.map(datetime_to_millis),
            done_at: record.done_at.map(datetime_to_millis),
            source_position: record.source_position.clone(),
            source_coord: record.source_coord.map(format_coord),
            volume_ul: record.volume_ul,
            destination_position: record.destination_position.clone(),
            destination_coord: record.destination_coord.map(format_coord),
            logfile: record.logfile.clone(),
            created_at: datetime_to_millis(record.created_at),
        }
    }
}

fn parse_labels(raw: &str) -> Vec<String> {
    serde_json::from_str(raw).unwrap_or_default()
}

fn format_coord(coord: TrayCoord) -> String {
    format!("{}/{}/{}", coord.tray, coord.slot, coord.vial)
}

fn parse_coord(raw: &str) -> Option<TrayCoord> {
    let mut parts = raw.split('/').map(|p| p.parse::<u32>());
    match (parts.next(), parts.next(), parts.next(), parts.next()) {
        (Some(Ok(tray)), Some(Ok(slot)), Some(Ok(vial)), None) => Some(TrayCoord::new(tray, slot, vial)),
        _ => None,
    }
}

fn millis_to_datetime(ms: i64) -> Option<DateTime<Utc>> {
    Utc.timestamp_millis_opt(ms).single()
}

fn datetime_to_millis(dt: DateTime<Utc>) -> i64 {
    dt.timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_coord_text() {
        let coord = TrayCoord::new(2, 1, 17);
        assert_eq!(parse_coord(&format_coord(coord)), Some(coord));
        assert_eq!(parse_coord("2/1"), None);
        assert_eq!(parse_coord("2/1/x"), None);
    }
}

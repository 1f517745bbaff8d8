use pal_core::Sample;

use crate::error::Result;

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct SampleRow {
    pub id: i64,
    pub label: Option<String>,
    pub sample_type: String,
    pub machine_name: String,
    pub body: String,
    pub created_at: i64,
    pub updated_at: i64,
}

impl SampleRow {
    pub fn into_domain(self) -> Result<Sample> {
        Ok(serde_json::from_str(&self.body)?)
    }
}

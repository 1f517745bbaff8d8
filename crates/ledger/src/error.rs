use pal_core::ErrorKind;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("Database error: {0}")]
    Sqlx(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Sample not found: {0}")]
    NotFound(String),

    #[error("Sample is already labeled: {0}")]
    AlreadyLabeled(String),

    #[error("Sample has no label: {0}")]
    Unlabeled(String),
}

impl LedgerError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound(_) => ErrorKind::NotAvailable,
            Self::AlreadyLabeled(_) | Self::Unlabeled(_) => ErrorKind::Bug,
            Self::Sqlx(_) | Self::Migration(_) | Self::Serialization(_) => ErrorKind::Storage,
        }
    }
}

pub type Result<T> = std::result::Result<T, LedgerError>;

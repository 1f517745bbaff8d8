use pal_core::{ErrorKind, TrayCoord};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("Unknown custom position: {0}")]
    UnknownCustom(String),

    #[error("Invalid tray coordinate: {0}")]
    InvalidCoordinate(TrayCoord),

    #[error("No free vial holds {min_volume_ml} mL")]
    NoFreeVial { min_volume_ml: f64 },

    #[error("No occupied vial after {0}")]
    NoFullVial(TrayCoord),

    #[error("Invalid volume: {0}")]
    InvalidVolume(f64),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl RegistryError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::UnknownCustom(_) | Self::InvalidCoordinate(_) => ErrorKind::Critical,
            Self::NoFreeVial { .. } | Self::NoFullVial(_) => ErrorKind::NotAvailable,
            Self::InvalidVolume(_) => ErrorKind::Numerical,
            Self::Io(_) | Self::Serialization(_) => ErrorKind::Storage,
        }
    }
}

pub type Result<T> = std::result::Result<T, RegistryError>;

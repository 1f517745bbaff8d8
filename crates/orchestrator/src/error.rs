use events::TriggerPhase;
use ledger::LedgerError;
use pal_core::{CoreError, ErrorKind};
use registry::RegistryError;
use thiserror::Error;
use transport::TransportError;

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("Invalid trigger state transition from {from} to {to}")]
    InvalidTransition { from: String, to: String },

    #[error("Not available: {0}")]
    NotAvailable(String),

    #[error("Critical: {0}")]
    Critical(String),

    #[error("Internal error: {0}")]
    Bug(String),

    #[error("Numerical error: {0}")]
    Numerical(String),

    #[error("Timed out after {timeout_secs}s waiting for {phase} trigger")]
    TriggerTimeout { phase: TriggerPhase, timeout_secs: u64 },

    #[error("Emergency stop: {0}")]
    Estop(String),

    #[error("Another job is already in progress")]
    InProgress,

    #[error("Domain error: {0}")]
    Core(#[from] CoreError),

    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("Ledger error: {0}")]
    Ledger(#[from] LedgerError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl OrchestratorError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidTransition { .. } | Self::Bug(_) => ErrorKind::Bug,
            Self::NotAvailable(_) => ErrorKind::NotAvailable,
            Self::Critical(_) => ErrorKind::Critical,
            Self::Numerical(_) => ErrorKind::Numerical,
            Self::TriggerTimeout { phase, .. } => phase.timeout_kind(),
            Self::Estop(_) => ErrorKind::Estop,
            Self::InProgress => ErrorKind::InProgress,
            Self::Core(e) => e.kind(),
            Self::Registry(e) => e.kind(),
            Self::Ledger(e) => e.kind(),
            Self::Transport(e) => e.kind(),
            Self::Io(_) => ErrorKind::Storage,
        }
    }

    /// Create a trigger timeout error.
    pub fn timeout(phase: TriggerPhase, timeout: std::time::Duration) -> Self {
        Self::TriggerTimeout {
            phase,
            timeout_secs: timeout.as_secs(),
        }
    }

    /// Create an internal error, logging it where it is raised.
    pub fn bug(message: impl Into<String>) -> Self {
        let message = message.into();
        tracing::error!(error = %message, "Internal invariant violated");
        Self::Bug(message)
    }
}

pub type Result<T> = std::result::Result<T, OrchestratorError>;

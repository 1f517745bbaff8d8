use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Failure classes shared by every layer of the autosampler stack.
///
/// Each crate keeps its own error enum and maps it onto one of these kinds so
/// callers of `submit` and `run_schedule` can react without matching on
/// crate-specific variants.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Missing or empty position, sample or vial.
    NotAvailable,
    /// Structurally invalid request: bad coordinate, disallowed assembly, bad cardinality.
    Critical,
    /// Internal invariant violated.
    Bug,
    /// Unit or volume conversion failure.
    Numerical,
    StartTimeout,
    ContinueTimeout,
    DoneTimeout,
    /// External abort.
    Estop,
    SshError,
    CmdError,
    /// Another instrument job is already in flight.
    InProgress,
    /// Local persistence (snapshot file, database) failed.
    Storage,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotAvailable => "not_available",
            Self::Critical => "critical",
            Self::Bug => "bug",
            Self::Numerical => "numerical",
            Self::StartTimeout => "start_timeout",
            Self::ContinueTimeout => "continue_timeout",
            Self::DoneTimeout => "done_timeout",
            Self::Estop => "estop",
            Self::SshError => "ssh_error",
            Self::CmdError => "cmd_error",
            Self::InProgress => "in_progress",
            Self::Storage => "storage",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "not_available" => Some(Self::NotAvailable),
            "critical" => Some(Self::Critical),
            "bug" => Some(Self::Bug),
            "numerical" => Some(Self::Numerical),
            "start_timeout" => Some(Self::StartTimeout),
            "continue_timeout" => Some(Self::ContinueTimeout),
            "done_timeout" => Some(Self::DoneTimeout),
            "estop" => Some(Self::Estop),
            "ssh_error" => Some(Self::SshError),
            "cmd_error" => Some(Self::CmdError),
            "in_progress" => Some(Self::InProgress),
            "storage" => Some(Self::Storage),
            _ => None,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            Self::StartTimeout | Self::ContinueTimeout | Self::DoneTimeout
        )
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Error, Debug)]
pub enum CoreError {
    #[error("Assembly part {0} would become its own ancestor")]
    AssemblyCycle(String),

    #[error("Sample has no volume: {0}")]
    NoVolume(String),

    #[error("Numerical error: {0}")]
    Numerical(String),

    #[error("Validation error: {0}")]
    Validation(String),
}

impl CoreError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::AssemblyCycle(_) | Self::Validation(_) => ErrorKind::Critical,
            Self::NoVolume(_) | Self::Numerical(_) => ErrorKind::Numerical,
        }
    }
}

pub type Result<T> = std::result::Result<T, CoreError>;

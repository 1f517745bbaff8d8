use pal_core::ErrorKind;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Command execution failed: {0}")]
    CommandFailed(String),

    #[error("Command not found: {0}")]
    CommandNotFound(String),

    #[error("SSH session failed: {0}")]
    Ssh(String),

    #[error("Empty job: nothing to transmit")]
    EmptyJob,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl TransportError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Ssh(_) => ErrorKind::SshError,
            Self::EmptyJob => ErrorKind::Bug,
            Self::CommandFailed(_) | Self::CommandNotFound(_) | Self::Io(_) => ErrorKind::CmdError,
        }
    }
}

pub type Result<T> = std::result::Result<T, TransportError>;

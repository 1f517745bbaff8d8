use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

use crate::command::{JobCommand, AUX_LOG_HEADER};
use crate::error::{Result, TransportError};
use crate::traits::{InstrumentTransport, JobState};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LocalTransportConfig {
    pub pal_executable: PathBuf,
}

impl LocalTransportConfig {
    pub fn new(pal_executable: impl Into<PathBuf>) -> Self {
        Self {
            pal_executable: pal_executable.into(),
        }
    }
}

/// Launches the control software on this machine and keeps the child
/// process so it can be polled and killed.
#[derive(Debug, Clone)]
pub struct LocalTransport {
    config: LocalTransportConfig,
    running: Arc<Mutex<Option<Child>>>,
}

impl LocalTransport {
    pub fn new(config: LocalTransportConfig) -> Self {
        Self {
            config,
            running: Arc::new(Mutex::new(None)),
        }
    }

    fn running(&self) -> MutexGuard<'_, Option<Child>> {
        self.running.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl InstrumentTransport for LocalTransport {
    fn name(&self) -> &str {
        "local"
    }

    async fn prepare_aux_log(&self, path: &str) -> Result<()> {
        let path = Path::new(path);
        if let Some(dir) = path.parent() {
            if !dir.as_os_str().is_empty() {
                fs::create_dir_all(dir).await?;
            }
        }
        if path.exists() {
            return Ok(());
        }

        let mut file = fs::File::create(path).await?;
        file.write_all(AUX_LOG_HEADER.as_bytes()).await?;
        file.write_all(b"\n").await?;
        file.flush().await?;
        debug!(path = %path.display(), "Created aux log");
        Ok(())
    }

    async fn transmit(&self, command: &JobCommand) -> Result<()> {
        if command.is_empty() {
            return Err(TransportError::EmptyJob);
        }

        let executable = &self.config.pal_executable;
        let mut running = self.running();
        if let Some(previous) = running.as_mut() {
            if previous.try_wait()?.is_none() {
                return Err(TransportError::CommandFailed(format!(
                    "{} is still running the previous job",
                    executable.display()
                )));
            }
        }

        let child = Command::new(executable)
            .args(command.args())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .spawn()
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => {
                    TransportError::CommandNotFound(executable.display().to_string())
                }
                _ => TransportError::Io(e),
            })?;

        info!(
            executable = %executable.display(),
            pid = ?child.id(),
            calls = command.calls.len(),
            "Launched instrument job"
        );
        *running = Some(child);
        Ok(())
    }

    fn poll_job(&self) -> Result<JobState> {
        let mut running = self.running();
        let Some(child) = running.as_mut() else {
            return Ok(JobState::Idle);
        };
        let Some(status) = child.try_wait()? else {
            return Ok(JobState::Running);
        };

        *running = None;
        if status.success() {
            debug!(executable = %self.config.pal_executable.display(), "Instrument job exited");
            Ok(JobState::Idle)
        } else {
            Err(TransportError::CommandFailed(format!(
                "{} exited with {}",
                self.config.pal_executable.display(),
                status
            )))
        }
    }

    fn terminate(&self) -> Result<()> {
        if let Some(mut child) = self.running().take() {
            warn!(pid = ?child.id(), "Killing instrument job");
            child.start_kill()?;
        }
        Ok(())
    }
}

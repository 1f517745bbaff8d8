use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::command::{JobCommand, AUX_LOG_HEADER};
use crate::error::{Result, TransportError};
use crate::traits::InstrumentTransport;

/// Exit status ssh itself uses for connection failures.
const SSH_CONNECTION_FAILURE: i32 = 255;

/// Shell dialect of the instrument computer.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum RemoteShell {
    #[default]
    Cmd,
    Posix,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RemoteTransportConfig {
    pub host: String,
    pub user: String,
    pub key_path: PathBuf,
    /// Control software executable on the remote machine.
    pub pal_executable: String,
    /// Prefix that starts the job in a new terminal session.
    #[serde(default = "default_launcher")]
    pub launcher: String,
    #[serde(default)]
    pub shell: RemoteShell,
    #[serde(default = "default_ssh_binary")]
    pub ssh_binary: String,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
}

fn default_launcher() -> String {
    "cmd /c start \"\"".to_string()
}

fn default_ssh_binary() -> String {
    "ssh".to_string()
}

fn default_connect_timeout() -> u64 {
    10
}

impl RemoteTransportConfig {
    pub fn new(host: impl Into<String>, user: impl Into<String>, key_path: impl Into<PathBuf>) -> Self {
        Self {
            host: host.into(),
            user: user.into(),
            key_path: key_path.into(),
            pal_executable: "C:\\Program Files\\CTC Analytics\\PAL\\PAL.exe".to_string(),
            launcher: default_launcher(),
            shell: RemoteShell::default(),
            ssh_binary: default_ssh_binary(),
            connect_timeout_secs: default_connect_timeout(),
        }
    }

    pub fn with_executable(mut self, executable: impl Into<String>) -> Self {
        self.pal_executable = executable.into();
        self
    }

    pub fn with_launcher(mut self, launcher: impl Into<String>) -> Self {
        self.launcher = launcher.into();
        self
    }

    pub fn with_shell(mut self, shell: RemoteShell) -> Self {
        self.shell = shell;
        self
    }

    pub fn with_ssh_binary(mut self, binary: impl Into<String>) -> Self {
        self.ssh_binary = binary.into();
        self
    }
}

/// Runs the control software on the instrument computer over ssh.
#[derive(Debug, Clone)]
pub struct SshTransport {
    config: RemoteTransportConfig,
}

impl SshTransport {
    pub fn new(config: RemoteTransportConfig) -> Self {
        Self { config }
    }

    fn destination(&self) -> String {
        format!("{}@{}", self.config.user, self.config.host)
    }

    async fn run_ssh(&self, remote_command: &str) -> Result<String> {
        debug!(host = %self.config.host, command = %remote_command, "Running remote command");

        let output = Command::new(&self.config.ssh_binary)
            .arg("-i")
            .arg(&self.config.key_path)
            .arg("-o")
            .arg("BatchMode=yes")
            .arg("-o")
            .arg(format!("ConnectTimeout={}", self.config.connect_timeout_secs))
            .arg(self.destination())
            .arg(remote_command)
            .output()
            .await
            .map_err(|e| TransportError::Ssh(format!("{}: {}", self.config.ssh_binary, e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            return Err(match output.status.code() {
                Some(SSH_CONNECTION_FAILURE) | None => {
                    TransportError::Ssh(format!("{}: {}", self.destination(), stderr))
                }
                Some(code) => TransportError::CommandFailed(format!(
                    "remote command exited with {}: {}",
                    code, stderr
                )),
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    fn mkdir_command(&self, dir: &str) -> String {
        match self.config.shell {
            RemoteShell::Cmd => format!("if not exist \"{0}\" mkdir \"{0}\"", dir),
            RemoteShell::Posix => format!("mkdir -p '{}'", dir),
        }
    }

    fn header_command(&self, path: &str) -> String {
        match self.config.shell {
            RemoteShell::Cmd => format!("if not exist \"{0}\" (echo {1}) > \"{0}\"", path, AUX_LOG_HEADER),
            RemoteShell::Posix => format!(
                "[ -f '{0}' ] || printf '{1}\\n' > '{0}'",
                path,
                AUX_LOG_HEADER.replace('\t', "\\t")
            ),
        }
    }
}

/// Directory part of a remote path in either separator style.
fn remote_parent(path: &str) -> Option<&str> {
    let index = path.rfind(['/', '\\'])?;
    let parent = &path[..index];
    if parent.is_empty() {
        None
    } else {
        Some(parent)
    }
}

#[async_trait]
impl InstrumentTransport for SshTransport {
    fn name(&self) -> &str {
        "remote"
    }

    async fn prepare_aux_log(&self, path: &str) -> Result<()> {
        if let Some(dir) = remote_parent(path) {
            self.run_ssh(&self.mkdir_command(dir)).await?;
        } else {
            warn!(path = %path, "Aux log path has no directory component");
        }
        self.run_ssh(&self.header_command(path)).await?;
        Ok(())
    }

    async fn transmit(&self, command: &JobCommand) -> Result<()> {
        if command.is_empty() {
            return Err(TransportError::EmptyJob);
        }

        let line = format!(
            "{} {}",
            self.config.launcher,
            command.command_line(&self.config.pal_executable)
        );
        info!(
            host = %self.config.host,
            calls = command.calls.len(),
            "Launching remote instrument job"
        );
        self.run_ssh(&line).await?;
        Ok(())
    }
}

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::info;

use crate::command::JobCommand;
use crate::error::{Result, TransportError};
use crate::traits::InstrumentTransport;

/// Records jobs instead of launching them.
#[derive(Debug, Default)]
pub struct DryRunTransport {
    aux_logs: Mutex<Vec<String>>,
    commands: Mutex<Vec<JobCommand>>,
}

impl DryRunTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn commands(&self) -> Vec<JobCommand> {
        self.commands.lock().await.clone()
    }

    pub async fn aux_logs(&self) -> Vec<String> {
        self.aux_logs.lock().await.clone()
    }
}

#[async_trait]
impl InstrumentTransport for DryRunTransport {
    fn name(&self) -> &str {
        "dry_run"
    }

    async fn prepare_aux_log(&self, path: &str) -> Result<()> {
        self.aux_logs.lock().await.push(path.to_string());
        Ok(())
    }

    async fn transmit(&self, command: &JobCommand) -> Result<()> {
        if command.is_empty() {
            return Err(TransportError::EmptyJob);
        }
        for call in &command.calls {
            info!(method = %call.method_file, params = %call.params, "Dry run");
        }
        self.commands.lock().await.push(command.clone());
        Ok(())
    }
}

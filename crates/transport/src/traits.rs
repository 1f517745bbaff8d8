use async_trait::async_trait;

use crate::command::JobCommand;
use crate::error::Result;

/// Whether a launched job is still executing on this side of the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Running,
    /// Nothing launched, or the launched job exited cleanly.
    Idle,
}

/// Delivers a job to the autosampler control software.
#[async_trait]
pub trait InstrumentTransport: Send + Sync {
    /// Short name used in logs and events.
    fn name(&self) -> &str;

    /// Create the aux log file and its header. The instrument only appends
    /// to a file that already exists.
    async fn prepare_aux_log(&self, path: &str) -> Result<()>;

    /// Launch the job. Returns once the control software accepted it, not
    /// when the autosampler finished.
    async fn transmit(&self, command: &JobCommand) -> Result<()>;

    /// Non-blocking check of the launched job. A job that already exited
    /// with a failure is reported once as an error.
    fn poll_job(&self) -> Result<JobState> {
        Ok(JobState::Idle)
    }

    /// Kill the launched job, if this transport owns it.
    fn terminate(&self) -> Result<()> {
        Ok(())
    }
}

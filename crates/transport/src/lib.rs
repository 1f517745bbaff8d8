pub mod command;
pub mod dry_run;
pub mod error;
pub mod local;
pub mod remote;
pub mod traits;

pub use command::{JobCommand, MethodCall, AUX_LOG_HEADER};
pub use dry_run::DryRunTransport;
pub use error::{Result, TransportError};
pub use local::{LocalTransport, LocalTransportConfig};
pub use remote::{RemoteShell, RemoteTransportConfig, SshTransport};
pub use traits::{InstrumentTransport, JobState};

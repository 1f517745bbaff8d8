pub mod compiler;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod resources;
pub mod scheduler;
pub mod state_machine;
pub mod triggers;

pub use compiler::PlanCompiler;
pub use config::{DispatcherConfig, TriggerConfig};
pub use dispatcher::Dispatcher;
pub use error::{OrchestratorError, Result};
pub use resources::JobGuard;
pub use scheduler::{RunScheduler, ScheduleClock, ScheduledRun, Spacing};
pub use state_machine::{TriggerState, TriggerStateMachine, TriggerTracker};
pub use triggers::{MemoryTrigger, TriggerLine, TriggerLines, TriggerOutcome, TriggerSynchronizer};

//! Sample Ledger client and run record storage.

mod error;
mod memory;
pub mod models;
mod pool;
pub mod repositories;
mod traits;

pub use error::*;
pub use memory::MemoryLedger;
pub use models::{RunRecord, RunRecordRow};
pub use pool::*;
pub use repositories::*;
pub use traits::SampleLedger;

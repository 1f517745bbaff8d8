//! Position Registry
//!
//! Tracks which sample occupies each fixed position and tray vial of the
//! autosampler, persisting every change to a JSON snapshot.

mod error;
mod registry;
mod snapshot;
mod store;
mod topology;

pub use error::{RegistryError, Result};
pub use registry::PositionRegistry;
pub use snapshot::{CustomState, RegistrySnapshot, TrayState};
pub use store::SnapshotStore;
pub use topology::{Topology, TraySpec};

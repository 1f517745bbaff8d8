//! Domain model shared by the PAL autosampler crates: samples, positions,
//! micro-steps, compiled jobs and the common error taxonomy.

pub mod domain;
pub mod error;

pub use domain::*;
pub use error::{CoreError, ErrorKind, Result};

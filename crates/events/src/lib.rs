//! Event system for the PAL orchestrator
//!
//! This crate provides the event bus and event types used to report job,
//! trigger and registry activity to interested listeners.

mod bus;
mod types;

pub use bus::EventBus;
pub use types::*;

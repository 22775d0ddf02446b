//! Event system for Formic
//!
//! This crate provides the event bus and event types used to notify
//! observers (SSE clients, the board UI) about task lifecycle changes.

mod bus;
mod types;

pub use bus::{EventBus, ScopedPublisher};
pub use types::*;

//! State management with actor pattern
//!
//! StateManager owns the trip store and processes messages via channels,
//! providing thread-safe access to persistent state. It also implements
//! every storage-backed tracker port.

mod manager;
mod messages;
mod ports;

pub use manager::StateManager;
pub use messages::{StateCommand, StateError, StateResponse};

//! TripTrack - real-time transit trip tracker
//!
//! Follows a single trip of a bus, tram or train stop by stop. Each poll
//! fetches the trip from the departure monitor, works out which stops the
//! vehicle has passed, records their delays, and schedules the next poll for
//! shortly after the vehicle reaches its next stop. The trip is done once
//! its final stop is passed.
//!
//! # Modules
//!
//! - [`tracker`] - Per-trip polling state machine and its collaborator traits
//! - [`progress`] - Stop history resolution and deduplication
//! - [`provider`] - Trip data client
//! - [`state`] - Actor owning the SQLite store
//! - [`scheduler`] - Job worker draining the delayed queue
//! - [`config`] - Configuration types and loading
//! - [`cli`] - Command-line interface

pub mod cli;
pub mod config;
pub mod domain;
pub mod error;
pub mod progress;
pub mod provider;
pub mod scheduler;
pub mod state;
pub mod tracker;

// Re-export commonly used types
pub use config::{Config, ProviderConfig, StorageConfig, TrackingConfig};
pub use domain::{FetchedTrip, LastStopSnapshot, Product, StopVisit, TRIP_QUEUE, TripIdentity, TripJob};
pub use error::TrackerError;
pub use progress::{StopHistory, extend_tracked, new_stop_codes, resolve_stop_history};
pub use provider::{ProviderError, TripProvider, VagTripProvider};
pub use scheduler::{JobResult, Worker, WorkerConfig, WorkerStats};
pub use state::{StateCommand, StateError, StateManager, StateResponse};
pub use tracker::{Outcome, Rescheduler, TrackerPorts, TripTracker};

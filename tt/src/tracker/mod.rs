//! Per-trip polling state machine
//!
//! [`TripTracker`] runs one poll of one trip against the collaborators in
//! [`ports`]; [`writer`] persists newly completed stops and [`reschedule`]
//! decides when the trip is polled next.

mod controller;
pub mod ports;
mod reschedule;
mod writer;

pub use controller::{Outcome, REQUEST_TIME_METRIC, TripTracker};
pub use ports::{
    ContinuationQueue, ErrorExporter, LiveLocations, MetricsSink, StorageError, TrackerPorts, TrackingKeys,
    TripProvider, TripStorage,
};
pub use reschedule::{DEFAULT_FALLBACK_POLL_MS, DEFAULT_POLL_BUFFER_MS, Decision, Rescheduler};
pub use writer::{PersistReport, persist_new_stops};

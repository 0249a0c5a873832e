//! TripStore - SQLite persistence for the trip tracker
//!
//! Owns every table the tracker writes to:
//!
//! - `stops` - reference data for stops, created lazily
//! - `trip_stops` - one row per (trip, service date, product, stop), upsert only
//! - `tracking_keys` - snapshot of every trip currently being polled
//! - `live_locations` - last known position per stop
//! - `metric_datapoints` / `error_reports` - operational data
//! - `jobs` - the delayed poll queue
//!
//! `trip_stops.stop_code` references `stops`, so writing a record for an
//! unknown stop fails with [`StoreError::ReferentialIntegrity`].

mod error;
mod jobs;
mod records;
mod store;

pub use error::{Result, StoreError};
pub use jobs::{Job, JobCounts, JobStatus};
pub use records::{ErrorReport, LiveLocation, MetricDatapoint, StopEntity, TrackingKey, TripStopRecord};
pub use store::Store;

/// Current Unix time in milliseconds
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

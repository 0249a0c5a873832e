//! Row types persisted by the store

use std::collections::BTreeSet;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// One observed stop of one trip
///
/// Keyed by (trip_number, service_date, product, stop_code). Rows are only
/// ever upserted; a second write for the same key replaces the fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TripStopRecord {
    pub trip_number: u32,
    pub service_date: NaiveDate,
    pub product: String,
    pub stop_code: String,

    /// Stop point / platform served at this stop
    pub platform: Option<String>,
    pub direction_text: Option<String>,
    pub scheduled_arrival: Option<DateTime<Utc>>,
    pub arrival_delay_secs: i64,
    pub scheduled_departure: Option<DateTime<Utc>>,
    pub departure_delay_secs: i64,
}

/// Reference data for a stop
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StopEntity {
    pub stop_code: String,
    /// Operator-specific alternate code
    pub alt_code: Option<String>,
    pub name: String,
    pub latitude: f64,
    pub longitude: f64,
    /// Products (bus, tram, ...) known to serve this stop
    pub products: BTreeSet<String>,
}

/// Snapshot of a trip that is currently being polled
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackingKey {
    pub trip_number: u32,
    /// JSON snapshot written by the tracker
    pub payload: String,
    pub updated_at: i64,
}

/// Last published position for a stop
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LiveLocation {
    pub stop_code: String,
    pub latitude: f64,
    pub longitude: f64,
    pub updated_at: i64,
}

/// A single recorded metric value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricDatapoint {
    pub name: String,
    pub value: f64,
    pub recorded_at: i64,
}

/// An exported error with the context it occurred in
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorReport {
    pub id: i64,
    pub message: String,
    /// JSON context (usually the job payload)
    pub context: String,
    pub reported_at: i64,
}

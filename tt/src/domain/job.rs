//! Poll job payload
//!
//! The payload is the only state carried from one poll of a trip to the next.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::trip::{FetchedTrip, Product, StopVisit, TripIdentity};

/// Queue that carries trip polls
pub const TRIP_QUEUE: &str = "q:trips";

/// Payload of one trip poll
///
/// Identity fields and the tracked stop list are required; a payload missing
/// any of them is rejected at the queue boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TripJob {
    pub trip_number: u32,
    pub service_date: NaiveDate,
    pub product: Product,

    /// Codes of stops already persisted, in trip order
    pub already_tracked_stops: Vec<String>,

    pub trip_start_time: Option<DateTime<Utc>>,
    pub trip_end_time: Option<DateTime<Utc>>,

    /// Snapshot from the previous poll
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_stop: Option<LastStopSnapshot>,
}

impl TripJob {
    /// First poll of a trip: nothing tracked yet
    pub fn new(
        trip: TripIdentity,
        trip_start_time: Option<DateTime<Utc>>,
        trip_end_time: Option<DateTime<Utc>>,
    ) -> Self {
        debug!(%trip, "TripJob::new: called");
        Self {
            trip_number: trip.trip_number,
            service_date: trip.service_date,
            product: trip.product,
            already_tracked_stops: Vec::new(),
            trip_start_time,
            trip_end_time,
            last_stop: None,
        }
    }

    pub fn identity(&self) -> TripIdentity {
        TripIdentity {
            trip_number: self.trip_number,
            service_date: self.service_date,
            product: self.product,
        }
    }

    /// Payload for the next poll of the same trip
    pub fn continuation(&self, already_tracked_stops: Vec<String>, last_stop: LastStopSnapshot) -> Self {
        debug!(trip_number = self.trip_number, tracked = already_tracked_stops.len(), "TripJob::continuation: called");
        Self {
            already_tracked_stops,
            last_stop: Some(last_stop),
            ..self.clone()
        }
    }
}

/// Where a running trip was last seen
///
/// Written to the trip's tracking key and carried in the continuation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LastStopSnapshot {
    pub stop_code: String,
    pub alt_code: Option<String>,
    pub stop_name: String,
    pub product: Product,
    pub line_name: String,
    pub direction: Option<String>,
    pub direction_text: Option<String>,
    pub vehicle_number: Option<String>,
    pub service_date: NaiveDate,
    pub occupancy: Option<String>,
    pub platform: Option<String>,
    pub scheduled_departure: Option<DateTime<Utc>>,
    pub actual_departure: Option<DateTime<Utc>>,
    /// Interpolated position towards the next stop (0..=1)
    pub progress_to_next_stop: Option<f64>,
}

impl LastStopSnapshot {
    pub fn new(job: &TripJob, trip: &FetchedTrip, last_stop: &StopVisit, progress: Option<f64>) -> Self {
        debug!(stop_code = %last_stop.stop_code, ?progress, "LastStopSnapshot::new: called");
        Self {
            stop_code: last_stop.stop_code.clone(),
            alt_code: last_stop.alt_code.clone(),
            stop_name: last_stop.name.clone(),
            product: job.product,
            line_name: trip.line_name.clone(),
            direction: trip.direction.clone(),
            direction_text: trip.direction_text.clone(),
            vehicle_number: trip.vehicle_number.clone(),
            service_date: job.service_date,
            occupancy: trip.occupancy.clone(),
            platform: last_stop.platform.clone(),
            scheduled_departure: last_stop.scheduled_departure,
            actual_departure: last_stop.actual_departure,
            progress_to_next_stop: progress,
        }
    }
}

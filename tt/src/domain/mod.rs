//! Domain types for the trip tracker
//!
//! Trips, stop visits and the poll job payload. Persisted row types are
//! re-exported from tripstore.

mod job;
mod trip;

pub use job::{LastStopSnapshot, TRIP_QUEUE, TripJob};
pub use trip::{FetchedTrip, Product, StopVisit, TripIdentity};

// Re-export tripstore types for convenience
pub use tripstore::{StopEntity, TripStopRecord};

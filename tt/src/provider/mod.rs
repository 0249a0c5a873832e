//! Trip-data provider
//!
//! [`TripProvider`] is the seam the tracker fetches trips through;
//! [`VagTripProvider`] implements it over the public departure-monitor API.

use async_trait::async_trait;
use chrono::NaiveDate;

mod error;
mod vag;

pub use error::{ProviderError, is_transient_status};
pub use vag::VagTripProvider;

use crate::domain::{FetchedTrip, Product};

/// Source of live trip data
///
/// Implementations do not retry; the job queue decides when to try again.
#[async_trait]
pub trait TripProvider: Send + Sync {
    /// Fetch the current stop sequence of one trip
    async fn fetch_trip(
        &self,
        trip_number: u32,
        product: Product,
        service_date: NaiveDate,
    ) -> Result<FetchedTrip, ProviderError>;
}

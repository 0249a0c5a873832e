//! Trip and stop-visit types
//!
//! A trip is one scheduled run of a vehicle, identified by trip number,
//! service date and product. The provider returns it as an ordered list of
//! stop visits.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;
use tripstore::{StopEntity, TripStopRecord};

/// Transport mode of a trip
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Product {
    Bus,
    Tram,
    UBahn,
    SBahn,
    RBahn,
}

impl Product {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Bus => "Bus",
            Self::Tram => "Tram",
            Self::UBahn => "UBahn",
            Self::SBahn => "SBahn",
            Self::RBahn => "RBahn",
        }
    }
}

impl std::fmt::Display for Product {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for Product {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        debug!(%s, "Product::from_str: called");
        match s.to_ascii_lowercase().replace('-', "").as_str() {
            "bus" => Ok(Self::Bus),
            "tram" => Ok(Self::Tram),
            "ubahn" => Ok(Self::UBahn),
            "sbahn" => Ok(Self::SBahn),
            "rbahn" => Ok(Self::RBahn),
            _ => Err(format!(
                "Unknown product '{}'. Supported: Bus, Tram, UBahn, SBahn, RBahn",
                s
            )),
        }
    }
}

/// Identity of one trip
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TripIdentity {
    pub trip_number: u32,
    pub service_date: NaiveDate,
    pub product: Product,
}

impl std::fmt::Display for TripIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({}, {})", self.trip_number, self.product, self.service_date)
    }
}

/// One stop of a trip with its scheduled and actual times
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StopVisit {
    /// Network-wide stop code
    pub stop_code: String,
    /// Operator-specific stop code
    pub alt_code: Option<String>,
    pub name: String,
    /// Stop point / platform served
    pub platform: Option<String>,
    pub direction_text: Option<String>,
    pub latitude: f64,
    pub longitude: f64,
    pub scheduled_arrival: Option<DateTime<Utc>>,
    pub actual_arrival: Option<DateTime<Utc>>,
    pub scheduled_departure: Option<DateTime<Utc>>,
    pub actual_departure: Option<DateTime<Utc>>,
}

/// Delay in whole seconds, rounded down; zero unless both times are known
fn delay_secs(scheduled: Option<DateTime<Utc>>, actual: Option<DateTime<Utc>>) -> i64 {
    match (scheduled, actual) {
        (Some(scheduled), Some(actual)) => (actual - scheduled).num_milliseconds().div_euclid(1000),
        _ => 0,
    }
}

impl StopVisit {
    /// Actual departure, else scheduled departure
    pub fn departure_time(&self) -> Option<DateTime<Utc>> {
        self.actual_departure.or(self.scheduled_departure)
    }

    /// Actual arrival, else scheduled arrival
    pub fn arrival_time(&self) -> Option<DateTime<Utc>> {
        self.actual_arrival.or(self.scheduled_arrival)
    }

    /// Time at which the vehicle has left (or, at a terminus, reached) this stop
    pub fn passed_time(&self) -> Option<DateTime<Utc>> {
        self.departure_time().or_else(|| self.arrival_time())
    }

    pub fn arrival_delay_secs(&self) -> i64 {
        delay_secs(self.scheduled_arrival, self.actual_arrival)
    }

    pub fn departure_delay_secs(&self) -> i64 {
        delay_secs(self.scheduled_departure, self.actual_departure)
    }

    /// Build the persisted record of this visit for the given trip
    pub fn to_record(&self, trip: &TripIdentity) -> TripStopRecord {
        debug!(%trip, stop_code = %self.stop_code, "StopVisit::to_record: called");
        TripStopRecord {
            trip_number: trip.trip_number,
            service_date: trip.service_date,
            product: trip.product.to_string(),
            stop_code: self.stop_code.clone(),
            platform: self.platform.clone(),
            direction_text: self.direction_text.clone(),
            scheduled_arrival: self.scheduled_arrival,
            arrival_delay_secs: self.arrival_delay_secs(),
            scheduled_departure: self.scheduled_departure,
            departure_delay_secs: self.departure_delay_secs(),
        }
    }

    /// Build the stop reference data carried by this visit
    pub fn to_stop_entity(&self, product: Product) -> StopEntity {
        debug!(stop_code = %self.stop_code, %product, "StopVisit::to_stop_entity: called");
        StopEntity {
            stop_code: self.stop_code.clone(),
            alt_code: self.alt_code.clone(),
            name: self.name.clone(),
            latitude: self.latitude,
            longitude: self.longitude,
            products: [product.to_string()].into_iter().collect(),
        }
    }
}

/// A trip as returned by the provider
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FetchedTrip {
    /// How long the provider request took, in milliseconds
    pub request_time_ms: Option<f64>,
    pub stops: Vec<StopVisit>,
    pub line_name: String,
    pub vehicle_number: Option<String>,
    pub occupancy: Option<String>,
    pub direction: Option<String>,
    pub direction_text: Option<String>,
}

impl FetchedTrip {
    /// First visit with the given stop code
    pub fn find_stop(&self, stop_code: &str) -> Option<&StopVisit> {
        self.stops.iter().find(|s| s.stop_code == stop_code)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn at(h: u32, m: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 17, h, m, s).unwrap()
    }

    fn visit() -> StopVisit {
        StopVisit {
            stop_code: "3101".to_string(),
            alt_code: Some("PL".to_string()),
            name: "Plärrer".to_string(),
            platform: Some("1".to_string()),
            direction_text: Some("Am Wegfeld".to_string()),
            latitude: 49.448,
            longitude: 11.064,
            scheduled_arrival: Some(at(8, 0, 0)),
            actual_arrival: None,
            scheduled_departure: Some(at(8, 1, 0)),
            actual_departure: None,
        }
    }

    #[test]
    fn test_product_parse() {
        assert_eq!("tram".parse::<Product>().unwrap(), Product::Tram);
        assert_eq!("U-Bahn".parse::<Product>().unwrap(), Product::UBahn);
        assert_eq!("SBAHN".parse::<Product>().unwrap(), Product::SBahn);
        assert!("ferry".parse::<Product>().is_err());
    }

    #[test]
    fn test_product_serde_matches_display() {
        let json = serde_json::to_string(&Product::UBahn).unwrap();
        assert_eq!(json, "\"UBahn\"");
        assert_eq!(Product::UBahn.to_string(), "UBahn");
    }

    #[test]
    fn test_delay_defaults_to_zero_without_actual() {
        let v = visit();
        assert_eq!(v.arrival_delay_secs(), 0);
        assert_eq!(v.departure_delay_secs(), 0);
    }

    #[test]
    fn test_delay_rounds_down() {
        let mut v = visit();
        v.actual_arrival = Some(at(8, 0, 0) + Duration::milliseconds(90_900));
        v.actual_departure = Some(at(8, 1, 0) - Duration::milliseconds(1_500));
        assert_eq!(v.arrival_delay_secs(), 90);
        assert_eq!(v.departure_delay_secs(), -2);
    }

    #[test]
    fn test_times_prefer_actual() {
        let mut v = visit();
        assert_eq!(v.departure_time(), Some(at(8, 1, 0)));
        v.actual_departure = Some(at(8, 3, 0));
        assert_eq!(v.departure_time(), Some(at(8, 3, 0)));

        v.scheduled_departure = None;
        v.actual_departure = None;
        assert_eq!(v.passed_time(), Some(at(8, 0, 0)));
    }

    #[test]
    fn test_to_record() {
        let mut v = visit();
        v.actual_departure = Some(at(8, 2, 0));
        let trip = TripIdentity {
            trip_number: 1042,
            service_date: NaiveDate::from_ymd_opt(2024, 5, 17).unwrap(),
            product: Product::Tram,
        };

        let record = v.to_record(&trip);
        assert_eq!(record.product, "Tram");
        assert_eq!(record.stop_code, "3101");
        assert_eq!(record.departure_delay_secs, 60);
        assert_eq!(record.arrival_delay_secs, 0);
    }

    #[test]
    fn test_to_stop_entity() {
        let entity = visit().to_stop_entity(Product::Bus);
        assert_eq!(entity.alt_code.as_deref(), Some("PL"));
        assert!(entity.products.contains("Bus"));
    }
}

//! Departure-monitor API client
//!
//! Fetches a trip's stop sequence (`Fahrtverlauf`) and maps the wire format
//! onto [`FetchedTrip`].

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use reqwest::Client;
use serde::{Deserialize, Deserializer};
use serde_json::Value;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use super::{ProviderError, TripProvider, is_transient_status};
use crate::config::ProviderConfig;
use crate::domain::{FetchedTrip, Product, StopVisit};

/// Codes arrive as numbers or strings depending on the endpoint
fn code_or_none<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<String>, D::Error> {
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(value.and_then(|v| match v {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }))
}

fn code<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    code_or_none(deserializer)?.ok_or_else(|| serde::de::Error::custom("missing stop code"))
}

#[derive(Debug, Deserialize)]
struct TripResponse {
    #[serde(rename = "Fahrt")]
    trip: WireTrip,
}

#[derive(Debug, Deserialize)]
struct WireTrip {
    #[serde(rename = "Linienname", default)]
    line_name: String,
    #[serde(rename = "Fahrzeugnummer", default, deserialize_with = "code_or_none")]
    vehicle_number: Option<String>,
    #[serde(rename = "Besetzgrad", default)]
    occupancy: Option<String>,
    #[serde(rename = "Richtung", default)]
    direction: Option<String>,
    #[serde(rename = "Richtungstext", default)]
    direction_text: Option<String>,
    #[serde(rename = "Fahrtverlauf", default)]
    stops: Vec<WireStop>,
}

#[derive(Debug, Deserialize)]
struct WireStop {
    #[serde(rename = "Haltestellenname", default)]
    name: String,
    #[serde(rename = "VGNKennung", deserialize_with = "code")]
    stop_code: String,
    #[serde(rename = "VAGKennung", default, deserialize_with = "code_or_none")]
    alt_code: Option<String>,
    #[serde(rename = "Haltepunkt", default, deserialize_with = "code_or_none")]
    platform: Option<String>,
    #[serde(rename = "Richtungstext", default)]
    direction_text: Option<String>,
    #[serde(rename = "Latitude", default)]
    latitude: f64,
    #[serde(rename = "Longitude", default)]
    longitude: f64,
    #[serde(rename = "AnkunftszeitSoll", default)]
    scheduled_arrival: Option<DateTime<Utc>>,
    #[serde(rename = "AnkunftszeitIst", default)]
    actual_arrival: Option<DateTime<Utc>>,
    #[serde(rename = "AbfahrtszeitSoll", default)]
    scheduled_departure: Option<DateTime<Utc>>,
    #[serde(rename = "AbfahrtszeitIst", default)]
    actual_departure: Option<DateTime<Utc>>,
}

impl From<WireStop> for StopVisit {
    fn from(stop: WireStop) -> Self {
        Self {
            stop_code: stop.stop_code,
            alt_code: stop.alt_code,
            name: stop.name,
            platform: stop.platform,
            direction_text: stop.direction_text,
            latitude: stop.latitude,
            longitude: stop.longitude,
            scheduled_arrival: stop.scheduled_arrival,
            actual_arrival: stop.actual_arrival,
            scheduled_departure: stop.scheduled_departure,
            actual_departure: stop.actual_departure,
        }
    }
}

/// Decode a trip response body
fn parse_trip_response(body: &str, request_time_ms: f64) -> Result<FetchedTrip, ProviderError> {
    debug!(body_len = body.len(), "parse_trip_response: called");
    let response: TripResponse =
        serde_json::from_str(body).map_err(|e| ProviderError::Invalid(format!("Failed to decode trip: {}", e)))?;
    let trip = response.trip;

    Ok(FetchedTrip {
        request_time_ms: Some(request_time_ms),
        stops: trip.stops.into_iter().map(StopVisit::from).collect(),
        line_name: trip.line_name,
        vehicle_number: trip.vehicle_number,
        occupancy: trip.occupancy,
        direction: trip.direction,
        direction_text: trip.direction_text,
    })
}

/// HTTP client for the departure-monitor trip endpoint
pub struct VagTripProvider {
    base_url: String,
    http: Client,
}

impl VagTripProvider {
    /// Create a new client from configuration
    pub fn from_config(config: &ProviderConfig) -> Result<Self, ProviderError> {
        debug!(?config, "from_config: called");
        let http = Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .user_agent(config.user_agent.clone())
            .build()
            .map_err(ProviderError::Network)?;

        Ok(Self {
            base_url: config.base_url.trim_end_matches('/').to_string(),
            http,
        })
    }

    fn trip_url(&self, trip_number: u32, product: Product, service_date: NaiveDate) -> String {
        format!(
            "{}/fahrten/{}/{}/{}",
            self.base_url,
            product.as_str(),
            service_date.format("%Y-%m-%d"),
            trip_number
        )
    }
}

#[async_trait]
impl TripProvider for VagTripProvider {
    async fn fetch_trip(
        &self,
        trip_number: u32,
        product: Product,
        service_date: NaiveDate,
    ) -> Result<FetchedTrip, ProviderError> {
        let url = self.trip_url(trip_number, product, service_date);
        debug!(%url, "fetch_trip: called");

        let started = Instant::now();
        let response = self.http.get(&url).send().await?;
        let status = response.status().as_u16();

        if !response.status().is_success() {
            let body = response.text().await.unwrap_or_default();
            debug!(status, %body, "fetch_trip: non-success status");
            if status == 404 {
                return Err(ProviderError::NotFound(format!("{} ({}, {})", trip_number, product, service_date)));
            }
            if is_transient_status(status) {
                warn!(status, trip_number, "Provider returned transient error");
                return Err(ProviderError::Transient {
                    status: Some(status),
                    message: body,
                });
            }
            return Err(ProviderError::Invalid(format!("HTTP {}: {}", status, body)));
        }

        let body = response.text().await?;
        let request_time_ms = started.elapsed().as_secs_f64() * 1000.0;
        parse_trip_response(&body, request_time_ms)
    }
}

//! Persistence of newly completed stops
//!
//! All per-stop upserts run concurrently and are settled before any result is
//! inspected. A record rejected for an unknown stop gets one recovery
//! attempt: upsert the stop, then the record again.

use futures::future::join_all;
use tracing::{debug, warn};

use super::ports::{StorageError, TripStorage};
use crate::domain::{FetchedTrip, StopVisit, TripIdentity};
use crate::error::TrackerError;

/// Result of persisting one batch of stops
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PersistReport {
    /// Stop codes written, in input order
    pub recorded: Vec<String>,
    /// Stop codes that first needed their stop upserted
    pub recovered: Vec<String>,
}

/// Write a [`TripStopRecord`](crate::domain::TripStopRecord) for every code in `new_codes`
pub async fn persist_new_stops(
    storage: &dyn TripStorage,
    trip: &TripIdentity,
    fetched: &FetchedTrip,
    new_codes: &[String],
) -> Result<PersistReport, TrackerError> {
    debug!(%trip, count = new_codes.len(), "persist_new_stops: called");

    let visits = new_codes
        .iter()
        .map(|code| {
            fetched
                .find_stop(code)
                .ok_or_else(|| TrackerError::Logic(format!("Stop {} is not part of trip {}", code, trip)))
        })
        .collect::<Result<Vec<_>, _>>()?;

    let writes = visits
        .iter()
        .enumerate()
        .map(|(index, visit)| async move { (index, write_stop(storage, trip, visit).await) });
    let results = join_all(writes).await;

    let mut report = PersistReport::default();
    for (index, result) in results {
        let code = &visits[index].stop_code;
        match result {
            Ok(recovered) => {
                if recovered {
                    report.recovered.push(code.clone());
                }
                report.recorded.push(code.clone());
            }
            Err(err) => {
                debug!(%code, %err, "persist_new_stops: write failed");
                return Err(err);
            }
        }
    }

    debug!(
        recorded = report.recorded.len(),
        recovered = report.recovered.len(),
        "persist_new_stops: done"
    );
    Ok(report)
}

/// Upsert one record; returns whether recovery was needed
async fn write_stop(storage: &dyn TripStorage, trip: &TripIdentity, visit: &StopVisit) -> Result<bool, TrackerError> {
    let record = visit.to_record(trip);

    match storage.upsert_trip_stop_record(record.clone()).await {
        Ok(()) => Ok(false),
        Err(StorageError::ReferentialIntegrity(detail)) => {
            warn!(stop_code = %visit.stop_code, %detail, "Unknown stop, upserting it before retrying");
            storage
                .upsert_stop_entity(visit.to_stop_entity(trip.product))
                .await
                .map_err(|e| TrackerError::Persistence(format!("Failed to upsert stop {}: {}", visit.stop_code, e)))?;

            storage.upsert_trip_stop_record(record).await.map_err(|e| match e {
                StorageError::ReferentialIntegrity(_) => TrackerError::ReferentialIntegrity {
                    stop_code: visit.stop_code.clone(),
                },
                StorageError::Other(message) => TrackerError::Persistence(message),
            })?;
            Ok(true)
        }
        Err(StorageError::Other(message)) => Err(TrackerError::Persistence(message)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Product;
    use crate::tracker::ports::mock::RecordingBackend;
    use chrono::{NaiveDate, TimeZone, Utc};
    use std::sync::atomic::Ordering;

    fn visit(code: &str, minute: u32) -> StopVisit {
        let scheduled = Utc.with_ymd_and_hms(2024, 5, 17, 8, minute, 0).unwrap();
        StopVisit {
            stop_code: code.to_string(),
            alt_code: None,
            name: format!("Stop {}", code),
            platform: None,
            direction_text: None,
            latitude: 49.4,
            longitude: 11.0 + f64::from(minute) / 100.0,
            scheduled_arrival: Some(scheduled),
            actual_arrival: Some(scheduled + chrono::Duration::seconds(90)),
            scheduled_departure: Some(scheduled),
            actual_departure: Some(scheduled + chrono::Duration::seconds(95)),
        }
    }

    fn fixture() -> (TripIdentity, FetchedTrip) {
        let trip = TripIdentity {
            trip_number: 1042,
            service_date: NaiveDate::from_ymd_opt(2024, 5, 17).unwrap(),
            product: Product::Tram,
        };
        let fetched = FetchedTrip {
            request_time_ms: None,
            stops: vec![visit("A", 0), visit("B", 5), visit("C", 10)],
            line_name: "4".to_string(),
            vehicle_number: None,
            occupancy: None,
            direction: None,
            direction_text: None,
        };
        (trip, fetched)
    }

    fn codes(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn test_writes_every_new_stop() {
        let (trip, fetched) = fixture();
        let backend = RecordingBackend::new();

        let report = persist_new_stops(backend.as_ref(), &trip, &fetched, &codes(&["A", "B"]))
            .await
            .unwrap();

        assert_eq!(report.recorded, codes(&["A", "B"]));
        assert!(report.recovered.is_empty());
        let records = backend.records.lock().unwrap();
        let b = &records[&(1042, "B".to_string())];
        assert_eq!(b.arrival_delay_secs, 90);
        assert_eq!(b.departure_delay_secs, 95);
        assert_eq!(b.product, "Tram");
    }

    #[tokio::test]
    async fn test_recovers_unknown_stop_once() {
        let (trip, fetched) = fixture();
        let backend = RecordingBackend::with_known_stops(&["A"]);

        let report = persist_new_stops(backend.as_ref(), &trip, &fetched, &codes(&["A", "B"]))
            .await
            .unwrap();

        assert_eq!(report.recorded, codes(&["A", "B"]));
        assert_eq!(report.recovered, codes(&["B"]));
        assert!(backend.stops.lock().unwrap().contains_key("B"));
        assert!(backend.recorded_codes().contains("B"));

        let stop = backend.stops.lock().unwrap()["B"].clone();
        assert_eq!(stop.name, "Stop B");
        assert!(stop.products.contains("Tram"));
    }

    #[tokio::test]
    async fn test_failed_recovery_is_fatal() {
        let (trip, fetched) = fixture();
        let backend = RecordingBackend::with_known_stops(&[]);
        backend.fail_stop_upserts.store(true, Ordering::SeqCst);

        let err = persist_new_stops(backend.as_ref(), &trip, &fetched, &codes(&["B"]))
            .await
            .unwrap_err();

        assert!(matches!(err, TrackerError::Persistence(_)));
        assert!(backend.recorded_codes().is_empty());
    }

    #[tokio::test]
    async fn test_other_failure_is_fatal_after_all_writes_settle() {
        let (trip, fetched) = fixture();
        let backend = RecordingBackend::new();
        backend.failing_records.lock().unwrap().insert("A".to_string());

        let err = persist_new_stops(backend.as_ref(), &trip, &fetched, &codes(&["A", "B"]))
            .await
            .unwrap_err();

        assert!(matches!(err, TrackerError::Persistence(_)));
        // B was still attempted and written
        assert!(backend.recorded_codes().contains("B"));
    }

    #[tokio::test]
    async fn test_unknown_code_is_logic_error() {
        let (trip, fetched) = fixture();
        let backend = RecordingBackend::new();

        let err = persist_new_stops(backend.as_ref(), &trip, &fetched, &codes(&["Z"]))
            .await
            .unwrap_err();

        assert!(matches!(err, TrackerError::Logic(_)));
        assert!(backend.events().is_empty());
    }

    #[tokio::test]
    async fn test_nothing_new_writes_nothing() {
        let (trip, fetched) = fixture();
        let backend = RecordingBackend::new();

        let report = persist_new_stops(backend.as_ref(), &trip, &fetched, &[]).await.unwrap();

        assert_eq!(report, PersistReport::default());
        assert!(backend.events().is_empty());
    }
}

//! Collaborators the tracker talks to
//!
//! Every side effect of an invocation goes through one of these traits, so
//! the controller can run against the SQLite-backed [`StateManager`] in
//! production and against in-memory doubles in tests.
//!
//! [`StateManager`]: crate::state::StateManager

use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

pub use crate::provider::TripProvider;

use crate::domain::{LastStopSnapshot, StopEntity, TripJob, TripStopRecord};
use crate::error::TrackerError;

/// Errors reported by storage-backed collaborators
#[derive(Debug, Clone, Error)]
pub enum StorageError {
    /// The record references a stop that does not exist yet
    #[error("Referential integrity violation: {0}")]
    ReferentialIntegrity(String),

    #[error("Storage error: {0}")]
    Other(String),
}

/// Trip stop records and their stop reference data
#[async_trait]
pub trait TripStorage: Send + Sync {
    /// Insert or overwrite the record keyed by (trip, date, product, stop)
    async fn upsert_trip_stop_record(&self, record: TripStopRecord) -> Result<(), StorageError>;

    /// Insert or update a stop, merging its product set
    async fn upsert_stop_entity(&self, stop: StopEntity) -> Result<(), StorageError>;
}

/// Last known vehicle positions
#[async_trait]
pub trait LiveLocations: Send + Sync {
    async fn set_location(&self, stop_code: &str, latitude: f64, longitude: f64) -> Result<(), StorageError>;
}

/// Per-trip snapshot of the last completed stop
#[async_trait]
pub trait TrackingKeys: Send + Sync {
    async fn set_tracking_key(&self, trip_number: u32, snapshot: &LastStopSnapshot) -> Result<(), StorageError>;

    /// Returns whether a key was removed
    async fn delete_tracking_key(&self, trip_number: u32) -> Result<bool, StorageError>;
}

/// Delayed dispatch of the next poll
#[async_trait]
pub trait ContinuationQueue: Send + Sync {
    /// Schedule `job` to run after `delay`; returns the job id
    async fn enqueue_delayed(&self, delay: Duration, job: &TripJob) -> Result<String, StorageError>;
}

#[async_trait]
pub trait MetricsSink: Send + Sync {
    async fn record(&self, name: &str, value: f64) -> Result<(), StorageError>;
}

/// Destination for fatal invocation errors
///
/// Reporting never fails from the caller's point of view.
#[async_trait]
pub trait ErrorExporter: Send + Sync {
    async fn report_error(&self, error: &TrackerError, context: &Value);
}

/// Everything a [`TripTracker`](super::TripTracker) needs
#[derive(Clone)]
pub struct TrackerPorts {
    pub provider: Arc<dyn TripProvider>,
    pub storage: Arc<dyn TripStorage>,
    pub locations: Arc<dyn LiveLocations>,
    pub tracking_keys: Arc<dyn TrackingKeys>,
    pub queue: Arc<dyn ContinuationQueue>,
    pub metrics: Arc<dyn MetricsSink>,
    pub errors: Arc<dyn ErrorExporter>,
}

impl TrackerPorts {
    /// Wire every storage-backed port to one backend
    pub fn with_backend<B>(provider: Arc<dyn TripProvider>, backend: Arc<B>) -> Self
    where
        B: TripStorage + LiveLocations + TrackingKeys + ContinuationQueue + MetricsSink + ErrorExporter + 'static,
    {
        Self {
            provider,
            storage: backend.clone(),
            locations: backend.clone(),
            tracking_keys: backend.clone(),
            queue: backend.clone(),
            metrics: backend.clone(),
            errors: backend,
        }
    }
}

#[cfg(test)]
pub mod mock {
    use super::*;
    use crate::domain::{FetchedTrip, Product};
    use crate::provider::ProviderError;
    use chrono::NaiveDate;
    use std::collections::{BTreeSet, HashMap, VecDeque};
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tracing::debug;

    /// Provider returning canned responses in order
    pub struct MockTripProvider {
        responses: Mutex<VecDeque<Result<FetchedTrip, ProviderError>>>,
    }

    impl MockTripProvider {
        pub fn new(responses: Vec<Result<FetchedTrip, ProviderError>>) -> Self {
            debug!(response_count = %responses.len(), "MockTripProvider::new: called");
            Self {
                responses: Mutex::new(responses.into()),
            }
        }

        pub fn returning(trip: FetchedTrip) -> Self {
            Self::new(vec![Ok(trip)])
        }
    }

    #[async_trait]
    impl TripProvider for MockTripProvider {
        async fn fetch_trip(
            &self,
            _trip_number: u32,
            _product: Product,
            _service_date: NaiveDate,
        ) -> Result<FetchedTrip, ProviderError> {
            debug!("MockTripProvider::fetch_trip: called");
            self.responses
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(ProviderError::Invalid("No more mock responses".to_string())))
        }
    }

    /// In-memory backend recording every call in order
    #[derive(Default)]
    pub struct RecordingBackend {
        /// Ordered call log, e.g. `record:B`, `enqueue`, `error:logic`
        pub events: Mutex<Vec<String>>,
        pub records: Mutex<HashMap<(u32, String), TripStopRecord>>,
        pub stops: Mutex<HashMap<String, StopEntity>>,
        pub locations: Mutex<Vec<(String, f64, f64)>>,
        pub tracking_keys: Mutex<HashMap<u32, LastStopSnapshot>>,
        pub enqueued: Mutex<Vec<(Duration, TripJob)>>,
        pub metrics: Mutex<Vec<(String, f64)>>,
        pub errors: Mutex<Vec<(String, Value)>>,
        /// Reject records whose stop is unknown, like a foreign key
        pub enforce_stops: AtomicBool,
        /// Stop codes whose record upsert fails outright
        pub failing_records: Mutex<BTreeSet<String>>,
        pub fail_stop_upserts: AtomicBool,
        pub fail_locations: AtomicBool,
        pub fail_tracking_keys: AtomicBool,
        pub fail_enqueue: AtomicBool,
    }

    impl RecordingBackend {
        pub fn new() -> Arc<Self> {
            Arc::new(Self::default())
        }

        pub fn with_known_stops(codes: &[&str]) -> Arc<Self> {
            let backend = Self::default();
            backend.enforce_stops.store(true, Ordering::SeqCst);
            {
                let mut stops = backend.stops.lock().unwrap();
                for code in codes {
                    stops.insert(
                        code.to_string(),
                        StopEntity {
                            stop_code: code.to_string(),
                            alt_code: None,
                            name: code.to_string(),
                            latitude: 0.0,
                            longitude: 0.0,
                            products: BTreeSet::new(),
                        },
                    );
                }
            }
            Arc::new(backend)
        }

        pub fn events(&self) -> Vec<String> {
            self.events.lock().unwrap().clone()
        }

        pub fn recorded_codes(&self) -> BTreeSet<String> {
            self.records.lock().unwrap().keys().map(|(_, code)| code.clone()).collect()
        }

        fn log(&self, event: impl Into<String>) {
            self.events.lock().unwrap().push(event.into());
        }
    }

    #[async_trait]
    impl TripStorage for RecordingBackend {
        async fn upsert_trip_stop_record(&self, record: TripStopRecord) -> Result<(), StorageError> {
            self.log(format!("record:{}", record.stop_code));
            if self.failing_records.lock().unwrap().contains(&record.stop_code) {
                return Err(StorageError::Other(format!("write failed for {}", record.stop_code)));
            }
            if self.enforce_stops.load(Ordering::SeqCst) && !self.stops.lock().unwrap().contains_key(&record.stop_code)
            {
                return Err(StorageError::ReferentialIntegrity(record.stop_code.clone()));
            }
            self.records
                .lock()
                .unwrap()
                .insert((record.trip_number, record.stop_code.clone()), record);
            Ok(())
        }

        async fn upsert_stop_entity(&self, stop: StopEntity) -> Result<(), StorageError> {
            self.log(format!("stop:{}", stop.stop_code));
            if self.fail_stop_upserts.load(Ordering::SeqCst) {
                return Err(StorageError::Other("stop table locked".to_string()));
            }
            self.stops.lock().unwrap().insert(stop.stop_code.clone(), stop);
            Ok(())
        }
    }

    #[async_trait]
    impl LiveLocations for RecordingBackend {
        async fn set_location(&self, stop_code: &str, latitude: f64, longitude: f64) -> Result<(), StorageError> {
            self.log(format!("location:{}", stop_code));
            if self.fail_locations.load(Ordering::SeqCst) {
                return Err(StorageError::Other("geo index unavailable".to_string()));
            }
            self.locations
                .lock()
                .unwrap()
                .push((stop_code.to_string(), latitude, longitude));
            Ok(())
        }
    }

    #[async_trait]
    impl TrackingKeys for RecordingBackend {
        async fn set_tracking_key(&self, trip_number: u32, snapshot: &LastStopSnapshot) -> Result<(), StorageError> {
            self.log("tracking:set");
            if self.fail_tracking_keys.load(Ordering::SeqCst) {
                return Err(StorageError::Other("tracking keys unavailable".to_string()));
            }
            self.tracking_keys.lock().unwrap().insert(trip_number, snapshot.clone());
            Ok(())
        }

        async fn delete_tracking_key(&self, trip_number: u32) -> Result<bool, StorageError> {
            self.log("tracking:delete");
            if self.fail_tracking_keys.load(Ordering::SeqCst) {
                return Err(StorageError::Other("tracking keys unavailable".to_string()));
            }
            Ok(self.tracking_keys.lock().unwrap().remove(&trip_number).is_some())
        }
    }

    #[async_trait]
    impl ContinuationQueue for RecordingBackend {
        async fn enqueue_delayed(&self, delay: Duration, job: &TripJob) -> Result<String, StorageError> {
            self.log("enqueue");
            if self.fail_enqueue.load(Ordering::SeqCst) {
                return Err(StorageError::Other("queue closed".to_string()));
            }
            let mut enqueued = self.enqueued.lock().unwrap();
            enqueued.push((delay, job.clone()));
            Ok(format!("job-{}", enqueued.len()))
        }
    }

    #[async_trait]
    impl MetricsSink for RecordingBackend {
        async fn record(&self, name: &str, value: f64) -> Result<(), StorageError> {
            self.log(format!("metric:{}", name));
            self.metrics.lock().unwrap().push((name.to_string(), value));
            Ok(())
        }
    }

    #[async_trait]
    impl ErrorExporter for RecordingBackend {
        async fn report_error(&self, error: &TrackerError, context: &Value) {
            self.log(format!("error:{}", error.kind()));
            self.errors.lock().unwrap().push((error.to_string(), context.clone()));
        }
    }

    pub fn ports(provider: MockTripProvider, backend: Arc<RecordingBackend>) -> TrackerPorts {
        TrackerPorts::with_backend(Arc::new(provider), backend)
    }
}

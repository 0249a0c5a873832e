//! Tracker ports backed by the StateManager

use async_trait::async_trait;
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, warn};

use super::{StateError, StateManager};
use crate::domain::{LastStopSnapshot, StopEntity, TRIP_QUEUE, TripJob, TripStopRecord};
use crate::error::TrackerError;
use crate::tracker::{
    ContinuationQueue, ErrorExporter, LiveLocations, MetricsSink, StorageError, TrackingKeys, TripStorage,
};

impl From<StateError> for StorageError {
    fn from(err: StateError) -> Self {
        match err {
            StateError::ReferentialIntegrity(detail) => StorageError::ReferentialIntegrity(detail),
            other => StorageError::Other(other.to_string()),
        }
    }
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<String, StorageError> {
    serde_json::to_string(value).map_err(|e| StorageError::Other(format!("Failed to serialize: {}", e)))
}

#[async_trait]
impl TripStorage for StateManager {
    async fn upsert_trip_stop_record(&self, record: TripStopRecord) -> Result<(), StorageError> {
        Ok(self.upsert_trip_stop(record).await?)
    }

    async fn upsert_stop_entity(&self, stop: StopEntity) -> Result<(), StorageError> {
        Ok(self.upsert_stop(stop).await?)
    }
}

#[async_trait]
impl LiveLocations for StateManager {
    async fn set_location(&self, stop_code: &str, latitude: f64, longitude: f64) -> Result<(), StorageError> {
        Ok(self.set_live_location(stop_code, latitude, longitude).await?)
    }
}

#[async_trait]
impl TrackingKeys for StateManager {
    async fn set_tracking_key(&self, trip_number: u32, snapshot: &LastStopSnapshot) -> Result<(), StorageError> {
        let payload = to_json(snapshot)?;
        Ok(StateManager::set_tracking_key(self, trip_number, payload).await?)
    }

    async fn delete_tracking_key(&self, trip_number: u32) -> Result<bool, StorageError> {
        Ok(StateManager::delete_tracking_key(self, trip_number).await?)
    }
}

#[async_trait]
impl ContinuationQueue for StateManager {
    async fn enqueue_delayed(&self, delay: Duration, job: &TripJob) -> Result<String, StorageError> {
        let payload = to_json(job)?;
        let delay_ms = i64::try_from(delay.as_millis()).unwrap_or(i64::MAX);
        let run_at = tripstore::now_ms().saturating_add(delay_ms);
        debug!(trip_number = job.trip_number, run_at, "enqueue_delayed: called");
        Ok(self.enqueue_job(TRIP_QUEUE, payload, run_at).await?)
    }
}

#[async_trait]
impl MetricsSink for StateManager {
    async fn record(&self, name: &str, value: f64) -> Result<(), StorageError> {
        Ok(self.record_metric(name, value).await?)
    }
}

#[async_trait]
impl ErrorExporter for StateManager {
    async fn report_error(&self, error: &TrackerError, context: &Value) {
        let mut context = context.clone();
        if let Value::Object(map) = &mut context {
            map.insert("kind".to_string(), Value::String(error.kind().to_string()));
        }
        if let Err(e) = self.record_error(error.to_string(), context.to_string()).await {
            warn!(error = %e, original = %error, "Failed to store error report");
        }
    }
}

//! StateManager - actor that owns the trip store
//!
//! Processes commands via channels so every SQLite access happens on one task.

use chrono::NaiveDate;
use std::path::Path;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info};
use tripstore::{
    ErrorReport, Job, JobCounts, JobStatus, LiveLocation, MetricDatapoint, StopEntity, Store, TrackingKey,
    TripStopRecord,
};

use super::messages::{StateCommand, StateError, StateResponse};
use crate::domain::{TRIP_QUEUE, TripIdentity, TripJob};

/// Handle to send commands to the StateManager
#[derive(Clone)]
pub struct StateManager {
    tx: mpsc::Sender<StateCommand>,
}

impl StateManager {
    /// Open the store at `db_path` and spawn the actor
    pub fn spawn(db_path: impl AsRef<Path>) -> eyre::Result<Self> {
        debug!(db_path = %db_path.as_ref().display(), "spawn: called");
        let store = Store::open(db_path.as_ref())?;
        Ok(Self::with_store(store))
    }

    /// Spawn the actor over an already opened store
    pub fn with_store(store: Store) -> Self {
        debug!(?store, "with_store: called");
        let (tx, rx) = mpsc::channel(256);
        tokio::spawn(actor_loop(store, rx));
        info!("StateManager spawned");
        Self { tx }
    }

    async fn request<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<StateResponse<T>>) -> StateCommand,
    ) -> StateResponse<T> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(command(reply_tx))
            .await
            .map_err(|_| StateError::ChannelError)?;
        reply_rx.await.map_err(|_| StateError::ChannelError)?
    }

    // === Stops ===

    pub async fn upsert_stop(&self, stop: StopEntity) -> StateResponse<()> {
        debug!(stop_code = %stop.stop_code, "upsert_stop: called");
        self.request(|reply| StateCommand::UpsertStop { stop, reply }).await
    }

    pub async fn get_stop(&self, stop_code: &str) -> StateResponse<Option<StopEntity>> {
        debug!(%stop_code, "get_stop: called");
        let stop_code = stop_code.to_string();
        self.request(|reply| StateCommand::GetStop { stop_code, reply }).await
    }

    /// Insert or overwrite a trip stop record
    pub async fn upsert_trip_stop(&self, record: TripStopRecord) -> StateResponse<()> {
        debug!(trip_number = record.trip_number, stop_code = %record.stop_code, "upsert_trip_stop: called");
        self.request(|reply| StateCommand::UpsertTripStop { record, reply }).await
    }

    pub async fn list_trip_stops(
        &self,
        trip_number: u32,
        service_date: NaiveDate,
        product: &str,
    ) -> StateResponse<Vec<TripStopRecord>> {
        debug!(trip_number, %service_date, %product, "list_trip_stops: called");
        let product = product.to_string();
        self.request(|reply| StateCommand::ListTripStops {
            trip_number,
            service_date,
            product,
            reply,
        })
        .await
    }

    // === Tracking keys and live locations ===

    pub async fn set_tracking_key(&self, trip_number: u32, payload: String) -> StateResponse<()> {
        debug!(trip_number, "set_tracking_key: called");
        self.request(|reply| StateCommand::SetTrackingKey {
            trip_number,
            payload,
            reply,
        })
        .await
    }

    pub async fn get_tracking_key(&self, trip_number: u32) -> StateResponse<Option<TrackingKey>> {
        debug!(trip_number, "get_tracking_key: called");
        self.request(|reply| StateCommand::GetTrackingKey { trip_number, reply })
            .await
    }

    pub async fn delete_tracking_key(&self, trip_number: u32) -> StateResponse<bool> {
        debug!(trip_number, "delete_tracking_key: called");
        self.request(|reply| StateCommand::DeleteTrackingKey { trip_number, reply })
            .await
    }

    pub async fn list_tracking_keys(&self) -> StateResponse<Vec<TrackingKey>> {
        debug!("list_tracking_keys: called");
        self.request(|reply| StateCommand::ListTrackingKeys { reply }).await
    }

    pub async fn set_live_location(&self, stop_code: &str, latitude: f64, longitude: f64) -> StateResponse<()> {
        debug!(%stop_code, latitude, longitude, "set_live_location: called");
        let stop_code = stop_code.to_string();
        self.request(|reply| StateCommand::SetLiveLocation {
            stop_code,
            latitude,
            longitude,
            reply,
        })
        .await
    }

    pub async fn get_live_location(&self, stop_code: &str) -> StateResponse<Option<LiveLocation>> {
        debug!(%stop_code, "get_live_location: called");
        let stop_code = stop_code.to_string();
        self.request(|reply| StateCommand::GetLiveLocation { stop_code, reply })
            .await
    }

    // === Metrics and error reports ===

    pub async fn record_metric(&self, name: &str, value: f64) -> StateResponse<()> {
        debug!(%name, value, "record_metric: called");
        let name = name.to_string();
        self.request(|reply| StateCommand::RecordMetric { name, value, reply })
            .await
    }

    pub async fn list_metrics(&self, name: &str, limit: usize) -> StateResponse<Vec<MetricDatapoint>> {
        debug!(%name, limit, "list_metrics: called");
        let name = name.to_string();
        self.request(|reply| StateCommand::ListMetrics { name, limit, reply })
            .await
    }

    /// Store an error report; returns its id
    pub async fn record_error(&self, message: String, context: String) -> StateResponse<i64> {
        debug!(%message, "record_error: called");
        self.request(|reply| StateCommand::RecordError {
            message,
            context,
            reply,
        })
        .await
    }

    pub async fn list_errors(&self, limit: usize) -> StateResponse<Vec<ErrorReport>> {
        debug!(limit, "list_errors: called");
        self.request(|reply| StateCommand::ListErrors { limit, reply }).await
    }

    // === Job queue ===

    /// Enqueue a job to run at `run_at` (unix ms); returns the job id
    pub async fn enqueue_job(&self, queue: &str, payload: String, run_at: i64) -> StateResponse<String> {
        debug!(%queue, run_at, "enqueue_job: called");
        let queue = queue.to_string();
        self.request(|reply| StateCommand::EnqueueJob {
            queue,
            payload,
            run_at,
            reply,
        })
        .await
    }

    /// Mark up to `limit` due jobs active and return them
    pub async fn claim_due_jobs(&self, queue: &str, now: i64, limit: usize) -> StateResponse<Vec<Job>> {
        debug!(%queue, now, limit, "claim_due_jobs: called");
        let queue = queue.to_string();
        self.request(|reply| StateCommand::ClaimDueJobs {
            queue,
            now,
            limit,
            reply,
        })
        .await
    }

    pub async fn complete_job(&self, id: &str) -> StateResponse<()> {
        debug!(%id, "complete_job: called");
        let id = id.to_string();
        self.request(|reply| StateCommand::CompleteJob { id, reply }).await
    }

    pub async fn fail_job(&self, id: &str, error: String) -> StateResponse<()> {
        debug!(%id, %error, "fail_job: called");
        let id = id.to_string();
        self.request(|reply| StateCommand::FailJob { id, error, reply }).await
    }

    pub async fn park_job(&self, id: &str, error: String) -> StateResponse<()> {
        debug!(%id, %error, "park_job: called");
        let id = id.to_string();
        self.request(|reply| StateCommand::ParkJob { id, error, reply }).await
    }

    pub async fn retry_job(&self, id: &str, run_at: i64, error: String) -> StateResponse<()> {
        debug!(%id, run_at, %error, "retry_job: called");
        let id = id.to_string();
        self.request(|reply| StateCommand::RetryJob {
            id,
            run_at,
            error,
            reply,
        })
        .await
    }

    /// Put jobs left active by a previous run back in the queue
    pub async fn requeue_active_jobs(&self, queue: &str, run_at: i64) -> StateResponse<usize> {
        debug!(%queue, run_at, "requeue_active_jobs: called");
        let queue = queue.to_string();
        self.request(|reply| StateCommand::RequeueActiveJobs { queue, run_at, reply })
            .await
    }

    pub async fn prune_jobs(&self, queue: &str, keep_completed: usize, keep_failed: usize) -> StateResponse<usize> {
        debug!(%queue, keep_completed, keep_failed, "prune_jobs: called");
        let queue = queue.to_string();
        self.request(|reply| StateCommand::PruneJobs {
            queue,
            keep_completed,
            keep_failed,
            reply,
        })
        .await
    }

    pub async fn job_counts(&self, queue: &str) -> StateResponse<JobCounts> {
        debug!(%queue, "job_counts: called");
        let queue = queue.to_string();
        self.request(|reply| StateCommand::JobCounts { queue, reply }).await
    }

    pub async fn list_jobs(&self, queue: &str, status: Option<JobStatus>) -> StateResponse<Vec<Job>> {
        debug!(%queue, ?status, "list_jobs: called");
        let queue = queue.to_string();
        self.request(|reply| StateCommand::ListJobs { queue, status, reply })
            .await
    }

    /// Id of a waiting or active poll job for `trip`, if one is queued
    ///
    /// Payloads that do not decode are skipped; the worker parks them.
    pub async fn pending_trip_job(&self, trip: &TripIdentity) -> StateResponse<Option<String>> {
        debug!(%trip, "pending_trip_job: called");
        for status in [JobStatus::Waiting, JobStatus::Active] {
            for job in self.list_jobs(TRIP_QUEUE, Some(status)).await? {
                if let Ok(payload) = serde_json::from_str::<TripJob>(&job.payload)
                    && payload.identity() == *trip
                {
                    return Ok(Some(job.id));
                }
            }
        }
        Ok(None)
    }

    /// Shutdown the actor
    pub async fn shutdown(&self) -> Result<(), StateError> {
        debug!("shutdown: called");
        self.tx
            .send(StateCommand::Shutdown)
            .await
            .map_err(|_| StateError::ChannelError)
    }
}

/// The actor loop that processes commands
async fn actor_loop(mut store: Store, mut rx: mpsc::Receiver<StateCommand>) {
    debug!("actor_loop: called");

    while let Some(cmd) = rx.recv().await {
        match cmd {
            StateCommand::UpsertStop { stop, reply } => {
                debug!(stop_code = %stop.stop_code, "actor_loop: UpsertStop command");
                let _ = reply.send(store.upsert_stop(&stop).map_err(StateError::from));
            }

            StateCommand::GetStop { stop_code, reply } => {
                debug!(%stop_code, "actor_loop: GetStop command");
                let _ = reply.send(store.get_stop(&stop_code).map_err(StateError::from));
            }

            StateCommand::UpsertTripStop { record, reply } => {
                debug!(stop_code = %record.stop_code, "actor_loop: UpsertTripStop command");
                let _ = reply.send(store.upsert_trip_stop(&record).map_err(StateError::from));
            }

            StateCommand::ListTripStops {
                trip_number,
                service_date,
                product,
                reply,
            } => {
                debug!(trip_number, "actor_loop: ListTripStops command");
                let result = store
                    .list_trip_stops(trip_number, service_date, &product)
                    .map_err(StateError::from);
                let _ = reply.send(result);
            }

            StateCommand::SetTrackingKey {
                trip_number,
                payload,
                reply,
            } => {
                debug!(trip_number, "actor_loop: SetTrackingKey command");
                let _ = reply.send(store.set_tracking_key(trip_number, &payload).map_err(StateError::from));
            }

            StateCommand::GetTrackingKey { trip_number, reply } => {
                debug!(trip_number, "actor_loop: GetTrackingKey command");
                let _ = reply.send(store.get_tracking_key(trip_number).map_err(StateError::from));
            }

            StateCommand::DeleteTrackingKey { trip_number, reply } => {
                debug!(trip_number, "actor_loop: DeleteTrackingKey command");
                let _ = reply.send(store.delete_tracking_key(trip_number).map_err(StateError::from));
            }

            StateCommand::ListTrackingKeys { reply } => {
                debug!("actor_loop: ListTrackingKeys command");
                let _ = reply.send(store.list_tracking_keys().map_err(StateError::from));
            }

            StateCommand::SetLiveLocation {
                stop_code,
                latitude,
                longitude,
                reply,
            } => {
                debug!(%stop_code, "actor_loop: SetLiveLocation command");
                let result = store
                    .set_live_location(&stop_code, latitude, longitude)
                    .map_err(StateError::from);
                let _ = reply.send(result);
            }

            StateCommand::GetLiveLocation { stop_code, reply } => {
                debug!(%stop_code, "actor_loop: GetLiveLocation command");
                let _ = reply.send(store.get_live_location(&stop_code).map_err(StateError::from));
            }

            StateCommand::RecordMetric { name, value, reply } => {
                debug!(%name, "actor_loop: RecordMetric command");
                let _ = reply.send(store.record_metric(&name, value).map_err(StateError::from));
            }

            StateCommand::ListMetrics { name, limit, reply } => {
                debug!(%name, limit, "actor_loop: ListMetrics command");
                let _ = reply.send(store.list_metrics(&name, limit).map_err(StateError::from));
            }

            StateCommand::RecordError {
                message,
                context,
                reply,
            } => {
                debug!("actor_loop: RecordError command");
                let _ = reply.send(store.record_error(&message, &context).map_err(StateError::from));
            }

            StateCommand::ListErrors { limit, reply } => {
                debug!(limit, "actor_loop: ListErrors command");
                let _ = reply.send(store.list_errors(limit).map_err(StateError::from));
            }

            StateCommand::EnqueueJob {
                queue,
                payload,
                run_at,
                reply,
            } => {
                debug!(%queue, run_at, "actor_loop: EnqueueJob command");
                let _ = reply.send(store.enqueue_job(&queue, &payload, run_at).map_err(StateError::from));
            }

            StateCommand::ClaimDueJobs {
                queue,
                now,
                limit,
                reply,
            } => {
                debug!(%queue, limit, "actor_loop: ClaimDueJobs command");
                let _ = reply.send(store.claim_due_jobs(&queue, now, limit).map_err(StateError::from));
            }

            StateCommand::CompleteJob { id, reply } => {
                debug!(%id, "actor_loop: CompleteJob command");
                let _ = reply.send(store.complete_job(&id).map_err(StateError::from));
            }

            StateCommand::FailJob { id, error, reply } => {
                debug!(%id, "actor_loop: FailJob command");
                let _ = reply.send(store.fail_job(&id, &error).map_err(StateError::from));
            }

            StateCommand::ParkJob { id, error, reply } => {
                debug!(%id, "actor_loop: ParkJob command");
                let _ = reply.send(store.park_job(&id, &error).map_err(StateError::from));
            }

            StateCommand::RetryJob {
                id,
                run_at,
                error,
                reply,
            } => {
                debug!(%id, run_at, "actor_loop: RetryJob command");
                let _ = reply.send(store.retry_job(&id, run_at, &error).map_err(StateError::from));
            }

            StateCommand::RequeueActiveJobs { queue, run_at, reply } => {
                debug!(%queue, "actor_loop: RequeueActiveJobs command");
                let _ = reply.send(store.requeue_active_jobs(&queue, run_at).map_err(StateError::from));
            }

            StateCommand::PruneJobs {
                queue,
                keep_completed,
                keep_failed,
                reply,
            } => {
                debug!(%queue, "actor_loop: PruneJobs command");
                let result = store
                    .prune_jobs(&queue, keep_completed, keep_failed)
                    .map_err(StateError::from);
                let _ = reply.send(result);
            }

            StateCommand::JobCounts { queue, reply } => {
                debug!(%queue, "actor_loop: JobCounts command");
                let _ = reply.send(store.job_counts(&queue).map_err(StateError::from));
            }

            StateCommand::ListJobs { queue, status, reply } => {
                debug!(%queue, ?status, "actor_loop: ListJobs command");
                let _ = reply.send(store.list_jobs(&queue, status).map_err(StateError::from));
            }

            StateCommand::Shutdown => {
                debug!("actor_loop: Shutdown command");
                info!("StateManager shutting down");
                break;
            }
        }
    }

    debug!("actor_loop: exited");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;
    use tempfile::tempdir;

    fn stop(code: &str) -> StopEntity {
        StopEntity {
            stop_code: code.to_string(),
            alt_code: None,
            name: format!("Stop {}", code),
            latitude: 49.45,
            longitude: 11.08,
            products: BTreeSet::from(["Tram".to_string()]),
        }
    }

    fn record(code: &str, delay: i64) -> TripStopRecord {
        TripStopRecord {
            trip_number: 1042,
            service_date: NaiveDate::from_ymd_opt(2024, 5, 17).unwrap(),
            product: "Tram".to_string(),
            stop_code: code.to_string(),
            platform: None,
            direction_text: None,
            scheduled_arrival: None,
            arrival_delay_secs: delay,
            scheduled_departure: None,
            departure_delay_secs: delay,
        }
    }

    #[tokio::test]
    async fn test_trip_stop_crud_on_disk() {
        let temp = tempdir().unwrap();
        let manager = StateManager::spawn(temp.path().join("trips.db")).unwrap();

        manager.upsert_stop(stop("3101")).await.unwrap();
        manager.upsert_trip_stop(record("3101", 30)).await.unwrap();
        // Same key again overwrites
        manager.upsert_trip_stop(record("3101", 75)).await.unwrap();

        let stops = manager
            .list_trip_stops(1042, NaiveDate::from_ymd_opt(2024, 5, 17).unwrap(), "Tram")
            .await
            .unwrap();
        assert_eq!(stops.len(), 1);
        assert_eq!(stops[0].arrival_delay_secs, 75);

        manager.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_unknown_stop_is_referential_integrity() {
        let manager = StateManager::with_store(Store::open_in_memory().unwrap());

        let err = manager.upsert_trip_stop(record("9999", 0)).await.unwrap_err();
        assert!(matches!(err, StateError::ReferentialIntegrity(_)));
    }

    #[tokio::test]
    async fn test_tracking_keys() {
        let manager = StateManager::with_store(Store::open_in_memory().unwrap());

        manager.set_tracking_key(1042, "{\"stop_code\":\"A\"}".to_string()).await.unwrap();
        let key = manager.get_tracking_key(1042).await.unwrap().unwrap();
        assert_eq!(key.payload, "{\"stop_code\":\"A\"}");
        assert_eq!(manager.list_tracking_keys().await.unwrap().len(), 1);

        assert!(manager.delete_tracking_key(1042).await.unwrap());
        assert!(!manager.delete_tracking_key(1042).await.unwrap());
    }

    #[tokio::test]
    async fn test_job_lifecycle() {
        let manager = StateManager::with_store(Store::open_in_memory().unwrap());

        let id = manager.enqueue_job("q:test", "{}".to_string(), 1_000).await.unwrap();
        assert!(manager.claim_due_jobs("q:test", 999, 5).await.unwrap().is_empty());

        let claimed = manager.claim_due_jobs("q:test", 1_000, 5).await.unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].id, id);
        assert_eq!(claimed[0].attempts, 1);

        manager.complete_job(&id).await.unwrap();
        let counts = manager.job_counts("q:test").await.unwrap();
        assert_eq!(counts.completed, 1);
        assert_eq!(counts.waiting, 0);
    }

    #[tokio::test]
    async fn test_pending_trip_job_matches_waiting_and_active() {
        use crate::domain::Product;

        let manager = StateManager::with_store(Store::open_in_memory().unwrap());
        let trip = TripIdentity {
            trip_number: 1042,
            service_date: NaiveDate::from_ymd_opt(2024, 5, 17).unwrap(),
            product: Product::Tram,
        };
        let other_day = TripIdentity {
            service_date: NaiveDate::from_ymd_opt(2024, 5, 18).unwrap(),
            ..trip
        };
        assert_eq!(manager.pending_trip_job(&trip).await.unwrap(), None);

        let payload = |trip| serde_json::to_string(&TripJob::new(trip, None, None)).unwrap();
        manager.enqueue_job(TRIP_QUEUE, "not json".to_string(), 0).await.unwrap();
        manager.enqueue_job(TRIP_QUEUE, payload(other_day), 0).await.unwrap();
        assert_eq!(manager.pending_trip_job(&trip).await.unwrap(), None);

        let id = manager.enqueue_job(TRIP_QUEUE, payload(trip), 0).await.unwrap();
        assert_eq!(manager.pending_trip_job(&trip).await.unwrap(), Some(id.clone()));

        // Still pending while a worker runs it
        manager.claim_due_jobs(TRIP_QUEUE, 0, 10).await.unwrap();
        assert_eq!(manager.pending_trip_job(&trip).await.unwrap(), Some(id.clone()));

        manager.complete_job(&id).await.unwrap();
        assert_eq!(manager.pending_trip_job(&trip).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_shutdown_closes_channel() {
        let manager = StateManager::with_store(Store::open_in_memory().unwrap());
        manager.shutdown().await.unwrap();
        // Give the actor a chance to exit
        tokio::task::yield_now().await;
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;

        let err = manager.list_tracking_keys().await.unwrap_err();
        assert!(matches!(err, StateError::ChannelError));
    }
}

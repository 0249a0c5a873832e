//! State manager messages
//!
//! Commands and responses for the actor pattern.

use chrono::NaiveDate;
use thiserror::Error;
use tokio::sync::oneshot;
use tripstore::{
    ErrorReport, Job, JobCounts, JobStatus, LiveLocation, MetricDatapoint, StopEntity, StoreError, TrackingKey,
    TripStopRecord,
};

/// Errors from state operations
#[derive(Debug, Error)]
pub enum StateError {
    #[error("Record not found: {0}")]
    NotFound(String),

    /// A write referenced a stop that does not exist
    #[error("Referential integrity violation: {0}")]
    ReferentialIntegrity(String),

    #[error("Store error: {0}")]
    StoreError(String),

    #[error("Channel error")]
    ChannelError,
}

impl From<StoreError> for StateError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::ReferentialIntegrity(detail) => StateError::ReferentialIntegrity(detail),
            StoreError::JobNotFound(id) => StateError::NotFound(format!("Job {}", id)),
            other => StateError::StoreError(other.to_string()),
        }
    }
}

/// Response from state operations
pub type StateResponse<T> = Result<T, StateError>;

/// Commands sent to the StateManager actor
#[derive(Debug)]
pub enum StateCommand {
    // Stop operations
    UpsertStop {
        stop: StopEntity,
        reply: oneshot::Sender<StateResponse<()>>,
    },
    GetStop {
        stop_code: String,
        reply: oneshot::Sender<StateResponse<Option<StopEntity>>>,
    },
    UpsertTripStop {
        record: TripStopRecord,
        reply: oneshot::Sender<StateResponse<()>>,
    },
    ListTripStops {
        trip_number: u32,
        service_date: NaiveDate,
        product: String,
        reply: oneshot::Sender<StateResponse<Vec<TripStopRecord>>>,
    },

    // Tracking key and live location operations
    SetTrackingKey {
        trip_number: u32,
        payload: String,
        reply: oneshot::Sender<StateResponse<()>>,
    },
    GetTrackingKey {
        trip_number: u32,
        reply: oneshot::Sender<StateResponse<Option<TrackingKey>>>,
    },
    DeleteTrackingKey {
        trip_number: u32,
        reply: oneshot::Sender<StateResponse<bool>>,
    },
    ListTrackingKeys {
        reply: oneshot::Sender<StateResponse<Vec<TrackingKey>>>,
    },
    SetLiveLocation {
        stop_code: String,
        latitude: f64,
        longitude: f64,
        reply: oneshot::Sender<StateResponse<()>>,
    },
    GetLiveLocation {
        stop_code: String,
        reply: oneshot::Sender<StateResponse<Option<LiveLocation>>>,
    },

    // Metrics and error reports
    RecordMetric {
        name: String,
        value: f64,
        reply: oneshot::Sender<StateResponse<()>>,
    },
    ListMetrics {
        name: String,
        limit: usize,
        reply: oneshot::Sender<StateResponse<Vec<MetricDatapoint>>>,
    },
    RecordError {
        message: String,
        context: String,
        reply: oneshot::Sender<StateResponse<i64>>,
    },
    ListErrors {
        limit: usize,
        reply: oneshot::Sender<StateResponse<Vec<ErrorReport>>>,
    },

    // Job queue operations
    EnqueueJob {
        queue: String,
        payload: String,
        run_at: i64,
        reply: oneshot::Sender<StateResponse<String>>,
    },
    ClaimDueJobs {
        queue: String,
        now: i64,
        limit: usize,
        reply: oneshot::Sender<StateResponse<Vec<Job>>>,
    },
    CompleteJob {
        id: String,
        reply: oneshot::Sender<StateResponse<()>>,
    },
    FailJob {
        id: String,
        error: String,
        reply: oneshot::Sender<StateResponse<()>>,
    },
    ParkJob {
        id: String,
        error: String,
        reply: oneshot::Sender<StateResponse<()>>,
    },
    RetryJob {
        id: String,
        run_at: i64,
        error: String,
        reply: oneshot::Sender<StateResponse<()>>,
    },
    RequeueActiveJobs {
        queue: String,
        run_at: i64,
        reply: oneshot::Sender<StateResponse<usize>>,
    },
    PruneJobs {
        queue: String,
        keep_completed: usize,
        keep_failed: usize,
        reply: oneshot::Sender<StateResponse<usize>>,
    },
    JobCounts {
        queue: String,
        reply: oneshot::Sender<StateResponse<JobCounts>>,
    },
    ListJobs {
        queue: String,
        status: Option<JobStatus>,
        reply: oneshot::Sender<StateResponse<Vec<Job>>>,
    },

    // Shutdown
    Shutdown,
}

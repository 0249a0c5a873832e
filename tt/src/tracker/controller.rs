//! Trip lifecycle controller
//!
//! One call to [`TripTracker::process`] is one poll of one trip: fetch the
//! trip, resolve how far it has got, persist stops completed since the last
//! poll, then either finish the trip or schedule the next poll.

use chrono::{DateTime, Utc};
use serde_json::{Value, json};
use tracing::{Instrument, debug, error, info, info_span, warn};

use super::ports::TrackerPorts;
use super::reschedule::{Decision, Rescheduler};
use super::writer::persist_new_stops;
use crate::domain::{LastStopSnapshot, TripJob};
use crate::error::TrackerError;
use crate::progress::{extend_tracked, new_stop_codes, resolve_stop_history};

/// Metric name for provider request latency
pub const REQUEST_TIME_METRIC: &str = "trip.request_time";

/// Result of a successful poll
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// The trip reached its final stop; no further polls
    Complete { newly_recorded: Vec<String> },
    /// A continuation was enqueued
    Rescheduled {
        newly_recorded: Vec<String>,
        next_poll_at: DateTime<Utc>,
        progress: Option<f64>,
    },
}

impl Outcome {
    pub fn newly_recorded(&self) -> &[String] {
        match self {
            Outcome::Complete { newly_recorded } => newly_recorded,
            Outcome::Rescheduled { newly_recorded, .. } => newly_recorded,
        }
    }

    pub fn is_complete(&self) -> bool {
        matches!(self, Outcome::Complete { .. })
    }
}

/// Polls trips and drives them to completion
#[derive(Clone)]
pub struct TripTracker {
    ports: TrackerPorts,
    rescheduler: Rescheduler,
}

impl TripTracker {
    pub fn new(ports: TrackerPorts, rescheduler: Rescheduler) -> Self {
        Self { ports, rescheduler }
    }

    /// Process one poll job as of now
    pub async fn process(&self, job: &TripJob) -> Result<Outcome, TrackerError> {
        self.process_at(job, Utc::now()).await
    }

    /// Process one poll job as of `now`
    ///
    /// Every error is handed to the error exporter before it is returned.
    pub async fn process_at(&self, job: &TripJob, now: DateTime<Utc>) -> Result<Outcome, TrackerError> {
        let span = info_span!(
            "trip",
            trip_number = job.trip_number,
            product = %job.product,
            service_date = %job.service_date
        );

        async move {
            debug!(%now, tracked = job.already_tracked_stops.len(), "process_at: called");
            match self.run(job, now).await {
                Ok(outcome) => Ok(outcome),
                Err(err) => {
                    error!(error = %err, kind = err.kind(), "Trip poll failed");
                    self.ports.errors.report_error(&err, &error_context(job, now)).await;
                    Err(err)
                }
            }
        }
        .instrument(span)
        .await
    }

    async fn run(&self, job: &TripJob, now: DateTime<Utc>) -> Result<Outcome, TrackerError> {
        let trip = job.identity();
        let fetched = self
            .ports
            .provider
            .fetch_trip(job.trip_number, job.product, job.service_date)
            .await?;
        debug!(stops = fetched.stops.len(), "run: trip fetched");

        if let Some(request_time_ms) = fetched.request_time_ms
            && let Err(e) = self.ports.metrics.record(REQUEST_TIME_METRIC, request_time_ms).await
        {
            warn!(error = %e, "Failed to record request time");
        }

        let history = resolve_stop_history(&fetched.stops, now);
        let Some(last_index) = history.last_stop_index else {
            return Err(TrackerError::Logic(format!(
                "No stop of trip {} has been passed at {}",
                trip, now
            )));
        };

        let new_codes = new_stop_codes(&history.completed_stop_codes, &job.already_tracked_stops);
        let report = persist_new_stops(self.ports.storage.as_ref(), &trip, &fetched, &new_codes).await?;
        if !report.recovered.is_empty() {
            info!(recovered = ?report.recovered, "Recovered unknown stops");
        }

        match self.rescheduler.decide(&fetched.stops, last_index, now) {
            Decision::Complete => {
                match self.ports.tracking_keys.delete_tracking_key(job.trip_number).await {
                    Ok(removed) => debug!(removed, "run: tracking key deleted"),
                    Err(e) => warn!(error = %e, "Failed to delete tracking key"),
                }
                info!(recorded = report.recorded.len(), "Trip complete");
                Ok(Outcome::Complete {
                    newly_recorded: report.recorded,
                })
            }
            Decision::Continue { next_poll_at, delay } => {
                let last_stop = &fetched.stops[last_index];

                if let Err(e) = self
                    .ports
                    .locations
                    .set_location(&last_stop.stop_code, last_stop.latitude, last_stop.longitude)
                    .await
                {
                    warn!(error = %e, stop_code = %last_stop.stop_code, "Failed to publish live location");
                }

                let snapshot = LastStopSnapshot::new(job, &fetched, last_stop, history.progress);
                if let Err(e) = self.ports.tracking_keys.set_tracking_key(job.trip_number, &snapshot).await {
                    warn!(error = %e, "Failed to write tracking key");
                }

                let tracked = extend_tracked(&job.already_tracked_stops, &history.completed_stop_codes);
                let continuation = job.continuation(tracked, snapshot);
                let job_id = self
                    .ports
                    .queue
                    .enqueue_delayed(delay, &continuation)
                    .await
                    .map_err(|e| TrackerError::Queue(e.to_string()))?;

                info!(
                    %job_id,
                    %next_poll_at,
                    last_stop = %last_stop.stop_code,
                    progress = ?history.progress,
                    recorded = report.recorded.len(),
                    "Next poll scheduled"
                );
                Ok(Outcome::Rescheduled {
                    newly_recorded: report.recorded,
                    next_poll_at,
                    progress: history.progress,
                })
            }
        }
    }
}

/// The whole job payload plus the reference time
fn error_context(job: &TripJob, now: DateTime<Utc>) -> Value {
    let mut context = serde_json::to_value(job).unwrap_or_else(|e| {
        warn!(error = %e, "Failed to serialize job for error context");
        json!({ "trip_number": job.trip_number })
    });
    if let Value::Object(map) = &mut context {
        map.insert("at".to_string(), Value::String(now.to_rfc3339()));
    }
    context
}

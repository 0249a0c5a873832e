//! Job worker
//!
//! Claims due trip polls from the job queue, runs each on its own task and
//! settles the job afterwards: completed, retried with backoff, failed or
//! parked when the payload cannot be decoded.

use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::{JoinError, JoinSet};
use tokio::time::MissedTickBehavior;
use tracing::{Instrument, debug, error, info, info_span, warn};
use tripstore::{Job, now_ms};

use super::config::WorkerConfig;
use crate::domain::{TRIP_QUEUE, TripJob};
use crate::state::{StateError, StateManager};
use crate::tracker::{Outcome, TripTracker};

/// How a job was settled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobResult {
    Completed,
    /// Put back in the queue for another attempt
    Retried,
    Failed,
    /// Payload could not be decoded; never executed
    Parked,
}

/// Counters kept by the worker
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct WorkerStats {
    pub claimed: u64,
    pub completed: u64,
    pub retried: u64,
    pub failed: u64,
    pub parked: u64,
    /// Jobs that could not be settled in the store
    pub errors: u64,
    pub pruned: u64,
    pub peak_in_flight: usize,
}

type TaskOutput = (String, Result<JobResult, StateError>);

/// Runs trip polls from the queue with a concurrency limit
pub struct Worker {
    config: WorkerConfig,
    state: StateManager,
    tracker: TripTracker,
    stats: WorkerStats,
}

impl Worker {
    pub fn new(config: WorkerConfig, state: StateManager, tracker: TripTracker) -> Self {
        debug!(?config, "Worker::new: called");
        Self {
            config,
            state,
            tracker,
            stats: WorkerStats::default(),
        }
    }

    pub fn stats(&self) -> &WorkerStats {
        &self.stats
    }

    /// Run until a shutdown signal arrives, then let in-flight jobs finish
    pub async fn run(&mut self, mut shutdown_rx: mpsc::Receiver<()>) -> eyre::Result<WorkerStats> {
        info!(concurrency = self.config.concurrency, "Worker starting");

        let requeued = self.state.requeue_active_jobs(TRIP_QUEUE, now_ms()).await?;
        if requeued > 0 {
            info!(requeued, "Recovered interrupted jobs");
        }

        let mut tasks: JoinSet<TaskOutput> = JoinSet::new();
        let mut interval = tokio::time::interval(self.config.poll_interval());
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut settled_since_prune = 0usize;

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.spawn_due_jobs(&mut tasks, now_ms()).await {
                        warn!(error = %e, "Failed to claim due jobs");
                    }
                    if settled_since_prune > 0 {
                        self.prune().await;
                        settled_since_prune = 0;
                    }
                }
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    self.record(joined);
                    settled_since_prune += 1;
                }
                // A closed channel disables this arm instead of stopping the worker
                Some(()) = shutdown_rx.recv() => {
                    info!(in_flight = tasks.len(), "Shutdown signal received");
                    break;
                }
            }
        }

        // Graceful shutdown: no new claims, wait for running polls
        while let Some(joined) = tasks.join_next().await {
            self.record(joined);
        }
        self.prune().await;

        info!(stats = ?self.stats, "Worker stopped");
        Ok(self.stats.clone())
    }

    /// Claim every job due at `now` (up to the concurrency limit) and run them to completion
    pub async fn run_due_jobs(&mut self, now: i64) -> Result<Vec<JobResult>, StateError> {
        debug!(now, "run_due_jobs: called");
        let mut tasks: JoinSet<TaskOutput> = JoinSet::new();
        self.spawn_due_jobs(&mut tasks, now).await?;

        let mut results = Vec::with_capacity(tasks.len());
        while let Some(joined) = tasks.join_next().await {
            if let Ok((_, Ok(result))) = &joined {
                results.push(*result);
            }
            self.record(joined);
        }
        self.prune().await;
        Ok(results)
    }

    async fn spawn_due_jobs(&mut self, tasks: &mut JoinSet<TaskOutput>, now: i64) -> Result<usize, StateError> {
        let free = self.config.concurrency.saturating_sub(tasks.len());
        if free == 0 {
            debug!("spawn_due_jobs: at capacity");
            return Ok(0);
        }

        let jobs = self.state.claim_due_jobs(TRIP_QUEUE, now, free).await?;
        let claimed = jobs.len();
        for job in jobs {
            let state = self.state.clone();
            let tracker = self.tracker.clone();
            let config = self.config.clone();
            let span = info_span!("job", id = %job.id, attempt = job.attempts);
            tasks.spawn(
                async move {
                    let id = job.id.clone();
                    (id, execute(&state, &tracker, &config, job).await)
                }
                .instrument(span),
            );
        }

        self.stats.claimed += claimed as u64;
        self.stats.peak_in_flight = self.stats.peak_in_flight.max(tasks.len());
        if claimed > 0 {
            debug!(claimed, in_flight = tasks.len(), "spawn_due_jobs: spawned");
        }
        Ok(claimed)
    }

    fn record(&mut self, joined: Result<TaskOutput, JoinError>) {
        match joined {
            Ok((_, Ok(result))) => match result {
                JobResult::Completed => self.stats.completed += 1,
                JobResult::Retried => self.stats.retried += 1,
                JobResult::Failed => self.stats.failed += 1,
                JobResult::Parked => self.stats.parked += 1,
            },
            Ok((id, Err(e))) => {
                error!(%id, error = %e, "Failed to settle job");
                self.stats.errors += 1;
            }
            Err(e) => {
                error!(error = %e, "Job task panicked");
                self.stats.errors += 1;
            }
        }
    }

    async fn prune(&mut self) {
        match self
            .state
            .prune_jobs(TRIP_QUEUE, self.config.keep_completed, self.config.keep_failed)
            .await
        {
            Ok(pruned) => {
                if pruned > 0 {
                    debug!(pruned, "prune: removed old jobs");
                }
                self.stats.pruned += pruned as u64;
            }
            Err(e) => warn!(error = %e, "Failed to prune jobs"),
        }
    }
}

/// Run one claimed job and settle it
async fn execute(
    state: &StateManager,
    tracker: &TripTracker,
    config: &WorkerConfig,
    job: Job,
) -> Result<JobResult, StateError> {
    debug!(payload_len = job.payload.len(), "execute: called");

    let trip_job: TripJob = match serde_json::from_str(&job.payload) {
        Ok(trip_job) => trip_job,
        Err(e) => {
            warn!(error = %e, "Parking job with malformed payload");
            state.park_job(&job.id, format!("Malformed payload: {}", e)).await?;
            return Ok(JobResult::Parked);
        }
    };

    match tracker.process(&trip_job).await {
        Ok(outcome) => {
            debug!(complete = outcome.is_complete(), "execute: poll succeeded");
            if let Outcome::Complete { .. } = outcome {
                info!(trip_number = trip_job.trip_number, "Trip finished");
            }
            state.complete_job(&job.id).await?;
            Ok(JobResult::Completed)
        }
        Err(err) if err.is_retryable() && job.attempts < config.max_attempts => {
            let delay = config.backoff(job.attempts);
            let run_at = now_ms().saturating_add(delay.as_millis() as i64);
            warn!(error = %err, attempt = job.attempts, ?delay, "Poll failed, retrying");
            state.retry_job(&job.id, run_at, err.to_string()).await?;
            Ok(JobResult::Retried)
        }
        Err(err) => {
            error!(error = %err, attempt = job.attempts, "Poll failed permanently");
            state.fail_job(&job.id, err.to_string()).await?;
            Ok(JobResult::Failed)
        }
    }
}

//! Job worker for trip polls
//!
//! Drains the delayed job queue with a concurrency limit, retrying failed
//! polls with exponential backoff.

mod config;
mod worker;

pub use config::WorkerConfig;
pub use worker::{JobResult, Worker, WorkerStats};

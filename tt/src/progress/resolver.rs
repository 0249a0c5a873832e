//! Stop history resolution
//!
//! Works out how far a trip has got at a reference time: the last stop the
//! vehicle has left, how far along it is towards the next one, and which
//! stop codes are complete.

use chrono::{DateTime, Utc};
use std::collections::HashSet;
use tracing::debug;

use crate::domain::StopVisit;

/// Progress of a trip at a reference time
#[derive(Debug, Clone, PartialEq)]
pub struct StopHistory {
    /// Index of the last stop the vehicle has left; `None` if it has not left any
    pub last_stop_index: Option<usize>,
    /// Fraction (0..=1) of the way from the last stop to the next one.
    /// `None` at the final stop or when the segment has no usable times.
    pub progress: Option<f64>,
    /// Codes of every stop up to and including the last one, first-seen order, no duplicates
    pub completed_stop_codes: Vec<String>,
}

/// Resolve the history of `stops` as of `now`
pub fn resolve_stop_history(stops: &[StopVisit], now: DateTime<Utc>) -> StopHistory {
    debug!(stop_count = stops.len(), %now, "resolve_stop_history: called");

    let last_stop_index = stops
        .iter()
        .rposition(|stop| stop.passed_time().is_some_and(|passed| passed <= now));

    let Some(index) = last_stop_index else {
        debug!("resolve_stop_history: no stop passed yet");
        return StopHistory {
            last_stop_index: None,
            progress: None,
            completed_stop_codes: Vec::new(),
        };
    };

    let progress = stops
        .get(index + 1)
        .and_then(|next| segment_progress(&stops[index], next, now));

    let mut seen = HashSet::new();
    let completed_stop_codes = stops[..=index]
        .iter()
        .filter(|stop| seen.insert(stop.stop_code.as_str()))
        .map(|stop| stop.stop_code.clone())
        .collect();

    debug!(index, ?progress, "resolve_stop_history: resolved");
    StopHistory {
        last_stop_index,
        progress,
        completed_stop_codes,
    }
}

/// Elapsed share of the travel time between two consecutive stops
fn segment_progress(from: &StopVisit, to: &StopVisit, now: DateTime<Utc>) -> Option<f64> {
    let departed = from.passed_time()?;
    let arrives = to.arrival_time().or_else(|| to.departure_time())?;

    let total = (arrives - departed).num_milliseconds();
    if total <= 0 {
        debug!("segment_progress: non-positive segment, treating as arrived");
        return Some(1.0);
    }
    let elapsed = (now - departed).num_milliseconds();
    Some((elapsed as f64 / total as f64).clamp(0.0, 1.0))
}

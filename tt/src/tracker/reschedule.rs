//! When to poll a trip again

use chrono::{DateTime, TimeDelta, Utc};
use std::time::Duration;
use tracing::debug;

use crate::domain::StopVisit;

/// Added to the next stop's arrival so the poll lands after the vehicle does
pub const DEFAULT_POLL_BUFFER_MS: u64 = 5_000;

/// Delay used when the next stop has no usable time
pub const DEFAULT_FALLBACK_POLL_MS: u64 = 60_000;

/// What to do after a poll
#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    /// The final stop has been reached
    Complete,
    /// Poll again at `next_poll_at`, which is `delay` from now
    Continue {
        next_poll_at: DateTime<Utc>,
        delay: Duration,
    },
}

#[derive(Debug, Clone)]
pub struct Rescheduler {
    poll_buffer: Duration,
    fallback_delay: Duration,
}

impl Default for Rescheduler {
    fn default() -> Self {
        Self::new(
            Duration::from_millis(DEFAULT_POLL_BUFFER_MS),
            Duration::from_millis(DEFAULT_FALLBACK_POLL_MS),
        )
    }
}

impl Rescheduler {
    pub fn new(poll_buffer: Duration, fallback_delay: Duration) -> Self {
        Self {
            poll_buffer,
            fallback_delay,
        }
    }

    /// Decide given the index of the last completed stop
    pub fn decide(&self, stops: &[StopVisit], last_stop_index: usize, now: DateTime<Utc>) -> Decision {
        debug!(last_stop_index, stop_count = stops.len(), "Rescheduler::decide: called");

        let Some(next) = stops.get(last_stop_index + 1) else {
            debug!("Rescheduler::decide: final stop reached");
            return Decision::Complete;
        };

        match next.arrival_time().or_else(|| next.departure_time()) {
            Some(expected) => {
                let next_poll_at = expected + to_delta(self.poll_buffer);
                // Already overdue polls run immediately
                let delay = (next_poll_at - now).to_std().unwrap_or(Duration::ZERO);
                debug!(%next_poll_at, ?delay, "Rescheduler::decide: continue");
                Decision::Continue { next_poll_at, delay }
            }
            None => {
                debug!(stop_code = %next.stop_code, "Rescheduler::decide: next stop has no time, using fallback");
                Decision::Continue {
                    next_poll_at: now + to_delta(self.fallback_delay),
                    delay: self.fallback_delay,
                }
            }
        }
    }
}

fn to_delta(duration: Duration) -> TimeDelta {
    TimeDelta::from_std(duration).unwrap_or(TimeDelta::zero())
}

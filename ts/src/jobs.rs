//! Delayed job queue types

use serde::{Deserialize, Serialize};

use crate::StoreError;

/// Lifecycle of a queued job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Waiting for `run_at` to pass
    #[default]
    Waiting,
    /// Claimed by a worker
    Active,
    Completed,
    /// Out of attempts or not retryable
    Failed,
    /// Payload could not be decoded; kept for inspection, never run
    Parked,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Waiting => "waiting",
            Self::Active => "active",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Parked => "parked",
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for JobStatus {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "waiting" => Ok(Self::Waiting),
            "active" => Ok(Self::Active),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "parked" => Ok(Self::Parked),
            other => Err(StoreError::InvalidData(format!("unknown job status '{}'", other))),
        }
    }
}

/// A job row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub queue: String,
    /// Opaque JSON payload; decoding is the consumer's business
    pub payload: String,
    /// Unix ms before which the job must not run
    pub run_at: i64,
    /// Number of times the job has been claimed
    pub attempts: u32,
    pub status: JobStatus,
    pub last_error: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

/// Number of jobs per status in one queue
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct JobCounts {
    pub waiting: u64,
    pub active: u64,
    pub completed: u64,
    pub failed: u64,
    pub parked: u64,
}

impl JobCounts {
    pub fn total(&self) -> u64 {
        self.waiting + self.active + self.completed + self.failed + self.parked
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_string_roundtrip() {
        for status in [
            JobStatus::Waiting,
            JobStatus::Active,
            JobStatus::Completed,
            JobStatus::Failed,
            JobStatus::Parked,
        ] {
            assert_eq!(status.as_str().parse::<JobStatus>().unwrap(), status);
        }
    }

    #[test]
    fn test_unknown_status_rejected() {
        assert!("delayed".parse::<JobStatus>().is_err());
    }

    #[test]
    fn test_counts_total() {
        let counts = JobCounts {
            waiting: 2,
            active: 1,
            completed: 3,
            failed: 0,
            parked: 1,
        };
        assert_eq!(counts.total(), 7);
    }
}

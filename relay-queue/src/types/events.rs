use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::JobId;

/// Worker lifecycle events for structured observability
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum JobEvent {
    /// A claimed job is about to run
    Processing {
        job_id: JobId,
        job_name: String,
        queue: String,
        attempts: u32,
        at: DateTime<Utc>,
    },

    /// Job ran to completion and was deleted
    Completed {
        job_id: JobId,
        at: DateTime<Utc>,
    },

    /// Job was released back for another attempt
    Released {
        job_id: JobId,
        /// Backoff chosen by the worker; `None` when the job released itself
        retry_in_ms: Option<u64>,
        at: DateTime<Utc>,
    },

    /// Job failed terminally
    Failed {
        job_id: JobId,
        error: String,
        at: DateTime<Utc>,
    },

    /// The worker left its polling loop
    WorkerStopped {
        forced: bool,
        at: DateTime<Utc>,
    },
}

impl JobEvent {
    /// Get event type name as string
    pub fn event_name(&self) -> &'static str {
        match self {
            Self::Processing { .. } => "processing",
            Self::Completed { .. } => "completed",
            Self::Released { .. } => "released",
            Self::Failed { .. } => "failed",
            Self::WorkerStopped { .. } => "worker_stopped",
        }
    }

    /// Get the job ID, if the event concerns a job
    pub fn job_id(&self) -> Option<&JobId> {
        match self {
            Self::Processing { job_id, .. }
            | Self::Completed { job_id, .. }
            | Self::Released { job_id, .. }
            | Self::Failed { job_id, .. } => Some(job_id),
            Self::WorkerStopped { .. } => None,
        }
    }

    /// Get the timestamp from any event
    pub fn timestamp(&self) -> &DateTime<Utc> {
        match self {
            Self::Processing { at, .. }
            | Self::Completed { at, .. }
            | Self::Released { at, .. }
            | Self::Failed { at, .. }
            | Self::WorkerStopped { at, .. } => at,
        }
    }
}

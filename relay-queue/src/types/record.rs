use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::JobId;

/// One unit of work as stored or sent by a backend
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    /// Backend-assigned identifier
    pub id: JobId,

    /// Name of the registered job type that processes the payload
    pub job_name: String,

    /// Job payload
    pub payload: Value,

    /// Logical queue the record belongs to
    pub queue: String,

    /// Number of prior delivery attempts
    pub attempts: u32,

    /// The record cannot be claimed before this instant
    pub not_before: DateTime<Utc>,

    /// When the record was created
    pub created_at: DateTime<Utc>,
}

impl JobRecord {
    /// Create a fresh record, eligible immediately
    pub fn new(
        id: JobId,
        job_name: impl Into<String>,
        payload: Value,
        queue: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            job_name: job_name.into(),
            payload,
            queue: queue.into(),
            attempts: 0,
            not_before: now,
            created_at: now,
        }
    }

    /// Set the prior attempt count
    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts;
        self
    }

    /// Set the eligibility instant
    pub fn with_not_before(mut self, not_before: DateTime<Utc>) -> Self {
        self.not_before = not_before;
        self
    }

    /// Check if the record can be claimed at `now`
    pub fn is_eligible(&self, now: DateTime<Utc>) -> bool {
        self.not_before <= now
    }
}

/// Terminal flags of a queue handle
///
/// Only used for idempotency inside one handle's lifetime; exclusivity of the
/// claim itself is the backend's business.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandleState {
    pub deleted: bool,
    pub released: bool,
    pub failed: bool,
}

impl HandleState {
    /// Whether any terminal operation ran
    pub fn is_terminal(&self) -> bool {
        self.deleted || self.released || self.failed
    }

    /// Get the state name as a string
    pub fn name(&self) -> &'static str {
        if self.failed {
            "failed"
        } else if self.released {
            "released"
        } else if self.deleted {
            "deleted"
        } else {
            "claimed"
        }
    }
}

pub mod sync;
pub mod broker;
pub mod jobserver;

#[cfg(feature = "database")]
pub mod database;

use async_trait::async_trait;
use serde_json::Value;

use crate::{handle::QueueHandle, JobId, QueueResult};

/// A claimed job handed out by [`QueueBackend::pop`]
pub type BoxedHandle = Box<dyn QueueHandle>;

/// Storage or protocol driver for enqueueing and claiming jobs
///
/// Claim exclusivity is the driver's job and must come from the platform's
/// own atomic primitive, never from locks held in this process.
#[async_trait]
pub trait QueueBackend: Send + Sync {
    /// Driver name this backend was built from
    fn driver(&self) -> &'static str;

    /// Establish the connection. Idempotent.
    async fn connect(&self) -> QueueResult<()>;

    /// Release the connection without disturbing other users of shared resources
    async fn disconnect(&self) -> QueueResult<()>;

    /// Persist or send a new record with zero attempts, eligible now
    async fn push(&self, job_name: &str, payload: Value, queue: &str) -> QueueResult<JobId>;

    /// Atomically claim the oldest eligible record, if any
    async fn pop(&self, queue: &str) -> QueueResult<Option<BoxedHandle>>;

    /// Number of unclaimed records that are eligible now
    async fn size(&self, queue: &str) -> QueueResult<u64>;

    /// Discard every record of the queue, claimed or not
    async fn clear(&self, queue: &str) -> QueueResult<()>;
}

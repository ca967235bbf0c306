pub mod registry;

pub use registry::{ErasedJob, JobRegistry};

use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::{handle::QueueHandle, HandleState, JobError, JobId, QueueResult};

/// Application-defined job type
///
/// Instances are built from the recorded payload the first time a handle needs
/// them, so the implementing type doubles as the payload schema.
#[async_trait]
pub trait Job: DeserializeOwned + Send + Sync + 'static {
    /// Name recorded on every job record of this type
    const JOB_NAME: &'static str;

    /// Queue used when a dispatch does not pick one
    const QUEUE: Option<&'static str> = None;

    /// Perform the work
    async fn handle(&self, ctx: &JobContext<'_>) -> Result<(), JobError>;

    /// Called once after the job failed terminally
    async fn failed(&self, _error: &JobError) {}

    /// Attempts allowed before the worker stops retrying errors
    fn max_attempts(&self) -> Option<u32> {
        None
    }
}

/// The running job's view of its own handle
pub struct JobContext<'a> {
    handle: &'a dyn QueueHandle,
}

impl<'a> JobContext<'a> {
    pub fn new(handle: &'a dyn QueueHandle) -> Self {
        Self { handle }
    }

    pub fn id(&self) -> &JobId {
        self.handle.id()
    }

    pub fn job_name(&self) -> &str {
        self.handle.job_name()
    }

    pub fn queue(&self) -> &str {
        self.handle.queue()
    }

    pub fn payload(&self) -> &Value {
        self.handle.payload()
    }

    /// Prior delivery attempts of this job
    pub fn attempts(&self) -> u32 {
        self.handle.attempts()
    }

    pub fn state(&self) -> HandleState {
        self.handle.state()
    }

    /// Ask for redelivery after `delay`
    pub async fn release_back(&self, delay: Duration) -> QueueResult<()> {
        self.handle.release_back(delay).await
    }

    /// Alias of [`JobContext::release_back`]
    pub async fn try_again_in(&self, delay: Duration) -> QueueResult<()> {
        self.release_back(delay).await
    }

    /// Stop any further processing of this job
    pub async fn delete(&self) -> QueueResult<()> {
        self.handle.delete().await
    }
}

//! Claimed job handles.
//!
//! A handle wraps exactly one claimed [`JobRecord`] together with whatever the
//! backend needs to acknowledge it. Every backend contributes its own handle
//! type; the shared bookkeeping lives in [`HandleCore`].

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use serde_json::Value;
use tracing::warn;

use crate::{
    job::{ErasedJob, JobContext, JobRegistry},
    HandleState, JobError, JobId, JobRecord, QueueError, QueueResult,
};

/// State shared by every handle implementation
pub struct HandleCore {
    record: JobRecord,
    registry: Arc<JobRegistry>,
    state: Mutex<HandleState>,
    instance: OnceCell<Box<dyn ErasedJob>>,
}

impl HandleCore {
    pub fn new(record: JobRecord, registry: Arc<JobRegistry>) -> Self {
        Self {
            record,
            registry,
            state: Mutex::new(HandleState::default()),
            instance: OnceCell::new(),
        }
    }

    pub fn record(&self) -> &JobRecord {
        &self.record
    }

    pub fn state(&self) -> HandleState {
        *self.state.lock()
    }

    /// Flag the handle deleted; false if it already was
    pub fn mark_deleted(&self) -> bool {
        let mut state = self.state.lock();
        !std::mem::replace(&mut state.deleted, true)
    }

    /// Flag the handle failed; false if it already was
    pub fn mark_failed(&self) -> bool {
        let mut state = self.state.lock();
        !std::mem::replace(&mut state.failed, true)
    }

    /// Flag the handle released
    ///
    /// Releasing after any terminal operation is an error: the claim is gone.
    pub fn mark_released(&self) -> QueueResult<()> {
        let mut state = self.state.lock();
        if state.is_terminal() {
            return Err(QueueError::HandleTerminated(self.record.id.to_string()));
        }
        state.released = true;
        Ok(())
    }

    fn instance(&self) -> Result<&dyn ErasedJob, JobError> {
        self.instance
            .get_or_try_init(|| {
                self.registry
                    .construct(&self.record.job_name, self.record.payload.clone())
            })
            .map(|job| job.as_ref())
    }

    /// Build the job instance once and run its `handle` entry point
    pub async fn fire(&self, handle: &dyn QueueHandle) -> Result<(), JobError> {
        let job = self.instance()?;
        job.handle(&JobContext::new(handle)).await
    }

    /// Run the job's `failed` hook, if an instance can be built
    pub async fn notify_failed(&self, error: &JobError) {
        match self.instance() {
            Ok(job) => job.failed(error).await,
            Err(e) => warn!("No failed hook for job {}: {}", self.record.id, e),
        }
    }

    /// Attempts limit declared by the job, if any
    pub fn max_attempts(&self) -> Option<u32> {
        self.instance().ok().and_then(|job| job.max_attempts())
    }
}

/// A claimed job plus its backend-specific acknowledgement semantics
#[async_trait]
pub trait QueueHandle: Send + Sync {
    fn core(&self) -> &HandleCore;

    fn id(&self) -> &JobId {
        &self.core().record().id
    }

    fn job_name(&self) -> &str {
        &self.core().record().job_name
    }

    fn payload(&self) -> &Value {
        &self.core().record().payload
    }

    fn queue(&self) -> &str {
        &self.core().record().queue
    }

    /// Prior delivery attempts, as reported by the backend
    fn attempts(&self) -> u32 {
        self.core().record().attempts
    }

    fn state(&self) -> HandleState {
        self.core().state()
    }

    fn max_attempts(&self) -> Option<u32> {
        self.core().max_attempts()
    }

    /// Run the job. Only some backends acknowledge as part of this call.
    async fn fire(&self) -> Result<(), JobError>;

    /// Remove the claim and the record for good. Calling twice is fine.
    async fn delete(&self) -> QueueResult<()>;

    /// Make the job eligible again after `delay`, one attempt later
    async fn release_back(&self, delay: Duration) -> QueueResult<()>;

    /// Terminal failure: delete (best effort), then run the job's `failed` hook
    async fn fail(&self, error: &JobError) -> QueueResult<()> {
        if !self.core().mark_failed() {
            return Ok(());
        }

        if let Err(e) = self.delete().await {
            warn!("Failed to delete job {} after failure: {}", self.id(), e);
        }

        self.core().notify_failed(error).await;
        Ok(())
    }
}

/// Downgrade acknowledgement errors to a warning; the backend will redeliver
pub(crate) fn tolerate_ack(job_id: &JobId, operation: &str, result: QueueResult<()>) -> QueueResult<()> {
    match result {
        Err(e) if e.is_acknowledgement() => {
            warn!("Ignoring {} of job {}: {}", operation, job_id, e);
            Ok(())
        }
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Job;
    use chrono::Utc;
    use serde::Deserialize;
    use serde_json::json;

    #[derive(Deserialize)]
    struct CountingJob;

    #[async_trait]
    impl Job for CountingJob {
        const JOB_NAME: &'static str = "counting";

        async fn handle(&self, ctx: &JobContext<'_>) -> Result<(), JobError> {
            assert_eq!(ctx.job_name(), "counting");
            Ok(())
        }
    }

    struct TestHandle {
        core: HandleCore,
    }

    #[async_trait]
    impl QueueHandle for TestHandle {
        fn core(&self) -> &HandleCore {
            &self.core
        }

        async fn fire(&self) -> Result<(), JobError> {
            self.core.fire(self).await
        }

        async fn delete(&self) -> QueueResult<()> {
            self.core.mark_deleted();
            Ok(())
        }

        async fn release_back(&self, _delay: Duration) -> QueueResult<()> {
            self.core.mark_released()
        }
    }

    fn handle(job_name: &str) -> TestHandle {
        let registry = JobRegistry::new().with::<CountingJob>().unwrap();
        let record = JobRecord::new(JobId::new(), job_name, json!(null), "default", Utc::now());
        TestHandle {
            core: HandleCore::new(record, Arc::new(registry)),
        }
    }

    #[tokio::test]
    async fn test_fire_runs_registered_job() {
        let handle = handle("counting");
        handle.fire().await.unwrap();
        assert!(!handle.state().is_terminal());
    }

    #[tokio::test]
    async fn test_fire_unknown_job_is_error() {
        let handle = handle("missing");
        let err = handle.fire().await.unwrap_err();
        assert_eq!(err, JobError::UnknownJob("missing".to_string()));
    }

    #[tokio::test]
    async fn test_fail_marks_failed_and_deleted() {
        let handle = handle("counting");
        handle.fail(&JobError::new("boom")).await.unwrap();
        handle.fail(&JobError::new("boom")).await.unwrap();

        let state = handle.state();
        assert!(state.failed);
        assert!(state.deleted);
    }

    #[tokio::test]
    async fn test_release_after_delete_rejected() {
        let handle = handle("counting");
        handle.delete().await.unwrap();

        let result = handle.release_back(Duration::ZERO).await;
        assert!(matches!(result, Err(QueueError::HandleTerminated(_))));
    }
}

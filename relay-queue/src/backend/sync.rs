use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, warn};

use crate::{
    backend::{BoxedHandle, QueueBackend},
    handle::{HandleCore, QueueHandle},
    Clock, JobError, JobId, JobRecord, JobRegistry, QueueError, QueueResult,
};

/// Runs every pushed job immediately, in the caller's task
///
/// Nothing is persisted, so there is never a backlog to pop, size or clear.
pub struct SyncQueue {
    registry: Arc<JobRegistry>,
    clock: Arc<dyn Clock>,
}

impl SyncQueue {
    pub fn new(registry: Arc<JobRegistry>, clock: Arc<dyn Clock>) -> Self {
        Self { registry, clock }
    }
}

#[async_trait]
impl QueueBackend for SyncQueue {
    fn driver(&self) -> &'static str {
        "sync"
    }

    async fn connect(&self) -> QueueResult<()> {
        Ok(())
    }

    async fn disconnect(&self) -> QueueResult<()> {
        Ok(())
    }

    async fn push(&self, job_name: &str, payload: Value, queue: &str) -> QueueResult<JobId> {
        let id = JobId::new();
        let record = JobRecord::new(id.clone(), job_name, payload, queue, self.clock.now());
        let handle = SyncJobHandle::new(record, self.registry.clone());

        debug!("Running job {} ({}) synchronously", id, job_name);

        if let Err(error) = handle.fire().await {
            handle.fail(&error).await?;
            return Err(QueueError::JobFailed(error));
        }

        Ok(id)
    }

    async fn pop(&self, _queue: &str) -> QueueResult<Option<BoxedHandle>> {
        Ok(None)
    }

    async fn size(&self, _queue: &str) -> QueueResult<u64> {
        Ok(0)
    }

    async fn clear(&self, _queue: &str) -> QueueResult<()> {
        Ok(())
    }
}

/// Handle for a job executed inline by [`SyncQueue`]
pub struct SyncJobHandle {
    core: HandleCore,
}

impl SyncJobHandle {
    pub fn new(record: JobRecord, registry: Arc<JobRegistry>) -> Self {
        Self {
            core: HandleCore::new(record, registry),
        }
    }
}

#[async_trait]
impl QueueHandle for SyncJobHandle {
    fn core(&self) -> &HandleCore {
        &self.core
    }

    async fn fire(&self) -> Result<(), JobError> {
        self.core.fire(self).await?;

        if !self.state().is_terminal() {
            self.delete().await?;
        }
        Ok(())
    }

    async fn delete(&self) -> QueueResult<()> {
        self.core.mark_deleted();
        Ok(())
    }

    async fn release_back(&self, delay: Duration) -> QueueResult<()> {
        self.core.mark_released()?;
        warn!(
            "Job {} asked to be released back in {:?}, but the sync driver keeps no backlog; dropping it",
            self.id(),
            delay
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Job, JobContext, SystemClock};
    use serde::Deserialize;
    use serde_json::json;

    #[derive(Deserialize)]
    struct Flaky {
        fail: bool,
    }

    #[async_trait]
    impl Job for Flaky {
        const JOB_NAME: &'static str = "flaky";

        async fn handle(&self, _ctx: &JobContext<'_>) -> Result<(), JobError> {
            if self.fail {
                Err(JobError::new("flaked"))
            } else {
                Ok(())
            }
        }
    }

    fn queue() -> SyncQueue {
        let registry = JobRegistry::new().with::<Flaky>().unwrap();
        SyncQueue::new(Arc::new(registry), Arc::new(SystemClock))
    }

    #[tokio::test]
    async fn test_push_runs_job_inline() {
        let queue = queue();
        let id = queue.push("flaky", json!({"fail": false}), "default").await;
        assert!(id.is_ok());
        assert_eq!(queue.size("default").await.unwrap(), 0);
        assert!(queue.pop("default").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_push_rethrows_job_error() {
        let queue = queue();
        let result = queue.push("flaky", json!({"fail": true}), "default").await;

        match result {
            Err(QueueError::JobFailed(error)) => assert_eq!(error, JobError::new("flaked")),
            other => panic!("expected JobFailed, got {:?}", other.map(|id| id.to_string())),
        }
    }
}

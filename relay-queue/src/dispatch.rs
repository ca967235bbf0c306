//! Fluent dispatch front-end for job types.
//!
//! ```rust,ignore
//! SendWelcomeEmail { user_id: 42 }
//!     .on_queue(&manager, "emails")
//!     .dispatch(&SendWelcomeEmail { user_id: 42 })
//!     .await?;
//!
//! // or, with every default
//! SendWelcomeEmail { user_id: 42 }.dispatch(&manager).await?;
//! ```

use async_trait::async_trait;
use serde::Serialize;
use tracing::{debug, instrument};

use crate::{Job, JobId, QueueManager, QueueResult};

/// A dispatch whose target is still being chosen
#[must_use = "nothing is enqueued until `dispatch` is awaited"]
pub struct PendingDispatch<'a> {
    manager: &'a QueueManager,
    job_name: &'a str,
    queue: Option<String>,
    connection: Option<String>,
}

impl<'a> PendingDispatch<'a> {
    /// Target the manager's defaults
    pub fn new(manager: &'a QueueManager, job_name: &'a str) -> Self {
        Self {
            manager,
            job_name,
            queue: None,
            connection: None,
        }
    }

    pub fn on_queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = Some(queue.into());
        self
    }

    pub fn on_connection(mut self, connection: impl Into<String>) -> Self {
        self.connection = Some(connection.into());
        self
    }

    pub fn job_name(&self) -> &str {
        self.job_name
    }

    /// Queue the payload will land on
    pub fn target_queue(&self) -> &str {
        self.queue.as_deref().unwrap_or(self.manager.default_queue())
    }

    /// Connection the payload will be pushed through
    pub fn target_connection(&self) -> &str {
        self.connection
            .as_deref()
            .unwrap_or(self.manager.default_connection())
    }

    /// Push the payload, returning the new record's id
    #[instrument(skip(self, payload), fields(job = %self.job_name, queue = %self.target_queue(), connection = %self.target_connection()))]
    pub async fn dispatch<P: Serialize + ?Sized>(self, payload: &P) -> QueueResult<JobId> {
        let payload = serde_json::to_value(payload)?;

        let id = self
            .manager
            .push(
                self.job_name,
                payload,
                Some(self.target_queue()),
                Some(self.target_connection()),
            )
            .await?;

        debug!("Dispatched job {}", id);
        Ok(id)
    }
}

/// Lets a job type enqueue itself
#[async_trait]
pub trait Dispatchable: Job + Serialize {
    /// Start a dispatch with the job's own queue preference
    fn dispatcher(manager: &QueueManager) -> PendingDispatch<'_> {
        let pending = PendingDispatch::new(manager, Self::JOB_NAME);
        match Self::QUEUE {
            Some(queue) => pending.on_queue(queue),
            None => pending,
        }
    }

    fn on_queue(manager: &QueueManager, queue: impl Into<String>) -> PendingDispatch<'_> {
        Self::dispatcher(manager).on_queue(queue)
    }

    fn on_connection(manager: &QueueManager, connection: impl Into<String>) -> PendingDispatch<'_> {
        Self::dispatcher(manager).on_connection(connection)
    }

    /// Enqueue this instance with every default
    async fn dispatch(&self, manager: &QueueManager) -> QueueResult<JobId> {
        Self::dispatcher(manager).dispatch(self).await
    }
}

impl<J: Job + Serialize> Dispatchable for J {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{JobContext, JobError, JobRegistry, QueueConfig};
    use serde::Deserialize;
    use std::sync::Arc;

    #[derive(Serialize, Deserialize)]
    struct Report {
        id: u32,
    }

    #[async_trait]
    impl Job for Report {
        const JOB_NAME: &'static str = "report";
        const QUEUE: Option<&'static str> = Some("reports");

        async fn handle(&self, _ctx: &JobContext<'_>) -> Result<(), JobError> {
            Ok(())
        }
    }

    fn manager() -> QueueManager {
        QueueManager::new(QueueConfig::default(), Arc::new(JobRegistry::new()))
    }

    #[test]
    fn test_defaults_resolve_through_manager() {
        let manager = manager();
        let pending = PendingDispatch::new(&manager, "report");

        assert_eq!(pending.target_queue(), "default");
        assert_eq!(pending.target_connection(), "sync");
    }

    #[test]
    fn test_job_queue_preference_and_override() {
        let manager = manager();

        assert_eq!(Report::dispatcher(&manager).target_queue(), "reports");
        assert_eq!(Report::on_queue(&manager, "urgent").target_queue(), "urgent");
        assert_eq!(
            Report::on_connection(&manager, "broker").target_connection(),
            "broker"
        );
    }

    #[tokio::test]
    async fn test_dispatch_to_unregistered_sync_job_fails() {
        let manager = manager();
        let err = Report { id: 1 }.dispatch(&manager).await.unwrap_err();
        assert!(matches!(err, crate::QueueError::JobFailed(JobError::UnknownJob(_))));
    }
}

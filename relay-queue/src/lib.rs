//! # relay-queue: Backend-agnostic background jobs
//!
//! Enqueue units of work, claim and run them at least once, retry or delete
//! them, and drain in-flight work on shutdown, with the same contract over four
//! structurally different backends:
//!
//! - **database**: a SQLite table claimed with one atomic `UPDATE ... RETURNING`
//! - **broker**: an SQS-like broker with visibility timeouts and receipt handles
//! - **jobserver**: a Faktory-like server speaking push / fetch / ack / fail
//! - **sync**: runs every job inline at push time, nothing is stored
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use relay_queue::prelude::*;
//! use serde::{Deserialize, Serialize};
//! use std::sync::Arc;
//!
//! #[derive(Serialize, Deserialize)]
//! struct SendWelcomeEmail {
//!     user_id: u64,
//! }
//!
//! #[async_trait]
//! impl Job for SendWelcomeEmail {
//!     const JOB_NAME: &'static str = "SendWelcomeEmail";
//!     const QUEUE: Option<&'static str> = Some("emails");
//!
//!     async fn handle(&self, ctx: &JobContext<'_>) -> Result<(), JobError> {
//!         if smtp_is_down() {
//!             ctx.try_again_in(Duration::from_secs(5)).await?;
//!             return Ok(());
//!         }
//!         send(self.user_id).await.map_err(|e| JobError::new(e.to_string()))
//!     }
//! }
//!
//! let registry = Arc::new(JobRegistry::new().with::<SendWelcomeEmail>()?);
//! let manager = Arc::new(QueueManager::new(QueueConfig::from_env()?, registry));
//!
//! SendWelcomeEmail { user_id: 42 }.dispatch(&manager).await?;
//!
//! let worker = Worker::new(manager.clone(), manager.config().worker.clone());
//! tokio::spawn({
//!     let worker = worker.clone();
//!     async move { worker.run().await }
//! });
//! // ...
//! worker.stop().await;
//! ```

pub mod types;
pub mod error;
pub mod config;
pub mod job;
pub mod handle;
pub mod backend;
pub mod manager;
pub mod dispatch;
pub mod worker;
pub mod observability;

pub use types::{Clock, HandleState, JobEvent, JobId, JobRecord, ManualClock, ReceiptHandle, SystemClock};
pub use error::{JobError, QueueError, QueueResult};
pub use config::{ConnectionConfig, QueueConfig, WorkerConfig};
pub use job::{Job, JobContext, JobRegistry};
pub use handle::{HandleCore, QueueHandle};
pub use backend::{BoxedHandle, QueueBackend};
pub use backend::sync::{SyncJobHandle, SyncQueue};
pub use backend::broker::{BrokerJobHandle, BrokerOptions, BrokerQueue, BrokerTransport, MemoryBroker};
pub use backend::jobserver::{
    FaktoryClient, JobServerClient, JobServerJobHandle, JobServerOptions, JobServerQueue, MemoryJobServer,
};
pub use manager::{DriverContext, DriverFactory, QueueManager};
pub use dispatch::{Dispatchable, PendingDispatch};
pub use worker::{StopOutcome, Worker, WorkerState};
pub use observability::{MetricsSnapshot, WorkerMetrics};

#[cfg(feature = "database")]
pub use backend::database::{ClaimReaper, DatabaseJobHandle, DatabaseOptions, DatabaseQueue};

#[cfg(feature = "sqs")]
pub use backend::broker::SqsTransport;

/// Everything a job-defining application usually needs
pub mod prelude {
    pub use crate::{
        Dispatchable, Job, JobContext, JobError, JobId, JobRegistry, QueueConfig, QueueError,
        QueueManager, QueueResult, StopOutcome, Worker,
    };

    pub use async_trait::async_trait;
    pub use std::time::Duration;
}

//! External job-server queue (Faktory-like).
//!
//! The server speaks four verbs: push, fetch, ack and fail. It treats job
//! payloads as opaque, so the attempt count travels in the job's `custom`
//! section and is rewritten by this client on every re-push.

pub mod faktory;
pub mod memory;

pub use faktory::FaktoryClient;
pub use memory::{FailureReport, MemoryJobServer};

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{info, warn};

use crate::{
    backend::{BoxedHandle, QueueBackend},
    handle::{tolerate_ack, HandleCore, QueueHandle},
    types::clock::after,
    Clock, JobError, JobId, JobRecord, JobRegistry, QueueError, QueueResult,
};

/// Client-managed fields carried through the server untouched
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobCustom {
    #[serde(default)]
    pub attempts: u32,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// A job as the server sees it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerJob {
    pub jid: String,
    pub jobtype: String,
    /// The job payload is `args[0]`
    #[serde(default)]
    pub args: Vec<Value>,
    #[serde(default = "default_queue")]
    pub queue: String,
    /// Not eligible before this instant
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub at: Option<DateTime<Utc>>,
    /// Server-side retries; always zero because retries are ours to schedule
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<i64>,
    #[serde(default)]
    pub custom: JobCustom,
}

fn default_queue() -> String {
    "default".to_string()
}

impl ServerJob {
    pub fn new(jobtype: impl Into<String>, payload: Value, queue: impl Into<String>) -> Self {
        Self {
            jid: JobId::new().to_string(),
            jobtype: jobtype.into(),
            args: vec![payload],
            queue: queue.into(),
            at: None,
            retry: Some(0),
            custom: JobCustom::default(),
        }
    }

    pub fn payload(&self) -> Value {
        self.args.first().cloned().unwrap_or(Value::Null)
    }

    /// Same job under a new jid, one attempt later, eligible at `at`
    pub fn next_attempt(&self, at: Option<DateTime<Utc>>) -> Self {
        let mut next = self.clone();
        next.jid = JobId::new().to_string();
        next.at = at;
        next.custom.attempts = self.custom.attempts.saturating_add(1);
        next
    }
}

/// The job-server verbs the queue needs
#[async_trait]
pub trait JobServerClient: Send + Sync {
    async fn connect(&self) -> QueueResult<()>;

    async fn disconnect(&self) -> QueueResult<()>;

    async fn push(&self, job: ServerJob) -> QueueResult<()>;

    /// Reserve the next job from the first non-empty queue, in order
    async fn fetch(&self, queues: &[&str]) -> QueueResult<Option<ServerJob>>;

    /// Fails with [`QueueError::StaleClaim`] when the server no longer holds the reservation
    async fn ack(&self, jid: &str) -> QueueResult<()>;

    async fn fail(&self, jid: &str, errtype: &str, message: &str) -> QueueResult<()>;

    /// Jobs enqueued and ready to fetch; scheduled jobs are not counted
    async fn queue_size(&self, queue: &str) -> QueueResult<u64>;

    async fn clear_queue(&self, queue: &str) -> QueueResult<()>;
}

/// Options of a `jobserver` connection
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct JobServerOptions {
    /// `memory` or `faktory`
    pub transport: String,
    pub address: String,
    /// Reported to the server in the handshake
    pub hostname: Option<String>,
}

impl Default for JobServerOptions {
    fn default() -> Self {
        Self {
            transport: "memory".to_string(),
            address: "127.0.0.1:7419".to_string(),
            hostname: None,
        }
    }
}

impl JobServerOptions {
    pub fn client(&self, clock: Arc<dyn Clock>) -> QueueResult<Arc<dyn JobServerClient>> {
        match self.transport.as_str() {
            "memory" => Ok(Arc::new(MemoryJobServer::new(clock))),
            "faktory" => Ok(Arc::new(FaktoryClient::new(
                self.address.clone(),
                self.hostname.clone(),
            ))),
            other => Err(QueueError::Configuration(format!(
                "unknown job server transport `{}`",
                other
            ))),
        }
    }
}

/// Queue backed by a [`JobServerClient`]
pub struct JobServerQueue {
    client: Arc<dyn JobServerClient>,
    registry: Arc<JobRegistry>,
    clock: Arc<dyn Clock>,
}

impl JobServerQueue {
    pub fn new(client: Arc<dyn JobServerClient>, registry: Arc<JobRegistry>, clock: Arc<dyn Clock>) -> Self {
        Self {
            client,
            registry,
            clock,
        }
    }

    pub fn from_options(
        options: &JobServerOptions,
        registry: Arc<JobRegistry>,
        clock: Arc<dyn Clock>,
    ) -> QueueResult<Self> {
        let client = options.client(clock.clone())?;
        Ok(Self::new(client, registry, clock))
    }

    pub fn client(&self) -> &Arc<dyn JobServerClient> {
        &self.client
    }
}

#[async_trait]
impl QueueBackend for JobServerQueue {
    fn driver(&self) -> &'static str {
        "jobserver"
    }

    async fn connect(&self) -> QueueResult<()> {
        self.client.connect().await?;
        info!("Job server queue connected");
        Ok(())
    }

    async fn disconnect(&self) -> QueueResult<()> {
        self.client.disconnect().await
    }

    async fn push(&self, job_name: &str, payload: Value, queue: &str) -> QueueResult<JobId> {
        let job = ServerJob::new(job_name, payload, queue);
        let jid = JobId::from(job.jid.as_str());
        self.client.push(job).await?;
        Ok(jid)
    }

    async fn pop(&self, queue: &str) -> QueueResult<Option<BoxedHandle>> {
        let Some(job) = self.client.fetch(&[queue]).await? else {
            return Ok(None);
        };

        let now = self.clock.now();
        let record = JobRecord::new(
            JobId::from(job.jid.as_str()),
            job.jobtype.clone(),
            job.payload(),
            job.queue.clone(),
            now,
        )
        .with_attempts(job.custom.attempts)
        .with_not_before(job.at.unwrap_or(now));

        let handle: BoxedHandle = Box::new(JobServerJobHandle {
            core: HandleCore::new(record, self.registry.clone()),
            client: self.client.clone(),
            clock: self.clock.clone(),
            job,
        });
        Ok(Some(handle))
    }

    async fn size(&self, queue: &str) -> QueueResult<u64> {
        self.client.queue_size(queue).await
    }

    async fn clear(&self, queue: &str) -> QueueResult<()> {
        self.client.clear_queue(queue).await
    }
}

/// Handle for a job reserved from the job server
///
/// `fire` acknowledges on success: the server expects an ACK or FAIL for
/// every fetched job before the reservation runs out.
pub struct JobServerJobHandle {
    core: HandleCore,
    client: Arc<dyn JobServerClient>,
    clock: Arc<dyn Clock>,
    job: ServerJob,
}

impl JobServerJobHandle {
    pub fn server_job(&self) -> &ServerJob {
        &self.job
    }
}

#[async_trait]
impl QueueHandle for JobServerJobHandle {
    fn core(&self) -> &HandleCore {
        &self.core
    }

    async fn fire(&self) -> Result<(), JobError> {
        self.core.fire(self).await?;

        // The handler's result stands; a lost ACK only means the server redelivers.
        if !self.state().is_terminal() {
            if let Err(e) = self.delete().await {
                warn!("Failed to acknowledge completed job {}: {}", self.id(), e);
            }
        }
        Ok(())
    }

    async fn delete(&self) -> QueueResult<()> {
        if !self.core.mark_deleted() {
            return Ok(());
        }
        tolerate_ack(self.id(), "ack", self.client.ack(&self.job.jid).await)
    }

    async fn release_back(&self, delay: Duration) -> QueueResult<()> {
        self.core.mark_released()?;

        match self.client.ack(&self.job.jid).await {
            Ok(()) => {}
            Err(e) if e.is_acknowledgement() => {
                // The server will redeliver the original; a re-push would duplicate it.
                warn!("Ignoring release of job {}: {}", self.id(), e);
                return Ok(());
            }
            Err(e) => return Err(e),
        }

        let at = (!delay.is_zero()).then(|| after(self.clock.now(), delay));
        self.client.push(self.job.next_attempt(at)).await
    }

    async fn fail(&self, error: &JobError) -> QueueResult<()> {
        if !self.core.mark_failed() {
            return Ok(());
        }
        // FAIL ends the reservation just like ACK does.
        self.core.mark_deleted();

        if let Err(e) = tolerate_ack(
            self.id(),
            "fail",
            self.client.fail(&self.job.jid, error.kind(), error.message()).await,
        ) {
            warn!("Failed to report failure of job {}: {}", self.id(), e);
        }

        self.core.notify_failed(error).await;
        Ok(())
    }
}

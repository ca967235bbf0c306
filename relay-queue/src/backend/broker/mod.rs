//! Message-broker queue (SQS-like).
//!
//! The broker owns exclusivity: a received message stays invisible to other
//! consumers for the visibility timeout and can only be acknowledged with the
//! receipt handle of that delivery. Attempts come from the broker's approximate
//! receive count, never from the message body.

pub mod memory;
#[cfg(feature = "sqs")]
pub mod sqs;

pub use memory::MemoryBroker;
#[cfg(feature = "sqs")]
pub use sqs::SqsTransport;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, error, info};

use crate::{
    backend::{BoxedHandle, QueueBackend},
    handle::{tolerate_ack, HandleCore, QueueHandle},
    Clock, JobError, JobId, JobRecord, JobRegistry, QueueError, QueueResult, ReceiptHandle,
};

/// One delivery of a message
#[derive(Debug, Clone)]
pub struct BrokerMessage {
    pub message_id: String,
    pub receipt_handle: ReceiptHandle,
    pub body: String,
    /// Deliveries so far, this one included
    pub receive_count: u32,
}

/// The broker operations the queue needs
#[async_trait]
pub trait BrokerTransport: Send + Sync {
    async fn connect(&self) -> QueueResult<()>;

    async fn disconnect(&self) -> QueueResult<()>;

    /// Send a message, returning the broker's message id
    async fn send(&self, queue_url: &str, body: String) -> QueueResult<String>;

    /// Receive at most one visible message and hide it for `visibility_timeout`
    async fn receive(
        &self,
        queue_url: &str,
        visibility_timeout: Duration,
    ) -> QueueResult<Option<BrokerMessage>>;

    /// Fails with [`QueueError::InvalidReceipt`] when the receipt no longer matches a delivery
    async fn delete(&self, queue_url: &str, receipt: &ReceiptHandle) -> QueueResult<()>;

    async fn change_visibility(
        &self,
        queue_url: &str,
        receipt: &ReceiptHandle,
        timeout: Duration,
    ) -> QueueResult<()>;

    /// Messages visible to consumers right now
    async fn approximate_size(&self, queue_url: &str) -> QueueResult<u64>;

    async fn purge(&self, queue_url: &str) -> QueueResult<()>;
}

/// Options of a `broker` connection
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BrokerOptions {
    /// `memory` or `sqs`
    pub transport: String,
    pub queue_url_prefix: String,
    /// Queue used when a push or pop names none
    pub default_queue: Option<String>,
    pub region: Option<String>,
    pub endpoint: Option<String>,
    /// Seconds a received message stays hidden from other consumers
    pub visibility_timeout: u64,
}

impl Default for BrokerOptions {
    fn default() -> Self {
        Self {
            transport: "memory".to_string(),
            queue_url_prefix: String::new(),
            default_queue: None,
            region: None,
            endpoint: None,
            visibility_timeout: 30,
        }
    }
}

impl BrokerOptions {
    /// Build the transport named by `transport`
    pub fn transport(&self, clock: Arc<dyn Clock>) -> QueueResult<Arc<dyn BrokerTransport>> {
        match self.transport.as_str() {
            "memory" => Ok(Arc::new(MemoryBroker::new(clock))),
            #[cfg(feature = "sqs")]
            "sqs" => Ok(Arc::new(SqsTransport::new(
                self.region.clone(),
                self.endpoint.clone(),
            ))),
            #[cfg(not(feature = "sqs"))]
            "sqs" => Err(QueueError::Configuration(
                "the sqs broker transport requires the `sqs` feature".to_string(),
            )),
            other => Err(QueueError::Configuration(format!(
                "unknown broker transport `{}`",
                other
            ))),
        }
    }
}

/// Wire body of a broker message
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Envelope {
    job_class_name: String,
    data: Value,
}

/// Queue on top of a [`BrokerTransport`]
pub struct BrokerQueue {
    transport: Arc<dyn BrokerTransport>,
    options: BrokerOptions,
    registry: Arc<JobRegistry>,
    clock: Arc<dyn Clock>,
}

impl BrokerQueue {
    pub fn new(
        transport: Arc<dyn BrokerTransport>,
        options: BrokerOptions,
        registry: Arc<JobRegistry>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            transport,
            options,
            registry,
            clock,
        }
    }

    pub fn from_options(
        options: BrokerOptions,
        registry: Arc<JobRegistry>,
        clock: Arc<dyn Clock>,
    ) -> QueueResult<Self> {
        let transport = options.transport(clock.clone())?;
        Ok(Self::new(transport, options, registry, clock))
    }

    pub fn transport(&self) -> &Arc<dyn BrokerTransport> {
        &self.transport
    }

    /// Full queue URL for a queue name
    pub fn queue_url(&self, queue: &str) -> QueueResult<String> {
        let queue = match (queue.is_empty(), &self.options.default_queue) {
            (false, _) => queue,
            (true, Some(default)) => default.as_str(),
            (true, None) => {
                return Err(QueueError::Configuration(
                    "no queue given and the broker connection has no default_queue".to_string(),
                ))
            }
        };
        Ok(format!("{}{}", self.options.queue_url_prefix, queue))
    }

    fn visibility_timeout(&self) -> Duration {
        Duration::from_secs(self.options.visibility_timeout)
    }
}

#[async_trait]
impl QueueBackend for BrokerQueue {
    fn driver(&self) -> &'static str {
        "broker"
    }

    async fn connect(&self) -> QueueResult<()> {
        self.transport.connect().await?;
        info!("Broker queue connected (transport: {})", self.options.transport);
        Ok(())
    }

    async fn disconnect(&self) -> QueueResult<()> {
        self.transport.disconnect().await
    }

    async fn push(&self, job_name: &str, payload: Value, queue: &str) -> QueueResult<JobId> {
        let body = serde_json::to_string(&Envelope {
            job_class_name: job_name.to_string(),
            data: payload,
        })?;

        let message_id = self.transport.send(&self.queue_url(queue)?, body).await?;
        Ok(JobId::from(message_id))
    }

    async fn pop(&self, queue: &str) -> QueueResult<Option<BoxedHandle>> {
        let queue_url = self.queue_url(queue)?;

        let Some(message) = self
            .transport
            .receive(&queue_url, self.visibility_timeout())
            .await?
        else {
            return Ok(None);
        };

        let envelope: Envelope = match serde_json::from_str(&message.body) {
            Ok(envelope) => envelope,
            Err(e) => {
                error!("Discarding unreadable message {} from {}: {}", message.message_id, queue_url, e);
                tolerate_ack(
                    &JobId::from(message.message_id.as_str()),
                    "delete",
                    self.transport.delete(&queue_url, &message.receipt_handle).await,
                )?;
                return Ok(None);
            }
        };

        debug!(
            "Received message {} from {} (receive count {})",
            message.message_id, queue_url, message.receive_count
        );

        let record = JobRecord::new(
            JobId::from(message.message_id),
            envelope.job_class_name,
            envelope.data,
            queue,
            self.clock.now(),
        )
        .with_attempts(message.receive_count.saturating_sub(1));

        let handle: BoxedHandle = Box::new(BrokerJobHandle {
            core: HandleCore::new(record, self.registry.clone()),
            transport: self.transport.clone(),
            queue_url,
            receipt: message.receipt_handle,
        });
        Ok(Some(handle))
    }

    async fn size(&self, queue: &str) -> QueueResult<u64> {
        self.transport.approximate_size(&self.queue_url(queue)?).await
    }

    async fn clear(&self, queue: &str) -> QueueResult<()> {
        self.transport.purge(&self.queue_url(queue)?).await
    }
}

/// Handle for one delivery of a broker message
pub struct BrokerJobHandle {
    core: HandleCore,
    transport: Arc<dyn BrokerTransport>,
    queue_url: String,
    receipt: ReceiptHandle,
}

impl BrokerJobHandle {
    pub fn receipt(&self) -> &ReceiptHandle {
        &self.receipt
    }
}

#[async_trait]
impl QueueHandle for BrokerJobHandle {
    fn core(&self) -> &HandleCore {
        &self.core
    }

    async fn fire(&self) -> Result<(), JobError> {
        self.core.fire(self).await
    }

    async fn delete(&self) -> QueueResult<()> {
        if !self.core.mark_deleted() {
            return Ok(());
        }
        tolerate_ack(
            self.id(),
            "delete",
            self.transport.delete(&self.queue_url, &self.receipt).await,
        )
    }

    async fn release_back(&self, delay: Duration) -> QueueResult<()> {
        self.core.mark_released()?;
        tolerate_ack(
            self.id(),
            "release",
            self.transport
                .change_visibility(&self.queue_url, &self.receipt, delay)
                .await,
        )
    }
}

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use uuid::Uuid;

use super::{BrokerMessage, BrokerTransport};
use crate::{types::clock::after, Clock, QueueError, QueueResult, ReceiptHandle};

#[derive(Debug)]
struct StoredMessage {
    message_id: String,
    body: String,
    visible_at: DateTime<Utc>,
    receive_count: u32,
    /// Receipt of the latest delivery; every receive issues a new one
    receipt: Option<ReceiptHandle>,
}

impl StoredMessage {
    fn holds(&self, receipt: &ReceiptHandle) -> bool {
        self.receipt.as_ref() == Some(receipt)
    }
}

/// In-process broker with visibility timeouts and receipt handles
///
/// Queues are keyed by queue URL and created on first use.
pub struct MemoryBroker {
    clock: Arc<dyn Clock>,
    queues: Mutex<HashMap<String, VecDeque<StoredMessage>>>,
    connected: AtomicBool,
}

impl MemoryBroker {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            queues: Mutex::new(HashMap::new()),
            connected: AtomicBool::new(false),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    fn ensure_connected(&self) -> QueueResult<()> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(QueueError::Connection("memory broker is not connected".to_string()))
        }
    }

    fn invalid_receipt(receipt: &ReceiptHandle) -> QueueError {
        QueueError::InvalidReceipt(receipt.to_string())
    }
}

#[async_trait]
impl BrokerTransport for MemoryBroker {
    async fn connect(&self) -> QueueResult<()> {
        self.connected.store(true, Ordering::Release);
        Ok(())
    }

    async fn disconnect(&self) -> QueueResult<()> {
        self.connected.store(false, Ordering::Release);
        Ok(())
    }

    async fn send(&self, queue_url: &str, body: String) -> QueueResult<String> {
        self.ensure_connected()?;

        let message_id = Uuid::new_v4().to_string();
        self.queues
            .lock()
            .entry(queue_url.to_string())
            .or_default()
            .push_back(StoredMessage {
                message_id: message_id.clone(),
                body,
                visible_at: self.clock.now(),
                receive_count: 0,
                receipt: None,
            });

        Ok(message_id)
    }

    async fn receive(
        &self,
        queue_url: &str,
        visibility_timeout: Duration,
    ) -> QueueResult<Option<BrokerMessage>> {
        self.ensure_connected()?;
        let now = self.clock.now();

        let mut queues = self.queues.lock();
        let Some(message) = queues
            .get_mut(queue_url)
            .and_then(|messages| messages.iter_mut().find(|m| m.visible_at <= now))
        else {
            return Ok(None);
        };

        let receipt = ReceiptHandle::new();
        message.receive_count += 1;
        message.visible_at = after(now, visibility_timeout);
        message.receipt = Some(receipt.clone());

        Ok(Some(BrokerMessage {
            message_id: message.message_id.clone(),
            receipt_handle: receipt,
            body: message.body.clone(),
            receive_count: message.receive_count,
        }))
    }

    async fn delete(&self, queue_url: &str, receipt: &ReceiptHandle) -> QueueResult<()> {
        self.ensure_connected()?;

        let mut queues = self.queues.lock();
        let messages = queues
            .get_mut(queue_url)
            .ok_or_else(|| Self::invalid_receipt(receipt))?;
        let position = messages
            .iter()
            .position(|m| m.holds(receipt))
            .ok_or_else(|| Self::invalid_receipt(receipt))?;

        messages.remove(position);
        Ok(())
    }

    async fn change_visibility(
        &self,
        queue_url: &str,
        receipt: &ReceiptHandle,
        timeout: Duration,
    ) -> QueueResult<()> {
        self.ensure_connected()?;
        let now = self.clock.now();

        let mut queues = self.queues.lock();
        let message = queues
            .get_mut(queue_url)
            .and_then(|messages| messages.iter_mut().find(|m| m.holds(receipt)))
            .ok_or_else(|| Self::invalid_receipt(receipt))?;

        message.visible_at = after(now, timeout);
        Ok(())
    }

    async fn approximate_size(&self, queue_url: &str) -> QueueResult<u64> {
        self.ensure_connected()?;
        let now = self.clock.now();

        let queues = self.queues.lock();
        let count = queues.get(queue_url).map_or(0, |messages| {
            messages.iter().filter(|m| m.visible_at <= now).count()
        });

        Ok(count as u64)
    }

    async fn purge(&self, queue_url: &str) -> QueueResult<()> {
        self.ensure_connected()?;
        self.queues.lock().remove(queue_url);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ManualClock;

    async fn broker() -> (MemoryBroker, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new());
        let broker = MemoryBroker::new(clock.clone());
        broker.connect().await.unwrap();
        (broker, clock)
    }

    #[tokio::test]
    async fn test_received_message_hidden_until_visibility_timeout() {
        let (broker, clock) = broker().await;
        broker.send("q", "body".to_string()).await.unwrap();

        let first = broker.receive("q", Duration::from_secs(30)).await.unwrap().unwrap();
        assert_eq!(first.receive_count, 1);
        assert!(broker.receive("q", Duration::from_secs(30)).await.unwrap().is_none());

        clock.advance(Duration::from_secs(30));
        let second = broker.receive("q", Duration::from_secs(30)).await.unwrap().unwrap();
        assert_eq!(second.receive_count, 2);
        assert_eq!(second.message_id, first.message_id);
        assert_ne!(second.receipt_handle, first.receipt_handle);
    }

    #[tokio::test]
    async fn test_superseded_receipt_is_invalid() {
        let (broker, clock) = broker().await;
        broker.send("q", "body".to_string()).await.unwrap();

        let first = broker.receive("q", Duration::from_secs(1)).await.unwrap().unwrap();
        clock.advance(Duration::from_secs(2));
        let second = broker.receive("q", Duration::from_secs(1)).await.unwrap().unwrap();

        let result = broker.delete("q", &first.receipt_handle).await;
        assert!(matches!(result, Err(QueueError::InvalidReceipt(_))));

        broker.delete("q", &second.receipt_handle).await.unwrap();
        assert_eq!(broker.approximate_size("q").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_size_counts_only_visible_messages() {
        let (broker, clock) = broker().await;
        broker.send("q", "a".to_string()).await.unwrap();
        broker.send("q", "b".to_string()).await.unwrap();

        let a = broker.receive("q", Duration::from_secs(30)).await.unwrap().unwrap();
        assert_eq!(broker.approximate_size("q").await.unwrap(), 1);

        broker
            .change_visibility("q", &a.receipt_handle, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(broker.approximate_size("q").await.unwrap(), 1);

        clock.advance(Duration::from_secs(5));
        assert_eq!(broker.approximate_size("q").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_disconnected_broker_refuses_operations() {
        let clock = Arc::new(ManualClock::new());
        let broker = MemoryBroker::new(clock);

        let result = broker.send("q", "body".to_string()).await;
        assert!(matches!(result, Err(e) if e.is_connectivity()));
    }
}

use std::time::Duration;

use async_trait::async_trait;
use aws_config::{BehaviorVersion, Region};
use aws_sdk_sqs::error::{DisplayErrorContext, SdkError};
use aws_sdk_sqs::types::{MessageSystemAttributeName, QueueAttributeName};
use aws_sdk_sqs::Client;
use tokio::sync::OnceCell;
use tracing::{debug, warn};

use super::{BrokerMessage, BrokerTransport};
use crate::{QueueError, QueueResult, ReceiptHandle};

const MAX_VISIBILITY_SECS: u64 = 43_200;

/// Amazon SQS (or any SQS-compatible endpoint)
pub struct SqsTransport {
    region: Option<String>,
    endpoint: Option<String>,
    client: OnceCell<Client>,
}

impl SqsTransport {
    pub fn new(region: Option<String>, endpoint: Option<String>) -> Self {
        Self {
            region,
            endpoint,
            client: OnceCell::new(),
        }
    }

    /// Use an already configured client
    pub fn with_client(client: Client) -> Self {
        Self {
            region: None,
            endpoint: None,
            client: OnceCell::new_with(Some(client)),
        }
    }

    async fn create_client(&self) -> Client {
        let mut loader = aws_config::defaults(BehaviorVersion::latest());
        if let Some(region) = &self.region {
            loader = loader.region(Region::new(region.clone()));
        }
        if let Some(endpoint) = &self.endpoint {
            loader = loader.endpoint_url(endpoint.clone());
        }

        Client::new(&loader.load().await)
    }

    fn client(&self) -> QueueResult<&Client> {
        self.client
            .get()
            .ok_or_else(|| QueueError::Connection("sqs transport is not connected".to_string()))
    }

    /// Whole seconds, capped at the 12 hour SQS visibility limit
    fn visibility_seconds(duration: Duration) -> i32 {
        let secs = duration.as_secs();
        if secs > MAX_VISIBILITY_SECS {
            warn!(
                "Visibility timeout of {}s exceeds the SQS limit; capping at {}s",
                secs, MAX_VISIBILITY_SECS
            );
        }
        i32::try_from(secs.min(MAX_VISIBILITY_SECS)).unwrap_or(i32::MAX)
    }
}

/// Dispatch and timeout failures are connectivity problems; anything else came back from SQS
fn map_sdk_error<E, R>(err: SdkError<E, R>) -> QueueError
where
    E: std::error::Error + 'static,
    R: std::fmt::Debug,
{
    let message = DisplayErrorContext(&err).to_string();
    match err {
        SdkError::DispatchFailure(_) | SdkError::TimeoutError(_) => QueueError::Connection(message),
        _ => QueueError::Protocol(message),
    }
}

#[async_trait]
impl BrokerTransport for SqsTransport {
    async fn connect(&self) -> QueueResult<()> {
        self.client.get_or_init(|| self.create_client()).await;
        Ok(())
    }

    async fn disconnect(&self) -> QueueResult<()> {
        // The SDK client holds no session to close.
        Ok(())
    }

    async fn send(&self, queue_url: &str, body: String) -> QueueResult<String> {
        let output = self
            .client()?
            .send_message()
            .queue_url(queue_url)
            .message_body(body)
            .send()
            .await
            .map_err(map_sdk_error)?;

        output
            .message_id()
            .map(str::to_string)
            .ok_or_else(|| QueueError::Protocol("SendMessage returned no message id".to_string()))
    }

    async fn receive(
        &self,
        queue_url: &str,
        visibility_timeout: Duration,
    ) -> QueueResult<Option<BrokerMessage>> {
        let output = self
            .client()?
            .receive_message()
            .queue_url(queue_url)
            .max_number_of_messages(1)
            .visibility_timeout(Self::visibility_seconds(visibility_timeout))
            .message_system_attribute_names(MessageSystemAttributeName::ApproximateReceiveCount)
            .send()
            .await
            .map_err(map_sdk_error)?;

        let Some(message) = output.messages().first() else {
            return Ok(None);
        };

        let receipt = message
            .receipt_handle()
            .ok_or_else(|| QueueError::Protocol("received message without receipt handle".to_string()))?;

        let receive_count = message
            .attributes()
            .and_then(|attrs| attrs.get(&MessageSystemAttributeName::ApproximateReceiveCount))
            .and_then(|count| count.parse().ok())
            .unwrap_or(1);

        debug!("Received SQS message from {}", queue_url);

        Ok(Some(BrokerMessage {
            message_id: message.message_id().unwrap_or_default().to_string(),
            receipt_handle: ReceiptHandle::from(receipt),
            body: message.body().unwrap_or_default().to_string(),
            receive_count,
        }))
    }

    async fn delete(&self, queue_url: &str, receipt: &ReceiptHandle) -> QueueResult<()> {
        let result = self
            .client()?
            .delete_message()
            .queue_url(queue_url)
            .receipt_handle(receipt.as_str())
            .send()
            .await;

        match result {
            Ok(_) => Ok(()),
            Err(err) => match err.as_service_error() {
                Some(service) if service.is_receipt_handle_is_invalid() => {
                    Err(QueueError::InvalidReceipt(receipt.to_string()))
                }
                _ => Err(map_sdk_error(err)),
            },
        }
    }

    async fn change_visibility(
        &self,
        queue_url: &str,
        receipt: &ReceiptHandle,
        timeout: Duration,
    ) -> QueueResult<()> {
        let result = self
            .client()?
            .change_message_visibility()
            .queue_url(queue_url)
            .receipt_handle(receipt.as_str())
            .visibility_timeout(Self::visibility_seconds(timeout))
            .send()
            .await;

        match result {
            Ok(_) => Ok(()),
            Err(err) => match err.as_service_error() {
                Some(service)
                    if service.is_receipt_handle_is_invalid() || service.is_message_not_inflight() =>
                {
                    Err(QueueError::InvalidReceipt(receipt.to_string()))
                }
                _ => Err(map_sdk_error(err)),
            },
        }
    }

    async fn approximate_size(&self, queue_url: &str) -> QueueResult<u64> {
        let output = self
            .client()?
            .get_queue_attributes()
            .queue_url(queue_url)
            .attribute_names(QueueAttributeName::ApproximateNumberOfMessages)
            .send()
            .await
            .map_err(map_sdk_error)?;

        Ok(output
            .attributes()
            .and_then(|attrs| attrs.get(&QueueAttributeName::ApproximateNumberOfMessages))
            .and_then(|value| value.parse().ok())
            .unwrap_or(0))
    }

    async fn purge(&self, queue_url: &str) -> QueueResult<()> {
        self.client()?
            .purge_queue()
            .queue_url(queue_url)
            .send()
            .await
            .map_err(map_sdk_error)?;
        Ok(())
    }
}

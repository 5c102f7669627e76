use std::time::Duration;

use anyhow::{Context as _, Result};
use aws_sdk_sqs::Client;
use bytes::Bytes;
use tracing::debug;

use keda_connector_core::engine::queue::{QueueDelivery, QueueSource};
use keda_connector_core::SourceMessage;

/// Queue source over SQS: long-poll receive, receipt-handle delete.
pub struct SqsSource {
    client: Client,
    queue_url: String,
}

impl SqsSource {
    pub fn new(client: Client, queue_url: String) -> Self {
        SqsSource { client, queue_url }
    }
}

impl QueueSource for SqsSource {
    type AckToken = String;

    async fn receive(&self, max: usize, wait: Duration) -> Result<Vec<QueueDelivery<String>>> {
        let output = self
            .client
            .receive_message()
            .queue_url(&self.queue_url)
            .max_number_of_messages(max.min(10) as i32)
            .wait_time_seconds(wait.as_secs().min(20) as i32)
            .message_attribute_names("All")
            .send()
            .await
            .context("failed to fetch sqs message")?;

        let deliveries = output
            .messages()
            .iter()
            .filter_map(|message| {
                // a message without a receipt handle cannot be deleted, skip it
                let token = message.receipt_handle()?.to_string();
                let attributes = message
                    .message_attributes()
                    .map(|attributes| {
                        attributes
                            .iter()
                            .filter_map(|(name, value)| {
                                value.string_value().map(|v| (name.clone(), v.to_string()))
                            })
                            .collect()
                    })
                    .unwrap_or_default();
                Some(QueueDelivery {
                    message: SourceMessage {
                        payload: message
                            .body()
                            .map(|body| Bytes::copy_from_slice(body.as_bytes())),
                        key: None,
                        attributes,
                        partition_id: None,
                        sequence: None,
                    },
                    token,
                })
            })
            .collect::<Vec<_>>();
        if !deliveries.is_empty() {
            debug!(count = deliveries.len(), "received messages");
        }
        Ok(deliveries)
    }

    async fn ack(&self, token: String) -> Result<()> {
        self.client
            .delete_message()
            .queue_url(&self.queue_url)
            .receipt_handle(token)
            .send()
            .await
            .context("failed to delete message")?;
        Ok(())
    }
}

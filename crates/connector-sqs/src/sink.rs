use anyhow::{Context as _, Result};
use aws_sdk_sqs::types::MessageAttributeValue;
use aws_sdk_sqs::Client;
use bytes::Bytes;
use http::header::HeaderMap;
use tracing::warn;

use keda_connector_core::{OutboundResponse, Sink, SourceMessage};

/// Publishes responses and error envelopes to SQS sink queues, copying the
/// function's response headers onto the response message as String
/// attributes.
pub struct SqsSink {
    client: Client,
    response_url: Option<String>,
    error_url: Option<String>,
}

impl SqsSink {
    pub fn new(client: Client, response_url: Option<String>, error_url: Option<String>) -> Self {
        SqsSink {
            client,
            response_url,
            error_url,
        }
    }

    async fn send(
        &self,
        queue_url: &str,
        body: String,
        attributes: Vec<(String, MessageAttributeValue)>,
    ) -> Result<()> {
        let mut request = self.client.send_message().queue_url(queue_url).message_body(body);
        for (name, value) in attributes {
            request = request.message_attributes(name, value);
        }
        request
            .send()
            .await
            .with_context(|| format!("failed to send message to queue [{queue_url}]"))?;
        Ok(())
    }
}

impl Sink for SqsSink {
    async fn publish_response(
        &self,
        _inbound: &SourceMessage,
        outbound: &OutboundResponse,
    ) -> Result<()> {
        let queue_url = self
            .response_url
            .as_deref()
            .context("response queue not resolved")?;
        self.send(
            queue_url,
            String::from_utf8_lossy(&outbound.body).into_owned(),
            header_attributes(&outbound.headers),
        )
        .await
    }

    async fn publish_error(&self, _inbound: &SourceMessage, payload: Bytes) -> Result<()> {
        let queue_url = self
            .error_url
            .as_deref()
            .context("error queue not resolved")?;
        self.send(
            queue_url,
            String::from_utf8_lossy(&payload).into_owned(),
            Vec::new(),
        )
        .await
    }
}

/// Convert response HTTP headers to String-typed message attributes,
/// dropping any the queue cannot represent.
fn header_attributes(headers: &HeaderMap) -> Vec<(String, MessageAttributeValue)> {
    headers
        .iter()
        .filter_map(|(name, value)| {
            let Ok(value) = value.to_str() else {
                warn!(name = %name, "dropping non-text response header");
                return None;
            };
            if value.is_empty() {
                return None;
            }
            let attribute = MessageAttributeValue::builder()
                .data_type("String")
                .string_value(value)
                .build();
            match attribute {
                Ok(attribute) => Some((name.as_str().to_string(), attribute)),
                Err(err) => {
                    warn!(name = %name, error = %err, "failed to build message attribute");
                    None
                }
            }
        })
        .collect()
}

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use http::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE};
use tracing::{debug, instrument, warn};

use crate::config::ConnectorMetadata;
use crate::envelope::{ErrorEnvelope, FunctionHttpRequest, FunctionHttpResponse};
use crate::message::SourceMessage;

pub const HEADER_TOPIC: &str = "KEDA-Topic";
pub const HEADER_RESPONSE_TOPIC: &str = "KEDA-Response-Topic";
pub const HEADER_ERROR_TOPIC: &str = "KEDA-Error-Topic";
pub const HEADER_SOURCE_NAME: &str = "KEDA-Source-Name";
/// Carries the record key to the function, and on the return path replaces
/// the outbound message key.
pub const HEADER_MESSAGE_KEY: &str = "KEDA-Message-Key";
/// Marks a tombstone record; `true` with an empty response body requests an
/// explicit null-value publish on the return path.
pub const HEADER_MESSAGE_TOMBSTONE: &str = "KEDA-Message-Tombstone";

/// Status code recorded in the envelope when no response was ever received.
const NO_RESPONSE_STATUS: u16 = 500;

/// A successful (2xx) invocation result.
#[derive(Debug, Clone)]
pub struct InvokeResponse {
    pub status: u16,
    pub headers: HeaderMap,
    pub body: Bytes,
}

/// POSTs message payloads to the configured endpoint with bounded retry.
///
/// The invoker is stateless apart from the shared `reqwest::Client`; one
/// instance serves every worker. An attempt succeeds iff the transport
/// returns a response with a status in `[200, 300)`. Failed attempts retry
/// immediately (pacing is the engine's concern, not the invoker's) and a
/// terminal failure is reported as an [`ErrorEnvelope`] for the error sink.
pub struct HttpInvoker {
    client: reqwest::Client,
    meta: Arc<ConnectorMetadata>,
}

impl HttpInvoker {
    pub fn new(meta: Arc<ConnectorMetadata>) -> Self {
        HttpInvoker {
            client: reqwest::Client::new(),
            meta,
        }
    }

    /// Invoke the endpoint once per message, retrying up to
    /// `max_retries + 1` attempts total.
    #[instrument(level = "debug", skip_all, fields(endpoint = %self.meta.http_endpoint, partition_id = ?msg.partition_id))]
    pub async fn invoke(&self, msg: &SourceMessage) -> Result<InvokeResponse, Box<ErrorEnvelope>> {
        let headers = self.request_headers(msg);
        let body = msg.payload.clone().unwrap_or_default();
        let attempts = self.meta.max_retries.saturating_add(1);

        let mut last_status = None;
        let mut last_body = String::new();
        let mut last_error = String::new();

        for attempt in 0..attempts {
            let sent = self
                .client
                .post(&self.meta.http_endpoint)
                .headers(headers.clone())
                .body(body.clone())
                .send()
                .await;

            let response = match sent {
                Ok(response) => response,
                Err(err) => {
                    warn!(attempt, error = %err, "sending function invocation request failed");
                    last_error = err.to_string();
                    continue;
                }
            };

            let status = response.status().as_u16();
            if (200..300).contains(&status) {
                let headers = response.headers().clone();
                match response.bytes().await {
                    Ok(bytes) => {
                        debug!(attempt, status, "function invocation succeeded");
                        return Ok(InvokeResponse {
                            status,
                            headers,
                            body: bytes,
                        });
                    }
                    Err(err) => {
                        warn!(attempt, error = %err, "failed to read function response body");
                        last_status = Some(status);
                        last_error = err.to_string();
                        continue;
                    }
                }
            }

            warn!(attempt, status, "function invocation returned failure status");
            last_status = Some(status);
            last_body = response.text().await.unwrap_or_default();
            last_error = format!("request returned failure: {status}");
        }

        Err(Box::new(self.envelope(
            msg,
            &headers,
            last_status,
            last_body,
            last_error,
        )))
    }

    /// Assemble the connector headers plus the broker attributes carried on
    /// the message. Attributes that are not representable as HTTP headers
    /// are dropped with a warning rather than failing the invocation.
    fn request_headers(&self, msg: &SourceMessage) -> HeaderMap {
        let mut headers = HeaderMap::new();
        let mut insert = |name: &str, value: &str| match (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            (Ok(name), Ok(value)) => {
                headers.append(name, value);
            }
            _ => warn!(name, "dropping unrepresentable request header"),
        };

        insert(HEADER_TOPIC, &self.meta.topic);
        insert(HEADER_RESPONSE_TOPIC, &self.meta.response_topic);
        insert(HEADER_ERROR_TOPIC, &self.meta.error_topic);
        insert(HEADER_SOURCE_NAME, &self.meta.source_name);
        if let Some(key) = &msg.key {
            insert(HEADER_MESSAGE_KEY, &String::from_utf8_lossy(key));
        }
        if msg.is_tombstone() {
            insert(HEADER_MESSAGE_TOMBSTONE, "true");
        }
        for (name, value) in &msg.attributes {
            insert(name.as_str(), value.as_str());
        }
        // after the attribute passthrough so a broker header cannot shadow it
        if let Ok(content_type) = HeaderValue::from_str(&self.meta.content_type) {
            headers.insert(CONTENT_TYPE, content_type);
        }
        headers
    }

    fn envelope(
        &self,
        msg: &SourceMessage,
        headers: &HeaderMap,
        last_status: Option<u16>,
        last_body: String,
        last_error: String,
    ) -> ErrorEnvelope {
        let mut header_echo: HashMap<String, Vec<String>> = HashMap::new();
        for (name, value) in headers {
            header_echo
                .entry(name.as_str().to_string())
                .or_default()
                .push(String::from_utf8_lossy(value.as_bytes()).into_owned());
        }

        ErrorEnvelope {
            request: FunctionHttpRequest {
                message: msg.payload_string(),
                http_endpoint: self.meta.http_endpoint.clone(),
                headers: header_echo,
            },
            response: FunctionHttpResponse {
                response_body: last_body,
                status_code: last_status.unwrap_or(NO_RESPONSE_STATUS),
                error_string: last_error,
            },
        }
    }
}

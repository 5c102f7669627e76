use core::future::Future;

use std::sync::Arc;

use anyhow::{Context as _, Result};
use bytes::Bytes;
use http::header::HeaderMap;
use tracing::{debug, error};

use crate::config::ConnectorMetadata;
use crate::envelope::ErrorEnvelope;
use crate::invoker::{InvokeResponse, HEADER_MESSAGE_KEY, HEADER_MESSAGE_TOMBSTONE};
use crate::message::SourceMessage;

/// Broker-side publish surface for the response and error sinks.
///
/// Implementations publish to the topics named in [`ConnectorMetadata`] on
/// the same broker the message came from, carrying whatever metadata the
/// broker supports (keys and ordering hints, attributes, headers). The
/// routing policy, including what a publish failure means for
/// acknowledgement, lives in [`SinkRouter`], not here.
pub trait Sink: Send + Sync + 'static {
    fn publish_response(
        &self,
        inbound: &SourceMessage,
        outbound: &OutboundResponse,
    ) -> impl Future<Output = Result<()>> + Send;

    fn publish_error(
        &self,
        inbound: &SourceMessage,
        payload: Bytes,
    ) -> impl Future<Output = Result<()>> + Send;
}

/// A function response ready for the response topic, with the control
/// headers already stripped and applied.
#[derive(Debug, Clone)]
pub struct OutboundResponse {
    pub body: Bytes,
    /// Response headers minus the control headers; brokers that carry
    /// metadata propagate these.
    pub headers: HeaderMap,
    /// Publish key: the inbound record's key unless the function overrode
    /// it via `KEDA-Message-Key`.
    pub key: Option<Bytes>,
    /// Explicit null-value publish requested via `KEDA-Message-Tombstone`.
    pub tombstone: bool,
}

/// Routes invocation outcomes to the configured sink topics.
///
/// An `Err` from either routing method means the publish failed and the
/// inbound message must not be acknowledged (or its checkpoint advanced);
/// the broker will redeliver it.
pub struct SinkRouter<S> {
    sink: S,
    meta: Arc<ConnectorMetadata>,
}

impl<S: Sink> SinkRouter<S> {
    pub fn new(sink: S, meta: Arc<ConnectorMetadata>) -> Self {
        SinkRouter { sink, meta }
    }

    /// Publish a successful response to the response topic, if one is
    /// configured.
    pub async fn route_response(
        &self,
        inbound: &SourceMessage,
        response: InvokeResponse,
    ) -> Result<()> {
        if !self.meta.has_response_topic() {
            debug!("no response topic configured, dropping response");
            return Ok(());
        }
        let outbound = apply_control_headers(inbound, response);
        self.sink
            .publish_response(inbound, &outbound)
            .await
            .map_err(|err| {
                error!(
                    error = %format!("{err:#}"),
                    topic = %self.meta.response_topic,
                    source = %self.meta.source_name,
                    http_endpoint = %self.meta.http_endpoint,
                    "failed to publish response body from http request to topic",
                );
                err
            })
    }

    /// Publish an error envelope to the error topic. With no error topic
    /// configured the envelope is logged and dropped; the message is still
    /// acknowledged.
    pub async fn route_error(
        &self,
        inbound: &SourceMessage,
        envelope: &ErrorEnvelope,
    ) -> Result<()> {
        if !self.meta.has_error_topic() {
            error!(
                error = %envelope.response.error_string,
                source = %self.meta.source_name,
                http_endpoint = %self.meta.http_endpoint,
                "message received to publish to error topic, but no error topic was set",
            );
            return Ok(());
        }
        let payload = serde_json::to_vec(envelope).context("failed to serialize error envelope")?;
        self.sink
            .publish_error(inbound, payload.into())
            .await
            .map_err(|err| {
                error!(
                    error = %format!("{err:#}"),
                    topic = %self.meta.error_topic,
                    source = %self.meta.source_name,
                    "failed to publish message to error topic",
                );
                err
            })
    }
}

/// Strip the control headers from a function response and fold them into
/// publish directives: `KEDA-Message-Key` replaces the outbound key, and
/// `KEDA-Message-Tombstone: true` with an empty body requests an explicit
/// null-value publish.
fn apply_control_headers(inbound: &SourceMessage, response: InvokeResponse) -> OutboundResponse {
    let InvokeResponse {
        mut headers, body, ..
    } = response;

    let key_override = headers
        .remove(HEADER_MESSAGE_KEY)
        .map(|value| Bytes::copy_from_slice(value.as_bytes()));
    let tombstone_requested = headers
        .remove(HEADER_MESSAGE_TOMBSTONE)
        .is_some_and(|value| value.as_bytes().eq_ignore_ascii_case(b"true"));

    OutboundResponse {
        tombstone: tombstone_requested && body.is_empty(),
        key: key_override.or_else(|| inbound.key.clone()),
        headers,
        body,
    }
}

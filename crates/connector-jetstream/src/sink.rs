use std::sync::Arc;

use anyhow::{anyhow, bail, Context as _, Result};
use async_nats::jetstream;
use bytes::Bytes;
use tracing::{info, warn};

use keda_connector_core::{ConnectorMetadata, OutboundResponse, Sink, SourceMessage};

/// Publishes responses and error envelopes to JetStream subjects,
/// propagating the function's response headers as NATS headers.
///
/// Before publishing, the target stream (named by the subject's first
/// dot-segment) must exist; with auto-create enabled a missing stream is
/// added with the segment's subject wildcard, otherwise routing fails.
pub struct JetStreamSink {
    context: jetstream::Context,
    meta: Arc<ConnectorMetadata>,
    auto_create_streams: bool,
}

impl JetStreamSink {
    pub fn new(
        context: jetstream::Context,
        meta: Arc<ConnectorMetadata>,
        auto_create_streams: bool,
    ) -> Self {
        JetStreamSink {
            context,
            meta,
            auto_create_streams,
        }
    }

    async fn ensure_stream(&self, subject: &str) -> Result<()> {
        let stream_name = stream_name_for(subject);
        if self.context.get_stream(stream_name).await.is_ok() {
            return Ok(());
        }
        if !self.auto_create_streams {
            bail!("stream not found: {stream_name}");
        }
        info!(stream_name, subject, "stream not present, creating it");
        self.context
            .create_stream(jetstream::stream::Config {
                name: stream_name.to_string(),
                subjects: vec![format!("{stream_name}.>").into()],
                ..Default::default()
            })
            .await
            .with_context(|| format!("failed to create stream [{stream_name}]"))?;
        Ok(())
    }

    async fn publish(
        &self,
        subject: String,
        headers: Option<async_nats::HeaderMap>,
        payload: Bytes,
    ) -> Result<()> {
        self.ensure_stream(&subject).await?;
        let ack = match headers {
            Some(headers) => self
                .context
                .publish_with_headers(subject.clone(), headers, payload)
                .await,
            None => self.context.publish(subject.clone(), payload).await,
        }
        .map_err(|err| anyhow!("failed to publish to subject [{subject}]: {err}"))?;
        ack.await
            .map_err(|err| anyhow!("publish to subject [{subject}] was not acknowledged: {err}"))?;
        Ok(())
    }
}

impl Sink for JetStreamSink {
    async fn publish_response(
        &self,
        _inbound: &SourceMessage,
        outbound: &OutboundResponse,
    ) -> Result<()> {
        self.publish(
            self.meta.response_topic.clone(),
            nats_headers(&outbound.headers),
            outbound.body.clone(),
        )
        .await
    }

    async fn publish_error(&self, _inbound: &SourceMessage, payload: Bytes) -> Result<()> {
        self.publish(self.meta.error_topic.clone(), None, payload)
            .await
    }
}

/// The stream a subject belongs to is named by its first dot-segment.
pub fn stream_name_for(subject: &str) -> &str {
    subject.split('.').next().unwrap_or(subject)
}

/// Convert response HTTP headers to NATS headers, dropping any value that
/// is not representable as text.
fn nats_headers(headers: &http::HeaderMap) -> Option<async_nats::HeaderMap> {
    if headers.is_empty() {
        return None;
    }
    let mut converted = async_nats::HeaderMap::new();
    for (name, value) in headers {
        match value.to_str() {
            Ok(value) => converted.append(name.as_str(), value),
            Err(_) => warn!(name = %name, "dropping non-text response header"),
        }
    }
    Some(converted)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn stream_name_is_the_first_dot_segment() {
        assert_eq!(stream_name_for("events.orders"), "events");
        assert_eq!(stream_name_for("events"), "events");
        assert_eq!(stream_name_for("a.b.c"), "a");
    }

    #[test]
    fn header_conversion_drops_non_text_values() {
        let mut headers = http::HeaderMap::new();
        headers.insert("x-ok", http::header::HeaderValue::from_static("fine"));
        headers.insert(
            "x-bad",
            http::header::HeaderValue::from_bytes(b"\xff\xfe").unwrap(),
        );
        let converted = nats_headers(&headers).unwrap();
        assert_eq!(converted.get("x-ok").map(|v| v.as_str()), Some("fine"));
        assert!(converted.get("x-bad").is_none());
    }

    #[test]
    fn empty_headers_convert_to_none() {
        assert!(nats_headers(&http::HeaderMap::new()).is_none());
    }
}

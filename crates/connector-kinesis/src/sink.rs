use std::sync::Arc;

use anyhow::{Context as _, Result};
use aws_sdk_kinesis::primitives::Blob;
use aws_sdk_kinesis::Client;
use bytes::Bytes;

use keda_connector_core::{ConnectorMetadata, OutboundResponse, Sink, SourceMessage};

/// Publishes responses and error envelopes as Kinesis records, carrying the
/// inbound record's partition key and its sequence number as the ordering
/// hint.
pub struct KinesisSink {
    client: Client,
    meta: Arc<ConnectorMetadata>,
}

impl KinesisSink {
    pub fn new(client: Client, meta: Arc<ConnectorMetadata>) -> Self {
        KinesisSink { client, meta }
    }

    async fn put_record(
        &self,
        stream_name: &str,
        inbound: &SourceMessage,
        partition_key: String,
        data: Blob,
    ) -> Result<()> {
        let mut request = self
            .client
            .put_record()
            .stream_name(stream_name)
            .partition_key(partition_key)
            .data(data);
        if let Some(sequence) = &inbound.sequence {
            request = request.sequence_number_for_ordering(sequence);
        }
        request
            .send()
            .await
            .with_context(|| format!("failed to put record to stream [{stream_name}]"))?;
        Ok(())
    }
}

impl Sink for KinesisSink {
    async fn publish_response(
        &self,
        inbound: &SourceMessage,
        outbound: &OutboundResponse,
    ) -> Result<()> {
        // an explicit tombstone publish carries no data
        let data = if outbound.tombstone {
            Blob::new(Vec::new())
        } else {
            Blob::new(outbound.body.to_vec())
        };
        self.put_record(
            &self.meta.response_topic,
            inbound,
            partition_key(outbound.key.as_ref(), inbound),
            data,
        )
        .await
    }

    async fn publish_error(&self, inbound: &SourceMessage, payload: Bytes) -> Result<()> {
        self.put_record(
            &self.meta.error_topic,
            inbound,
            partition_key(inbound.key.as_ref(), inbound),
            Blob::new(payload.to_vec()),
        )
        .await
    }
}

/// Kinesis requires a partition key on every put; fall back to the shard id
/// for the rare record without one.
fn partition_key(key: Option<&Bytes>, inbound: &SourceMessage) -> String {
    match key {
        Some(key) => String::from_utf8_lossy(key).into_owned(),
        None => inbound.partition_id.clone().unwrap_or_default(),
    }
}

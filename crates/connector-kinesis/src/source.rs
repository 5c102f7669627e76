use std::collections::HashMap;

use anyhow::{Context as _, Result};
use aws_sdk_kinesis::types::ShardIteratorType;
use aws_sdk_kinesis::Client;
use bytes::Bytes;
use tracing::debug;

use keda_connector_core::engine::partitioned::{PartitionSource, PullBatch};
use keda_connector_core::SourceMessage;

/// Partitioned-log source over a Kinesis stream: shards are partitions,
/// sequence numbers are cursors, shard iterators are the pull handles.
pub struct KinesisSource {
    client: Client,
    stream_name: String,
}

impl KinesisSource {
    pub fn new(client: Client, stream_name: String) -> Self {
        KinesisSource {
            client,
            stream_name,
        }
    }
}

impl PartitionSource for KinesisSource {
    type Iterator = String;

    async fn discover_partitions(&self) -> Result<Vec<String>> {
        let output = self
            .client
            .describe_stream()
            .stream_name(&self.stream_name)
            .send()
            .await
            .context("failed to describe stream")?;
        let description = output
            .stream_description()
            .context("describe stream returned no description")?;
        Ok(description
            .shards()
            .iter()
            .map(|shard| shard.shard_id().to_string())
            .collect())
    }

    async fn open_iterator(
        &self,
        partition_id: &str,
        cursor: Option<&str>,
    ) -> Result<Option<String>> {
        let request = self
            .client
            .get_shard_iterator()
            .stream_name(&self.stream_name)
            .shard_id(partition_id);
        // resume strictly after the checkpoint, or start at the oldest
        // retained record
        let request = match cursor {
            Some(sequence) => request
                .shard_iterator_type(ShardIteratorType::AfterSequenceNumber)
                .starting_sequence_number(sequence),
            None => request.shard_iterator_type(ShardIteratorType::TrimHorizon),
        };
        let output = request
            .send()
            .await
            .context("failed to get shard iterator")?;
        Ok(output.shard_iterator().map(str::to_string))
    }

    async fn pull(
        &self,
        partition_id: &str,
        iterator: String,
        limit: usize,
    ) -> Result<PullBatch<String>> {
        let output = self
            .client
            .get_records()
            .shard_iterator(&iterator)
            .limit(limit as i32)
            .send()
            .await
            .context("failed to get records")?;

        let records = output
            .records()
            .iter()
            .map(|record| SourceMessage {
                payload: Some(Bytes::copy_from_slice(record.data().as_ref())),
                key: Some(Bytes::copy_from_slice(record.partition_key().as_bytes())),
                attributes: HashMap::new(),
                partition_id: Some(partition_id.to_string()),
                sequence: Some(record.sequence_number().to_string()),
            })
            .collect();

        if let Some(millis) = output.millis_behind_latest() {
            debug!(partition_id, millis_behind_latest = millis, "pulled records");
        }

        let next = advance_iterator(output.next_shard_iterator(), &iterator);
        Ok(PullBatch { records, next })
    }
}

/// A shard is closed when the broker hands back no next iterator, or hands
/// back the one we just used. Iterators are compared by value.
fn advance_iterator(next: Option<&str>, current: &str) -> Option<String> {
    next.filter(|next| *next != current).map(str::to_string)
}

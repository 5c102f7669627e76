use std::collections::HashMap;

use anyhow::{anyhow, Result};
use async_nats::jetstream;

use keda_connector_core::engine::subscription::Acker;
use keda_connector_core::SourceMessage;

/// Acknowledgement handle for one JetStream delivery. Dropping it without
/// acking leaves the message to redeliver after the consumer's ack wait.
pub struct JetStreamAcker(jetstream::Message);

impl Acker for JetStreamAcker {
    async fn ack(self) -> Result<()> {
        self.0
            .ack()
            .await
            .map_err(|err| anyhow!("failed to ack message: {err}"))
    }
}

/// Split a delivered message into the engine's message envelope and its
/// acknowledgement handle.
pub fn into_delivery(message: jetstream::Message) -> (SourceMessage, JetStreamAcker) {
    let mut attributes = HashMap::new();
    if let Some(headers) = &message.headers {
        for (name, values) in headers.iter() {
            let value = values
                .iter()
                .map(|value| value.as_str())
                .collect::<Vec<_>>()
                .join(",");
            attributes.insert(name.to_string(), value);
        }
    }
    let sequence = message
        .info()
        .ok()
        .map(|info| info.stream_sequence.to_string());

    let source_message = SourceMessage {
        payload: Some(message.payload.clone()),
        key: None,
        attributes,
        partition_id: None,
        sequence,
    };
    (source_message, JetStreamAcker(message))
}

//! AWS Kinesis HTTP connector.
//!
//! Shards are discovered on a fixed cadence and each one gets its own
//! worker; records flow through the shared invoke-route-checkpoint loop in
//! `keda-connector-core`, and responses go back out as Kinesis records on
//! the configured sink streams.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use aws_sdk_kinesis::types::StreamStatus;
use aws_sdk_kinesis::Client;
use tracing::{debug, info};

use keda_connector_aws::AwsSettings;
use keda_connector_core::engine::partitioned::PartitionEngine;
use keda_connector_core::{
    ConnectorMetadata, ConnectorState, HttpInvoker, Lifecycle, SinkRouter,
};

mod sink;
mod source;

pub use sink::KinesisSink;
pub use source::KinesisSource;

/// How long startup waits for the source stream to become ACTIVE.
const SOURCE_CONFIRM_BUDGET: Duration = Duration::from_secs(300);
const SOURCE_CONFIRM_POLL: Duration = Duration::from_secs(5);

pub async fn run() -> Result<()> {
    let meta = Arc::new(ConnectorMetadata::from_env()?);
    let settings = AwsSettings::from_env()?;
    let sdk_config = settings.load().await;
    let client = Client::new(&sdk_config);

    wait_until_stream_active(&client, &meta.topic, SOURCE_CONFIRM_BUDGET).await?;

    let lifecycle = Lifecycle::new();
    Arc::clone(&lifecycle).listen_for_signals();

    let invoker = Arc::new(HttpInvoker::new(Arc::clone(&meta)));
    let router = Arc::new(SinkRouter::new(
        KinesisSink::new(client.clone(), Arc::clone(&meta)),
        Arc::clone(&meta),
    ));
    let source = Arc::new(KinesisSource::new(client, meta.topic.clone()));
    let engine = PartitionEngine::new(source, invoker, router);

    lifecycle.advance(ConnectorState::Running);
    info!(topic = %meta.topic, source = %meta.source_name, "kinesis connector running");
    engine.run(lifecycle.token()).await?;

    lifecycle.advance(ConnectorState::Closed);
    info!("kinesis connector shut down");
    Ok(())
}

/// Poll DescribeStream until the stream reports ACTIVE, within the budget.
async fn wait_until_stream_active(client: &Client, stream_name: &str, budget: Duration) -> Result<()> {
    let deadline = tokio::time::Instant::now() + budget;
    loop {
        match client
            .describe_stream()
            .stream_name(stream_name)
            .send()
            .await
        {
            Ok(output) => {
                if output
                    .stream_description()
                    .is_some_and(|description| {
                        matches!(description.stream_status(), StreamStatus::Active)
                    })
                {
                    return Ok(());
                }
                debug!(stream_name, "stream exists but is not active yet");
            }
            Err(err) => {
                debug!(stream_name, error = %err, "stream not reachable yet");
            }
        }
        if tokio::time::Instant::now() + SOURCE_CONFIRM_POLL > deadline {
            bail!("not able to connect to kinesis stream [{stream_name}]");
        }
        tokio::time::sleep(SOURCE_CONFIRM_POLL).await;
    }
}

//! NATS JetStream HTTP connector.
//!
//! A durable pull consumer feeds the subscription engine; each message is
//! POSTed to the downstream endpoint once, the outcome is routed to the
//! sink subjects, and the message is acked. Unacked messages redeliver
//! after the consumer's ack wait.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context as _, Result};
use async_nats::jetstream;
use async_nats::jetstream::consumer::pull;
use async_nats::jetstream::consumer::AckPolicy;
use futures::StreamExt as _;
use tracing::{debug, info};

use keda_connector_core::engine::subscription::{Delivery, SubscriptionEngine};
use keda_connector_core::{
    ConnectorMetadata, ConnectorState, HttpInvoker, Lifecycle, SinkRouter,
};

mod config;
mod sink;
mod source;

pub use config::JetStreamSettings;
pub use sink::{stream_name_for, JetStreamSink};
pub use source::{into_delivery, JetStreamAcker};

/// How long startup waits for the source stream to appear.
const SOURCE_CONFIRM_BUDGET: Duration = Duration::from_secs(300);
const SOURCE_CONFIRM_POLL: Duration = Duration::from_secs(5);

pub async fn run() -> Result<()> {
    let meta = Arc::new(ConnectorMetadata::from_env()?);
    let settings = JetStreamSettings::from_env()?;

    let client = async_nats::ConnectOptions::new()
        .name("jetstream-http-connector")
        .connect(settings.server.as_str())
        .await
        .with_context(|| format!("failed to connect to nats server [{}]", settings.server))?;
    let context = jetstream::new(client);

    let stream = wait_for_stream(&context, &meta.topic, SOURCE_CONFIRM_BUDGET).await?;
    validate_sink_streams(&context, &meta, settings.auto_create_streams).await?;

    let consumer = stream
        .get_or_create_consumer(
            &settings.durable,
            pull::Config {
                durable_name: Some(settings.durable.clone()),
                ack_policy: AckPolicy::Explicit,
                ack_wait: settings.ack_wait,
                ..Default::default()
            },
        )
        .await
        .with_context(|| format!("failed to create durable consumer [{}]", settings.durable))?;

    let lifecycle = Lifecycle::new();
    Arc::clone(&lifecycle).listen_for_signals();

    let invoker = Arc::new(HttpInvoker::new(Arc::clone(&meta)));
    let router = Arc::new(SinkRouter::new(
        JetStreamSink::new(context.clone(), Arc::clone(&meta), settings.auto_create_streams),
        Arc::clone(&meta),
    ));
    let engine = SubscriptionEngine::new(invoker, router).with_concurrent(settings.concurrent);

    let messages = consumer
        .stream()
        .max_messages_per_batch(settings.pull_batch)
        .messages()
        .await
        .context("failed to start consuming messages")?;
    let deliveries = messages
        .map(|item| {
            item.map(|message| {
                let (message, acker) = into_delivery(message);
                Delivery { message, acker }
            })
            .map_err(|err| anyhow!("subscription delivery failed: {err}"))
        })
        .boxed();

    lifecycle.advance(ConnectorState::Running);
    info!(topic = %meta.topic, source = %meta.source_name, "jetstream connector running");
    engine.run(deliveries, lifecycle.token()).await?;

    if !lifecycle.token().is_cancelled() {
        bail!("jetstream subscription closed unexpectedly");
    }
    lifecycle.advance(ConnectorState::Closed);
    info!("jetstream connector shut down");
    Ok(())
}

/// Poll for the stream backing the source topic, within the budget.
async fn wait_for_stream(
    context: &jetstream::Context,
    topic: &str,
    budget: Duration,
) -> Result<jetstream::stream::Stream> {
    let stream_name = stream_name_for(topic);
    let deadline = tokio::time::Instant::now() + budget;
    loop {
        match context.get_stream(stream_name).await {
            Ok(stream) => return Ok(stream),
            Err(err) => debug!(stream_name, error = %err, "stream not reachable yet"),
        }
        if tokio::time::Instant::now() + SOURCE_CONFIRM_POLL > deadline {
            bail!("stream not found: {stream_name}");
        }
        tokio::time::sleep(SOURCE_CONFIRM_POLL).await;
    }
}

/// Without auto-create, the streams behind the configured sink subjects
/// must already exist; failing at startup beats failing on the first
/// routed message.
async fn validate_sink_streams(
    context: &jetstream::Context,
    meta: &ConnectorMetadata,
    auto_create_streams: bool,
) -> Result<()> {
    if auto_create_streams {
        return Ok(());
    }
    for topic in [&meta.response_topic, &meta.error_topic] {
        if topic.is_empty() {
            continue;
        }
        let stream_name = stream_name_for(topic);
        context
            .get_stream(stream_name)
            .await
            .map_err(|err| anyhow!("stream not found: {stream_name}: {err}"))?;
    }
    Ok(())
}

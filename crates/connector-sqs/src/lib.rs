//! AWS SQS HTTP connector.
//!
//! One long-poll receive loop feeds a worker pool bounded by
//! `MAX_INFLIGHT`; each message is POSTed to the downstream endpoint once,
//! the outcome is routed to the sink queues, and the message is deleted by
//! receipt handle. There is no ordering guarantee; SQS does not offer one.

use std::env;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context as _, Result};
use aws_sdk_sqs::Client;
use tracing::{debug, info};

use keda_connector_aws::AwsSettings;
use keda_connector_core::engine::queue::{QueueEngine, DEFAULT_MAX_INFLIGHT};
use keda_connector_core::{
    ConnectorMetadata, ConnectorState, HttpInvoker, Lifecycle, SinkRouter,
};

mod sink;
mod source;

pub use sink::SqsSink;
pub use source::SqsSource;

const MAX_INFLIGHT_VAR: &str = "MAX_INFLIGHT";

/// How long startup waits for the source queue to become resolvable.
const SOURCE_CONFIRM_BUDGET: Duration = Duration::from_secs(300);
const SOURCE_CONFIRM_POLL: Duration = Duration::from_secs(5);

pub async fn run() -> Result<()> {
    let meta = Arc::new(ConnectorMetadata::from_env()?);
    let max_inflight = max_inflight_from_env()?;
    let settings = AwsSettings::from_env()?;
    let client = Client::new(&settings.load().await);

    let queue_url = wait_for_queue(&client, &meta.topic, SOURCE_CONFIRM_BUDGET).await?;
    let response_url = match meta.has_response_topic() {
        true => Some(resolve_queue_url(&client, &meta.response_topic).await?),
        false => None,
    };
    let error_url = match meta.has_error_topic() {
        true => Some(resolve_queue_url(&client, &meta.error_topic).await?),
        false => None,
    };

    let lifecycle = Lifecycle::new();
    Arc::clone(&lifecycle).listen_for_signals();

    let invoker = Arc::new(HttpInvoker::new(Arc::clone(&meta)));
    let router = Arc::new(SinkRouter::new(
        SqsSink::new(client.clone(), response_url, error_url),
        Arc::clone(&meta),
    ));
    let source = Arc::new(SqsSource::new(client, queue_url));
    let engine = QueueEngine::new(source, invoker, router).with_max_inflight(max_inflight);

    lifecycle.advance(ConnectorState::Running);
    info!(topic = %meta.topic, source = %meta.source_name, "sqs connector running");
    engine.run(lifecycle.token()).await?;

    lifecycle.advance(ConnectorState::Closed);
    info!("sqs connector shut down");
    Ok(())
}

/// Worker pool size, `MAX_INFLIGHT` (default 10).
fn max_inflight_from_env() -> Result<usize> {
    match env::var(MAX_INFLIGHT_VAR) {
        Ok(raw) if !raw.is_empty() => {
            let parsed = raw
                .trim()
                .parse::<usize>()
                .context("failed to parse value from MAX_INFLIGHT environment variable")?;
            if parsed == 0 {
                bail!("MAX_INFLIGHT must be at least 1");
            }
            Ok(parsed)
        }
        _ => Ok(DEFAULT_MAX_INFLIGHT),
    }
}

async fn resolve_queue_url(client: &Client, queue_name: &str) -> Result<String> {
    let output = client
        .get_queue_url()
        .queue_name(queue_name)
        .send()
        .await
        .with_context(|| format!("failed to resolve queue url for [{queue_name}]"))?;
    output
        .queue_url()
        .map(str::to_string)
        .with_context(|| format!("queue [{queue_name}] has no url"))
}

/// Poll GetQueueUrl until the source queue resolves, within the budget.
async fn wait_for_queue(client: &Client, queue_name: &str, budget: Duration) -> Result<String> {
    let deadline = tokio::time::Instant::now() + budget;
    loop {
        match resolve_queue_url(client, queue_name).await {
            Ok(url) => return Ok(url),
            Err(err) => debug!(queue_name, error = %format!("{err:#}"), "queue not reachable yet"),
        }
        if tokio::time::Instant::now() + SOURCE_CONFIRM_POLL > deadline {
            bail!("not able to connect to sqs queue [{queue_name}]");
        }
        tokio::time::sleep(SOURCE_CONFIRM_POLL).await;
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    #[serial_test::serial]
    fn max_inflight_defaults() {
        env::remove_var(MAX_INFLIGHT_VAR);
        assert_eq!(max_inflight_from_env().unwrap(), DEFAULT_MAX_INFLIGHT);
    }

    #[test]
    #[serial_test::serial]
    fn max_inflight_parses_and_validates() {
        env::set_var(MAX_INFLIGHT_VAR, "4");
        assert_eq!(max_inflight_from_env().unwrap(), 4);

        env::set_var(MAX_INFLIGHT_VAR, "0");
        assert!(max_inflight_from_env().is_err());

        env::set_var(MAX_INFLIGHT_VAR, "many");
        assert!(max_inflight_from_env().is_err());

        env::remove_var(MAX_INFLIGHT_VAR);
    }
}

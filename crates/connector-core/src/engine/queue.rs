use core::future::Future;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context as _, Result};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::invoker::HttpInvoker;
use crate::message::SourceMessage;
use crate::router::{Sink, SinkRouter};

pub const DEFAULT_MAX_INFLIGHT: usize = 10;
/// Broker-imposed ceiling on a single receive.
pub const DEFAULT_RECEIVE_BATCH: usize = 10;
/// Broker-imposed ceiling on the long-poll wait.
pub const DEFAULT_WAIT: Duration = Duration::from_secs(20);

/// Pause before retrying after a failed receive, so a broken broker
/// connection does not turn the loop hot.
const RECEIVE_RETRY_DELAY: Duration = Duration::from_secs(1);

/// One received message plus whatever the driver needs to delete it.
pub struct QueueDelivery<T> {
    pub message: SourceMessage,
    pub token: T,
}

/// Capability surface of a queue broker: long-poll receive plus
/// receipt-handle delete. No partitions, no ordering.
pub trait QueueSource: Send + Sync + 'static {
    type AckToken: Send + 'static;

    fn receive(
        &self,
        max: usize,
        wait: Duration,
    ) -> impl Future<Output = Result<Vec<QueueDelivery<Self::AckToken>>>> + Send;

    /// Delete a message. Failure is tolerable; the broker redelivers after
    /// the visibility timeout.
    fn ack(&self, token: Self::AckToken) -> impl Future<Output = Result<()>> + Send;
}

/// Dispatch engine for queue brokers: a receive loop feeding a worker pool
/// bounded by a semaphore of `max_inflight` permits. The semaphore is the
/// sole backpressure mechanism; the loop cannot outrun acknowledgement by
/// more than the permit count.
pub struct QueueEngine<Q, S> {
    source: Arc<Q>,
    invoker: Arc<HttpInvoker>,
    router: Arc<SinkRouter<S>>,
    max_inflight: usize,
    receive_batch: usize,
    wait: Duration,
}

impl<Q: QueueSource, S: Sink> QueueEngine<Q, S> {
    pub fn new(source: Arc<Q>, invoker: Arc<HttpInvoker>, router: Arc<SinkRouter<S>>) -> Self {
        QueueEngine {
            source,
            invoker,
            router,
            max_inflight: DEFAULT_MAX_INFLIGHT,
            receive_batch: DEFAULT_RECEIVE_BATCH,
            wait: DEFAULT_WAIT,
        }
    }

    pub fn with_max_inflight(mut self, max_inflight: usize) -> Self {
        self.max_inflight = max_inflight.max(1);
        self
    }

    pub fn with_receive(mut self, batch: usize, wait: Duration) -> Self {
        self.receive_batch = batch.clamp(1, DEFAULT_RECEIVE_BATCH);
        self.wait = wait.min(DEFAULT_WAIT);
        self
    }

    /// Receive and dispatch until cancellation, then drain in-flight work.
    pub async fn run(&self, token: CancellationToken) -> Result<()> {
        let semaphore = Arc::new(Semaphore::new(self.max_inflight));
        let mut inflight = JoinSet::new();

        'receive: loop {
            // reap completed workers so the set does not grow unbounded
            while inflight.try_join_next().is_some() {}

            let batch = tokio::select! {
                _ = token.cancelled() => break 'receive,
                received = self.source.receive(self.receive_batch, self.wait) => match received {
                    Ok(batch) => batch,
                    Err(err) => {
                        warn!(error = %format!("{err:#}"), "failed to receive messages");
                        tokio::select! {
                            _ = token.cancelled() => break 'receive,
                            _ = tokio::time::sleep(RECEIVE_RETRY_DELAY) => continue 'receive,
                        }
                    }
                },
            };

            for delivery in batch {
                let permit = tokio::select! {
                    _ = token.cancelled() => break 'receive,
                    permit = Arc::clone(&semaphore).acquire_owned() => {
                        permit.context("worker semaphore closed")?
                    }
                };
                let source = Arc::clone(&self.source);
                let invoker = Arc::clone(&self.invoker);
                let router = Arc::clone(&self.router);
                inflight.spawn(async move {
                    process(source, invoker, router, delivery).await;
                    drop(permit);
                });
            }
        }

        debug!("queue engine draining in-flight messages");
        while let Some(joined) = inflight.join_next().await {
            if let Err(err) = joined {
                error!(error = %err, "queue worker task failed");
            }
        }
        Ok(())
    }
}

/// Invoke, route, then delete. A routing failure leaves the message
/// unacknowledged for the broker to redeliver.
async fn process<Q: QueueSource, S: Sink>(
    source: Arc<Q>,
    invoker: Arc<HttpInvoker>,
    router: Arc<SinkRouter<S>>,
    delivery: QueueDelivery<Q::AckToken>,
) {
    let QueueDelivery { message, token } = delivery;
    let routed = match invoker.invoke(&message).await {
        Ok(response) => router.route_response(&message, response).await,
        Err(envelope) => router.route_error(&message, &envelope).await,
    };
    match routed {
        Ok(()) => {
            if let Err(err) = source.ack(token).await {
                warn!(error = %format!("{err:#}"), "failed to ack message, broker will redeliver");
            }
        }
        Err(_) => {
            warn!("routing failed, message left for redelivery");
        }
    }
}

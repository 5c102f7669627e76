use core::future::Future;

use std::sync::Arc;

use anyhow::{Context as _, Result};
use futures::{Stream, StreamExt as _};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::invoker::HttpInvoker;
use crate::message::SourceMessage;
use crate::router::{Sink, SinkRouter};

pub const DEFAULT_CONCURRENT: usize = 1;

/// Confirms one delivery back to the broker. Consumed on use; an abandoned
/// acker leaves the message to redeliver after the ack wait.
pub trait Acker: Send + 'static {
    fn ack(self) -> impl Future<Output = Result<()>> + Send;
}

/// One message from a durable subscription plus its acknowledgement handle.
pub struct Delivery<A> {
    pub message: SourceMessage,
    pub acker: A,
}

/// Dispatch engine for stream-subscription brokers.
///
/// Deliveries arrive as a stream (the driver decides whether it is fed by
/// a pull-fetch loop or a push callback) and each dispatch is gated by a
/// semaphore of `concurrent` permits. With `concurrent == 1` messages are
/// processed strictly in delivery order.
pub struct SubscriptionEngine<S> {
    invoker: Arc<HttpInvoker>,
    router: Arc<SinkRouter<S>>,
    concurrent: usize,
}

impl<S: Sink> SubscriptionEngine<S> {
    pub fn new(invoker: Arc<HttpInvoker>, router: Arc<SinkRouter<S>>) -> Self {
        SubscriptionEngine {
            invoker,
            router,
            concurrent: DEFAULT_CONCURRENT,
        }
    }

    pub fn with_concurrent(mut self, concurrent: usize) -> Self {
        self.concurrent = concurrent.max(1);
        self
    }

    /// Dispatch deliveries until the subscription closes or cancellation,
    /// then drain. Returns `Ok(())` in both cases; the caller decides
    /// whether an early subscription close is fatal.
    pub async fn run<A, St>(&self, mut deliveries: St, token: CancellationToken) -> Result<()>
    where
        A: Acker,
        St: Stream<Item = Result<Delivery<A>>> + Send + Unpin,
    {
        let semaphore = Arc::new(Semaphore::new(self.concurrent));
        let mut inflight = JoinSet::new();

        loop {
            while inflight.try_join_next().is_some() {}

            let next = tokio::select! {
                _ = token.cancelled() => break,
                next = deliveries.next() => next,
            };
            let Some(delivery) = next else {
                debug!("subscription stream closed");
                break;
            };
            let delivery = match delivery {
                Ok(delivery) => delivery,
                Err(err) => {
                    warn!(error = %format!("{err:#}"), "subscription delivery error");
                    continue;
                }
            };

            let permit = tokio::select! {
                _ = token.cancelled() => break,
                permit = Arc::clone(&semaphore).acquire_owned() => {
                    permit.context("dispatch semaphore closed")?
                }
            };
            let invoker = Arc::clone(&self.invoker);
            let router = Arc::clone(&self.router);
            inflight.spawn(async move {
                process(invoker, router, delivery).await;
                drop(permit);
            });
        }

        debug!("subscription engine draining in-flight messages");
        while let Some(joined) = inflight.join_next().await {
            if let Err(err) = joined {
                error!(error = %err, "subscription worker task failed");
            }
        }
        Ok(())
    }
}

/// Invoke, route, then ack. A routing failure abandons the delivery so the
/// broker redelivers it after the ack wait.
async fn process<A: Acker, S: Sink>(
    invoker: Arc<HttpInvoker>,
    router: Arc<SinkRouter<S>>,
    delivery: Delivery<A>,
) {
    let Delivery { message, acker } = delivery;
    let routed = match invoker.invoke(&message).await {
        Ok(response) => router.route_response(&message, response).await,
        Err(envelope) => router.route_error(&message, &envelope).await,
    };
    match routed {
        Ok(()) => {
            if let Err(err) = acker.ack().await {
                warn!(error = %format!("{err:#}"), "failed to ack message, broker will redeliver");
            }
        }
        Err(_) => {
            warn!("routing failed, message left for redelivery");
        }
    }
}

use core::future::Future;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::invoker::HttpInvoker;
use crate::message::SourceMessage;
use crate::router::{Sink, SinkRouter};

pub const DEFAULT_MAX_RECORDS: usize = 10;
pub const DEFAULT_DISCOVER_INTERVAL: Duration = Duration::from_secs(30);
pub const DEFAULT_SCAN_INTERVAL: Duration = Duration::from_secs(10);

/// A batch pulled from one partition.
///
/// `next` is the iterator for the following pull; `None` means the driver
/// observed partition closure and no further records will appear.
pub struct PullBatch<I> {
    pub records: Vec<SourceMessage>,
    pub next: Option<I>,
}

/// Capability surface of a partitioned-log broker.
///
/// Iterators are opaque to the engine; the driver decides how closure is
/// detected and reports it by returning a batch without a next iterator.
pub trait PartitionSource: Send + Sync + 'static {
    type Iterator: Send + 'static;

    /// Current set of partition ids. Called on the discovery cadence; the
    /// engine filters out ids it has already seen.
    fn discover_partitions(&self) -> impl Future<Output = Result<Vec<String>>> + Send;

    /// Open an iterator for a partition. With a cursor the iterator resumes
    /// strictly after that sequence, otherwise at the oldest retained
    /// record. `None` means no iterator is currently available.
    fn open_iterator(
        &self,
        partition_id: &str,
        cursor: Option<&str>,
    ) -> impl Future<Output = Result<Option<Self::Iterator>>> + Send;

    /// Pull up to `limit` records.
    fn pull(
        &self,
        partition_id: &str,
        iterator: Self::Iterator,
        limit: usize,
    ) -> impl Future<Output = Result<PullBatch<Self::Iterator>>> + Send;
}

/// Per-partition checkpoints. `None` means the partition has been observed
/// but nothing has been processed yet (start at the trim horizon).
///
/// Single writer per key: the discovery path only inserts fresh keys, the
/// owning worker is the only mutator and remover.
type CheckpointMap = Arc<RwLock<HashMap<String, Option<String>>>>;

/// Dispatch engine for partitioned-log brokers.
///
/// One worker per partition, spawned when discovery first announces the
/// partition id. Within a partition, records are processed strictly in
/// sequence: invoke, route, advance the checkpoint. Closure retires the
/// partition for the rest of the process lifetime.
pub struct PartitionEngine<P, S> {
    source: Arc<P>,
    invoker: Arc<HttpInvoker>,
    router: Arc<SinkRouter<S>>,
    checkpoints: CheckpointMap,
    max_records: usize,
    discover_interval: Duration,
    scan_interval: Duration,
}

impl<P, S> Clone for PartitionEngine<P, S> {
    fn clone(&self) -> Self {
        PartitionEngine {
            source: Arc::clone(&self.source),
            invoker: Arc::clone(&self.invoker),
            router: Arc::clone(&self.router),
            checkpoints: Arc::clone(&self.checkpoints),
            max_records: self.max_records,
            discover_interval: self.discover_interval,
            scan_interval: self.scan_interval,
        }
    }
}

impl<P: PartitionSource, S: Sink> PartitionEngine<P, S> {
    pub fn new(source: Arc<P>, invoker: Arc<HttpInvoker>, router: Arc<SinkRouter<S>>) -> Self {
        PartitionEngine {
            source,
            invoker,
            router,
            checkpoints: Arc::new(RwLock::new(HashMap::new())),
            max_records: DEFAULT_MAX_RECORDS,
            discover_interval: DEFAULT_DISCOVER_INTERVAL,
            scan_interval: DEFAULT_SCAN_INTERVAL,
        }
    }

    pub fn with_max_records(mut self, max_records: usize) -> Self {
        self.max_records = max_records;
        self
    }

    pub fn with_intervals(mut self, discover: Duration, scan: Duration) -> Self {
        self.discover_interval = discover;
        self.scan_interval = scan;
        self
    }

    /// The checkpoint for a partition, or `None` once it has been retired
    /// (or never observed).
    pub async fn checkpoint(&self, partition_id: &str) -> Option<Option<String>> {
        self.checkpoints.read().await.get(partition_id).cloned()
    }

    /// Run discovery and partition workers until cancellation, then drain.
    pub async fn run(&self, token: CancellationToken) -> Result<()> {
        let (tx, mut rx) = mpsc::channel::<String>(1);
        let discovery = tokio::spawn(discovery_loop(
            Arc::clone(&self.source),
            tx,
            token.clone(),
            self.discover_interval,
        ));

        let mut workers = JoinSet::new();
        while let Some(partition_id) = rx.recv().await {
            self.checkpoints
                .write()
                .await
                .entry(partition_id.clone())
                .or_insert(None);
            info!(partition_id, "starting partition worker");
            workers.spawn(self.clone().partition_worker(partition_id, token.clone()));
        }

        // Discovery has stopped; wait for every worker to finish its
        // in-flight message and unwind.
        while let Some(joined) = workers.join_next().await {
            if let Err(err) = joined {
                error!(error = %err, "partition worker task failed");
            }
        }
        if let Err(err) = discovery.await {
            error!(error = %err, "discovery task failed");
        }
        Ok(())
    }

    /// The per-partition loop: reopen an iterator from the checkpoint, pull
    /// one batch, process it in order, then wait out the scan tick.
    #[instrument(level = "debug", skip_all, fields(partition_id = %partition_id))]
    async fn partition_worker(self, partition_id: String, token: CancellationToken) {
        loop {
            let Some(cursor) = self.checkpoints.read().await.get(&partition_id).cloned() else {
                info!("partition not found in checkpoint map, stopping worker");
                return;
            };

            match self.source.open_iterator(&partition_id, cursor.as_deref()).await {
                Err(err) => {
                    warn!(error = %format!("{err:#}"), "failed to open partition iterator");
                }
                Ok(None) => {
                    debug!("no iterator available for partition, idling");
                }
                Ok(Some(iterator)) => {
                    match self
                        .source
                        .pull(&partition_id, iterator, self.max_records)
                        .await
                    {
                        Err(err) => {
                            warn!(error = %format!("{err:#}"), "failed to pull records");
                        }
                        Ok(batch) => {
                            let closed = batch.next.is_none();
                            let drained = self
                                .process_batch(&partition_id, batch.records, &token)
                                .await;
                            if closed && drained {
                                info!("partition closed, retiring");
                                self.checkpoints.write().await.remove(&partition_id);
                                return;
                            }
                        }
                    }
                }
            }

            tokio::select! {
                _ = token.cancelled() => return,
                _ = tokio::time::sleep(self.scan_interval) => {}
            }
        }
    }

    /// Process a batch in order. Returns `false` when the batch was cut
    /// short by cancellation or a routing failure; the checkpoint then
    /// stops at the last routed record and the remainder is re-read on the
    /// next pull.
    async fn process_batch(
        &self,
        partition_id: &str,
        records: Vec<SourceMessage>,
        token: &CancellationToken,
    ) -> bool {
        for msg in records {
            if token.is_cancelled() {
                return false;
            }
            let sequence = msg.sequence.clone();
            let routed = match self.invoker.invoke(&msg).await {
                Ok(response) => self.router.route_response(&msg, response).await,
                Err(envelope) => self.router.route_error(&msg, &envelope).await,
            };
            if routed.is_err() {
                warn!(
                    sequence = ?sequence,
                    "routing failed, checkpoint not advanced past this record",
                );
                return false;
            }
            if let Some(sequence) = sequence {
                self.checkpoints
                    .write()
                    .await
                    .insert(partition_id.to_string(), Some(sequence));
            }
        }
        true
    }
}

/// Announce newly observed partitions on a bounded channel.
///
/// Membership is by partition id for the process lifetime: a partition that
/// closed and is re-reported by a stale snapshot is never announced twice.
async fn discovery_loop<P: PartitionSource>(
    source: Arc<P>,
    tx: mpsc::Sender<String>,
    token: CancellationToken,
    interval: Duration,
) {
    let mut seen = HashSet::new();
    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = token.cancelled() => {
                debug!("discovery stopping");
                return;
            }
            _ = ticker.tick() => {}
        }

        let partitions = match source.discover_partitions().await {
            Ok(partitions) => partitions,
            Err(err) => {
                warn!(error = %format!("{err:#}"), "partition discovery failed");
                continue;
            }
        };

        for partition_id in partitions {
            if seen.insert(partition_id.clone()) {
                debug!(partition_id, "discovered new partition");
                tokio::select! {
                    _ = token.cancelled() => return,
                    sent = tx.send(partition_id) => {
                        if sent.is_err() {
                            return;
                        }
                    }
                }
            }
        }
    }
}

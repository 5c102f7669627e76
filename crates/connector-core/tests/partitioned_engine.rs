//! Partitioned-log engine behavior against an in-memory log driver.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use bytes::Bytes;
use tokio_util::sync::CancellationToken;

use keda_connector_core::engine::partitioned::{PartitionEngine, PartitionSource, PullBatch};
use keda_connector_core::{
    ConnectorMetadata, HttpInvoker, OutboundResponse, Sink, SinkRouter, SourceMessage,
};

fn meta(endpoint: &str) -> Arc<ConnectorMetadata> {
    Arc::new(ConnectorMetadata {
        topic: "stream".to_string(),
        response_topic: "stream-resp".to_string(),
        error_topic: "stream-err".to_string(),
        http_endpoint: endpoint.to_string(),
        max_retries: 0,
        content_type: "text/plain".to_string(),
        source_name: "KEDAConnector".to_string(),
    })
}

fn record(partition: &str, sequence: &str) -> SourceMessage {
    SourceMessage {
        payload: Some(Bytes::from(format!("{partition}-{sequence}"))),
        key: Some(Bytes::from(partition.to_string())),
        attributes: HashMap::new(),
        partition_id: Some(partition.to_string()),
        sequence: Some(sequence.to_string()),
    }
}

struct LogPartition {
    records: Vec<SourceMessage>,
    /// Whether pulling past the last record reports closure.
    closes: bool,
}

/// In-memory partitioned log: iterators are indexes, cursors are sequence
/// strings, discovery follows a scripted set of rounds (the last round
/// repeats forever).
struct FakeLog {
    rounds: Mutex<VecDeque<Vec<String>>>,
    partitions: Mutex<HashMap<String, LogPartition>>,
}

impl FakeLog {
    fn new(rounds: Vec<Vec<&str>>, partitions: Vec<(&str, Vec<&str>, bool)>) -> Arc<Self> {
        Arc::new(FakeLog {
            rounds: Mutex::new(
                rounds
                    .into_iter()
                    .map(|round| round.into_iter().map(String::from).collect())
                    .collect(),
            ),
            partitions: Mutex::new(
                partitions
                    .into_iter()
                    .map(|(id, sequences, closes)| {
                        (
                            id.to_string(),
                            LogPartition {
                                records: sequences
                                    .into_iter()
                                    .map(|sequence| record(id, sequence))
                                    .collect(),
                                closes,
                            },
                        )
                    })
                    .collect(),
            ),
        })
    }
}

impl PartitionSource for FakeLog {
    type Iterator = usize;

    async fn discover_partitions(&self) -> Result<Vec<String>> {
        let mut rounds = self.rounds.lock().unwrap();
        if rounds.len() > 1 {
            Ok(rounds.pop_front().unwrap())
        } else {
            Ok(rounds.front().cloned().unwrap_or_default())
        }
    }

    async fn open_iterator(
        &self,
        partition_id: &str,
        cursor: Option<&str>,
    ) -> Result<Option<usize>> {
        let partitions = self.partitions.lock().unwrap();
        let Some(partition) = partitions.get(partition_id) else {
            return Ok(None);
        };
        let index = match cursor {
            Some(cursor) => partition
                .records
                .iter()
                .position(|r| r.sequence.as_deref() == Some(cursor))
                .map(|i| i + 1)
                .unwrap_or(0),
            None => 0,
        };
        Ok(Some(index))
    }

    async fn pull(
        &self,
        partition_id: &str,
        iterator: usize,
        limit: usize,
    ) -> Result<PullBatch<usize>> {
        let partitions = self.partitions.lock().unwrap();
        let Some(partition) = partitions.get(partition_id) else {
            return Ok(PullBatch {
                records: Vec::new(),
                next: None,
            });
        };
        let end = (iterator + limit).min(partition.records.len());
        let records = partition.records[iterator..end].to_vec();
        let next = if partition.closes && end >= partition.records.len() {
            None
        } else {
            Some(end)
        };
        Ok(PullBatch { records, next })
    }
}

#[derive(Default)]
struct RecordingSink {
    /// (partition id, sequence) of successfully published responses.
    responses: Mutex<Vec<(String, String)>>,
    errors: Mutex<Vec<Bytes>>,
    /// Number of publish attempts that fail before the sink recovers.
    fail_first: AtomicUsize,
    attempts: AtomicUsize,
}

#[derive(Clone, Default)]
struct SharedSink(Arc<RecordingSink>);

impl std::ops::Deref for SharedSink {
    type Target = RecordingSink;

    fn deref(&self) -> &RecordingSink {
        &self.0
    }
}

impl Sink for SharedSink {
    async fn publish_response(
        &self,
        inbound: &SourceMessage,
        _outbound: &OutboundResponse,
    ) -> Result<()> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if self
            .fail_first
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            anyhow::bail!("sink unavailable");
        }
        self.responses.lock().unwrap().push((
            inbound.partition_id.clone().unwrap_or_default(),
            inbound.sequence.clone().unwrap_or_default(),
        ));
        Ok(())
    }

    async fn publish_error(&self, _inbound: &SourceMessage, payload: Bytes) -> Result<()> {
        self.errors.lock().unwrap().push(payload);
        Ok(())
    }
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not reached within 5s"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

fn engine(
    source: Arc<FakeLog>,
    sink: SharedSink,
    meta: Arc<ConnectorMetadata>,
) -> PartitionEngine<FakeLog, SharedSink> {
    PartitionEngine::new(
        source,
        Arc::new(HttpInvoker::new(meta.clone())),
        Arc::new(SinkRouter::new(sink, meta)),
    )
    .with_intervals(Duration::from_millis(50), Duration::from_millis(50))
}

#[tokio::test]
async fn closed_partition_processes_in_order_then_retires() {
    let mut server = mockito::Server::new_async().await;
    let endpoint = server
        .mock("POST", "/")
        .with_status(200)
        .with_body("ok")
        .expect(3)
        .create_async()
        .await;

    let source = FakeLog::new(
        vec![vec!["shard-1"]],
        vec![("shard-1", vec!["1", "2", "3"], true)],
    );
    let sink = SharedSink(Arc::new(RecordingSink::default()));
    let engine = engine(source, sink.clone(), meta(&server.url()));

    let token = CancellationToken::new();
    let runner = tokio::spawn({
        let engine = engine.clone();
        let token = token.clone();
        async move { engine.run(token).await }
    });

    wait_until(|| sink.responses.lock().unwrap().len() == 3).await;
    let responses = sink.responses.lock().unwrap().clone();
    assert_eq!(
        responses,
        vec![
            ("shard-1".to_string(), "1".to_string()),
            ("shard-1".to_string(), "2".to_string()),
            ("shard-1".to_string(), "3".to_string()),
        ]
    );

    // the worker observed closure: the checkpoint entry is gone and the
    // re-reported partition id is never announced again
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while engine.checkpoint("shard-1").await.is_some() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "partition was not retired within 5s"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(sink.responses.lock().unwrap().len(), 3);

    token.cancel();
    runner.await.unwrap().unwrap();
    endpoint.assert_async().await;
}

#[tokio::test]
async fn partitions_discovered_mid_run_get_their_own_worker() {
    let mut server = mockito::Server::new_async().await;
    server
        .mock("POST", "/")
        .with_status(200)
        .with_body("ok")
        .expect_at_least(2)
        .create_async()
        .await;

    let source = FakeLog::new(
        vec![vec!["shard-1"], vec!["shard-1", "shard-2"]],
        vec![
            ("shard-1", vec!["a1"], false),
            ("shard-2", vec!["b1"], false),
        ],
    );
    let sink = SharedSink(Arc::new(RecordingSink::default()));
    let engine = engine(source, sink.clone(), meta(&server.url()));

    let token = CancellationToken::new();
    let runner = tokio::spawn({
        let engine = engine.clone();
        let token = token.clone();
        async move { engine.run(token).await }
    });

    wait_until(|| sink.responses.lock().unwrap().len() >= 2).await;
    let responses = sink.responses.lock().unwrap().clone();
    assert!(responses.contains(&("shard-1".to_string(), "a1".to_string())));
    assert!(responses.contains(&("shard-2".to_string(), "b1".to_string())));

    // neither worker processed the other's records
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let first = engine.checkpoint("shard-1").await;
        let second = engine.checkpoint("shard-2").await;
        if first == Some(Some("a1".to_string())) && second == Some(Some("b1".to_string())) {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "checkpoints did not settle within 5s: {first:?} {second:?}"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    token.cancel();
    runner.await.unwrap().unwrap();
}

#[tokio::test]
async fn routing_failure_replays_from_checkpoint() {
    let mut server = mockito::Server::new_async().await;
    server
        .mock("POST", "/")
        .with_status(200)
        .with_body("ok")
        .expect_at_least(3)
        .create_async()
        .await;

    let source = FakeLog::new(vec![vec!["shard-1"]], vec![("shard-1", vec!["1", "2"], false)]);
    let sink = SharedSink(Arc::new(RecordingSink {
        fail_first: AtomicUsize::new(1),
        ..Default::default()
    }));
    let engine = engine(source, sink.clone(), meta(&server.url()));

    let token = CancellationToken::new();
    let runner = tokio::spawn({
        let engine = engine.clone();
        let token = token.clone();
        async move { engine.run(token).await }
    });

    // first publish of "1" fails, the batch is cut, and the next scan
    // re-reads "1" before moving on to "2"
    wait_until(|| sink.responses.lock().unwrap().len() == 2).await;
    let responses = sink.responses.lock().unwrap().clone();
    assert_eq!(
        responses,
        vec![
            ("shard-1".to_string(), "1".to_string()),
            ("shard-1".to_string(), "2".to_string()),
        ]
    );
    assert_eq!(sink.attempts.load(Ordering::SeqCst), 3);
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while engine.checkpoint("shard-1").await != Some(Some("2".to_string())) {
        assert!(
            tokio::time::Instant::now() < deadline,
            "checkpoint did not advance to \"2\" within 5s"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    token.cancel();
    runner.await.unwrap().unwrap();
}

#[tokio::test]
async fn cancellation_stops_pulls_and_drains() {
    let mut server = mockito::Server::new_async().await;
    server
        .mock("POST", "/")
        .with_status(200)
        .with_body("ok")
        .create_async()
        .await;

    let source = FakeLog::new(vec![vec!["shard-1"]], vec![("shard-1", vec!["1"], false)]);
    let sink = SharedSink(Arc::new(RecordingSink::default()));
    let engine = engine(source, sink.clone(), meta(&server.url()));

    let token = CancellationToken::new();
    let runner = tokio::spawn({
        let engine = engine.clone();
        let token = token.clone();
        async move { engine.run(token).await }
    });

    wait_until(|| !sink.responses.lock().unwrap().is_empty()).await;
    token.cancel();
    tokio::time::timeout(Duration::from_secs(5), runner)
        .await
        .expect("engine did not drain after cancellation")
        .unwrap()
        .unwrap();

    // nothing new is invoked once the engine has returned
    let settled = sink.responses.lock().unwrap().len();
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(sink.responses.lock().unwrap().len(), settled);
}

//! Subscription engine behavior against scripted delivery streams.

use std::sync::{Arc, Mutex};

use anyhow::Result;
use bytes::Bytes;
use tokio_util::sync::CancellationToken;

use keda_connector_core::engine::subscription::{Acker, Delivery, SubscriptionEngine};
use keda_connector_core::{
    ConnectorMetadata, HttpInvoker, OutboundResponse, Sink, SinkRouter, SourceMessage,
};

fn meta(endpoint: &str, response_topic: &str, error_topic: &str) -> Arc<ConnectorMetadata> {
    Arc::new(ConnectorMetadata {
        topic: "events.orders".to_string(),
        response_topic: response_topic.to_string(),
        error_topic: error_topic.to_string(),
        http_endpoint: endpoint.to_string(),
        max_retries: 0,
        content_type: "text/plain".to_string(),
        source_name: "KEDAConnector".to_string(),
    })
}

struct FakeAcker {
    id: String,
    acked: Arc<Mutex<Vec<String>>>,
}

impl Acker for FakeAcker {
    async fn ack(self) -> Result<()> {
        self.acked.lock().unwrap().push(self.id);
        Ok(())
    }
}

fn deliveries(
    bodies: &[&str],
    acked: &Arc<Mutex<Vec<String>>>,
) -> Vec<Result<Delivery<FakeAcker>>> {
    bodies
        .iter()
        .enumerate()
        .map(|(i, body)| {
            Ok(Delivery {
                message: SourceMessage {
                    payload: Some(Bytes::from(body.to_string())),
                    ..Default::default()
                },
                acker: FakeAcker {
                    id: format!("msg-{i}"),
                    acked: Arc::clone(acked),
                },
            })
        })
        .collect()
}

#[derive(Default)]
struct RecordingSink {
    responses: Mutex<Vec<String>>,
    errors: Mutex<Vec<Bytes>>,
    fail_responses: bool,
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
        if self.fail_responses {
            anyhow::bail!("sink unavailable");
        }
        self.responses.lock().unwrap().push(inbound.payload_string());
        Ok(())
    }

    async fn publish_error(&self, _inbound: &SourceMessage, payload: Bytes) -> Result<()> {
        self.errors.lock().unwrap().push(payload);
        Ok(())
    }
}

#[tokio::test]
async fn serial_dispatch_preserves_delivery_order() {
    let mut server = mockito::Server::new_async().await;
    server
        .mock("POST", "/")
        .with_status(200)
        .with_body("ok")
        .expect(3)
        .create_async()
        .await;

    let acked = Arc::new(Mutex::new(Vec::new()));
    let sink = SharedSink(Arc::new(RecordingSink::default()));
    let meta = meta(&server.url(), "events.resp", "events.err");
    let engine = SubscriptionEngine::new(
        Arc::new(HttpInvoker::new(meta.clone())),
        Arc::new(SinkRouter::new(sink.clone(), meta)),
    );

    let stream = futures::stream::iter(deliveries(&["a", "b", "c"], &acked));
    engine.run(stream, CancellationToken::new()).await.unwrap();

    assert_eq!(
        sink.responses.lock().unwrap().as_slice(),
        ["a", "b", "c"]
    );
    assert_eq!(acked.lock().unwrap().as_slice(), ["msg-0", "msg-1", "msg-2"]);
}

#[tokio::test]
async fn routing_failure_abandons_the_delivery() {
    let mut server = mockito::Server::new_async().await;
    server
        .mock("POST", "/")
        .with_status(200)
        .with_body("ok")
        .expect(1)
        .create_async()
        .await;

    let acked = Arc::new(Mutex::new(Vec::new()));
    let sink = SharedSink(Arc::new(RecordingSink {
        fail_responses: true,
        ..Default::default()
    });
    let meta = meta(&server.url(), "events.resp", "");
    let engine = SubscriptionEngine::new(
        Arc::new(HttpInvoker::new(meta.clone())),
        Arc::new(SinkRouter::new(sink, meta)),
    );

    let stream = futures::stream::iter(deliveries(&["a"], &acked));
    engine.run(stream, CancellationToken::new()).await.unwrap();

    // unacked: the broker will redeliver after the ack wait
    assert!(acked.lock().unwrap().is_empty());
}

#[tokio::test]
async fn failed_invocation_routes_envelope_then_acks() {
    let mut server = mockito::Server::new_async().await;
    server
        .mock("POST", "/")
        .with_status(500)
        .with_body("boom")
        .expect(1)
        .create_async()
        .await;

    let acked = Arc::new(Mutex::new(Vec::new()));
    let sink = SharedSink(Arc::new(RecordingSink::default()));
    let meta = meta(&server.url(), "events.resp", "events.err");
    let engine = SubscriptionEngine::new(
        Arc::new(HttpInvoker::new(meta.clone())),
        Arc::new(SinkRouter::new(sink.clone(), meta)),
    );

    let stream = futures::stream::iter(deliveries(&["a"], &acked));
    engine.run(stream, CancellationToken::new()).await.unwrap();

    assert_eq!(sink.errors.lock().unwrap().len(), 1);
    assert_eq!(acked.lock().unwrap().as_slice(), ["msg-0"]);
}

#[tokio::test]
async fn cancellation_stops_dispatch() {
    let mut server = mockito::Server::new_async().await;
    server
        .mock("POST", "/")
        .with_status(200)
        .with_body("ok")
        .create_async()
        .await;

    let acked = Arc::new(Mutex::new(Vec::new()));
    let sink = SharedSink(Arc::new(RecordingSink::default()));
    let meta = meta(&server.url(), "", "");
    let engine = SubscriptionEngine::new(
        Arc::new(HttpInvoker::new(meta.clone())),
        Arc::new(SinkRouter::new(sink, meta)),
    );

    let token = CancellationToken::new();
    token.cancel();
    // a pending (never-ending) stream: cancellation must win the select
    let stream = futures::stream::pending::<Result<Delivery<FakeAcker>>>();
    engine.run(stream, token).await.unwrap();
    assert!(acked.lock().unwrap().is_empty());
}

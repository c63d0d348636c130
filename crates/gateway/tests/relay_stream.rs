use std::collections::{BTreeSet, HashMap};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::Router;
use porta_contracts::{EventType, RawRecord, SubscriptionCriteria, TransportStatus, UpstreamEvent};
use porta_gateway::config::GatewayConfig;
use porta_gateway::http::{AppState, app};
use porta_upstream::{
    DirectoryError, DispatchUpstream, StaffDirectory, Subscription, UpstreamError,
};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot};
use tokio_stream::StreamExt;
use tokio_stream::wrappers::ReceiverStream;

type EventSender = mpsc::Sender<Result<UpstreamEvent, UpstreamError>>;

struct MockUpstream {
    subscribe_calls: AtomicUsize,
    captured_criteria: Mutex<Option<SubscriptionCriteria>>,
    fail_subscribe: bool,
    feed: Mutex<Option<(mpsc::Receiver<Result<UpstreamEvent, UpstreamError>>, oneshot::Sender<()>)>>,
    records: Vec<RawRecord>,
}

impl MockUpstream {
    /// Mock that hands its one subscription a caller-controlled event feed.
    /// Returns the feed sender and a receiver that resolves when the relay
    /// cancels the subscription.
    fn with_feed() -> (Arc<Self>, EventSender, oneshot::Receiver<()>) {
        let (event_tx, event_rx) = mpsc::channel(64);
        let (cancel_tx, cancel_rx) = oneshot::channel();

        let mock = Arc::new(Self {
            subscribe_calls: AtomicUsize::new(0),
            captured_criteria: Mutex::new(None),
            fail_subscribe: false,
            feed: Mutex::new(Some((event_rx, cancel_tx))),
            records: Vec::new(),
        });

        (mock, event_tx, cancel_rx)
    }

    fn failing() -> Arc<Self> {
        Arc::new(Self {
            subscribe_calls: AtomicUsize::new(0),
            captured_criteria: Mutex::new(None),
            fail_subscribe: true,
            feed: Mutex::new(None),
            records: Vec::new(),
        })
    }

    fn with_records(records: Vec<RawRecord>) -> Arc<Self> {
        Arc::new(Self {
            subscribe_calls: AtomicUsize::new(0),
            captured_criteria: Mutex::new(None),
            fail_subscribe: false,
            feed: Mutex::new(None),
            records,
        })
    }

    fn criteria(&self) -> Option<SubscriptionCriteria> {
        self.captured_criteria
            .lock()
            .expect("criteria lock")
            .clone()
    }
}

#[async_trait::async_trait]
impl DispatchUpstream for MockUpstream {
    async fn subscribe(
        &self,
        criteria: &SubscriptionCriteria,
    ) -> Result<Subscription, UpstreamError> {
        self.subscribe_calls.fetch_add(1, Ordering::SeqCst);
        *self.captured_criteria.lock().expect("criteria lock") = Some(criteria.clone());

        if self.fail_subscribe {
            return Err(UpstreamError::Timeout);
        }

        let (event_rx, cancel_tx) = self
            .feed
            .lock()
            .expect("feed lock")
            .take()
            .expect("mock supports exactly one subscription");

        Ok(Subscription::new(
            Box::pin(ReceiverStream::new(event_rx)),
            cancel_tx,
        ))
    }

    async fn list_requests(
        &self,
        criteria: &SubscriptionCriteria,
    ) -> Result<Vec<RawRecord>, UpstreamError> {
        *self.captured_criteria.lock().expect("criteria lock") = Some(criteria.clone());
        Ok(self.records.clone())
    }

    async fn ping(&self) -> Result<(), UpstreamError> {
        Ok(())
    }
}

struct MockDirectory {
    calls: AtomicUsize,
    names: HashMap<String, String>,
}

impl MockDirectory {
    fn new(names: &[(&str, &str)]) -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            names: names
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        })
    }
}

#[async_trait::async_trait]
impl StaffDirectory for MockDirectory {
    async fn display_names(
        &self,
        ids: &BTreeSet<String>,
    ) -> Result<HashMap<String, String>, DirectoryError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(ids
            .iter()
            .filter_map(|id| self.names.get(id).map(|n| (id.clone(), n.clone())))
            .collect())
    }

    async fn ping(&self) -> Result<(), DirectoryError> {
        Ok(())
    }
}

fn test_config(keepalive_secs: u64) -> GatewayConfig {
    GatewayConfig::from_kv(&HashMap::from([
        ("PORTA_BIND_ADDR".to_string(), "127.0.0.1:0".to_string()),
        (
            "PORTA_DISPATCH_URL".to_string(),
            "http://127.0.0.1:1".to_string(),
        ),
        (
            "PORTA_DIRECTORY_URL".to_string(),
            "http://127.0.0.1:1".to_string(),
        ),
        (
            "PORTA_STREAM_TOKEN_SECRET".to_string(),
            "relay-test-signing-key".to_string(),
        ),
        (
            "PORTA_STREAM_KEEPALIVE_SECS".to_string(),
            keepalive_secs.to_string(),
        ),
    ]))
    .expect("test config is valid")
}

fn test_app(
    keepalive_secs: u64,
    upstream: Arc<dyn DispatchUpstream>,
    directory: Arc<dyn StaffDirectory>,
) -> Router {
    let state = AppState::new(test_config(keepalive_secs), None, upstream, directory)
        .expect("app state builds");
    app(state)
}

async fn spawn_server(
    app: Router,
) -> (SocketAddr, oneshot::Sender<()>, tokio::task::JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind should succeed");
    let addr = listener.local_addr().expect("local_addr should succeed");

    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let handle = tokio::spawn(async move {
        let _ = axum::serve(listener, app)
            .with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
            })
            .await;
    });

    (addr, shutdown_tx, handle)
}

async fn mint_token(client: &reqwest::Client, addr: SocketAddr) -> String {
    let resp = client
        .get(format!("http://{}/v1/transports/stream-token", addr))
        .header("x-porta-principal-id", "staff:1042")
        .send()
        .await
        .expect("token request succeeds");
    assert_eq!(resp.status(), reqwest::StatusCode::OK);

    let body: serde_json::Value = resp.json().await.expect("token response is json");
    assert_eq!(body["success"], true);
    body["token"]
        .as_str()
        .expect("token field is a string")
        .to_string()
}

/// Pulls the next complete SSE frame (data or comment) off the byte stream.
struct FrameReader<S> {
    stream: S,
    buf: Vec<u8>,
}

impl<S> FrameReader<S>
where
    S: tokio_stream::Stream<Item = Result<bytes::Bytes, reqwest::Error>> + Unpin,
{
    fn new(stream: S) -> Self {
        Self {
            stream,
            buf: Vec::new(),
        }
    }

    async fn next_frame(&mut self) -> String {
        loop {
            if let Some(pos) = find_frame_end(&self.buf) {
                let frame: Vec<u8> = self.buf.drain(..pos + 2).collect();
                return String::from_utf8(frame).expect("frame is utf8");
            }

            let chunk = tokio::time::timeout(Duration::from_secs(5), self.stream.next())
                .await
                .expect("frame arrives in time")
                .expect("stream stays open")
                .expect("chunk reads cleanly");
            self.buf.extend_from_slice(&chunk);
        }
    }
}

fn find_frame_end(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == b"\n\n")
}

fn frame_payload(frame: &str) -> serde_json::Value {
    let payload = frame
        .strip_prefix("data: ")
        .and_then(|rest| rest.strip_suffix("\n\n"))
        .expect("frame is a data frame");
    serde_json::from_str(payload).expect("payload is json")
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn token_endpoint_requires_a_principal() {
    let (upstream, _events, _cancelled) = MockUpstream::with_feed();
    let directory = MockDirectory::new(&[]);
    let (addr, shutdown, _task) = spawn_server(test_app(30, upstream, directory)).await;

    let client = reqwest::Client::new();
    let resp = client
        .get(format!("http://{}/v1/transports/stream-token", addr))
        .send()
        .await
        .expect("request succeeds");

    assert_eq!(resp.status(), reqwest::StatusCode::UNAUTHORIZED);
    let body: serde_json::Value = resp.json().await.expect("body is json");
    assert_eq!(
        body,
        serde_json::json!({"success": false, "error": "UNAUTHORIZED"})
    );

    let _ = shutdown.send(());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stream_relays_filtered_events_as_sse_frames() {
    let (upstream, events, _cancelled) = MockUpstream::with_feed();
    let directory = MockDirectory::new(&[]);
    let (addr, shutdown, _task) =
        spawn_server(test_app(30, upstream.clone(), directory)).await;

    let client = reqwest::Client::new();
    let token = mint_token(&client, addr).await;

    let resp = client
        .get(format!(
            "http://{}/v1/transports/stream?status=WAITING&token={}",
            addr, token
        ))
        .send()
        .await
        .expect("stream request succeeds");
    assert_eq!(resp.status(), reqwest::StatusCode::OK);
    assert_eq!(
        resp.headers()
            .get("content-type")
            .and_then(|v| v.to_str().ok()),
        Some("text/event-stream")
    );

    // Exactly one upstream subscription, carrying the translated filter.
    assert_eq!(upstream.subscribe_calls.load(Ordering::SeqCst), 1);
    assert_eq!(
        upstream.criteria(),
        Some(SubscriptionCriteria {
            status: Some(TransportStatus::Waiting),
            ..SubscriptionCriteria::default()
        })
    );

    events
        .send(Ok(UpstreamEvent {
            event_type: EventType::Created,
            record: RawRecord {
                id: "101".to_string(),
                status: Some(1),
                urgency: Some(2),
                origin_ward: Some("W3".to_string()),
                ..RawRecord::default()
            },
        }))
        .await
        .expect("event accepted");

    let mut frames = FrameReader::new(resp.bytes_stream());
    let payload = frame_payload(&frames.next_frame().await);
    assert_eq!(payload["type"], "CREATED");
    assert_eq!(payload["data"]["id"], "101");
    assert_eq!(payload["data"]["status"], "WAITING");
    assert_eq!(payload["data"]["urgency"], "URGENT");
    assert_eq!(payload["data"]["originWard"], "W3");

    // Unrecognized wire codes degrade to the sentinel, not an error.
    events
        .send(Ok(UpstreamEvent {
            event_type: EventType::Updated,
            record: RawRecord {
                id: "102".to_string(),
                status: Some(77),
                ..RawRecord::default()
            },
        }))
        .await
        .expect("event accepted");

    let payload = frame_payload(&frames.next_frame().await);
    assert_eq!(payload["type"], "UPDATED");
    assert_eq!(payload["data"]["status"], "UNKNOWN");

    let _ = shutdown.send(());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn keepalive_comments_flow_while_the_stream_is_quiet() {
    let (upstream, _events, _cancelled) = MockUpstream::with_feed();
    let directory = MockDirectory::new(&[]);
    let (addr, shutdown, _task) = spawn_server(test_app(1, upstream, directory)).await;

    let client = reqwest::Client::new();
    let token = mint_token(&client, addr).await;

    let resp = client
        .get(format!(
            "http://{}/v1/transports/stream?token={}",
            addr, token
        ))
        .send()
        .await
        .expect("stream request succeeds");

    let mut frames = FrameReader::new(resp.bytes_stream());
    assert_eq!(frames.next_frame().await, ": keep-alive\n\n");
    assert_eq!(frames.next_frame().await, ": keep-alive\n\n");

    let _ = shutdown.send(());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn client_disconnect_cancels_the_upstream_subscription() {
    let (upstream, events, cancelled) = MockUpstream::with_feed();
    let directory = MockDirectory::new(&[]);
    let (addr, shutdown, _task) = spawn_server(test_app(30, upstream, directory)).await;

    let client = reqwest::Client::new();
    let token = mint_token(&client, addr).await;

    let resp = client
        .get(format!(
            "http://{}/v1/transports/stream?token={}",
            addr, token
        ))
        .send()
        .await
        .expect("stream request succeeds");

    let mut frames = FrameReader::new(resp.bytes_stream());
    for i in 0..3 {
        events
            .send(Ok(UpstreamEvent {
                event_type: EventType::Updated,
                record: RawRecord {
                    id: i.to_string(),
                    status: Some(1),
                    ..RawRecord::default()
                },
            }))
            .await
            .expect("event accepted");
        frames.next_frame().await;
    }

    drop(frames);

    tokio::time::timeout(Duration::from_secs(5), cancelled)
        .await
        .expect("cancel observed in time")
        .expect("cancel signal delivered");

    let _ = shutdown.send(());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unrecognized_filter_values_are_rejected_before_subscribing() {
    let (upstream, _events, _cancelled) = MockUpstream::with_feed();
    let directory = MockDirectory::new(&[]);
    let (addr, shutdown, _task) =
        spawn_server(test_app(30, upstream.clone(), directory)).await;

    let client = reqwest::Client::new();
    let token = mint_token(&client, addr).await;

    let resp = client
        .get(format!(
            "http://{}/v1/transports/stream?status=PENDING&token={}",
            addr, token
        ))
        .send()
        .await
        .expect("request succeeds");

    assert_eq!(resp.status(), reqwest::StatusCode::BAD_REQUEST);
    let body: serde_json::Value = resp.json().await.expect("body is json");
    assert_eq!(body["success"], false);
    assert_eq!(body["error"], "INVALID_FILTER");

    assert_eq!(upstream.subscribe_calls.load(Ordering::SeqCst), 0);

    let _ = shutdown.send(());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn subscribe_failure_surfaces_as_a_plain_error_envelope() {
    let upstream = MockUpstream::failing();
    let directory = MockDirectory::new(&[]);
    let (addr, shutdown, _task) = spawn_server(test_app(30, upstream, directory)).await;

    let client = reqwest::Client::new();
    let token = mint_token(&client, addr).await;

    let resp = client
        .get(format!(
            "http://{}/v1/transports/stream?token={}",
            addr, token
        ))
        .send()
        .await
        .expect("request succeeds");

    assert_eq!(resp.status(), reqwest::StatusCode::INTERNAL_SERVER_ERROR);
    let body: serde_json::Value = resp.json().await.expect("body is json");
    assert_eq!(body["success"], false);
    assert_eq!(body["error"], "STREAM_SETUP_FAILED");
    assert!(body["message"].is_string());

    let _ = shutdown.send(());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stream_rejects_missing_and_expired_style_tokens() {
    let (upstream, _events, _cancelled) = MockUpstream::with_feed();
    let directory = MockDirectory::new(&[]);
    let (addr, shutdown, _task) =
        spawn_server(test_app(30, upstream.clone(), directory)).await;

    let client = reqwest::Client::new();

    let resp = client
        .get(format!("http://{}/v1/transports/stream", addr))
        .send()
        .await
        .expect("request succeeds");
    assert_eq!(resp.status(), reqwest::StatusCode::UNAUTHORIZED);

    let resp = client
        .get(format!(
            "http://{}/v1/transports/stream?token=not-a-token",
            addr
        ))
        .send()
        .await
        .expect("request succeeds");
    assert_eq!(resp.status(), reqwest::StatusCode::UNAUTHORIZED);
    let body: serde_json::Value = resp.json().await.expect("body is json");
    assert_eq!(
        body,
        serde_json::json!({"success": false, "error": "UNAUTHORIZED"})
    );

    assert_eq!(upstream.subscribe_calls.load(Ordering::SeqCst), 0);

    let _ = shutdown.send(());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn list_endpoint_maps_and_enriches_with_one_directory_call() {
    let upstream = MockUpstream::with_records(vec![
        RawRecord {
            id: "1".to_string(),
            status: Some(4),
            cancelled_by_id: Some("staff:9".to_string()),
            cancel_reason: Some("patient unavailable".to_string()),
            ..RawRecord::default()
        },
        RawRecord {
            id: "2".to_string(),
            status: Some(4),
            cancelled_by_id: Some("staff:9".to_string()),
            ..RawRecord::default()
        },
        RawRecord {
            id: "3".to_string(),
            status: Some(1),
            ..RawRecord::default()
        },
    ]);
    let directory = MockDirectory::new(&[("staff:9", "Kim, Harin")]);
    let (addr, shutdown, _task) =
        spawn_server(test_app(30, upstream.clone(), directory.clone())).await;

    let client = reqwest::Client::new();
    let resp = client
        .get(format!("http://{}/v1/transports?status=CANCELLED", addr))
        .header("x-porta-principal-id", "staff:1042")
        .send()
        .await
        .expect("request succeeds");

    assert_eq!(resp.status(), reqwest::StatusCode::OK);
    let body: serde_json::Value = resp.json().await.expect("body is json");
    assert_eq!(body["success"], true);

    let data = body["data"].as_array().expect("data is an array");
    assert_eq!(data.len(), 3);
    assert_eq!(data[0]["status"], "CANCELLED");
    assert_eq!(data[0]["cancelledByName"], "Kim, Harin");
    assert_eq!(data[1]["cancelledByName"], "Kim, Harin");
    assert_eq!(data[2]["status"], "WAITING");
    assert!(data[2].get("cancelledByName").is_none());

    assert_eq!(directory.calls.load(Ordering::SeqCst), 1);
    assert_eq!(
        upstream.criteria(),
        Some(SubscriptionCriteria {
            status: Some(TransportStatus::Cancelled),
            ..SubscriptionCriteria::default()
        })
    );

    let _ = shutdown.send(());
}

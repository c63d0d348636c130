use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use porta_contracts::{StreamFrame, SubscriptionCriteria, TransportStatus, UpstreamEvent};
use porta_upstream::{DispatchUpstream, StaffDirectory, Subscription, UpstreamError};
use tokio::sync::mpsc;
use tokio_stream::StreamExt;
use tracing::Instrument;
use ulid::Ulid;

use crate::{enrich, mapper, metrics};

/// SSE comment frame written on the keep-alive cadence. Comments are ignored
/// by EventSource but keep intermediaries from idling out the connection.
const KEEPALIVE_FRAME: &[u8] = b": keep-alive\n\n";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionState {
    Init,
    Subscribing,
    Streaming,
    Closing,
    Closed,
}

impl SessionState {
    fn as_str(self) -> &'static str {
        match self {
            SessionState::Init => "INIT",
            SessionState::Subscribing => "SUBSCRIBING",
            SessionState::Streaming => "STREAMING",
            SessionState::Closing => "CLOSING",
            SessionState::Closed => "CLOSED",
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RelaySettings {
    pub keepalive: Duration,
    pub channel_capacity: usize,
}

/// Per-connection relay session. Owned by exactly one task after spawn; that
/// task is the only writer of `closed`, so teardown cannot race.
struct RelaySession {
    id: Ulid,
    state: SessionState,
    closed: bool,
    events_relayed: u64,
    keepalives_sent: u64,
}

impl RelaySession {
    fn new() -> Self {
        Self {
            id: Ulid::new(),
            state: SessionState::Init,
            closed: false,
            events_relayed: 0,
            keepalives_sent: 0,
        }
    }

    fn transition(&mut self, next: SessionState) {
        tracing::debug!(
            session = %self.id,
            from = self.state.as_str(),
            to = next.as_str(),
            "relay session state change"
        );
        self.state = next;
    }

    /// Idempotent. After the first call every later teardown path is a no-op.
    fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.transition(SessionState::Closed);
    }
}

/// Opens an upstream subscription for `criteria` and spawns the relay pump.
/// Returns the receiving half the HTTP layer streams to the client. A
/// subscribe failure surfaces here, before any response bytes exist, so the
/// caller can still answer with a plain error envelope.
pub async fn open_stream(
    upstream: Arc<dyn DispatchUpstream>,
    directory: Arc<dyn StaffDirectory>,
    criteria: SubscriptionCriteria,
    settings: RelaySettings,
) -> Result<mpsc::Receiver<Bytes>, UpstreamError> {
    let mut session = RelaySession::new();
    let span = tracing::info_span!("relay_session", session = %session.id);

    session.transition(SessionState::Subscribing);
    let subscription = upstream.subscribe(&criteria).await?;

    let (tx, rx) = mpsc::channel(settings.channel_capacity);
    metrics::stream_session_opened();
    tokio::spawn(
        run_session(session, subscription, directory, tx, settings.keepalive).instrument(span),
    );

    Ok(rx)
}

/// The relay pump: single upstream subscription in, framed SSE bytes out.
/// The keep-alive timer lives exactly as long as the streaming phase. The
/// bounded channel is the backpressure boundary; when the client cannot
/// drain it, this task parks on `send` and stops pulling from upstream.
async fn run_session(
    mut session: RelaySession,
    mut subscription: Subscription,
    directory: Arc<dyn StaffDirectory>,
    tx: mpsc::Sender<Bytes>,
    keepalive_period: Duration,
) {
    session.transition(SessionState::Streaming);
    let mut keepalive =
        tokio::time::interval_at(tokio::time::Instant::now() + keepalive_period, keepalive_period);

    enum Step {
        ClientGone,
        Event(Option<Result<UpstreamEvent, UpstreamError>>),
        KeepAlive,
    }

    let outcome = loop {
        // Disconnect wins over pending work so a closed client is observed
        // on the very next iteration.
        let step = tokio::select! {
            biased;
            _ = tx.closed() => Step::ClientGone,
            event = subscription.events.next() => Step::Event(event),
            _ = keepalive.tick() => Step::KeepAlive,
        };

        match step {
            Step::ClientGone => break "client_disconnect",
            Step::Event(Some(Ok(event))) => {
                let Some(frame) = encode_data_frame(project(directory.as_ref(), event).await)
                else {
                    continue;
                };
                if tx.send(frame).await.is_err() {
                    break "client_disconnect";
                }
                session.events_relayed += 1;
                metrics::inc_stream_event();
                keepalive.reset();
            }
            Step::Event(Some(Err(err))) => {
                tracing::warn!(session = %session.id, error = %err, "upstream subscription failed");
                break "upstream_error";
            }
            Step::Event(None) => break "upstream_end",
            Step::KeepAlive => {
                if tx.send(Bytes::from_static(KEEPALIVE_FRAME)).await.is_err() {
                    break "client_disconnect";
                }
                session.keepalives_sent += 1;
                metrics::inc_stream_keepalive();
            }
        }
    };

    session.transition(SessionState::Closing);
    subscription.cancel();
    session.close();
    metrics::stream_session_closed(outcome);
    tracing::info!(
        session = %session.id,
        outcome,
        events = session.events_relayed,
        keepalives = session.keepalives_sent,
        "relay session closed"
    );
}

/// Maps one upstream event to its client frame, resolving `cancelledByName`
/// for cancelled records. Directory trouble degrades to the unenriched view.
async fn project(directory: &dyn StaffDirectory, event: UpstreamEvent) -> StreamFrame {
    let view = mapper::map_record(&event.record);
    let needs_name = view.status.as_deref() == Some(TransportStatus::Cancelled.as_str())
        && view.cancelled_by_id.is_some();

    let data = if needs_name {
        let mut enriched = enrich::enrich(directory, vec![view]).await;
        enriched.pop().unwrap_or_default()
    } else {
        view
    };

    StreamFrame {
        event_type: event.event_type,
        data,
    }
}

fn encode_data_frame(frame: StreamFrame) -> Option<Bytes> {
    let json = match serde_json::to_vec(&frame) {
        Ok(json) => json,
        Err(err) => {
            tracing::warn!(error = %err, "dropping unserializable stream frame");
            return None;
        }
    };

    let mut buf = Vec::with_capacity(json.len() + 8);
    buf.extend_from_slice(b"data: ");
    buf.extend_from_slice(&json);
    buf.extend_from_slice(b"\n\n");
    Some(Bytes::from(buf))
}

use std::collections::{BTreeSet, HashMap};
use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use porta_contracts::{RawRecord, SubscriptionCriteria, UpstreamEvent};
use serde::Deserialize;
use tokio::sync::{mpsc, oneshot};
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::{Stream, StreamExt};

pub type EventStream =
    Pin<Box<dyn Stream<Item = Result<UpstreamEvent, UpstreamError>> + Send + 'static>>;

#[derive(Debug)]
pub enum UpstreamError {
    Timeout,
    Http(reqwest::Error),
    BadStatus(reqwest::StatusCode),
    InvalidFrame,
    InvalidResponse,
}

impl std::fmt::Display for UpstreamError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UpstreamError::Timeout => write!(f, "dispatch service request timed out"),
            UpstreamError::Http(err) => write!(f, "dispatch service HTTP error: {}", err),
            UpstreamError::BadStatus(status) => {
                write!(f, "dispatch service returned status {}", status)
            }
            UpstreamError::InvalidFrame => {
                write!(f, "dispatch service emitted an undecodable event frame")
            }
            UpstreamError::InvalidResponse => {
                write!(f, "dispatch service returned invalid JSON response")
            }
        }
    }
}

impl std::error::Error for UpstreamError {}

impl From<reqwest::Error> for UpstreamError {
    fn from(value: reqwest::Error) -> Self {
        if value.is_timeout() {
            UpstreamError::Timeout
        } else {
            UpstreamError::Http(value)
        }
    }
}

#[derive(Debug)]
pub enum DirectoryError {
    Timeout,
    Http(reqwest::Error),
    BadStatus(reqwest::StatusCode),
    InvalidResponse,
}

impl std::fmt::Display for DirectoryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DirectoryError::Timeout => write!(f, "staff directory request timed out"),
            DirectoryError::Http(err) => write!(f, "staff directory HTTP error: {}", err),
            DirectoryError::BadStatus(status) => {
                write!(f, "staff directory returned status {}", status)
            }
            DirectoryError::InvalidResponse => {
                write!(f, "staff directory returned invalid JSON response")
            }
        }
    }
}

impl std::error::Error for DirectoryError {}

impl From<reqwest::Error> for DirectoryError {
    fn from(value: reqwest::Error) -> Self {
        if value.is_timeout() {
            DirectoryError::Timeout
        } else {
            DirectoryError::Http(value)
        }
    }
}

/// One open server-push subscription. Dropping it cancels the upstream read,
/// so a relay session can never leak its subscription.
pub struct Subscription {
    pub events: EventStream,
    cancel: Option<oneshot::Sender<()>>,
}

impl Subscription {
    pub fn new(events: EventStream, cancel: oneshot::Sender<()>) -> Self {
        Self {
            events,
            cancel: Some(cancel),
        }
    }

    /// Best-effort cancel of the upstream subscription. Idempotent.
    pub fn cancel(&mut self) {
        if let Some(tx) = self.cancel.take() {
            let _ = tx.send(());
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.cancel();
    }
}

/// The backend dispatch service: one server-streaming subscribe operation
/// plus the unary query the batched list endpoint uses.
#[async_trait]
pub trait DispatchUpstream: Send + Sync {
    async fn subscribe(
        &self,
        criteria: &SubscriptionCriteria,
    ) -> Result<Subscription, UpstreamError>;

    async fn list_requests(
        &self,
        criteria: &SubscriptionCriteria,
    ) -> Result<Vec<RawRecord>, UpstreamError>;

    async fn ping(&self) -> Result<(), UpstreamError>;
}

/// Batch-resolves staff ids to display names. The relay only ever issues one
/// lookup per batch, whatever the batch size.
#[async_trait]
pub trait StaffDirectory: Send + Sync {
    async fn display_names(
        &self,
        ids: &BTreeSet<String>,
    ) -> Result<HashMap<String, String>, DirectoryError>;

    async fn ping(&self) -> Result<(), DirectoryError>;
}

#[derive(Debug, Clone)]
pub struct HttpDispatchConfig {
    pub base_url: String,
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
}

/// Dispatch service client speaking newline-delimited JSON over a long-lived
/// HTTP response for subscribe, plain JSON for unary calls.
pub struct HttpDispatchClient {
    base_url: String,
    request_timeout: Duration,
    http: reqwest::Client,
}

impl HttpDispatchClient {
    pub fn new(config: HttpDispatchConfig) -> Result<Self, UpstreamError> {
        // No client-wide timeout: the subscribe response body is unbounded.
        let http = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .build()
            .map_err(UpstreamError::Http)?;

        Ok(Self {
            base_url: config.base_url.trim_end_matches('/').to_string(),
            request_timeout: config.request_timeout,
            http,
        })
    }
}

#[async_trait]
impl DispatchUpstream for HttpDispatchClient {
    async fn subscribe(
        &self,
        criteria: &SubscriptionCriteria,
    ) -> Result<Subscription, UpstreamError> {
        let resp = self
            .http
            .post(format!("{}/v1/transport-requests/subscribe", self.base_url))
            .json(criteria)
            .send()
            .await?;

        if !resp.status().is_success() {
            return Err(UpstreamError::BadStatus(resp.status()));
        }

        let (cancel_tx, cancel_rx) = oneshot::channel();
        let (event_tx, event_rx) = mpsc::channel(16);
        tokio::spawn(pump_event_frames(resp, event_tx, cancel_rx));

        Ok(Subscription::new(
            Box::pin(ReceiverStream::new(event_rx)),
            cancel_tx,
        ))
    }

    async fn list_requests(
        &self,
        criteria: &SubscriptionCriteria,
    ) -> Result<Vec<RawRecord>, UpstreamError> {
        let resp = self
            .http
            .post(format!("{}/v1/transport-requests/query", self.base_url))
            .timeout(self.request_timeout)
            .json(criteria)
            .send()
            .await?;

        if !resp.status().is_success() {
            return Err(UpstreamError::BadStatus(resp.status()));
        }

        resp.json::<Vec<RawRecord>>()
            .await
            .map_err(|_| UpstreamError::InvalidResponse)
    }

    async fn ping(&self) -> Result<(), UpstreamError> {
        let resp = self
            .http
            .get(format!("{}/healthz", self.base_url))
            .timeout(self.request_timeout)
            .send()
            .await?;

        if !resp.status().is_success() {
            return Err(UpstreamError::BadStatus(resp.status()));
        }
        Ok(())
    }
}

/// Reads the chunked subscribe body, reframes it into newline-delimited JSON
/// events, and forwards them until cancel, upstream end, or a dead receiver.
async fn pump_event_frames(
    resp: reqwest::Response,
    events: mpsc::Sender<Result<UpstreamEvent, UpstreamError>>,
    mut cancel: oneshot::Receiver<()>,
) {
    let mut body = resp.bytes_stream();
    let mut decoder = FrameDecoder::new();

    loop {
        let chunk = tokio::select! {
            // Returning drops the response, which aborts the connection.
            _ = &mut cancel => return,
            chunk = body.next() => chunk,
        };

        match chunk {
            Some(Ok(bytes)) => {
                for frame in decoder.push(&bytes) {
                    let event = serde_json::from_slice::<UpstreamEvent>(&frame)
                        .map_err(|_| UpstreamError::InvalidFrame);
                    let undecodable = event.is_err();
                    if undecodable {
                        tracing::warn!("ending subscription after undecodable event frame");
                    }
                    if events.send(event).await.is_err() {
                        return;
                    }
                    if undecodable {
                        return;
                    }
                }
            }
            Some(Err(err)) => {
                let _ = events.send(Err(UpstreamError::from(err))).await;
                return;
            }
            // Upstream ended the stream; closing the channel signals end.
            None => return,
        }
    }
}

/// Splits an arbitrary chunk sequence into newline-terminated frames. Frames
/// may span chunks; blank lines are skipped.
struct FrameDecoder {
    buf: Vec<u8>,
}

impl FrameDecoder {
    fn new() -> Self {
        Self { buf: Vec::new() }
    }

    fn push(&mut self, chunk: &[u8]) -> Vec<Vec<u8>> {
        self.buf.extend_from_slice(chunk);

        let mut frames = Vec::new();
        while let Some(pos) = self.buf.iter().position(|b| *b == b'\n') {
            let mut line: Vec<u8> = self.buf.drain(..=pos).collect();
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            if !line.iter().all(u8::is_ascii_whitespace) {
                frames.push(line);
            }
        }
        frames
    }
}

#[derive(Debug, Clone)]
pub struct HttpStaffDirectoryConfig {
    pub base_url: String,
    pub timeout: Duration,
}

pub struct HttpStaffDirectory {
    base_url: String,
    http: reqwest::Client,
}

#[derive(Debug, Deserialize)]
struct DisplayNamesResponse {
    names: HashMap<String, String>,
}

impl HttpStaffDirectory {
    pub fn new(config: HttpStaffDirectoryConfig) -> Result<Self, DirectoryError> {
        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(DirectoryError::Http)?;

        Ok(Self {
            base_url: config.base_url.trim_end_matches('/').to_string(),
            http,
        })
    }
}

#[async_trait]
impl StaffDirectory for HttpStaffDirectory {
    async fn display_names(
        &self,
        ids: &BTreeSet<String>,
    ) -> Result<HashMap<String, String>, DirectoryError> {
        let resp = self
            .http
            .post(format!("{}/v1/staff/display-names", self.base_url))
            .json(&serde_json::json!({ "ids": ids }))
            .send()
            .await?;

        if !resp.status().is_success() {
            return Err(DirectoryError::BadStatus(resp.status()));
        }

        resp.json::<DisplayNamesResponse>()
            .await
            .map(|decoded| decoded.names)
            .map_err(|_| DirectoryError::InvalidResponse)
    }

    async fn ping(&self) -> Result<(), DirectoryError> {
        let resp = self
            .http
            .get(format!("{}/healthz", self.base_url))
            .send()
            .await?;

        if !resp.status().is_success() {
            return Err(DirectoryError::BadStatus(resp.status()));
        }
        Ok(())
    }
}

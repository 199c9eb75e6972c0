//! Persistent queue coordinator channel.
//!
//! One channel is opened per job ticket. A single spawned task owns the
//! WebSocket connection for the channel's whole life and replaces it
//! wholesale after every drop, so an event from a stale connection can
//! never be forwarded once a replacement is open. The completion cell
//! settles at most once across all reconnects.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::{Mutex as AsyncMutex, Notify, mpsc, oneshot};
use tokio::time::sleep;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use url::Url;

use crate::protocol::{QueueEvent, RemoteAnswer};

mod settle;
use settle::Settle;

/// Ordered stream of session events shared by the queue channel and the
/// telemetry ingestor.
pub type EventSink = mpsc::UnboundedSender<QueueEvent>;

/// Payload of the keepalive probe. The coordinator reads and discards it;
/// the probe only keeps intermediaries from idling the socket out.
const KEEPALIVE_PAYLOAD: &str = "ping";

#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// WebSocket base of the coordinator (`ws://...` or `wss://...`).
    pub endpoint: Url,
    pub keepalive_interval: Duration,
    pub reconnect_delay: Duration,
}

impl QueueConfig {
    pub fn new(endpoint: Url) -> Self {
        Self {
            endpoint,
            keepalive_interval: Duration::from_secs(15),
            reconnect_delay: Duration::from_millis(400),
        }
    }
}

#[derive(Debug, Error)]
pub enum QueueError {
    /// The coordinator reported a failure for this job; the reason is
    /// forwarded verbatim.
    #[error("{0}")]
    Remote(String),
    #[error("completion already claimed")]
    CompletionClaimed,
    #[error("queue channel closed")]
    Closed,
    #[error("invalid queue endpoint: {0}")]
    Endpoint(String),
}

/// Handle to one queue attempt. Cheap to share; `close` may be called from
/// any task, any number of times.
#[derive(Debug)]
pub struct QueueChannel {
    shared: Arc<Shared>,
    completion: AsyncMutex<Option<oneshot::Receiver<Result<RemoteAnswer, QueueError>>>>,
}

#[derive(Debug)]
struct Shared {
    job_id: String,
    url: Url,
    config: QueueConfig,
    closed: AtomicBool,
    close_notify: Notify,
    settle: Settle<Result<RemoteAnswer, QueueError>>,
    events: EventSink,
}

impl Shared {
    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn mark_closed(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    fn forward(&self, event: QueueEvent) {
        // The consumer may have dropped its receiver; that never affects
        // channel state.
        let _ = self.events.send(event);
    }
}

impl QueueChannel {
    /// Connect to the coordinator for `job_id` and start forwarding events
    /// to `events`. The connection attempt itself happens on the spawned
    /// task; failures there feed the reconnect policy instead of this call.
    pub fn open(
        config: QueueConfig,
        job_id: impl Into<String>,
        events: EventSink,
    ) -> Result<Arc<Self>, QueueError> {
        let job_id = job_id.into();
        let url = queue_url(&config.endpoint, &job_id)?;
        let (settle, completion_rx) = Settle::channel();

        let shared = Arc::new(Shared {
            job_id,
            url,
            config,
            closed: AtomicBool::new(false),
            close_notify: Notify::new(),
            settle,
            events,
        });

        tokio::spawn(run(Arc::clone(&shared)));

        Ok(Arc::new(Self {
            shared,
            completion: AsyncMutex::new(Some(completion_rx)),
        }))
    }

    pub fn job_id(&self) -> &str {
        &self.shared.job_id
    }

    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }

    /// Wait for the terminal outcome of this attempt. Claimable once; the
    /// future stays pending forever if the coordinator stops gracefully
    /// without an answer or the channel is closed locally.
    pub async fn completion(&self) -> Result<RemoteAnswer, QueueError> {
        let receiver = self
            .completion
            .lock()
            .await
            .take()
            .ok_or(QueueError::CompletionClaimed)?;
        match receiver.await {
            Ok(outcome) => outcome,
            Err(_) => Err(QueueError::Closed),
        }
    }

    /// Idempotent close: suppresses any further reconnect, wakes the
    /// connection task, and lets it drop the socket. Transport-level close
    /// errors are swallowed.
    pub fn close(&self) {
        if !self.shared.closed.swap(true, Ordering::SeqCst) {
            tracing::debug!(
                target = "queue",
                job_id = %self.shared.job_id,
                "queue channel closed by caller"
            );
        }
        self.shared.close_notify.notify_one();
    }
}

impl Drop for QueueChannel {
    fn drop(&mut self) {
        self.close();
    }
}

fn queue_url(endpoint: &Url, job_id: &str) -> Result<Url, QueueError> {
    let mut url = endpoint.clone();
    {
        let mut segments = url
            .path_segments_mut()
            .map_err(|_| QueueError::Endpoint(format!("cannot-be-a-base url {endpoint}")))?;
        segments.pop_if_empty();
        segments.push("queue");
        segments.push(job_id);
    }
    Ok(url)
}

async fn run(shared: Arc<Shared>) {
    let mut attempt: u64 = 0;
    while !shared.is_closed() {
        attempt += 1;
        tracing::debug!(
            target = "queue",
            job_id = %shared.job_id,
            attempt,
            url = %shared.url,
            "connecting to queue coordinator"
        );
        match connect_async(shared.url.as_str()).await {
            Ok((socket, _)) => {
                tracing::debug!(target = "queue", job_id = %shared.job_id, attempt, "queue transport connected");
                drive(&shared, socket).await;
            }
            Err(err) => {
                tracing::debug!(
                    target = "queue",
                    job_id = %shared.job_id,
                    attempt,
                    error = %err,
                    "queue transport connect failed"
                );
            }
        }

        if shared.is_closed() || shared.settle.is_settled() {
            break;
        }

        tracing::debug!(
            target = "queue",
            job_id = %shared.job_id,
            delay_ms = shared.config.reconnect_delay.as_millis() as u64,
            "scheduling queue reconnect"
        );
        tokio::select! {
            _ = sleep(shared.config.reconnect_delay) => {}
            _ = shared.close_notify.notified() => break,
        }
    }
    tracing::debug!(target = "queue", job_id = %shared.job_id, "queue channel task finished");
}

/// Pump one connection until it drops, a terminal event arrives, or the
/// channel is closed. Returning drops the socket, which is the only
/// transport close we attempt; errors on the way out are irrelevant.
async fn drive(shared: &Arc<Shared>, socket: WebSocketStream<MaybeTlsStream<TcpStream>>) {
    let (mut sink, mut stream) = socket.split();
    // First probe one full interval after connect, not immediately.
    let mut keepalive = tokio::time::interval_at(
        tokio::time::Instant::now() + shared.config.keepalive_interval,
        shared.config.keepalive_interval,
    );

    loop {
        if shared.is_closed() {
            let _ = sink.send(Message::Close(None)).await;
            return;
        }
        tokio::select! {
            _ = shared.close_notify.notified() => {
                let _ = sink.send(Message::Close(None)).await;
                return;
            }
            _ = keepalive.tick() => {
                if let Err(err) = sink.send(Message::Text(KEEPALIVE_PAYLOAD.to_string())).await {
                    // Best effort; the transport's own liveness detection
                    // decides when the connection is gone.
                    tracing::trace!(
                        target = "queue",
                        job_id = %shared.job_id,
                        error = %err,
                        "keepalive probe failed"
                    );
                }
            }
            frame = stream.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    if handle_frame(shared, text.as_bytes()) {
                        return;
                    }
                }
                Some(Ok(Message::Binary(data))) => {
                    if handle_frame(shared, &data) {
                        return;
                    }
                }
                Some(Ok(Message::Close(_))) | None => {
                    tracing::debug!(
                        target = "queue",
                        job_id = %shared.job_id,
                        "queue transport closed by remote"
                    );
                    return;
                }
                Some(Ok(_)) => {}
                Some(Err(err)) => {
                    tracing::debug!(
                        target = "queue",
                        job_id = %shared.job_id,
                        error = %err,
                        "queue transport error"
                    );
                    return;
                }
            }
        }
    }
}

/// Parse and dispatch one inbound frame. Returns true when the frame was
/// terminal for the channel.
fn handle_frame(shared: &Shared, raw: &[u8]) -> bool {
    let event: QueueEvent = match serde_json::from_slice(raw) {
        Ok(event) => event,
        Err(err) => {
            // Unknown or partial frames are dropped on purpose.
            tracing::trace!(
                target = "queue",
                job_id = %shared.job_id,
                error = %err,
                "discarding unparseable queue frame"
            );
            return false;
        }
    };

    shared.forward(event.clone());

    match event {
        QueueEvent::Answer { sdp } => {
            shared.mark_closed();
            if shared.settle.settle(Ok(RemoteAnswer { sdp })) {
                tracing::info!(target = "queue", job_id = %shared.job_id, "answer received");
            } else {
                tracing::debug!(
                    target = "queue",
                    job_id = %shared.job_id,
                    "duplicate answer forwarded without re-settling"
                );
            }
            true
        }
        QueueEvent::Error { reason } => {
            shared.mark_closed();
            if shared.settle.settle(Err(QueueError::Remote(reason.clone()))) {
                tracing::warn!(
                    target = "queue",
                    job_id = %shared.job_id,
                    reason = %reason,
                    "coordinator reported failure"
                );
            }
            true
        }
        QueueEvent::Done => {
            // Graceful stop: the channel closes but the completion cell is
            // left untouched, so a caller still waiting stays pending.
            tracing::info!(
                target = "queue",
                job_id = %shared.job_id,
                "coordinator reported done; closing without an answer"
            );
            shared.mark_closed();
            true
        }
        QueueEvent::QueuePosition { .. } | QueueEvent::Assigned { .. } | QueueEvent::Logs { .. } => {
            false
        }
    }
}

//! Queue channel behavior against a scripted coordinator stub.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use axum::Router;
use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::response::IntoResponse;
use axum::routing::get;
use futures_util::future::BoxFuture;
use serde_json::json;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{sleep, timeout};
use url::Url;

use lookout::protocol::QueueEvent;
use lookout::queue::{QueueChannel, QueueConfig, QueueError};

#[derive(Default)]
struct Coordinator {
    connections: AtomicUsize,
    pings: AtomicUsize,
}

impl Coordinator {
    fn connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    fn pings(&self) -> usize {
        self.pings.load(Ordering::SeqCst)
    }
}

type Script =
    Arc<dyn Fn(usize, WebSocket, Arc<Coordinator>) -> BoxFuture<'static, ()> + Send + Sync>;

#[derive(Clone)]
struct AppState {
    coordinator: Arc<Coordinator>,
    script: Script,
}

fn script<F, Fut>(f: F) -> Script
where
    F: Fn(usize, WebSocket, Arc<Coordinator>) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = ()> + Send + 'static,
{
    Arc::new(move |attempt, socket, coordinator| Box::pin(f(attempt, socket, coordinator)))
}

async fn queue_ws(
    ws: WebSocketUpgrade,
    Path(_job_id): Path<String>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    let AppState {
        coordinator,
        script,
    } = state;
    let attempt = coordinator.connections.fetch_add(1, Ordering::SeqCst);
    ws.on_upgrade(move |socket| (*script)(attempt, socket, coordinator))
}

async fn start_coordinator(script: Script) -> (Url, Arc<Coordinator>, oneshot::Sender<()>) {
    let coordinator = Arc::new(Coordinator::default());
    let state = AppState {
        coordinator: Arc::clone(&coordinator),
        script,
    };
    let router = Router::new()
        .route("/queue/:job_id", get(queue_ws))
        .with_state(state);

    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind stub");
    let addr = listener.local_addr().expect("stub addr");
    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    tokio::spawn(async move {
        axum::serve(listener, router)
            .with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
            })
            .await
            .ok();
    });

    let endpoint = Url::parse(&format!("ws://{addr}")).expect("stub url");
    (endpoint, coordinator, shutdown_tx)
}

fn fast_config(endpoint: Url) -> QueueConfig {
    let mut config = QueueConfig::new(endpoint);
    config.keepalive_interval = Duration::from_millis(100);
    config.reconnect_delay = Duration::from_millis(100);
    config
}

async fn send_event(socket: &mut WebSocket, payload: serde_json::Value) {
    socket
        .send(WsMessage::Text(payload.to_string()))
        .await
        .expect("stub send");
}

async fn drain(mut socket: WebSocket, coordinator: Arc<Coordinator>) {
    while let Some(Ok(message)) = socket.recv().await {
        if let WsMessage::Text(text) = message {
            if text == "ping" {
                coordinator.pings.fetch_add(1, Ordering::SeqCst);
            }
        }
    }
}

async fn next_event(rx: &mut mpsc::UnboundedReceiver<QueueEvent>) -> QueueEvent {
    timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("timed out waiting for event")
        .expect("event stream ended")
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
    while !condition() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not met in time"
        );
        sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::test]
async fn delivers_events_in_order_and_resolves_with_answer() {
    let (endpoint, coordinator, _shutdown) = start_coordinator(script(
        |_attempt, mut socket, coordinator| async move {
            send_event(&mut socket, json!({"type": "queue_position", "position": 2})).await;
            send_event(&mut socket, json!({"type": "assigned", "worker_id": "w1"})).await;
            send_event(&mut socket, json!({"type": "answer", "sdp": "v=0..."})).await;
            drain(socket, coordinator).await;
        },
    ))
    .await;

    let (events, mut rx) = mpsc::unbounded_channel();
    let channel = QueueChannel::open(fast_config(endpoint), "job-1", events).expect("open");

    let answer = channel.completion().await.expect("completion");
    assert_eq!(answer.sdp, "v=0...");

    assert_eq!(
        next_event(&mut rx).await,
        QueueEvent::QueuePosition { position: 2 }
    );
    assert_eq!(
        next_event(&mut rx).await,
        QueueEvent::Assigned {
            worker_id: "w1".into()
        }
    );
    assert_eq!(
        next_event(&mut rx).await,
        QueueEvent::Answer { sdp: "v=0...".into() }
    );
    assert!(
        timeout(Duration::from_millis(200), rx.recv()).await.is_err(),
        "no events expected beyond the delivered three"
    );

    assert!(channel.is_closed());
    assert_eq!(coordinator.connections(), 1);
}

#[tokio::test]
async fn error_event_rejects_with_verbatim_reason_and_stops_reconnecting() {
    let (endpoint, coordinator, _shutdown) = start_coordinator(script(
        |_attempt, mut socket, coordinator| async move {
            send_event(
                &mut socket,
                json!({"type": "error", "reason": "no workers available"}),
            )
            .await;
            drain(socket, coordinator).await;
        },
    ))
    .await;

    let (events, mut rx) = mpsc::unbounded_channel();
    let channel = QueueChannel::open(fast_config(endpoint), "job-1", events).expect("open");

    let err = channel.completion().await.expect_err("must reject");
    match &err {
        QueueError::Remote(reason) => assert_eq!(reason, "no workers available"),
        other => panic!("unexpected error {other:?}"),
    }
    // The reason is forwarded to the sink before the channel closes.
    assert_eq!(
        next_event(&mut rx).await,
        QueueEvent::Error {
            reason: "no workers available".into()
        }
    );

    sleep(Duration::from_millis(400)).await;
    assert_eq!(coordinator.connections(), 1, "no reconnect after rejection");
}

#[tokio::test]
async fn reconnects_once_after_drop_then_done_leaves_completion_pending() {
    let (endpoint, coordinator, _shutdown) = start_coordinator(script(
        |attempt, mut socket, coordinator| async move {
            if attempt == 0 {
                // Drop the transport before any terminal event.
                return;
            }
            send_event(&mut socket, json!({"type": "done"})).await;
            drain(socket, coordinator).await;
        },
    ))
    .await;

    let (events, mut rx) = mpsc::unbounded_channel();
    let channel = QueueChannel::open(fast_config(endpoint), "job-1", events).expect("open");

    assert_eq!(next_event(&mut rx).await, QueueEvent::Done);
    {
        let coordinator = Arc::clone(&coordinator);
        wait_until(move || coordinator.connections() == 2).await;
    }
    {
        let channel = Arc::clone(&channel);
        wait_until(move || channel.is_closed()).await;
    }

    // A graceful stop settles nothing: the completion stays pending.
    assert!(
        timeout(Duration::from_millis(300), channel.completion())
            .await
            .is_err()
    );
}

#[tokio::test]
async fn repeated_drops_settle_exactly_once_on_terminal_event() {
    let (endpoint, coordinator, _shutdown) = start_coordinator(script(
        |attempt, mut socket, coordinator| async move {
            if attempt < 3 {
                return;
            }
            send_event(&mut socket, json!({"type": "answer", "sdp": "v=0"})).await;
            drain(socket, coordinator).await;
        },
    ))
    .await;

    let (events, _rx) = mpsc::unbounded_channel();
    let channel = QueueChannel::open(fast_config(endpoint), "job-1", events).expect("open");

    let answer = channel.completion().await.expect("completion");
    assert_eq!(answer.sdp, "v=0");
    assert_eq!(coordinator.connections(), 4);

    // Settled and closed: the reconnect loop must be done for good.
    sleep(Duration::from_millis(400)).await;
    assert_eq!(coordinator.connections(), 4);
}

#[tokio::test]
async fn reconnects_indefinitely_until_closed() {
    let (endpoint, coordinator, _shutdown) =
        start_coordinator(script(|_attempt, _socket, _coordinator| async move {
            // Drop every connection immediately.
        }))
        .await;

    let (events, _rx) = mpsc::unbounded_channel();
    let channel = QueueChannel::open(fast_config(endpoint), "job-1", events).expect("open");

    {
        let coordinator = Arc::clone(&coordinator);
        wait_until(move || coordinator.connections() >= 3).await;
    }

    channel.close();
    sleep(Duration::from_millis(150)).await;
    let settled = coordinator.connections();
    sleep(Duration::from_millis(400)).await;
    assert_eq!(
        coordinator.connections(),
        settled,
        "no connection attempts after close"
    );
}

#[tokio::test]
async fn close_during_backoff_cancels_the_pending_reconnect() {
    let (endpoint, coordinator, _shutdown) =
        start_coordinator(script(|_attempt, _socket, _coordinator| async move {}))
            .await;

    let mut config = fast_config(endpoint);
    config.reconnect_delay = Duration::from_millis(500);

    let (events, _rx) = mpsc::unbounded_channel();
    let channel = QueueChannel::open(config, "job-1", events).expect("open");

    {
        let coordinator = Arc::clone(&coordinator);
        wait_until(move || coordinator.connections() == 1).await;
    }
    // Now inside the backoff window.
    sleep(Duration::from_millis(100)).await;
    channel.close();

    sleep(Duration::from_millis(900)).await;
    assert_eq!(coordinator.connections(), 1);
}

#[tokio::test]
async fn malformed_frames_are_dropped_without_disturbing_the_stream() {
    let (endpoint, _coordinator, _shutdown) = start_coordinator(script(
        |_attempt, mut socket, coordinator| async move {
            socket
                .send(WsMessage::Text("not json at all".into()))
                .await
                .ok();
            send_event(&mut socket, json!({"type": "bogus"})).await;
            send_event(&mut socket, json!({"type": "queue_position", "position": -1})).await;
            socket.send(WsMessage::Binary(vec![0xff, 0x00])).await.ok();
            send_event(&mut socket, json!({"type": "queue_position", "position": 1})).await;
            send_event(&mut socket, json!({"type": "answer", "sdp": "v=0"})).await;
            drain(socket, coordinator).await;
        },
    ))
    .await;

    let (events, mut rx) = mpsc::unbounded_channel();
    let channel = QueueChannel::open(fast_config(endpoint), "job-1", events).expect("open");

    let answer = channel.completion().await.expect("completion");
    assert_eq!(answer.sdp, "v=0");

    assert_eq!(
        next_event(&mut rx).await,
        QueueEvent::QueuePosition { position: 1 }
    );
    assert_eq!(next_event(&mut rx).await, QueueEvent::Answer { sdp: "v=0".into() });
    assert!(
        timeout(Duration::from_millis(200), rx.recv()).await.is_err(),
        "malformed frames must not appear in the event stream"
    );
}

#[tokio::test]
async fn keepalive_probes_flow_while_connected() {
    let (endpoint, coordinator, _shutdown) =
        start_coordinator(script(|_attempt, socket, coordinator| async move {
            drain(socket, coordinator).await;
        }))
        .await;

    let (events, _rx) = mpsc::unbounded_channel();
    let channel = QueueChannel::open(fast_config(endpoint), "job-1", events).expect("open");

    {
        let coordinator = Arc::clone(&coordinator);
        wait_until(move || coordinator.pings() >= 2).await;
    }
    channel.close();
}

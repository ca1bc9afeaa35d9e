#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use axum::Router;
use axum::extract::State;
use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::response::IntoResponse;
use axum::routing::get;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio::sync::{Mutex as AsyncMutex, Notify, mpsc, oneshot};
use tokio::time::{Instant, sleep, timeout};
use tracing::debug;
use tracing_subscriber::{EnvFilter, fmt::SubscriberBuilder};

pub const WAIT: Duration = Duration::from_secs(5);

pub fn init_tracing() {
    let _ = SubscriberBuilder::default()
        .with_test_writer()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init();
}

/// Polls `check` until it holds or the wait budget runs out.
pub async fn eventually<F>(what: &str, check: F)
where
    F: Fn() -> bool,
{
    let deadline = Instant::now() + WAIT;
    while !check() {
        if Instant::now() >= deadline {
            panic!("timed out waiting for {what}");
        }
        sleep(Duration::from_millis(10)).await;
    }
}

async fn serve(router: Router) -> (SocketAddr, oneshot::Sender<()>) {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("listener bind");
    let addr = listener.local_addr().expect("local addr");
    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    tokio::spawn(async move {
        axum::serve(listener, router)
            .with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
            })
            .await
            .ok();
    });
    (addr, shutdown_tx)
}

fn send_json(tx: &mpsc::UnboundedSender<WsMessage>, value: Value) {
    if let Ok(text) = serde_json::to_string(&value) {
        let _ = tx.send(WsMessage::Text(text));
    }
}

/// Tracks the peers of a stub server and how many have ever connected.
#[derive(Default)]
struct Peers {
    current: Mutex<Option<mpsc::UnboundedSender<WsMessage>>>,
    connections: AtomicUsize,
    changed: Notify,
}

impl Peers {
    fn attach(&self, tx: mpsc::UnboundedSender<WsMessage>) {
        *self.current.lock() = Some(tx);
        self.connections.fetch_add(1, Ordering::SeqCst);
        self.changed.notify_waiters();
    }

    fn detach(&self) {
        self.changed.notify_waiters();
    }

    fn sender(&self) -> Option<mpsc::UnboundedSender<WsMessage>> {
        self.current.lock().clone()
    }

    async fn wait_for(&self, count: usize) {
        let wait = async {
            loop {
                let notified = self.changed.notified();
                if self.connections.load(Ordering::SeqCst) >= count {
                    return;
                }
                notified.await;
            }
        };
        timeout(WAIT, wait)
            .await
            .unwrap_or_else(|_| panic!("timed out waiting for connection #{count}"));
    }
}

struct SignalingState {
    peers: Peers,
    inbound: mpsc::UnboundedSender<Value>,
}

/// Minimal signaling server: acknowledges registrations like the real one
/// and otherwise hands every gateway message to the test.
pub struct SignalingStub {
    addr: SocketAddr,
    state: Arc<SignalingState>,
    inbound: AsyncMutex<mpsc::UnboundedReceiver<Value>>,
    _shutdown: oneshot::Sender<()>,
}

impl SignalingStub {
    pub async fn start() -> Self {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let state = Arc::new(SignalingState {
            peers: Peers::default(),
            inbound: inbound_tx,
        });
        let router = Router::new()
            .route("/ws", get(signaling_upgrade))
            .with_state(state.clone());
        let (addr, shutdown) = serve(router).await;
        Self {
            addr,
            state,
            inbound: AsyncMutex::new(inbound_rx),
            _shutdown: shutdown,
        }
    }

    pub fn url(&self) -> String {
        format!("ws://{}/ws", self.addr)
    }

    pub fn connections(&self) -> usize {
        self.state.peers.connections.load(Ordering::SeqCst)
    }

    pub async fn wait_for_connections(&self, count: usize) {
        self.state.peers.wait_for(count).await;
    }

    pub fn send(&self, value: Value) {
        let tx = self.state.peers.sender().expect("gateway connected");
        send_json(&tx, value);
    }

    /// Closes the current control connection from the server side.
    pub fn drop_connection(&self) {
        if let Some(tx) = self.state.peers.current.lock().take() {
            let _ = tx.send(WsMessage::Close(None));
        }
    }

    pub async fn recv(&self) -> Value {
        let mut inbound = self.inbound.lock().await;
        timeout(WAIT, inbound.recv())
            .await
            .expect("timed out waiting for gateway message")
            .expect("signaling stub closed")
    }

    /// Next gateway message of the given type; other types are skipped.
    pub async fn recv_type(&self, kind: &str) -> Value {
        loop {
            let message = self.recv().await;
            if message.get("type").and_then(Value::as_str) == Some(kind) {
                return message;
            }
            debug!("stub: skipping {message}");
        }
    }

    /// Asserts that no message of the given type arrives within `window`.
    pub async fn expect_none(&self, kind: &str, window: Duration) {
        let mut inbound = self.inbound.lock().await;
        let deadline = Instant::now() + window;
        while let Ok(Some(message)) = timeout(deadline.saturating_duration_since(Instant::now()), inbound.recv()).await {
            assert_ne!(
                message.get("type").and_then(Value::as_str),
                Some(kind),
                "unexpected {message}"
            );
        }
    }

    pub fn connect_client(&self, session_id: &str) {
        self.send(json!({ "type": "client-connected", "sessionId": session_id }));
    }

    pub fn disconnect_client(&self, session_id: &str) {
        self.send(json!({ "type": "client-disconnected", "sessionId": session_id }));
    }
}

async fn signaling_upgrade(
    ws: WebSocketUpgrade,
    State(state): State<Arc<SignalingState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_signaling_socket(socket, state))
}

async fn handle_signaling_socket(socket: WebSocket, state: Arc<SignalingState>) {
    let (mut sender, mut receiver) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<WsMessage>();

    let send_task = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            let closing = matches!(message, WsMessage::Close(_));
            if sender.send(message).await.is_err() || closing {
                break;
            }
        }
    });
    state.peers.attach(tx.clone());

    while let Some(Ok(message)) = receiver.next().await {
        let WsMessage::Text(text) = message else {
            continue;
        };
        let Ok(value) = serde_json::from_str::<Value>(&text) else {
            continue;
        };
        if value.get("type").and_then(Value::as_str) == Some("register-server") {
            let remote_id = value
                .get("remoteId")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_uppercase();
            send_json(&tx, json!({ "type": "registered", "remoteId": remote_id }));
        }
        let _ = state.inbound.send(value);
    }

    send_task.abort();
    state.peers.detach();
}

struct LocalState {
    peers: Peers,
    received: mpsc::UnboundedSender<String>,
    closed: AtomicUsize,
}

/// Stand-in for the local message endpoint.
pub struct LocalStub {
    addr: SocketAddr,
    state: Arc<LocalState>,
    received: AsyncMutex<mpsc::UnboundedReceiver<String>>,
    _shutdown: oneshot::Sender<()>,
}

impl LocalStub {
    pub async fn start() -> Self {
        let (received_tx, received_rx) = mpsc::unbounded_channel();
        let state = Arc::new(LocalState {
            peers: Peers::default(),
            received: received_tx,
            closed: AtomicUsize::new(0),
        });
        let router = Router::new()
            .route("/ws", get(local_upgrade))
            .with_state(state.clone());
        let (addr, shutdown) = serve(router).await;
        Self {
            addr,
            state,
            received: AsyncMutex::new(received_rx),
            _shutdown: shutdown,
        }
    }

    pub fn url(&self) -> String {
        format!("ws://{}/ws", self.addr)
    }

    pub fn connections(&self) -> usize {
        self.state.peers.connections.load(Ordering::SeqCst)
    }

    pub fn closed(&self) -> usize {
        self.state.closed.load(Ordering::SeqCst)
    }

    pub async fn wait_for_connections(&self, count: usize) {
        self.state.peers.wait_for(count).await;
    }

    /// Sends a text frame on the most recent connection.
    pub fn send(&self, text: &str) {
        let tx = self.state.peers.sender().expect("local client connected");
        let _ = tx.send(WsMessage::Text(text.to_string()));
    }

    /// Closes the most recent connection from the endpoint side.
    pub fn close_latest(&self) {
        if let Some(tx) = self.state.peers.current.lock().take() {
            let _ = tx.send(WsMessage::Close(None));
        }
    }

    pub async fn recv(&self) -> String {
        let mut received = self.received.lock().await;
        timeout(WAIT, received.recv())
            .await
            .expect("timed out waiting for local message")
            .expect("local stub closed")
    }
}

async fn local_upgrade(
    ws: WebSocketUpgrade,
    State(state): State<Arc<LocalState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_local_socket(socket, state))
}

async fn handle_local_socket(socket: WebSocket, state: Arc<LocalState>) {
    let (mut sender, mut receiver) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<WsMessage>();

    let send_task = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            if sender.send(message).await.is_err() {
                break;
            }
        }
    });
    state.peers.attach(tx);

    while let Some(Ok(message)) = receiver.next().await {
        match message {
            WsMessage::Text(text) => {
                let _ = state.received.send(text);
            }
            WsMessage::Close(_) => break,
            _ => {}
        }
    }

    send_task.abort();
    state.closed.fetch_add(1, Ordering::SeqCst);
    state.peers.detach();
}

/// An address nothing listens on.
pub async fn unused_local_url() -> String {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("listener bind");
    let addr = listener.local_addr().expect("local addr");
    drop(listener);
    format!("ws://{addr}/ws")
}

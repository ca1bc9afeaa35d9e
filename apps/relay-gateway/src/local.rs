use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, trace, warn};
use url::Url;

#[derive(Debug, Error)]
pub enum LocalEndpointError {
    #[error("local endpoint connect failed: {0}")]
    Connect(String),
    #[error("local endpoint is closed")]
    Closed,
}

/// Frames queued towards the local endpoint.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LocalFrame {
    Text(String),
    Close,
}

/// Opens the per-session connection to the local message endpoint.
#[async_trait]
pub trait LocalConnector: Send + Sync {
    async fn connect(&self, session_id: &str) -> Result<LocalEndpoint, LocalEndpointError>;
}

/// An open, duplex text connection to the local endpoint.
pub struct LocalEndpoint {
    sink: LocalSink,
    stream: mpsc::UnboundedReceiver<String>,
}

impl LocalEndpoint {
    /// `outbound` feeds the task that owns the connection; `inbound` yields
    /// messages from the endpoint and ends when the endpoint closes.
    pub fn new(
        outbound: mpsc::UnboundedSender<LocalFrame>,
        inbound: mpsc::UnboundedReceiver<String>,
    ) -> Self {
        Self {
            sink: LocalSink { tx: outbound },
            stream: inbound,
        }
    }

    pub fn split(self) -> (LocalSink, mpsc::UnboundedReceiver<String>) {
        (self.sink, self.stream)
    }
}

/// Sending half of a [`LocalEndpoint`]. Dropping it ends the connection
/// once queued frames are flushed.
pub struct LocalSink {
    tx: mpsc::UnboundedSender<LocalFrame>,
}

impl LocalSink {
    pub fn is_open(&self) -> bool {
        !self.tx.is_closed()
    }

    pub fn send(&self, text: String) -> Result<(), LocalEndpointError> {
        self.tx
            .send(LocalFrame::Text(text))
            .map_err(|_| LocalEndpointError::Closed)
    }

    /// Requests a close handshake. Idempotent.
    pub fn close(&self) -> Result<(), LocalEndpointError> {
        if !self.is_open() {
            return Ok(());
        }
        self.tx
            .send(LocalFrame::Close)
            .map_err(|_| LocalEndpointError::Closed)
    }
}

/// Connects to the local endpoint over WebSocket.
pub struct WebSocketConnector {
    url: Url,
}

impl WebSocketConnector {
    pub fn new(url: Url) -> Self {
        Self { url }
    }
}

#[async_trait]
impl LocalConnector for WebSocketConnector {
    async fn connect(&self, session_id: &str) -> Result<LocalEndpoint, LocalEndpointError> {
        let (ws_stream, _) = connect_async(self.url.as_str())
            .await
            .map_err(|err| LocalEndpointError::Connect(err.to_string()))?;
        debug!(
            target: "relay_gateway::local",
            session_id,
            url = %self.url,
            "connected to local endpoint"
        );

        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<LocalFrame>();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel::<String>();
        let (mut ws_write, mut ws_read) = ws_stream.split();
        let session_id = session_id.to_string();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    frame = outbound_rx.recv() => match frame {
                        Some(LocalFrame::Text(text)) => {
                            trace!(target: "relay_gateway::local", session_id = %session_id, len = text.len(), "local frame out");
                            if let Err(err) = ws_write.send(Message::Text(text)).await {
                                warn!(target: "relay_gateway::local", session_id = %session_id, error = %err, "local send failed");
                                break;
                            }
                        }
                        Some(LocalFrame::Close) | None => {
                            let _ = ws_write.send(Message::Close(None)).await;
                            break;
                        }
                    },
                    message = ws_read.next() => match message {
                        Some(Ok(Message::Text(text))) => {
                            if inbound_tx.send(text).is_err() {
                                break;
                            }
                        }
                        Some(Ok(Message::Close(_))) | None => break,
                        Some(Ok(_)) => {}
                        Some(Err(err)) => {
                            warn!(target: "relay_gateway::local", session_id = %session_id, error = %err, "local endpoint error");
                            break;
                        }
                    }
                }
            }
            debug!(target: "relay_gateway::local", session_id = %session_id, "local endpoint io finished");
        });

        Ok(LocalEndpoint::new(outbound_tx, inbound_rx))
    }
}

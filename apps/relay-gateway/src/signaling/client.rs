use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::{Error as WsError, Message, error::ProtocolError};
use tracing::{debug, info, trace, warn};
use url::Url;

use super::protocol::{ClientMessage, ServerMessage};
use crate::identity::GatewayIdentity;

const CLOSE_GRACE: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
pub enum SignalingError {
    #[error("signaling connect failed: {0}")]
    Connect(#[source] WsError),
    #[error("signaling connection error: {0}")]
    Connection(#[source] WsError),
    #[error("signaling connection is closed")]
    ChannelClosed,
    #[error("no reply from signaling server within {0:?} of a ping")]
    HeartbeatTimeout(Duration),
}

#[derive(Debug)]
enum Outgoing {
    Control(ClientMessage),
    Ping,
    Close,
}

/// Cheap handle for emitting control messages on the live connection.
#[derive(Clone, Debug)]
pub struct SignalingSender {
    tx: mpsc::UnboundedSender<Outgoing>,
}

impl SignalingSender {
    pub fn send(&self, message: ClientMessage) -> Result<(), SignalingError> {
        self.tx
            .send(Outgoing::Control(message))
            .map_err(|_| SignalingError::ChannelClosed)
    }
}

/// Receives the decoded control traffic of one connection. Messages are
/// delivered one at a time, in arrival order; the next message is not read
/// until the previous call returns.
#[async_trait]
pub trait SignalingHandler: Send + Sync {
    async fn on_connected(&self, sender: SignalingSender);
    async fn on_message(&self, message: ServerMessage);
    async fn on_disconnected(&self);
}

pub struct SignalingClient {
    url: Url,
    identity: GatewayIdentity,
    heartbeat: Duration,
}

impl SignalingClient {
    pub fn new(url: Url, identity: GatewayIdentity, heartbeat: Duration) -> Self {
        Self {
            url,
            identity,
            heartbeat,
        }
    }

    /// Runs one control connection to completion: connect, register, then
    /// dispatch inbound messages until the server closes, the connection
    /// errors, or `shutdown` flips to `true`.
    pub async fn run(
        &self,
        handler: &dyn SignalingHandler,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<(), SignalingError> {
        info!(
            target: "relay_gateway::signaling",
            url = %self.url,
            "connecting to signaling server"
        );
        let (ws_stream, _) = tokio::select! {
            result = connect_async(self.url.as_str()) => result.map_err(SignalingError::Connect)?,
            _ = shutdown.changed() => return Ok(()),
        };
        let (mut ws_write, mut ws_read) = ws_stream.split();

        let (tx, mut rx) = mpsc::unbounded_channel::<Outgoing>();
        let mut writer: JoinHandle<()> = tokio::spawn(async move {
            while let Some(outgoing) = rx.recv().await {
                let frame = match outgoing {
                    Outgoing::Control(message) => match serde_json::to_string(&message) {
                        Ok(text) => Message::Text(text),
                        Err(err) => {
                            warn!(
                                target: "relay_gateway::signaling",
                                error = %err,
                                "failed to encode control message"
                            );
                            continue;
                        }
                    },
                    Outgoing::Ping => Message::Ping(Vec::new()),
                    Outgoing::Close => {
                        let _ = ws_write.send(Message::Close(None)).await;
                        break;
                    }
                };
                if ws_write.send(frame).await.is_err() {
                    break;
                }
            }
        });

        let sender = SignalingSender { tx: tx.clone() };
        sender.send(ClientMessage::RegisterServer {
            remote_id: self.identity.as_str().to_string(),
        })?;
        debug!(
            target: "relay_gateway::signaling",
            remote_id = %self.identity,
            "sent register-server"
        );
        handler.on_connected(sender).await;

        let period = self.heartbeat;
        let mut heartbeat = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // Set when a ping goes out; any inbound frame clears it.
        let mut awaiting_reply = false;

        let result = loop {
            tokio::select! {
                _ = heartbeat.tick() => {
                    if awaiting_reply {
                        warn!(
                            target: "relay_gateway::signaling",
                            heartbeat_ms = period.as_millis() as u64,
                            "signaling server stopped answering pings"
                        );
                        break Err(SignalingError::HeartbeatTimeout(period));
                    }
                    if tx.send(Outgoing::Ping).is_err() {
                        break Err(SignalingError::ChannelClosed);
                    }
                    awaiting_reply = true;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        debug!(target: "relay_gateway::signaling", "closing signaling connection");
                        let _ = tx.send(Outgoing::Close);
                        break Ok(());
                    }
                }
                frame = ws_read.next() => {
                    if matches!(frame, Some(Ok(_))) {
                        awaiting_reply = false;
                    }
                    match frame {
                        Some(Ok(Message::Text(text))) => {
                            trace!(target: "relay_gateway::signaling", len = text.len(), "control frame in");
                            dispatch(handler, &text).await;
                        }
                        Some(Ok(Message::Binary(data))) => match String::from_utf8(data) {
                            Ok(text) => dispatch(handler, &text).await,
                            Err(_) => warn!(
                                target: "relay_gateway::signaling",
                                "ignoring non utf-8 binary control frame"
                            ),
                        },
                        Some(Ok(Message::Close(frame))) => {
                            info!(
                                target: "relay_gateway::signaling",
                                reason = ?frame.as_ref().map(|f| f.reason.to_string()),
                                "signaling server closed the connection"
                            );
                            break Ok(());
                        }
                        Some(Ok(_)) => {}
                        Some(Err(err)) => {
                            match &err {
                                WsError::ConnectionClosed
                                | WsError::AlreadyClosed
                                | WsError::Protocol(ProtocolError::ResetWithoutClosingHandshake) => {
                                    debug!(target: "relay_gateway::signaling", "signaling websocket closed: {err}");
                                }
                                _ => {
                                    warn!(target: "relay_gateway::signaling", "signaling websocket error: {err}");
                                }
                            }
                            break Err(SignalingError::Connection(err));
                        }
                        None => {
                            info!(target: "relay_gateway::signaling", "signaling stream ended");
                            break Ok(());
                        }
                    }
                }
            }
        };

        handler.on_disconnected().await;
        drop(tx);
        if tokio::time::timeout(CLOSE_GRACE, &mut writer).await.is_err() {
            writer.abort();
        }
        result
    }
}

async fn dispatch(handler: &dyn SignalingHandler, text: &str) {
    match serde_json::from_str::<ServerMessage>(text) {
        Ok(message) => {
            debug!(
                target: "relay_gateway::signaling",
                kind = message.kind(),
                session_id = message.session_id().unwrap_or_default(),
                "received control message"
            );
            handler.on_message(message).await;
        }
        Err(err) => {
            warn!(
                target: "relay_gateway::signaling",
                error = %err,
                len = text.len(),
                "ignoring malformed control message"
            );
        }
    }
}

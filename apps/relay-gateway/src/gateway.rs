use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use tokio::sync::{mpsc, watch};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};
use url::Url;

use crate::bridge::{Bridge, PumpExit};
use crate::config::{
    GatewayConfig, IceServerConfig, ReadyCallback, local_websocket_url, signaling_websocket_url,
};
use crate::error::GatewayError;
use crate::identity::GatewayIdentity;
use crate::local::{LocalConnector, WebSocketConnector};
use crate::session::{HandshakeState, Session, SessionRegistry};
use crate::signaling::{
    ClientMessage, ServerMessage, SignalingClient, SignalingHandler, SignalingSender,
};
use crate::transport::webrtc::WebRtcTransportFactory;
use crate::transport::{
    ConnectionState, IceCandidate, SessionDescription, TransportEvent, TransportEvents,
    TransportFactory,
};

const DRIVER_GRACE: Duration = Duration::from_secs(2);

/// Relays remote clients onto the local message endpoint.
///
/// The gateway keeps a registration with the signaling server for as long
/// as it runs, reconnecting after a fixed delay whenever the connection
/// drops. Each remote client gets its own [`Session`], driven by a
/// dedicated task that consumes the transport's events in order.
pub struct Gateway {
    core: Arc<GatewayCore>,
    signaling_url: Url,
    heartbeat: Duration,
    reconnect_delay: Duration,
    shutdown: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Gateway {
    /// Builds a gateway backed by WebRTC peer transports and a WebSocket
    /// local endpoint.
    pub fn new(config: GatewayConfig) -> Result<Self, GatewayError> {
        let local_url = local_websocket_url(&config.local_url)?;
        let factory: Arc<dyn TransportFactory> = Arc::new(WebRtcTransportFactory::new()?);
        let connector: Arc<dyn LocalConnector> = Arc::new(WebSocketConnector::new(local_url));
        Self::with_components(config, factory, connector)
    }

    /// Builds a gateway around caller-supplied transport and local endpoint
    /// implementations.
    pub fn with_components(
        config: GatewayConfig,
        factory: Arc<dyn TransportFactory>,
        connector: Arc<dyn LocalConnector>,
    ) -> Result<Self, GatewayError> {
        config.validate()?;
        let signaling_url = signaling_websocket_url(&config.signaling_url)?;
        let identity = match config.remote_id.as_deref() {
            Some(raw) => GatewayIdentity::parse(raw)?,
            None => GatewayIdentity::generate(&config.remote_id_prefix)?,
        };
        info!(
            target: "relay_gateway::gateway",
            remote_id = %identity,
            signaling_url = %signaling_url,
            local_url = %config.local_url,
            "gateway configured"
        );

        let (shutdown, _) = watch::channel(false);
        Ok(Self {
            core: Arc::new(GatewayCore {
                identity,
                ice_servers: config.ice_servers,
                on_ready: config.on_ready,
                factory,
                connector,
                registry: SessionRegistry::new(),
                signaling: RwLock::new(None),
                drivers: Mutex::new(JoinSet::new()),
                running: AtomicBool::new(false),
            }),
            signaling_url,
            heartbeat: config.heartbeat_interval,
            reconnect_delay: config.reconnect_delay,
            shutdown,
            task: Mutex::new(None),
        })
    }

    /// Starts the signaling loop in the background and returns immediately.
    /// Calling it while already running has no effect. Must be called from
    /// within a Tokio runtime.
    pub fn start(&self) {
        if self.core.running.swap(true, Ordering::SeqCst) {
            debug!(target: "relay_gateway::gateway", "gateway already running");
            return;
        }
        self.shutdown.send_replace(false);
        let client = SignalingClient::new(
            self.signaling_url.clone(),
            self.core.identity.clone(),
            self.heartbeat,
        );
        let task = tokio::spawn(signaling_loop(
            self.core.clone(),
            client,
            self.reconnect_delay,
            self.shutdown.subscribe(),
        ));
        *self.task.lock() = Some(task);
        info!(
            target: "relay_gateway::gateway",
            remote_id = %self.core.identity,
            "gateway started"
        );
    }

    /// Stops the signaling loop and tears down every session. Returns once
    /// the loop and all session tasks have finished.
    pub async fn stop(&self) {
        if !self.core.running.swap(false, Ordering::SeqCst) {
            return;
        }
        info!(target: "relay_gateway::gateway", "stopping gateway");
        self.shutdown.send_replace(true);

        let task = self.task.lock().take();
        if let Some(task) = task {
            if let Err(err) = task.await {
                warn!(target: "relay_gateway::gateway", error = %err, "signaling loop ended abnormally");
            }
        }

        for session in self.core.registry.drain() {
            session.release().await;
        }
        // Sessions torn down earlier may still have a driver winding down.
        let mut drivers = std::mem::take(&mut *self.core.drivers.lock());
        let joined = tokio::time::timeout(DRIVER_GRACE, async {
            while drivers.join_next().await.is_some() {}
        })
        .await;
        if joined.is_err() {
            warn!(
                target: "relay_gateway::gateway",
                remaining = drivers.len(),
                "session tasks did not finish; aborting"
            );
            drivers.shutdown().await;
        }
        info!(target: "relay_gateway::gateway", "gateway stopped");
    }

    pub fn is_running(&self) -> bool {
        self.core.running.load(Ordering::SeqCst)
    }

    pub fn remote_id(&self) -> &str {
        self.core.identity.as_str()
    }

    pub fn session_ids(&self) -> Vec<String> {
        self.core.registry.ids()
    }

    pub fn handshake_state(&self, session_id: &str) -> Option<HandshakeState> {
        self.core
            .registry
            .get(session_id)
            .map(|session| session.handshake_state())
    }

    /// Tears a session down as if the remote client had disconnected.
    /// Returns `false` when there was nothing to close.
    pub async fn close_session(&self, session_id: &str) -> bool {
        match self.core.registry.get(session_id) {
            Some(session) => self.core.teardown(&session, "closed by caller").await,
            None => false,
        }
    }
}

async fn signaling_loop(
    core: Arc<GatewayCore>,
    client: SignalingClient,
    reconnect_delay: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        if *shutdown.borrow() {
            break;
        }
        match client.run(&core, shutdown.clone()).await {
            Ok(()) => info!(target: "relay_gateway::gateway", "signaling connection ended"),
            Err(err) => warn!(
                target: "relay_gateway::gateway",
                error = %err,
                "signaling connection failed"
            ),
        }
        if *shutdown.borrow() {
            break;
        }
        info!(
            target: "relay_gateway::gateway",
            delay_ms = reconnect_delay.as_millis() as u64,
            "reconnecting to signaling server"
        );
        tokio::select! {
            _ = tokio::time::sleep(reconnect_delay) => {}
            changed = shutdown.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }
    }
    debug!(target: "relay_gateway::gateway", "signaling loop finished");
}

struct GatewayCore {
    identity: GatewayIdentity,
    ice_servers: Vec<IceServerConfig>,
    on_ready: Option<ReadyCallback>,
    factory: Arc<dyn TransportFactory>,
    connector: Arc<dyn LocalConnector>,
    registry: SessionRegistry,
    signaling: RwLock<Option<SignalingSender>>,
    drivers: Mutex<JoinSet<()>>,
    running: AtomicBool,
}

impl GatewayCore {
    fn send_control(&self, message: ClientMessage) -> bool {
        let sender = self.signaling.read().clone();
        let Some(sender) = sender else {
            debug!(
                target: "relay_gateway::gateway",
                "no signaling connection; dropping control message"
            );
            return false;
        };
        match sender.send(message) {
            Ok(()) => true,
            Err(err) => {
                debug!(target: "relay_gateway::gateway", error = %err, "control message not sent");
                false
            }
        }
    }

    /// Removes the session and releases its resources. Only the caller that
    /// wins the registry removal does any work.
    async fn teardown(&self, session: &Arc<Session>, reason: &str) -> bool {
        if !self.registry.remove_if_current(session) {
            return false;
        }
        info!(
            target: "relay_gateway::gateway",
            session_id = %session.id(),
            reason,
            "tearing down session"
        );
        session.release().await;
        true
    }

    async fn client_connected(self: &Arc<Self>, session_id: String) {
        if self.registry.contains(&session_id) {
            warn!(
                target: "relay_gateway::gateway",
                session_id = %session_id,
                "ignoring duplicate client-connected"
            );
            return;
        }
        let (transport, events) = match self.factory.create(&session_id, &self.ice_servers).await {
            Ok(created) => created,
            Err(err) => {
                error!(
                    target: "relay_gateway::gateway",
                    session_id = %session_id,
                    error = %err,
                    "failed to create peer transport"
                );
                return;
            }
        };

        let session = Arc::new(Session::new(session_id.clone(), transport));
        let shutdown = session.subscribe_shutdown();
        if let Err(rejected) = self.registry.insert(session.clone()) {
            warn!(
                target: "relay_gateway::gateway",
                session_id = %session_id,
                "session appeared concurrently; discarding new transport"
            );
            if let Err(err) = rejected.transport().close().await {
                warn!(
                    target: "relay_gateway::gateway",
                    session_id = %session_id,
                    error = %err,
                    "failed to close discarded transport"
                );
            }
            return;
        }
        {
            let mut drivers = self.drivers.lock();
            while drivers.try_join_next().is_some() {}
            drivers.spawn(drive_session(self.clone(), session, events, shutdown));
        }
        info!(
            target: "relay_gateway::gateway",
            session_id = %session_id,
            sessions = self.registry.len(),
            "client connected"
        );
    }

    async fn offer(&self, session_id: String, offer: SessionDescription) {
        let Some(session) = self.registry.get(&session_id) else {
            error!(
                target: "relay_gateway::gateway",
                session_id = %session_id,
                "offer for unknown session"
            );
            return;
        };
        match session.accept_offer(offer).await {
            Ok(answer) => {
                let sent = self.send_control(ClientMessage::Answer {
                    session_id: session_id.clone(),
                    data: answer,
                });
                if sent {
                    session.set_handshake_state(HandshakeState::AnswerSent);
                    debug!(target: "relay_gateway::gateway", session_id = %session_id, "answer sent");
                } else {
                    warn!(target: "relay_gateway::gateway", session_id = %session_id, "answer could not be sent");
                }
            }
            Err(err) => {
                warn!(
                    target: "relay_gateway::gateway",
                    session_id = %session_id,
                    error = %err,
                    "offer not accepted"
                );
                if session.handshake_state() == HandshakeState::Failed {
                    self.teardown(&session, "handshake failed").await;
                }
            }
        }
    }

    async fn remote_candidate(&self, session_id: String, candidate: Option<IceCandidate>) {
        let Some(session) = self.registry.get(&session_id) else {
            debug!(
                target: "relay_gateway::gateway",
                session_id = %session_id,
                "candidate for unknown session"
            );
            return;
        };
        let Some(candidate) = candidate.filter(|candidate| !candidate.is_terminal()) else {
            debug!(
                target: "relay_gateway::gateway",
                session_id = %session_id,
                "ignoring empty candidate"
            );
            return;
        };
        if let Err(err) = session.transport().add_ice_candidate(candidate).await {
            warn!(
                target: "relay_gateway::gateway",
                session_id = %session_id,
                error = %err,
                "failed to add remote candidate"
            );
        }
    }

    /// Applies one transport event. Returns `false` once the session is
    /// finished.
    async fn transport_event(
        &self,
        session: &Arc<Session>,
        event: TransportEvent,
        exits: &mpsc::UnboundedSender<PumpExit>,
    ) -> bool {
        match event {
            TransportEvent::LocalCandidate(candidate) => {
                if !candidate.is_terminal() {
                    self.send_control(ClientMessage::IceCandidate {
                        session_id: session.id().to_string(),
                        data: candidate,
                    });
                }
                true
            }
            TransportEvent::ConnectionState(state) => {
                debug!(
                    target: "relay_gateway::gateway",
                    session_id = %session.id(),
                    %state,
                    "connection state"
                );
                match state {
                    ConnectionState::Connected => {
                        session.set_handshake_state(HandshakeState::Connected);
                        true
                    }
                    ConnectionState::Failed => {
                        session.set_handshake_state(HandshakeState::Failed);
                        self.teardown(session, "connection failed").await;
                        false
                    }
                    ConnectionState::Closed => {
                        self.teardown(session, "connection closed").await;
                        false
                    }
                    _ => true,
                }
            }
            TransportEvent::ChannelOpen => {
                self.channel_open(session, exits).await;
                true
            }
            TransportEvent::Message(text) => {
                if !session.enqueue(text) {
                    warn!(
                        target: "relay_gateway::gateway",
                        session_id = %session.id(),
                        "local endpoint unavailable; dropping data channel message"
                    );
                }
                true
            }
            TransportEvent::ChannelClosed => {
                self.teardown(session, "data channel closed").await;
                false
            }
        }
    }

    async fn channel_open(&self, session: &Arc<Session>, exits: &mpsc::UnboundedSender<PumpExit>) {
        if !session.bridge_pending() {
            debug!(
                target: "relay_gateway::gateway",
                session_id = %session.id(),
                "data channel already bridged"
            );
            return;
        }
        let mut shutdown = session.subscribe_shutdown();
        let connected = tokio::select! {
            connected = self.connector.connect(session.id()) => connected,
            _ = shutdown.wait_for(|closed| *closed) => {
                debug!(
                    target: "relay_gateway::gateway",
                    session_id = %session.id(),
                    "session closed while connecting to local endpoint"
                );
                return;
            }
        };
        let endpoint = match connected {
            Ok(endpoint) => endpoint,
            Err(err) => {
                // The transport stays up; the session just never bridges.
                error!(
                    target: "relay_gateway::gateway",
                    session_id = %session.id(),
                    error = %err,
                    "failed to connect to local endpoint"
                );
                session.abandon_bridge();
                return;
            }
        };
        let Some(queue) = session.take_queue() else {
            return;
        };
        let bridge = Bridge::start(
            session.id(),
            endpoint,
            queue,
            session.transport().clone(),
            exits.clone(),
        );
        match session.attach_bridge(bridge) {
            Ok(()) => info!(
                target: "relay_gateway::gateway",
                session_id = %session.id(),
                "bridging data channel to local endpoint"
            ),
            Err(bridge) => {
                debug!(
                    target: "relay_gateway::gateway",
                    session_id = %session.id(),
                    "session closed while connecting; dropping local endpoint"
                );
                let _ = bridge.close();
            }
        }
    }
}

async fn drive_session(
    core: Arc<GatewayCore>,
    session: Arc<Session>,
    mut events: TransportEvents,
    mut shutdown: watch::Receiver<bool>,
) {
    let (exits_tx, mut exits_rx) = mpsc::unbounded_channel::<PumpExit>();
    loop {
        tokio::select! {
            biased;
            _ = shutdown.changed() => break,
            Some(exit) = exits_rx.recv() => {
                core.teardown(&session, &exit.to_string()).await;
                break;
            }
            event = events.recv() => match event {
                Some(event) => {
                    if !core.transport_event(&session, event, &exits_tx).await {
                        break;
                    }
                }
                None => {
                    core.teardown(&session, "transport events ended").await;
                    break;
                }
            }
        }
    }
    debug!(
        target: "relay_gateway::gateway",
        session_id = %session.id(),
        "session task finished"
    );
}

// Implemented on the `Arc` so new sessions can hand the core to their tasks.
#[async_trait]
impl SignalingHandler for Arc<GatewayCore> {
    async fn on_connected(&self, sender: SignalingSender) {
        *self.signaling.write() = Some(sender);
    }

    async fn on_message(&self, message: ServerMessage) {
        match message {
            ServerMessage::Registered { remote_id } => {
                if let Some(remote_id) = remote_id.as_deref() {
                    if !self.identity.matches(remote_id) {
                        warn!(
                            target: "relay_gateway::gateway",
                            expected = %self.identity,
                            received = remote_id,
                            "signaling server registered a different id"
                        );
                    }
                }
                info!(
                    target: "relay_gateway::gateway",
                    remote_id = %self.identity,
                    "registered with signaling server"
                );
                if let Some(callback) = &self.on_ready {
                    callback(self.identity.as_str());
                }
            }
            ServerMessage::ClientConnected { session_id } => {
                self.client_connected(session_id).await
            }
            ServerMessage::ClientDisconnected { session_id } => {
                match self.registry.get(&session_id) {
                    Some(session) => {
                        self.teardown(&session, "client disconnected").await;
                    }
                    None => debug!(
                        target: "relay_gateway::gateway",
                        session_id = %session_id,
                        "disconnect for unknown session"
                    ),
                }
            }
            ServerMessage::Offer { session_id, data } => self.offer(session_id, data).await,
            ServerMessage::IceCandidate { session_id, data } => {
                self.remote_candidate(session_id, data).await
            }
            ServerMessage::Error { error } => {
                error!(
                    target: "relay_gateway::gateway",
                    error = error.as_deref().unwrap_or("unspecified"),
                    "signaling server reported an error"
                );
            }
            ServerMessage::Unknown => {
                debug!(target: "relay_gateway::gateway", "ignoring unknown control message");
            }
        }
    }

    async fn on_disconnected(&self) {
        self.signaling.write().take();
    }
}

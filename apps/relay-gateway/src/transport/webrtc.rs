use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::setting_engine::SettingEngine;
use webrtc::api::{API, APIBuilder};
use webrtc::data_channel::RTCDataChannel;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;

use super::{
    ChannelState, ConnectionState, IceCandidate, PeerTransport, SessionDescription,
    TransportError, TransportEvent, TransportEvents, TransportFactory,
};
use crate::config::IceServerConfig;

type ChannelSlot = Arc<Mutex<Option<Arc<RTCDataChannel>>>>;

/// Builds answering peer connections on top of webrtc-rs.
pub struct WebRtcTransportFactory {
    api: API,
}

impl WebRtcTransportFactory {
    pub fn new() -> Result<Self, TransportError> {
        Ok(Self {
            api: build_api(SettingEngine::default())?,
        })
    }
}

#[async_trait]
impl TransportFactory for WebRtcTransportFactory {
    async fn create(
        &self,
        session_id: &str,
        ice_servers: &[IceServerConfig],
    ) -> Result<(Arc<dyn PeerTransport>, TransportEvents), TransportError> {
        let config = RTCConfiguration {
            ice_servers: ice_servers.iter().map(to_rtc_ice_server).collect(),
            ..Default::default()
        };
        let pc = Arc::new(
            self.api
                .new_peer_connection(config)
                .await
                .map_err(to_setup_error)?,
        );
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let channel: ChannelSlot = Arc::new(Mutex::new(None));
        install_callbacks(session_id, &pc, &channel, events_tx);
        debug!(
            target: "relay_gateway::transport::webrtc",
            session_id,
            ice_servers = ice_servers.len(),
            "peer connection created"
        );
        let transport = WebRtcTransport {
            session_id: session_id.to_string(),
            pc,
            channel,
        };
        Ok((Arc::new(transport) as Arc<dyn PeerTransport>, events_rx))
    }
}

pub struct WebRtcTransport {
    session_id: String,
    pc: Arc<RTCPeerConnection>,
    channel: ChannelSlot,
}

impl WebRtcTransport {
    fn data_channel(&self) -> Option<Arc<RTCDataChannel>> {
        self.channel.lock().clone()
    }
}

#[async_trait]
impl PeerTransport for WebRtcTransport {
    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), TransportError> {
        let description = session_description_from_payload(&description)?;
        self.pc
            .set_remote_description(description)
            .await
            .map_err(to_setup_error)
    }

    async fn create_answer(&self) -> Result<SessionDescription, TransportError> {
        if self.pc.remote_description().await.is_none() {
            return Err(TransportError::MissingRemoteDescription);
        }
        let answer = self.pc.create_answer(None).await.map_err(to_setup_error)?;
        Ok(payload_from_description(&answer))
    }

    async fn set_local_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), TransportError> {
        let description = session_description_from_payload(&description)?;
        self.pc
            .set_local_description(description)
            .await
            .map_err(to_setup_error)
    }

    async fn local_description(&self) -> Option<SessionDescription> {
        self.pc
            .local_description()
            .await
            .map(|description| payload_from_description(&description))
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), TransportError> {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: None,
        };
        self.pc
            .add_ice_candidate(init)
            .await
            .map_err(|err| TransportError::Operation(err.to_string()))
    }

    fn channel_state(&self) -> ChannelState {
        match self.data_channel() {
            None => ChannelState::Unavailable,
            Some(dc) => match dc.ready_state() {
                RTCDataChannelState::Open => ChannelState::Open,
                RTCDataChannelState::Closing => ChannelState::Closing,
                RTCDataChannelState::Closed => ChannelState::Closed,
                RTCDataChannelState::Connecting | RTCDataChannelState::Unspecified => {
                    ChannelState::Connecting
                }
            },
        }
    }

    async fn send_text(&self, text: &str) -> Result<(), TransportError> {
        let dc = self.data_channel().ok_or(TransportError::ChannelUnavailable)?;
        dc.send_text(text.to_string())
            .await
            .map(|_| ())
            .map_err(|err| TransportError::Operation(err.to_string()))
    }

    async fn close_channel(&self) -> Result<(), TransportError> {
        let Some(dc) = self.data_channel() else {
            return Ok(());
        };
        if matches!(
            dc.ready_state(),
            RTCDataChannelState::Closing | RTCDataChannelState::Closed
        ) {
            return Ok(());
        }
        dc.close()
            .await
            .map_err(|err| TransportError::Operation(err.to_string()))
    }

    async fn close(&self) -> Result<(), TransportError> {
        trace!(
            target: "relay_gateway::transport::webrtc",
            session_id = %self.session_id,
            "closing peer connection"
        );
        self.pc
            .close()
            .await
            .map_err(|err| TransportError::Operation(err.to_string()))
    }
}

fn install_callbacks(
    session_id: &str,
    pc: &Arc<RTCPeerConnection>,
    channel: &ChannelSlot,
    events: mpsc::UnboundedSender<TransportEvent>,
) {
    let candidate_events = events.clone();
    let candidate_session = session_id.to_string();
    pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
        let events = candidate_events.clone();
        let session_id = candidate_session.clone();
        Box::pin(async move {
            // `None` marks the end of gathering; nothing is forwarded for it.
            let Some(candidate) = candidate else {
                return;
            };
            match candidate.to_json() {
                Ok(init) => {
                    let _ = events.send(TransportEvent::LocalCandidate(IceCandidate {
                        candidate: init.candidate,
                        sdp_mid: init.sdp_mid,
                        sdp_mline_index: init.sdp_mline_index,
                    }));
                }
                Err(err) => warn!(
                    target: "relay_gateway::transport::webrtc",
                    session_id = %session_id,
                    error = %err,
                    "failed to serialize local candidate"
                ),
            }
        })
    }));

    let state_events = events.clone();
    pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
        let events = state_events.clone();
        Box::pin(async move {
            if let Some(state) = connection_state(state) {
                let _ = events.send(TransportEvent::ConnectionState(state));
            }
        })
    }));

    let slot = channel.clone();
    let channel_session = session_id.to_string();
    pc.on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
        let slot = slot.clone();
        let events = events.clone();
        let session_id = channel_session.clone();
        Box::pin(async move {
            {
                let mut guard = slot.lock();
                if guard.is_some() {
                    warn!(
                        target: "relay_gateway::transport::webrtc",
                        session_id = %session_id,
                        label = %dc.label(),
                        "ignoring additional data channel"
                    );
                    return;
                }
                *guard = Some(dc.clone());
            }
            debug!(
                target: "relay_gateway::transport::webrtc",
                session_id = %session_id,
                label = %dc.label(),
                "data channel announced"
            );

            let open_events = events.clone();
            dc.on_open(Box::new(move || {
                let events = open_events.clone();
                Box::pin(async move {
                    let _ = events.send(TransportEvent::ChannelOpen);
                })
            }));

            let message_events = events.clone();
            let message_session = session_id.clone();
            dc.on_message(Box::new(move |msg: DataChannelMessage| {
                let events = message_events.clone();
                let session_id = message_session.clone();
                Box::pin(async move {
                    match String::from_utf8(msg.data.to_vec()) {
                        Ok(text) => {
                            let _ = events.send(TransportEvent::Message(text));
                        }
                        Err(_) => warn!(
                            target: "relay_gateway::transport::webrtc",
                            session_id = %session_id,
                            binary = !msg.is_string,
                            len = msg.data.len(),
                            "dropping non utf-8 data channel message"
                        ),
                    }
                })
            }));

            let close_events = events.clone();
            dc.on_close(Box::new(move || {
                let events = close_events.clone();
                Box::pin(async move {
                    let _ = events.send(TransportEvent::ChannelClosed);
                })
            }));
        })
    }));
}

fn connection_state(state: RTCPeerConnectionState) -> Option<ConnectionState> {
    match state {
        RTCPeerConnectionState::New => Some(ConnectionState::New),
        RTCPeerConnectionState::Connecting => Some(ConnectionState::Connecting),
        RTCPeerConnectionState::Connected => Some(ConnectionState::Connected),
        RTCPeerConnectionState::Disconnected => Some(ConnectionState::Disconnected),
        RTCPeerConnectionState::Failed => Some(ConnectionState::Failed),
        RTCPeerConnectionState::Closed => Some(ConnectionState::Closed),
        RTCPeerConnectionState::Unspecified => None,
    }
}

fn to_rtc_ice_server(server: &IceServerConfig) -> RTCIceServer {
    RTCIceServer {
        urls: server.urls.clone(),
        username: server.username.clone().unwrap_or_default(),
        credential: server.credential.clone().unwrap_or_default(),
        ..Default::default()
    }
}

fn build_api(setting: SettingEngine) -> Result<API, TransportError> {
    let mut media_engine = MediaEngine::default();
    media_engine
        .register_default_codecs()
        .map_err(to_setup_error)?;

    let mut registry = Registry::new();
    registry =
        register_default_interceptors(registry, &mut media_engine).map_err(to_setup_error)?;

    Ok(APIBuilder::new()
        .with_setting_engine(setting)
        .with_media_engine(media_engine)
        .with_interceptor_registry(registry)
        .build())
}

fn payload_from_description(desc: &RTCSessionDescription) -> SessionDescription {
    SessionDescription::new(desc.sdp_type.to_string(), desc.sdp.clone())
}

fn session_description_from_payload(
    payload: &SessionDescription,
) -> Result<RTCSessionDescription, TransportError> {
    let invalid = |err: webrtc::Error| TransportError::InvalidDescription(err.to_string());
    match RTCSdpType::from(payload.kind.as_str()) {
        RTCSdpType::Offer => RTCSessionDescription::offer(payload.sdp.clone()).map_err(invalid),
        RTCSdpType::Answer => RTCSessionDescription::answer(payload.sdp.clone()).map_err(invalid),
        RTCSdpType::Pranswer => {
            RTCSessionDescription::pranswer(payload.sdp.clone()).map_err(invalid)
        }
        RTCSdpType::Rollback | RTCSdpType::Unspecified => Err(
            TransportError::InvalidDescription(format!("unsupported sdp type {}", payload.kind)),
        ),
    }
}

fn to_setup_error<E: std::fmt::Display>(err: E) -> TransportError {
    TransportError::Setup(err.to_string())
}

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;

use crate::config::IceServerConfig;

pub mod mock;
pub mod webrtc;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport setup failed: {0}")]
    Setup(String),
    #[error("invalid session description: {0}")]
    InvalidDescription(String),
    #[error("remote description has not been applied")]
    MissingRemoteDescription,
    #[error("data channel is not available")]
    ChannelUnavailable,
    #[error("transport operation failed: {0}")]
    Operation(String),
}

/// Connection-setup description exchanged as `offer`/`answer` payloads.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    pub sdp: String,
    #[serde(rename = "type")]
    pub kind: String,
}

impl SessionDescription {
    pub fn new(kind: impl Into<String>, sdp: impl Into<String>) -> Self {
        Self {
            sdp: sdp.into(),
            kind: kind.into(),
        }
    }
}

/// Network-path candidate as carried in `ice-candidate` payloads.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    #[serde(default)]
    pub candidate: String,
    #[serde(default)]
    pub sdp_mid: Option<String>,
    #[serde(default, rename = "sdpMLineIndex")]
    pub sdp_mline_index: Option<u16>,
}

impl IceCandidate {
    /// An empty candidate string is the end-of-candidates marker.
    pub fn is_terminal(&self) -> bool {
        self.candidate.trim().is_empty()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ConnectionState::New => "new",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Failed => "failed",
            ConnectionState::Closed => "closed",
        };
        f.write_str(label)
    }
}

/// Readiness of the transport's data channel.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChannelState {
    /// The remote peer has not announced a channel yet.
    Unavailable,
    Connecting,
    Open,
    Closing,
    Closed,
}

/// Everything a transport reports asynchronously. Each session consumes
/// these from a single ordered queue.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TransportEvent {
    LocalCandidate(IceCandidate),
    ConnectionState(ConnectionState),
    ChannelOpen,
    Message(String),
    ChannelClosed,
}

pub type TransportEvents = mpsc::UnboundedReceiver<TransportEvent>;

/// One peer transport instance, exclusively owned by a session.
#[async_trait]
pub trait PeerTransport: Send + Sync {
    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), TransportError>;

    async fn create_answer(&self) -> Result<SessionDescription, TransportError>;

    async fn set_local_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), TransportError>;

    async fn local_description(&self) -> Option<SessionDescription>;

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), TransportError>;

    fn channel_state(&self) -> ChannelState;

    async fn send_text(&self, text: &str) -> Result<(), TransportError>;

    async fn close_channel(&self) -> Result<(), TransportError>;

    async fn close(&self) -> Result<(), TransportError>;
}

/// Creates transports configured with the gateway's relay servers. The
/// returned receiver yields the transport's events in the order they occur.
#[async_trait]
pub trait TransportFactory: Send + Sync {
    async fn create(
        &self,
        session_id: &str,
        ice_servers: &[IceServerConfig],
    ) -> Result<(Arc<dyn PeerTransport>, TransportEvents), TransportError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn candidate_uses_browser_field_names() {
        let candidate = IceCandidate {
            candidate: "candidate:1 1 udp 2122260223 10.0.0.2 5000 typ host".into(),
            sdp_mid: Some("0".into()),
            sdp_mline_index: Some(0),
        };
        let value = serde_json::to_value(&candidate).expect("serialize");
        assert_eq!(
            value,
            json!({
                "candidate": "candidate:1 1 udp 2122260223 10.0.0.2 5000 typ host",
                "sdpMid": "0",
                "sdpMLineIndex": 0,
            })
        );
    }

    #[test]
    fn sparse_candidate_payload_is_terminal() {
        let parsed: IceCandidate =
            serde_json::from_value(json!({ "sdpMid": null })).expect("deserialize");
        assert!(parsed.is_terminal());
        let parsed: IceCandidate =
            serde_json::from_value(json!({ "candidate": "" })).expect("deserialize");
        assert!(parsed.is_terminal());
    }

    #[test]
    fn description_renames_type_field() {
        let description = SessionDescription::new("answer", "v=0");
        assert_eq!(
            serde_json::to_value(&description).expect("serialize"),
            json!({ "sdp": "v=0", "type": "answer" })
        );
    }
}

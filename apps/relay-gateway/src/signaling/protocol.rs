use serde::{Deserialize, Serialize};

use crate::transport::{IceCandidate, SessionDescription};

/// Control messages the gateway sends to the signaling server.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ClientMessage {
    #[serde(rename_all = "camelCase")]
    RegisterServer { remote_id: String },
    #[serde(rename_all = "camelCase")]
    Answer {
        session_id: String,
        data: SessionDescription,
    },
    #[serde(rename_all = "camelCase")]
    IceCandidate {
        session_id: String,
        data: IceCandidate,
    },
}

/// Control messages received from the signaling server.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ServerMessage {
    #[serde(rename_all = "camelCase")]
    Registered {
        #[serde(default)]
        remote_id: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    ClientConnected { session_id: String },
    #[serde(rename_all = "camelCase")]
    ClientDisconnected { session_id: String },
    #[serde(rename_all = "camelCase")]
    Offer {
        session_id: String,
        data: SessionDescription,
    },
    #[serde(rename_all = "camelCase")]
    IceCandidate {
        session_id: String,
        #[serde(default)]
        data: Option<IceCandidate>,
    },
    Error {
        #[serde(default)]
        error: Option<String>,
    },
    #[serde(other)]
    Unknown,
}

impl ServerMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            ServerMessage::Registered { .. } => "registered",
            ServerMessage::ClientConnected { .. } => "client-connected",
            ServerMessage::ClientDisconnected { .. } => "client-disconnected",
            ServerMessage::Offer { .. } => "offer",
            ServerMessage::IceCandidate { .. } => "ice-candidate",
            ServerMessage::Error { .. } => "error",
            ServerMessage::Unknown => "unknown",
        }
    }

    pub fn session_id(&self) -> Option<&str> {
        match self {
            ServerMessage::ClientConnected { session_id }
            | ServerMessage::ClientDisconnected { session_id }
            | ServerMessage::Offer { session_id, .. }
            | ServerMessage::IceCandidate { session_id, .. } => Some(session_id),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn register_uses_wire_names() {
        let message = ClientMessage::RegisterServer {
            remote_id: "MA-AB12-CD34".into(),
        };
        assert_eq!(
            serde_json::to_value(&message).expect("serialize"),
            json!({ "type": "register-server", "remoteId": "MA-AB12-CD34" })
        );
    }

    #[test]
    fn answer_carries_session_and_description() {
        let message = ClientMessage::Answer {
            session_id: "s1".into(),
            data: SessionDescription::new("answer", "v=0"),
        };
        assert_eq!(
            serde_json::to_value(&message).expect("serialize"),
            json!({
                "type": "answer",
                "sessionId": "s1",
                "data": { "sdp": "v=0", "type": "answer" },
            })
        );
    }

    #[test]
    fn inbound_messages_decode() {
        let offer: ServerMessage = serde_json::from_value(json!({
            "type": "offer",
            "sessionId": "s1",
            "data": { "sdp": "v=0", "type": "offer" },
        }))
        .expect("offer");
        assert_eq!(
            offer,
            ServerMessage::Offer {
                session_id: "s1".into(),
                data: SessionDescription::new("offer", "v=0"),
            }
        );

        let candidate: ServerMessage = serde_json::from_value(json!({
            "type": "ice-candidate",
            "sessionId": "s1",
            "data": null,
        }))
        .expect("candidate");
        assert_eq!(
            candidate,
            ServerMessage::IceCandidate {
                session_id: "s1".into(),
                data: None,
            }
        );

        let registered: ServerMessage =
            serde_json::from_str(r#"{"type":"registered","remoteId":"MA-AB12-CD34"}"#)
                .expect("registered");
        assert_eq!(registered.kind(), "registered");

        let error: ServerMessage =
            serde_json::from_str(r#"{"type":"error","error":"Remote ID required"}"#)
                .expect("error");
        assert_eq!(
            error,
            ServerMessage::Error {
                error: Some("Remote ID required".into())
            }
        );
    }

    #[test]
    fn unrecognised_types_decode_as_unknown() {
        let message: ServerMessage =
            serde_json::from_str(r#"{"type":"peer-disconnected"}"#).expect("decode");
        assert_eq!(message, ServerMessage::Unknown);
        assert_eq!(message.session_id(), None);
    }

    #[test]
    fn missing_session_id_is_malformed() {
        assert!(serde_json::from_str::<ServerMessage>(r#"{"type":"client-connected"}"#).is_err());
    }
}

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

use crate::identity::DEFAULT_PREFIX;

pub const DEFAULT_SIGNALING_URL: &str = "wss://signaling.music-assistant.io/ws";
pub const DEFAULT_LOCAL_URL: &str = "ws://localhost:8095/ws";
pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(5);
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
const DEFAULT_STUN_SERVERS: [&str; 3] = [
    "stun:stun.l.google.com:19302",
    "stun:stun1.l.google.com:19302",
    "stun:stun.cloudflare.com:3478",
];

/// Invoked with the gateway's remote id each time registration succeeds.
pub type ReadyCallback = Arc<dyn Fn(&str) + Send + Sync>;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid {field} url '{value}': {reason}")]
    InvalidUrl {
        field: &'static str,
        value: String,
        reason: String,
    },
    #[error("{0} must be greater than zero")]
    ZeroDuration(&'static str),
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServerConfig {
    pub urls: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

impl IceServerConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            urls: vec![url.into()],
            username: None,
            credential: None,
        }
    }

    pub fn with_credentials(
        mut self,
        username: impl Into<String>,
        credential: impl Into<String>,
    ) -> Self {
        self.username = Some(username.into());
        self.credential = Some(credential.into());
        self
    }
}

pub fn default_ice_servers() -> Vec<IceServerConfig> {
    DEFAULT_STUN_SERVERS
        .iter()
        .map(|url| IceServerConfig::new(*url))
        .collect()
}

#[derive(Clone)]
pub struct GatewayConfig {
    pub signaling_url: String,
    pub local_url: String,
    pub ice_servers: Vec<IceServerConfig>,
    pub remote_id: Option<String>,
    pub remote_id_prefix: String,
    pub reconnect_delay: Duration,
    pub heartbeat_interval: Duration,
    pub on_ready: Option<ReadyCallback>,
}

impl GatewayConfig {
    pub fn with_signaling_url(mut self, url: impl Into<String>) -> Self {
        self.signaling_url = url.into();
        self
    }

    pub fn with_local_url(mut self, url: impl Into<String>) -> Self {
        self.local_url = url.into();
        self
    }

    pub fn with_ice_servers(mut self, servers: Vec<IceServerConfig>) -> Self {
        self.ice_servers = servers;
        self
    }

    pub fn with_remote_id(mut self, remote_id: impl Into<String>) -> Self {
        self.remote_id = Some(remote_id.into());
        self
    }

    pub fn with_reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    pub fn on_ready<F>(mut self, callback: F) -> Self
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.on_ready = Some(Arc::new(callback));
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        signaling_websocket_url(&self.signaling_url)?;
        local_websocket_url(&self.local_url)?;
        if self.reconnect_delay.is_zero() {
            return Err(ConfigError::ZeroDuration("reconnect delay"));
        }
        if self.heartbeat_interval.is_zero() {
            return Err(ConfigError::ZeroDuration("heartbeat interval"));
        }
        Ok(())
    }
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            signaling_url: DEFAULT_SIGNALING_URL.to_string(),
            local_url: DEFAULT_LOCAL_URL.to_string(),
            ice_servers: default_ice_servers(),
            remote_id: None,
            remote_id_prefix: DEFAULT_PREFIX.to_string(),
            reconnect_delay: DEFAULT_RECONNECT_DELAY,
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            on_ready: None,
        }
    }
}

impl fmt::Debug for GatewayConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GatewayConfig")
            .field("signaling_url", &self.signaling_url)
            .field("local_url", &self.local_url)
            .field("ice_servers", &self.ice_servers)
            .field("remote_id", &self.remote_id)
            .field("remote_id_prefix", &self.remote_id_prefix)
            .field("reconnect_delay", &self.reconnect_delay)
            .field("heartbeat_interval", &self.heartbeat_interval)
            .field("on_ready", &self.on_ready.is_some())
            .finish()
    }
}

/// Comma separated list of ICE urls. `turn:` entries may embed credentials
/// as `turn:user:pass@host:port`.
pub fn parse_ice_server_list(raw: &str) -> Vec<IceServerConfig> {
    raw.split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(parse_ice_server)
        .collect()
}

fn parse_ice_server(entry: &str) -> IceServerConfig {
    let Some((scheme, rest)) = entry.split_once(':') else {
        return IceServerConfig::new(entry);
    };
    match rest.rsplit_once('@') {
        Some((userinfo, host)) if scheme.starts_with("turn") => {
            match userinfo.split_once(':') {
                Some((username, credential)) => {
                    IceServerConfig::new(format!("{scheme}:{host}"))
                        .with_credentials(username, credential)
                }
                None => IceServerConfig::new(entry),
            }
        }
        _ => IceServerConfig::new(entry),
    }
}

/// The signaling endpoint must be a WebSocket url; `http(s)` is accepted
/// and mapped onto `ws(s)`.
pub fn signaling_websocket_url(raw: &str) -> Result<Url, ConfigError> {
    let mut url = Url::parse(raw).map_err(|err| ConfigError::InvalidUrl {
        field: "signaling",
        value: raw.to_string(),
        reason: err.to_string(),
    })?;
    let scheme = match url.scheme() {
        "ws" | "http" => "ws",
        "wss" | "https" => "wss",
        other => {
            return Err(ConfigError::InvalidUrl {
                field: "signaling",
                value: raw.to_string(),
                reason: format!("unsupported scheme '{other}'"),
            });
        }
    };
    url.set_scheme(scheme).map_err(|_| ConfigError::InvalidUrl {
        field: "signaling",
        value: raw.to_string(),
        reason: "cannot rewrite scheme".into(),
    })?;
    Ok(url)
}

pub fn local_websocket_url(raw: &str) -> Result<Url, ConfigError> {
    let url = Url::parse(raw).map_err(|err| ConfigError::InvalidUrl {
        field: "local",
        value: raw.to_string(),
        reason: err.to_string(),
    })?;
    if !matches!(url.scheme(), "ws" | "wss") {
        return Err(ConfigError::InvalidUrl {
            field: "local",
            value: raw.to_string(),
            reason: format!("unsupported scheme '{}'", url.scheme()),
        });
    }
    Ok(url)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_public_deployment() {
        let config = GatewayConfig::default();
        assert_eq!(config.signaling_url, DEFAULT_SIGNALING_URL);
        assert_eq!(config.local_url, DEFAULT_LOCAL_URL);
        assert_eq!(config.ice_servers.len(), 3);
        assert_eq!(config.reconnect_delay, Duration::from_secs(5));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn http_signaling_urls_map_to_websocket_schemes() {
        let url = signaling_websocket_url("https://example.test/ws").expect("url");
        assert_eq!(url.as_str(), "wss://example.test/ws");
        let url = signaling_websocket_url("http://127.0.0.1:9000/ws").expect("url");
        assert_eq!(url.as_str(), "ws://127.0.0.1:9000/ws");
        assert!(signaling_websocket_url("ftp://example.test").is_err());
    }

    #[test]
    fn local_url_must_be_websocket() {
        assert!(local_websocket_url("ws://localhost:8095/ws").is_ok());
        assert!(local_websocket_url("http://localhost:8095/ws").is_err());
    }

    #[test]
    fn zero_delays_are_rejected() {
        let config = GatewayConfig::default().with_reconnect_delay(Duration::ZERO);
        assert!(matches!(
            config.validate(),
            Err(ConfigError::ZeroDuration("reconnect delay"))
        ));
    }

    #[test]
    fn ice_server_list_parses_turn_credentials() {
        let servers = parse_ice_server_list(
            "stun:stun.example.test:3478, turn:alice:secret@turn.example.test:3478,,",
        );
        assert_eq!(
            servers,
            vec![
                IceServerConfig::new("stun:stun.example.test:3478"),
                IceServerConfig::new("turn:turn.example.test:3478")
                    .with_credentials("alice", "secret"),
            ]
        );
    }
}

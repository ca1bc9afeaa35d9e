use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Parser};

use crate::config::{
    DEFAULT_LOCAL_URL, DEFAULT_SIGNALING_URL, GatewayConfig, default_ice_servers,
    parse_ice_server_list,
};
use crate::identity::DEFAULT_PREFIX;
use crate::telemetry::logging::{LogConfig, LogLevel};

#[derive(Parser, Debug)]
#[command(
    name = "relay-gateway",
    about = "Relay remote peer connections onto a local WebSocket endpoint",
    author,
    version
)]
pub struct Cli {
    #[command(flatten)]
    pub gateway: GatewayArgs,

    #[command(flatten)]
    pub logging: LoggingArgs,
}

#[derive(Args, Debug, Clone)]
pub struct GatewayArgs {
    #[arg(
        long,
        env = "RELAY_SIGNALING_URL",
        default_value = DEFAULT_SIGNALING_URL,
        help = "Signaling server WebSocket URL"
    )]
    pub signaling_url: String,

    #[arg(
        long,
        env = "RELAY_LOCAL_URL",
        default_value = DEFAULT_LOCAL_URL,
        help = "Local message endpoint WebSocket URL"
    )]
    pub local_url: String,

    #[arg(
        long = "ice-server",
        value_name = "URL",
        env = "RELAY_ICE_SERVERS",
        value_delimiter = ',',
        help = "STUN/TURN server URL; TURN credentials as turn:user:pass@host:port (repeatable)"
    )]
    pub ice_servers: Vec<String>,

    #[arg(
        long,
        env = "RELAY_REMOTE_ID",
        value_name = "ID",
        help = "Fixed gateway identifier (PREFIX-XXXX-XXXX); generated when omitted"
    )]
    pub remote_id: Option<String>,

    #[arg(
        long,
        env = "RELAY_REMOTE_ID_PREFIX",
        default_value = DEFAULT_PREFIX,
        help = "Prefix for generated gateway identifiers"
    )]
    pub remote_id_prefix: String,

    #[arg(
        long,
        env = "RELAY_RECONNECT_DELAY_SECS",
        default_value_t = 5,
        help = "Seconds to wait before reconnecting to the signaling server"
    )]
    pub reconnect_delay_secs: u64,

    #[arg(
        long,
        env = "RELAY_HEARTBEAT_SECS",
        default_value_t = 30,
        help = "Seconds between keepalive pings on the signaling connection"
    )]
    pub heartbeat_secs: u64,
}

impl GatewayArgs {
    pub fn to_config(&self) -> GatewayConfig {
        let ice_servers = parse_ice_server_list(&self.ice_servers.join(","));
        let ice_servers = if ice_servers.is_empty() {
            default_ice_servers()
        } else {
            ice_servers
        };
        GatewayConfig {
            signaling_url: self.signaling_url.clone(),
            local_url: self.local_url.clone(),
            ice_servers,
            remote_id: self
                .remote_id
                .clone()
                .filter(|value| !value.trim().is_empty()),
            remote_id_prefix: self.remote_id_prefix.clone(),
            reconnect_delay: Duration::from_secs(self.reconnect_delay_secs),
            heartbeat_interval: Duration::from_secs(self.heartbeat_secs),
            on_ready: None,
        }
    }
}

#[derive(Args, Debug, Clone)]
pub struct LoggingArgs {
    #[arg(
        long = "log-level",
        value_enum,
        env = "RELAY_LOG_LEVEL",
        default_value_t = LogLevel::Info,
        help = "Minimum log level (error, warn, info, debug, trace)"
    )]
    pub level: LogLevel,

    #[arg(
        long = "log-file",
        value_name = "PATH",
        env = "RELAY_LOG_FILE",
        help = "Write logs to the specified file instead of stderr"
    )]
    pub file: Option<PathBuf>,
}

impl LoggingArgs {
    pub fn to_config(&self) -> LogConfig {
        LogConfig {
            level: self.level,
            file: self.file.clone(),
        }
    }
}

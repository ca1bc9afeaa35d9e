pub mod bridge;
pub mod cli;
pub mod config;
pub mod error;
pub mod gateway;
pub mod identity;
pub mod local;
pub mod session;
pub mod signaling;
pub mod telemetry;
pub mod transport;

pub use config::{GatewayConfig, IceServerConfig};
pub use error::GatewayError;
pub use gateway::Gateway;
pub use identity::GatewayIdentity;

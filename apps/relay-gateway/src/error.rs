use thiserror::Error;

use crate::config::ConfigError;
use crate::identity::IdentityError;
use crate::transport::TransportError;

/// Errors surfaced while constructing a [`crate::Gateway`].
/// Per-session and per-connection failures are logged where they happen
/// and never reach the caller.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Identity(#[from] IdentityError),
    #[error(transparent)]
    Transport(#[from] TransportError),
}

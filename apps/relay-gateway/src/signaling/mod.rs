pub mod client;
pub mod protocol;

pub use client::{SignalingClient, SignalingError, SignalingHandler, SignalingSender};
pub use protocol::{ClientMessage, ServerMessage};

//! # Switchboard Gateway
//!
//! HTTP/WebSocket front door: platform webhooks are routed to the tenant's
//! adapter, browser chat sockets are bridged into the realtime connection
//! manager, and everything received is republished on an event bus.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

/// Inbound event broadcast.
pub mod events;
mod server;

pub use events::{EventBroadcaster, EventEnvelope, GatewayEvent};
pub use server::{Gateway, GatewayState, MAX_WEBHOOK_BODY};

use switchboard_channels::ChannelError;
use switchboard_core::config::Config;

/// Build a gateway from configuration, start its channels, and serve until
/// `shutdown` resolves.
///
/// # Errors
///
/// Returns error if the server fails to start.
pub async fn start(
    config: &Config,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> Result<(), GatewayError> {
    let mut gateway = Gateway::from_config(config)?;
    gateway.start_channels(config).await;
    gateway.run(shutdown).await
}

/// Gateway errors.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    /// Server error.
    #[error("Server error: {0}")]
    Server(String),

    /// Configuration error.
    #[error("Config error: {0}")]
    Config(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Channel setup error.
    #[error(transparent)]
    Channel(#[from] ChannelError),
}

//! # Switchboard Channels
//!
//! Channel adapters for messaging platforms.
//!
//! Each platform gets a [`MessageTransformer`] (wire JSON <-> normalized
//! model) and a [`ChannelAdapter`] (credentials, lifecycle, outbound calls,
//! inbound webhooks). The [`ChannelFactory`] owns adapters per tenant and
//! keeps them healthy.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod http;
mod lifecycle;
mod traits;

/// Adapter factory.
pub mod factory;
/// Message transformers and markup conversion.
pub mod transform;
/// Webhook authenticity checks.
pub mod webhook;

/// WhatsApp channel adapter.
pub mod whatsapp;
/// Telegram channel adapter.
pub mod telegram;
/// Slack channel adapter.
pub mod slack;
/// Signal channel adapter.
pub mod signal;
/// Browser chat channel adapter.
pub mod webchat;

pub use factory::{
    AdapterBuilder, AdapterKey, ChannelConfiguration, ChannelFactory, PlatformAdapterBuilder,
};
pub use lifecycle::DEGRADED_AFTER_FAILURES;
pub use traits::{
    AdapterHealth, AdapterState, ChannelAdapter, ChannelError, HealthStatus, WebhookOutcome,
    features,
};
pub use transform::MessageTransformer;
pub use webhook::{
    WebhookFailure, WebhookRequest, WebhookSecrets, WebhookValidator, WebhookVerdict,
};

// Re-export channel implementations
pub use signal::SignalAdapter;
pub use slack::SlackAdapter;
pub use telegram::TelegramAdapter;
pub use webchat::{ConnectionManager, RealtimeEvent, WebChatAdapter};
pub use whatsapp::WhatsAppAdapter;

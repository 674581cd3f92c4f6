//! Channel adapter trait and shared result types.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use switchboard_core::config::ConfigError;
use switchboard_core::content::{ContentKind, MessageContent};
use switchboard_core::types::{
    ChannelType, DeliveryReceipt, DeliveryStatus, MessageMetadata, TransformedMessage,
};
use switchboard_core::validation::ValidationError;

use crate::webchat::ConnectionManager;
use crate::webhook::{WebhookFailure, WebhookRequest, WebhookVerdict};

/// Channel errors.
#[derive(Error, Debug)]
pub enum ChannelError {
    /// Settings missing, blank, or malformed.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Payload does not have the expected shape.
    #[error("Malformed payload: {0}")]
    Structure(String),

    /// Signature, token, or policy check failed.
    #[error("Authenticity check failed: {0}")]
    Authenticity(String),

    /// Platform call failed.
    #[error("Transport error: {message}")]
    Transport {
        /// HTTP status, when one was received.
        status: Option<u16>,
        /// Error detail.
        message: String,
    },

    /// Platform asked us to slow down.
    #[error("Rate limited")]
    RateLimited,

    /// Operation not allowed in the adapter's current state.
    #[error("Lifecycle error: {0}")]
    Lifecycle(String),

    /// Operation exceeded its deadline.
    #[error("Timed out after {0:?}")]
    Timeout(Duration),
}

impl ChannelError {
    /// Transport error without an HTTP status.
    pub fn network(err: impl std::fmt::Display) -> Self {
        Self::Transport {
            status: None,
            message: scrub(&err.to_string()),
        }
    }
}

impl From<ConfigError> for ChannelError {
    fn from(err: ConfigError) -> Self {
        Self::Configuration(err.to_string())
    }
}

impl From<ValidationError> for ChannelError {
    fn from(err: ValidationError) -> Self {
        Self::Structure(err.to_string())
    }
}

impl From<serde_json::Error> for ChannelError {
    fn from(err: serde_json::Error) -> Self {
        Self::Structure(err.to_string())
    }
}

/// Redact token-like substrings (reqwest errors embed request URLs).
pub(crate) fn scrub(text: &str) -> String {
    switchboard_core::secrets::scrub_secrets(
        text,
        switchboard_core::secrets::COMMON_SECRET_PATTERNS,
    )
}

/// Adapter lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdapterState {
    /// Constructed, not yet initialized.
    Uninitialized,
    /// `initialize` in progress.
    Initializing,
    /// Running and healthy.
    Healthy,
    /// Running with recent failures.
    Degraded,
    /// Running but failing its health check.
    Unhealthy,
    /// `shutdown` in progress.
    ShuttingDown,
    /// Stopped. Terminal.
    Shutdown,
}

impl AdapterState {
    /// Whether sends and webhook processing are allowed.
    #[must_use]
    pub const fn is_running(self) -> bool {
        matches!(self, Self::Healthy | Self::Degraded | Self::Unhealthy)
    }
}

/// Health classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// Fully operational.
    Healthy,
    /// Operational with recent failures.
    Degraded,
    /// Not operational.
    Unhealthy,
}

/// Health report of one adapter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdapterHealth {
    /// Classification.
    pub status: HealthStatus,
    /// When the check ran.
    pub last_check: DateTime<Utc>,
    /// Free-form details (account, failure streak, errors).
    #[serde(default)]
    pub details: serde_json::Map<String, serde_json::Value>,
}

impl AdapterHealth {
    /// Report with no details.
    #[must_use]
    pub fn new(status: HealthStatus) -> Self {
        Self {
            status,
            last_check: Utc::now(),
            details: serde_json::Map::new(),
        }
    }

    /// Add a detail entry.
    #[must_use]
    pub fn with_detail(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.details.insert(key.to_string(), value.into());
        self
    }
}

/// Result of processing one inbound webhook.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WebhookOutcome {
    /// Whether the request passed validation.
    pub is_valid: bool,
    /// Normalized inbound messages.
    pub messages: Vec<TransformedMessage>,
    /// Status updates for earlier outbound messages.
    pub receipts: Vec<DeliveryReceipt>,
    /// Challenge to echo back verbatim.
    pub challenge: Option<String>,
    /// Why validation failed.
    pub error: Option<WebhookFailure>,
    /// Batch items that could not be parsed.
    pub skipped: usize,
}

impl WebhookOutcome {
    /// Valid request with nothing in it yet.
    #[must_use]
    pub fn accepted() -> Self {
        Self {
            is_valid: true,
            ..Self::default()
        }
    }

    /// Rejected request.
    #[must_use]
    pub fn rejected(error: WebhookFailure) -> Self {
        Self {
            is_valid: false,
            error: Some(error),
            ..Self::default()
        }
    }

    /// Handshake answered with a challenge.
    #[must_use]
    pub fn challenge(challenge: impl Into<String>) -> Self {
        Self {
            is_valid: true,
            challenge: Some(challenge.into()),
            ..Self::default()
        }
    }
}

impl From<WebhookVerdict> for WebhookOutcome {
    fn from(verdict: WebhookVerdict) -> Self {
        Self {
            is_valid: verdict.is_valid,
            challenge: verdict.challenge,
            error: verdict.error,
            ..Self::default()
        }
    }
}

/// Platform-specific feature names answered by [`ChannelAdapter::supports_feature`].
pub mod features {
    /// Plain text.
    pub const TEXT: &str = "text";
    /// Media by reference.
    pub const MEDIA: &str = "media";
    /// Locations.
    pub const LOCATION: &str = "location";
    /// Contact cards.
    pub const CONTACT: &str = "contact";
    /// Buttons and lists.
    pub const INTERACTIVE: &str = "interactive";
    /// Rich text ranges.
    pub const FORMATTING: &str = "formatting";
    /// Threads or topics.
    pub const THREADS: &str = "threads";
    /// Reactions.
    pub const REACTIONS: &str = "reactions";
    /// Edits.
    pub const EDITING: &str = "editing";
    /// Read receipts.
    pub const READ_RECEIPTS: &str = "read_receipts";
    /// Typing indicators.
    pub const TYPING: &str = "typing";
    /// Presence.
    pub const PRESENCE: &str = "presence";
    /// Queueing for offline recipients.
    pub const OFFLINE_QUEUE: &str = "offline_queue";
    /// Inbound webhooks.
    pub const WEBHOOKS: &str = "webhooks";
}

/// A messaging platform adapter.
///
/// `send_message` and `process_incoming_webhook` only fail with
/// [`ChannelError::Lifecycle`]; every other failure is reported in the
/// returned value.
#[async_trait]
pub trait ChannelAdapter: Send + Sync {
    /// Platform this adapter talks to.
    fn channel_type(&self) -> ChannelType;

    /// Stable instance identifier (`<type>:<tenant>`).
    fn channel_id(&self) -> &str;

    /// Human-readable name.
    fn channel_name(&self) -> &str;

    /// Content variants this adapter can send natively.
    fn supported_message_types(&self) -> &'static [ContentKind];

    /// Whether a named feature is supported. See [`features`].
    fn supports_feature(&self, feature: &str) -> bool;

    /// Current lifecycle state.
    fn state(&self) -> AdapterState;

    /// Verify credentials with a live identity call and start running.
    async fn initialize(&self) -> Result<(), ChannelError>;

    /// Send content to a user or conversation.
    async fn send_message(
        &self,
        user_id: &str,
        content: &MessageContent,
        metadata: Option<&MessageMetadata>,
    ) -> Result<DeliveryStatus, ChannelError>;

    /// Validate and normalize an inbound webhook.
    async fn process_incoming_webhook(
        &self,
        request: &WebhookRequest,
    ) -> Result<WebhookOutcome, ChannelError>;

    /// Authenticity check only.
    fn validate_webhook(&self, request: &WebhookRequest) -> bool;

    /// Live health check combined with the recent failure streak.
    async fn health_status(&self) -> AdapterHealth;

    /// Stop running. Idempotent.
    async fn shutdown(&self) -> Result<(), ChannelError>;

    /// Connection manager for channels fed by a realtime transport.
    fn realtime_manager(&self) -> Option<Arc<ConnectionManager>> {
        None
    }
}

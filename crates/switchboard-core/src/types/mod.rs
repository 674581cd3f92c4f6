//! Core types used throughout Switchboard.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::content::MessageContent;

/// Messaging platform identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelType {
    /// WhatsApp Business Cloud API.
    WhatsApp,
    /// Telegram Bot API.
    Telegram,
    /// Slack Events + Web API.
    Slack,
    /// Signal via the signal-cli REST bridge.
    Signal,
    /// Browser-based realtime chat.
    WebChat,
}

impl ChannelType {
    /// All channel types, in a stable order.
    pub const ALL: [Self; 5] = [
        Self::WhatsApp,
        Self::Telegram,
        Self::Slack,
        Self::Signal,
        Self::WebChat,
    ];

    /// Stable identifier (e.g. "telegram").
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::WhatsApp => "whatsapp",
            Self::Telegram => "telegram",
            Self::Slack => "slack",
            Self::Signal => "signal",
            Self::WebChat => "webchat",
        }
    }

    /// Human-readable label.
    #[must_use]
    pub const fn label(&self) -> &'static str {
        match self {
            Self::WhatsApp => "WhatsApp",
            Self::Telegram => "Telegram",
            Self::Slack => "Slack",
            Self::Signal => "Signal",
            Self::WebChat => "Web Chat",
        }
    }
}

impl fmt::Display for ChannelType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ChannelType {
    type Err = UnknownChannelType;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "whatsapp" => Ok(Self::WhatsApp),
            "telegram" => Ok(Self::Telegram),
            "slack" => Ok(Self::Slack),
            "signal" => Ok(Self::Signal),
            "webchat" | "web" | "websocket" => Ok(Self::WebChat),
            _ => Err(UnknownChannelType(s.to_string())),
        }
    }
}

/// Error returned when parsing an unknown channel type.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Unknown channel type: {0}")]
pub struct UnknownChannelType(pub String);

/// Identifier of an isolated customer/organization.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TenantId(pub String);

impl TenantId {
    /// Create a new tenant ID.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

impl fmt::Display for TenantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for TenantId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Build a composite user ID for group or channel conversations.
///
/// Format: `<conversation_id>:<user_id>`.
#[must_use]
pub fn composite_user_id(conversation_id: &str, user_id: &str) -> String {
    format!("{conversation_id}:{user_id}")
}

/// Split a user ID into `(conversation, user)`.
///
/// Bare IDs (direct messages) return `(None, id)`.
#[must_use]
pub fn split_user_id(user_id: &str) -> (Option<&str>, &str) {
    match user_id.split_once(':') {
        Some((conversation, user)) if !conversation.is_empty() && !user.is_empty() => {
            (Some(conversation), user)
        }
        _ => (None, user_id),
    }
}

/// Recipient address for outbound delivery: the conversation part of a
/// composite ID, or the bare ID itself.
#[must_use]
pub fn recipient_of(user_id: &str) -> &str {
    match split_user_id(user_id) {
        (Some(conversation), _) => conversation,
        (None, user) => user,
    }
}

/// Priority hint for a message.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    /// Low priority.
    Low,
    /// Normal priority.
    #[default]
    Normal,
    /// High priority.
    High,
    /// Urgent.
    Urgent,
}

/// A reaction attached to a message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Reaction {
    /// Emoji.
    pub emoji: String,
    /// Reacting user.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
}

/// Outcome state of an outbound message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryState {
    /// Accepted locally, not yet handed to the platform.
    Pending,
    /// Held for an offline recipient.
    Queued,
    /// Accepted by the platform.
    Sent,
    /// Delivered to the recipient device.
    Delivered,
    /// Read by the recipient.
    Read,
    /// Delivery failed.
    Failed,
}

impl DeliveryState {
    /// Parse a platform status string ("sent", "delivered", ...).
    #[must_use]
    pub fn from_platform(status: &str) -> Option<Self> {
        match status.to_ascii_lowercase().as_str() {
            "pending" => Some(Self::Pending),
            "queued" => Some(Self::Queued),
            "sent" => Some(Self::Sent),
            "delivered" => Some(Self::Delivered),
            "read" | "seen" => Some(Self::Read),
            "failed" | "undelivered" => Some(Self::Failed),
            _ => None,
        }
    }
}

/// Result record of an outbound send attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryStatus {
    /// Delivery state.
    pub status: DeliveryState,
    /// Message ID assigned by the platform.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    /// When the status was recorded.
    pub timestamp: DateTime<Utc>,
    /// Human-readable failure reason.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Raw platform response, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform_response: Option<serde_json::Value>,
}

impl DeliveryStatus {
    /// Message accepted by the platform.
    #[must_use]
    pub fn sent(message_id: impl Into<String>) -> Self {
        Self {
            status: DeliveryState::Sent,
            message_id: Some(message_id.into()),
            timestamp: Utc::now(),
            error: None,
            platform_response: None,
        }
    }

    /// Message held for later delivery.
    #[must_use]
    pub fn queued(message_id: impl Into<String>) -> Self {
        Self {
            status: DeliveryState::Queued,
            message_id: Some(message_id.into()),
            timestamp: Utc::now(),
            error: None,
            platform_response: None,
        }
    }

    /// Delivery failed.
    #[must_use]
    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            status: DeliveryState::Failed,
            message_id: None,
            timestamp: Utc::now(),
            error: Some(error.into()),
            platform_response: None,
        }
    }

    /// Attach the raw platform response.
    #[must_use]
    pub fn with_platform_response(mut self, response: serde_json::Value) -> Self {
        self.platform_response = Some(response);
        self
    }

    /// Whether the attempt failed.
    #[must_use]
    pub fn is_failed(&self) -> bool {
        self.status == DeliveryState::Failed
    }
}

/// Platform-reported status change of an earlier outbound message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryReceipt {
    /// Platform message ID the receipt refers to.
    pub message_id: String,
    /// Recipient the receipt refers to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recipient_id: Option<String>,
    /// New state.
    pub status: DeliveryState,
    /// When the platform observed the change.
    pub timestamp: DateTime<Utc>,
    /// Failure detail.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Optional envelope carried alongside content. Best-effort.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageMetadata {
    /// Channel-native message ID.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel_message_id: Option<String>,
    /// Thread or topic ID.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<String>,
    /// ID of the message being replied to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<String>,
    /// Whether the message was forwarded.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub forwarded: bool,
    /// When the message was last edited.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub edited_at: Option<DateTime<Utc>>,
    /// Delivery/read receipt.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delivery: Option<DeliveryReceipt>,
    /// Reactions.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub reactions: Vec<Reaction>,
    /// Priority hint.
    #[serde(default)]
    pub priority: Priority,
    /// Free-form platform-specific data.
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub platform_data: serde_json::Map<String, serde_json::Value>,
}

impl MessageMetadata {
    /// Insert a platform-specific value.
    pub fn insert_platform_data(&mut self, key: &str, value: impl Into<serde_json::Value>) {
        self.platform_data.insert(key.to_string(), value.into());
    }
}

/// Canonical output of inbound transformation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransformedMessage {
    /// Sender (composite for group conversations).
    pub user_id: String,
    /// Normalized content.
    pub content: MessageContent,
    /// Metadata envelope.
    #[serde(default)]
    pub metadata: MessageMetadata,
    /// Time the platform reported for the message.
    pub timestamp: DateTime<Utc>,
    /// Platform message ID.
    pub platform_message_id: String,
}

/// Parse a Unix timestamp in seconds, falling back to now.
#[must_use]
pub fn timestamp_from_secs(secs: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(secs, 0).unwrap_or_else(Utc::now)
}

/// Parse a Unix timestamp in milliseconds, falling back to now.
#[must_use]
pub fn timestamp_from_millis(millis: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(millis).unwrap_or_else(Utc::now)
}

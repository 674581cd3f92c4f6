//! JSON frames exchanged with browser clients: `{type, data, timestamp}`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use switchboard_core::content::MessageContent;
use switchboard_core::types::MessageMetadata;

use crate::traits::ChannelError;

/// A frame received from a client.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientFrame {
    /// Authenticate with a bearer token.
    Auth(AuthData),
    /// Send a message.
    Message(MessageData),
    /// Typing indicator.
    Typing(TypingData),
    /// Mark a message as read.
    ReadReceipt(ReadReceiptData),
    /// Announce an uploaded file.
    FileUpload(FileUploadData),
    /// Liveness check.
    Ping,
    /// Answer to a server keepalive ping.
    Pong,
}

impl ClientFrame {
    /// Parse a text frame.
    ///
    /// # Errors
    ///
    /// Returns `ChannelError::Structure` for malformed JSON, unknown frame
    /// types, or data that does not match the type.
    pub fn parse(text: &str) -> Result<Self, ChannelError> {
        let raw: RawFrame = serde_json::from_str(text)?;
        let data = raw.data;
        Ok(match raw.kind.as_str() {
            "auth" => Self::Auth(serde_json::from_value(data)?),
            "message" => Self::Message(serde_json::from_value(data)?),
            "typing" => Self::Typing(serde_json::from_value(data)?),
            "read_receipt" => Self::ReadReceipt(serde_json::from_value(data)?),
            "file_upload" => Self::FileUpload(serde_json::from_value(data)?),
            "ping" => Self::Ping,
            "pong" => Self::Pong,
            other => {
                return Err(ChannelError::Structure(format!("unknown frame type {other}")));
            }
        })
    }
}

#[derive(Debug, Deserialize)]
struct RawFrame {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    data: Value,
}

/// `auth` frame data.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthData {
    /// Bearer token.
    pub token: String,
    /// Session to resume.
    #[serde(default)]
    pub session_id: Option<String>,
}

/// `message` frame data.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageData {
    /// Message body.
    pub content: MessageContent,
    /// Client-side ID echoed in the ack.
    #[serde(default)]
    pub client_message_id: Option<String>,
    /// Message being replied to.
    #[serde(default)]
    pub reply_to: Option<String>,
    /// Thread the message belongs to.
    #[serde(default)]
    pub thread_id: Option<String>,
}

/// `typing` frame data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypingData {
    /// Started or stopped typing.
    pub is_typing: bool,
}

/// `read_receipt` frame data.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadReceiptData {
    /// Message that was read.
    pub message_id: String,
}

/// `file_upload` frame data. The bytes were already stored by the upload
/// service; the frame only references them.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileUploadData {
    /// Where the upload service stored the file.
    pub url: String,
    /// Original file name.
    pub filename: String,
    /// MIME type reported by the client.
    #[serde(default)]
    pub mime_type: Option<String>,
    /// Size in bytes.
    pub size: u64,
    /// Optional caption.
    #[serde(default)]
    pub caption: Option<String>,
    /// Client-side ID echoed in the ack.
    #[serde(default)]
    pub client_message_id: Option<String>,
}

/// A frame sent to a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ServerFrame {
    /// Sent on connect.
    AuthRequired {
        /// Seconds until the connection is closed.
        #[serde(rename = "timeoutSecs")]
        timeout_secs: u64,
    },
    /// Authentication accepted.
    #[serde(rename_all = "camelCase")]
    AuthSuccess {
        /// Authenticated user.
        user_id: String,
        /// Session created or resumed.
        session_id: String,
        /// Whether an existing session was resumed.
        resumed: bool,
        /// Offline messages about to be delivered.
        queued: usize,
    },
    /// Authentication rejected.
    AuthError {
        /// Reason.
        error: String,
    },
    /// A message for the user.
    Message(MessageFrame),
    /// Acknowledgement of a client message.
    #[serde(rename_all = "camelCase")]
    MessageAck {
        /// ID the client supplied.
        #[serde(skip_serializing_if = "Option::is_none")]
        client_message_id: Option<String>,
        /// ID assigned by the server.
        message_id: String,
        /// Delivery state.
        status: String,
    },
    /// Typing indicator.
    #[serde(rename_all = "camelCase")]
    Typing {
        /// Who is typing.
        user_id: String,
        /// Started or stopped.
        is_typing: bool,
    },
    /// Read receipt.
    #[serde(rename_all = "camelCase")]
    ReadReceipt {
        /// Message that was read.
        message_id: String,
        /// Reader.
        user_id: String,
    },
    /// Presence change.
    #[serde(rename_all = "camelCase")]
    Presence {
        /// User whose presence changed.
        user_id: String,
        /// Online or offline.
        online: bool,
        /// Last activity.
        last_seen: DateTime<Utc>,
    },
    /// Keepalive ping.
    Ping,
    /// Answer to a client ping.
    Pong,
    /// Error.
    Error {
        /// Machine-readable code.
        code: String,
        /// Detail.
        message: String,
    },
}

impl ServerFrame {
    /// Error frame.
    #[must_use]
    pub fn error(code: &str, message: impl Into<String>) -> Self {
        Self::Error {
            code: code.to_string(),
            message: message.into(),
        }
    }

    /// Serialize with the current timestamp.
    ///
    /// # Errors
    ///
    /// Returns error if serialization fails.
    pub fn to_text(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(&Envelope {
            frame: self,
            timestamp: Utc::now(),
        })
    }
}

#[derive(Serialize)]
struct Envelope<'a> {
    #[serde(flatten)]
    frame: &'a ServerFrame,
    timestamp: DateTime<Utc>,
}

/// Data of an outbound `message` frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageFrame {
    /// Server-assigned ID.
    pub message_id: String,
    /// Body.
    pub content: MessageContent,
    /// Optional metadata.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<MessageMetadata>,
    /// When the message was created.
    pub sent_at: DateTime<Utc>,
}

//! Bidirectional message transformers.
//!
//! One transformer per platform converts raw webhook JSON into a
//! [`TransformedMessage`] and renders [`MessageContent`] into the platform's
//! outbound payload. Transformers are pure: no I/O, no state.

pub mod markup;

use serde::Deserialize;
use serde_json::Value;

use switchboard_core::content::{MessageContent, validate_content};
use switchboard_core::types::{ChannelType, MessageMetadata, TransformedMessage};
use switchboard_core::validation::{limits, validate_message_content};

use crate::traits::{ChannelError, WebhookOutcome};

pub use markup::{Dialect, char_to_utf16_range, parse_markup, render_markup, utf16_to_char_range};

/// Converts between one platform's wire format and the normalized model.
pub trait MessageTransformer: Send + Sync {
    /// Platform handled by this transformer.
    fn channel_type(&self) -> ChannelType;

    /// Normalize one inbound platform message.
    ///
    /// # Errors
    ///
    /// Returns `ChannelError::Structure` if required fields are missing or
    /// the resulting content fails validation.
    fn parse_incoming(&self, raw: &Value) -> Result<TransformedMessage, ChannelError>;

    /// Render content as the platform's outbound payload.
    ///
    /// Never fails: content the platform cannot express degrades to text.
    fn format_outgoing(
        &self,
        user_id: &str,
        content: &MessageContent,
        metadata: Option<&MessageMetadata>,
    ) -> Value;

    /// Cheap shape check without full parsing.
    fn validate_structure(&self, raw: &Value) -> bool;

    /// Sender ID (composite for group conversations).
    ///
    /// # Errors
    ///
    /// Returns `ChannelError::Structure` if no sender can be found.
    fn extract_user_id(&self, raw: &Value) -> Result<String, ChannelError>;
}

/// Deserialize a typed wire struct from raw JSON.
pub(crate) fn decode<'a, T: Deserialize<'a>>(raw: &'a Value) -> Result<T, ChannelError> {
    T::deserialize(raw).map_err(|e| ChannelError::Structure(e.to_string()))
}

/// Sanitize inbound text that carries no offset ranges.
pub(crate) fn clean_text(text: &str) -> Result<String, ChannelError> {
    Ok(validate_message_content(text, limits::MAX_MESSAGE_LENGTH)?)
}

/// Validate the content of a freshly parsed message.
pub(crate) fn finish(message: TransformedMessage) -> Result<TransformedMessage, ChannelError> {
    validate_content(&message.content)?;
    Ok(message)
}

/// Parse every item of a batch independently, counting the ones that fail.
pub(crate) fn parse_batch<'a>(
    transformer: &dyn MessageTransformer,
    items: impl IntoIterator<Item = &'a Value>,
    outcome: &mut WebhookOutcome,
) {
    for (index, item) in items.into_iter().enumerate() {
        match transformer.parse_incoming(item) {
            Ok(message) => outcome.messages.push(message),
            Err(e) => {
                tracing::warn!(
                    channel = %transformer.channel_type(),
                    index,
                    error = %e,
                    "Skipping malformed webhook item"
                );
                outcome.skipped += 1;
            }
        }
    }
}

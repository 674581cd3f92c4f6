//! Signal envelope <-> normalized message conversion.
//!
//! Envelopes come from the signal-cli REST bridge. Signal identifies
//! messages by their sent timestamp (milliseconds), so that timestamp is the
//! platform message ID in both directions.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::Deserialize;
use serde_json::{Value, json};

use switchboard_core::content::{
    Dimensions, FormatKind, MediaContent, MediaType, MessageContent, TextContent, TextFormat,
};
use switchboard_core::types::{
    ChannelType, DeliveryReceipt, DeliveryState, MessageMetadata, TransformedMessage,
    composite_user_id, split_user_id, timestamp_from_millis,
};
use switchboard_core::validation::media_type_from_mime;

use crate::traits::{ChannelError, WebhookOutcome};
use crate::transform::{
    Dialect, MessageTransformer, clean_text, decode, finish, parse_batch, render_markup,
    utf16_to_char_range,
};

const GROUP_PREFIX: &str = "group.";

/// Signal transformer.
///
/// Outbound payloads omit the sending `number`; the adapter fills it in.
#[derive(Debug, Clone, Copy, Default)]
pub struct SignalTransformer;

impl MessageTransformer for SignalTransformer {
    fn channel_type(&self) -> ChannelType {
        ChannelType::Signal
    }

    fn parse_incoming(&self, raw: &Value) -> Result<TransformedMessage, ChannelError> {
        let received: SignalReceived = decode(raw)?;
        parse_envelope(received)
    }

    fn format_outgoing(
        &self,
        user_id: &str,
        content: &MessageContent,
        metadata: Option<&MessageMetadata>,
    ) -> Value {
        let message = match content {
            MessageContent::Text(text) => {
                render_markup(&text.text, &text.formatting, Dialect::Signal)
            }
            other => other.fallback_text(),
        };
        let mut payload = json!({
            "recipients": [recipient(user_id)],
            "message": message,
            "text_mode": "styled",
        });

        if let Some(quote) = metadata
            .and_then(|m| m.reply_to.as_deref())
            .and_then(|r| r.parse::<i64>().ok())
        {
            let (_, author) = split_user_id(user_id);
            payload["quote_timestamp"] = json!(quote);
            payload["quote_author"] = json!(author);
        }
        payload
    }

    fn validate_structure(&self, raw: &Value) -> bool {
        raw.pointer("/envelope/timestamp").is_some_and(Value::is_i64)
            && (raw.pointer("/envelope/dataMessage").is_some_and(Value::is_object)
                || raw.pointer("/envelope/editMessage/dataMessage").is_some_and(Value::is_object))
    }

    fn extract_user_id(&self, raw: &Value) -> Result<String, ChannelError> {
        let received: SignalReceived = decode(raw)?;
        let envelope = received.envelope;
        let data = envelope
            .data_message
            .as_ref()
            .or_else(|| envelope.edit_message.as_ref().map(|e| &e.data_message))
            .ok_or_else(|| ChannelError::Structure("envelope carries no data message".to_string()))?;
        sender_id(&envelope, data)
    }
}

/// Outbound recipient: a phone number, or the bridge's `group.<base64>` form.
fn recipient(user_id: &str) -> String {
    match split_user_id(user_id) {
        (Some(group), _) if group.starts_with(GROUP_PREFIX) => group.to_string(),
        (Some(group), _) => format!("{GROUP_PREFIX}{}", STANDARD.encode(group)),
        (None, user) => user.to_string(),
    }
}

fn sender_id(envelope: &SignalEnvelope, data: &SignalDataMessage) -> Result<String, ChannelError> {
    let source = envelope
        .source_number
        .as_deref()
        .or(envelope.source.as_deref())
        .or(envelope.source_uuid.as_deref())
        .ok_or_else(|| ChannelError::Structure("envelope without source".to_string()))?;
    Ok(match &data.group_info {
        Some(group) => composite_user_id(&group.group_id, source),
        None => source.to_string(),
    })
}

fn parse_envelope(received: SignalReceived) -> Result<TransformedMessage, ChannelError> {
    let SignalReceived { envelope, account } = received;
    let (data, edit_target) = match (&envelope.data_message, &envelope.edit_message) {
        (Some(data), _) => (data, None),
        (None, Some(edit)) => (&edit.data_message, Some(edit.target_sent_timestamp)),
        (None, None) => {
            return Err(ChannelError::Structure(
                "envelope carries no data message".to_string(),
            ));
        }
    };
    if data.reaction.is_some() {
        return Err(ChannelError::Structure("reactions are not messages".to_string()));
    }

    let user_id = sender_id(&envelope, data)?;
    let sent_at = data.timestamp.unwrap_or(envelope.timestamp);
    let message_id = edit_target.unwrap_or(sent_at).to_string();

    let mut metadata = MessageMetadata {
        channel_message_id: Some(message_id.clone()),
        reply_to: data.quote.as_ref().map(|q| q.id.to_string()),
        edited_at: edit_target.map(|_| timestamp_from_millis(envelope.timestamp)),
        ..MessageMetadata::default()
    };
    if let Some(uuid) = &envelope.source_uuid {
        metadata.insert_platform_data("sourceUuid", uuid.clone());
    }
    if let Some(name) = &envelope.source_name {
        metadata.insert_platform_data("sourceName", name.clone());
    }
    if let Some(group) = &data.group_info {
        metadata.insert_platform_data("groupId", group.group_id.clone());
    }
    if let Some(account) = account {
        metadata.insert_platform_data("account", account);
    }

    finish(TransformedMessage {
        user_id,
        content: data_content(data)?,
        metadata,
        timestamp: timestamp_from_millis(envelope.timestamp),
        platform_message_id: message_id,
    })
}

fn data_content(data: &SignalDataMessage) -> Result<MessageContent, ChannelError> {
    let text = data.message.as_deref().filter(|t| !t.is_empty());

    if let Some(attachment) = data.attachments.first() {
        let mut media = MediaContent::new(
            media_type_from_mime(&attachment.content_type),
            attachment.id.clone(),
        );
        media.mime_type = Some(attachment.content_type.clone());
        media.filename.clone_from(&attachment.filename);
        media.size = attachment.size;
        media.caption = text.map(clean_text).transpose()?;
        if let (Some(width), Some(height)) = (attachment.width, attachment.height) {
            media.dimensions = Some(Dimensions { width, height });
        }
        return Ok(MessageContent::Media(media));
    }

    if let Some(sticker) = &data.sticker {
        let url = format!("sticker:{}/{}", sticker.pack_id, sticker.sticker_id);
        return Ok(MessageContent::Media(MediaContent::new(MediaType::Sticker, url)));
    }

    let text = text.ok_or_else(|| ChannelError::Structure("data message without body".to_string()))?;
    let formatting = ranges_to_formatting(text, &data.text_styles, &data.mentions);
    let text = if formatting.is_empty() {
        clean_text(text)?
    } else {
        text.to_string()
    };
    Ok(MessageContent::Text(TextContent { text, formatting }))
}

fn ranges_to_formatting(
    text: &str,
    styles: &[SignalTextStyle],
    mentions: &[SignalMention],
) -> Vec<TextFormat> {
    let styled = styles.iter().filter_map(|style| {
        let kind = match style.style.as_str() {
            "BOLD" => FormatKind::Bold,
            "ITALIC" => FormatKind::Italic,
            "STRIKETHROUGH" => FormatKind::Strikethrough,
            "MONOSPACE" => FormatKind::Code,
            "SPOILER" => FormatKind::Spoiler,
            _ => return None,
        };
        Some((kind, style.start, style.length))
    });
    let mentioned = mentions.iter().filter_map(|mention| {
        let user_id = mention.uuid.clone().or_else(|| mention.number.clone())?;
        Some((FormatKind::Mention { user_id }, mention.start, mention.length))
    });

    let mut formatting: Vec<TextFormat> = styled
        .chain(mentioned)
        .filter_map(|(kind, start, length)| {
            let (offset, length) = utf16_to_char_range(text, start, length)?;
            (length > 0).then(|| TextFormat::new(kind, offset, length))
        })
        .collect();
    formatting.sort_by_key(|f| (f.offset, std::cmp::Reverse(f.length)));
    formatting
}

/// Split a webhook body (one envelope or an array) into messages and receipts.
pub(crate) fn collect_webhook(body: &Value, outcome: &mut WebhookOutcome) {
    let items: Vec<&Value> = match body {
        Value::Array(items) => items.iter().collect(),
        single => vec![single],
    };

    let (receipts, messages): (Vec<&Value>, Vec<&Value>) = items
        .into_iter()
        .partition(|item| item.pointer("/envelope/receiptMessage").is_some());

    for item in receipts {
        match receipts_of(item) {
            Ok(parsed) => outcome.receipts.extend(parsed),
            Err(e) => {
                tracing::warn!(channel = "signal", error = %e, "Skipping malformed receipt");
                outcome.skipped += 1;
            }
        }
    }
    parse_batch(&SignalTransformer, messages, outcome);
}

fn receipts_of(raw: &Value) -> Result<Vec<DeliveryReceipt>, ChannelError> {
    let received: SignalReceived = decode(raw)?;
    let envelope = received.envelope;
    let receipt = envelope
        .receipt_message
        .ok_or_else(|| ChannelError::Structure("envelope carries no receipt".to_string()))?;
    let status = if receipt.is_read || receipt.is_viewed {
        DeliveryState::Read
    } else if receipt.is_delivery {
        DeliveryState::Delivered
    } else {
        return Err(ChannelError::Structure("receipt of unknown kind".to_string()));
    };
    let recipient = envelope.source_number.or(envelope.source).or(envelope.source_uuid);
    let timestamp = timestamp_from_millis(receipt.when.unwrap_or(envelope.timestamp));

    Ok(receipt
        .timestamps
        .into_iter()
        .map(|sent| DeliveryReceipt {
            message_id: sent.to_string(),
            recipient_id: recipient.clone(),
            status,
            timestamp,
            error: None,
        })
        .collect())
}

// signal-cli REST types

#[derive(Debug, Deserialize)]
struct SignalReceived {
    envelope: SignalEnvelope,
    account: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SignalEnvelope {
    source: Option<String>,
    source_number: Option<String>,
    source_uuid: Option<String>,
    source_name: Option<String>,
    timestamp: i64,
    data_message: Option<SignalDataMessage>,
    edit_message: Option<SignalEditMessage>,
    receipt_message: Option<SignalReceiptMessage>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SignalDataMessage {
    timestamp: Option<i64>,
    message: Option<String>,
    group_info: Option<SignalGroupInfo>,
    quote: Option<SignalQuote>,
    sticker: Option<SignalSticker>,
    reaction: Option<Value>,
    #[serde(default)]
    attachments: Vec<SignalAttachment>,
    #[serde(default)]
    mentions: Vec<SignalMention>,
    #[serde(default)]
    text_styles: Vec<SignalTextStyle>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SignalEditMessage {
    target_sent_timestamp: i64,
    data_message: SignalDataMessage,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SignalReceiptMessage {
    when: Option<i64>,
    #[serde(default)]
    is_delivery: bool,
    #[serde(default)]
    is_read: bool,
    #[serde(default)]
    is_viewed: bool,
    #[serde(default)]
    timestamps: Vec<i64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SignalGroupInfo {
    group_id: String,
}

#[derive(Debug, Deserialize)]
struct SignalQuote {
    id: i64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SignalSticker {
    pack_id: String,
    sticker_id: u32,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SignalAttachment {
    id: String,
    content_type: String,
    filename: Option<String>,
    size: Option<u64>,
    width: Option<u32>,
    height: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct SignalMention {
    uuid: Option<String>,
    number: Option<String>,
    start: usize,
    length: usize,
}

#[derive(Debug, Deserialize)]
struct SignalTextStyle {
    style: String,
    start: usize,
    length: usize,
}

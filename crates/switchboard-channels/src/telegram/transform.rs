//! Telegram update <-> normalized message conversion.

use serde::Deserialize;
use serde_json::{Value, json};

use switchboard_core::content::{
    ContactContent, ContactPhone, Dimensions, FormatKind, InteractiveContent, InteractiveReply,
    InteractiveType, LocationContent, MediaContent, MediaType, MessageContent, TextContent,
    TextFormat,
};
use switchboard_core::types::{
    ChannelType, MessageMetadata, TransformedMessage, composite_user_id, recipient_of,
    timestamp_from_secs,
};

use crate::traits::ChannelError;
use crate::transform::{
    MessageTransformer, char_to_utf16_range, clean_text, decode, finish, utf16_to_char_range,
};

/// Telegram Bot API transformer.
///
/// Outbound payloads carry the Bot API method under `"method"`; the
/// adapter strips it before posting.
#[derive(Debug, Clone, Copy, Default)]
pub struct TelegramTransformer;

impl MessageTransformer for TelegramTransformer {
    fn channel_type(&self) -> ChannelType {
        ChannelType::Telegram
    }

    fn parse_incoming(&self, raw: &Value) -> Result<TransformedMessage, ChannelError> {
        let update: TgUpdate = decode(raw)?;
        if let Some(query) = update.callback_query {
            return parse_callback(update.update_id, query);
        }
        let edited = update.edited_message.is_some() || update.edited_channel_post.is_some();
        let message = update
            .message
            .or(update.edited_message)
            .or(update.channel_post)
            .or(update.edited_channel_post)
            .ok_or_else(|| ChannelError::Structure("update carries no message".to_string()))?;
        parse_message(update.update_id, message, edited)
    }

    fn format_outgoing(
        &self,
        user_id: &str,
        content: &MessageContent,
        metadata: Option<&MessageMetadata>,
    ) -> Value {
        let chat_id = recipient_of(user_id);
        let mut payload = match content {
            MessageContent::Text(text) => text_payload(chat_id, &text.text, &text.formatting),
            MessageContent::Media(media) => {
                let (method, field) = media_method(media.media_type);
                let mut payload = json!({ "method": method, "chat_id": chat_id });
                payload[field] = json!(media.url);
                if let Some(caption) = &media.caption {
                    payload["caption"] = json!(caption);
                    let entities = formatting_to_entities(caption, &media.caption_formatting);
                    if !entities.is_empty() {
                        payload["caption_entities"] = Value::Array(entities);
                    }
                }
                payload
            }
            MessageContent::Location(location) => match (&location.name, &location.address) {
                (Some(title), Some(address)) => json!({
                    "method": "sendVenue",
                    "chat_id": chat_id,
                    "latitude": location.latitude,
                    "longitude": location.longitude,
                    "title": title,
                    "address": address,
                }),
                _ => json!({
                    "method": "sendLocation",
                    "chat_id": chat_id,
                    "latitude": location.latitude,
                    "longitude": location.longitude,
                }),
            },
            MessageContent::Contact(contact) => match contact.phone_numbers.first() {
                Some(phone) => json!({
                    "method": "sendContact",
                    "chat_id": chat_id,
                    "phone_number": phone.number,
                    "first_name": contact.name,
                }),
                None => text_payload(chat_id, &contact.fallback_text(), &[]),
            },
            MessageContent::Interactive(interactive) => keyboard_payload(chat_id, interactive),
        };

        if let Some(metadata) = metadata {
            if let Some(thread) = metadata.thread_id.as_deref().and_then(|t| t.parse::<i64>().ok()) {
                payload["message_thread_id"] = json!(thread);
            }
            if let Some(reply) = metadata.reply_to.as_deref().and_then(|r| r.parse::<i64>().ok()) {
                payload["reply_parameters"] = json!({ "message_id": reply });
            }
        }
        payload
    }

    fn validate_structure(&self, raw: &Value) -> bool {
        raw.get("update_id").is_some_and(Value::is_i64)
            && [
                "message",
                "edited_message",
                "channel_post",
                "edited_channel_post",
                "callback_query",
            ]
            .iter()
            .any(|key| raw.get(key).is_some_and(Value::is_object))
    }

    fn extract_user_id(&self, raw: &Value) -> Result<String, ChannelError> {
        let update: TgUpdate = decode(raw)?;
        if let Some(query) = update.callback_query {
            return Ok(match query.message {
                Some(message) => sender_id(&message.chat, Some(&query.from), None),
                None => query.from.id.to_string(),
            });
        }
        let message = update
            .message
            .or(update.edited_message)
            .or(update.channel_post)
            .or(update.edited_channel_post)
            .ok_or_else(|| ChannelError::Structure("update carries no message".to_string()))?;
        Ok(sender_id(&message.chat, message.from.as_ref(), message.sender_chat.as_ref()))
    }
}

fn sender_id(chat: &TgChat, from: Option<&TgUser>, sender_chat: Option<&TgChat>) -> String {
    let sender = from
        .map(|u| u.id)
        .or_else(|| sender_chat.map(|c| c.id))
        .unwrap_or(chat.id);
    if chat.chat_type == "private" {
        sender.to_string()
    } else {
        composite_user_id(&chat.id.to_string(), &sender.to_string())
    }
}

fn parse_message(
    update_id: i64,
    message: TgMessage,
    edited: bool,
) -> Result<TransformedMessage, ChannelError> {
    let user_id = sender_id(&message.chat, message.from.as_ref(), message.sender_chat.as_ref());

    let mut metadata = MessageMetadata {
        channel_message_id: Some(message.message_id.to_string()),
        thread_id: message.message_thread_id.map(|t| t.to_string()),
        reply_to: message.reply_to_message.as_ref().map(|m| m.message_id.to_string()),
        forwarded: message.forward_origin.is_some() || message.forward_date.is_some(),
        edited_at: if edited {
            Some(timestamp_from_secs(message.edit_date.unwrap_or(message.date)))
        } else {
            None
        },
        ..MessageMetadata::default()
    };
    metadata.insert_platform_data("updateId", update_id);
    metadata.insert_platform_data("chatId", message.chat.id);
    metadata.insert_platform_data("chatType", message.chat.chat_type.clone());

    let content = message_content(&message)?;
    finish(TransformedMessage {
        user_id,
        content,
        metadata,
        timestamp: timestamp_from_secs(message.date),
        platform_message_id: message.message_id.to_string(),
    })
}

fn message_content(message: &TgMessage) -> Result<MessageContent, ChannelError> {
    let (caption, caption_formatting) = match &message.caption {
        Some(caption) => {
            let (caption, formatting) = formatted_text(caption, &message.caption_entities)?;
            (Some(caption), formatting)
        }
        None => (None, Vec::new()),
    };

    if let Some(text) = &message.text {
        let (text, formatting) = formatted_text(text, &message.entities)?;
        return Ok(MessageContent::Text(TextContent { text, formatting }));
    }

    if let Some(photo) = message.photo.iter().max_by_key(|p| u64::from(p.width) * u64::from(p.height)) {
        return Ok(MessageContent::Media(MediaContent {
            caption,
            caption_formatting,
            size: photo.file_size,
            dimensions: Some(Dimensions {
                width: photo.width,
                height: photo.height,
            }),
            mime_type: Some("image/jpeg".to_string()),
            ..MediaContent::new(MediaType::Image, &photo.file_id)
        }));
    }

    let files = [
        (MediaType::Video, message.video.as_ref().or(message.animation.as_ref())),
        (MediaType::Audio, message.audio.as_ref()),
        (MediaType::Voice, message.voice.as_ref()),
        (MediaType::Sticker, message.sticker.as_ref()),
        (MediaType::Document, message.document.as_ref()),
    ];
    if let Some((media_type, file)) = files.into_iter().find_map(|(t, f)| f.map(|f| (t, f))) {
        let dimensions = match (file.width, file.height) {
            (Some(width), Some(height)) => Some(Dimensions { width, height }),
            _ => None,
        };
        return Ok(MessageContent::Media(MediaContent {
            caption,
            caption_formatting,
            filename: file.file_name.clone(),
            mime_type: file.mime_type.clone(),
            size: file.file_size,
            duration: file.duration,
            dimensions,
            ..MediaContent::new(media_type, &file.file_id)
        }));
    }

    if let Some(venue) = &message.venue {
        return Ok(MessageContent::Location(LocationContent {
            latitude: venue.location.latitude,
            longitude: venue.location.longitude,
            name: Some(venue.title.clone()),
            address: Some(venue.address.clone()),
        }));
    }

    if let Some(location) = &message.location {
        return Ok(MessageContent::Location(LocationContent {
            latitude: location.latitude,
            longitude: location.longitude,
            name: None,
            address: None,
        }));
    }

    if let Some(contact) = &message.contact {
        let name = match &contact.last_name {
            Some(last) => format!("{} {last}", contact.first_name),
            None => contact.first_name.clone(),
        };
        return Ok(MessageContent::Contact(ContactContent {
            name,
            phone_numbers: vec![ContactPhone {
                number: contact.phone_number.clone(),
                label: None,
            }],
            emails: Vec::new(),
            organization: None,
        }));
    }

    Err(ChannelError::Structure(
        "message has no supported content".to_string(),
    ))
}

fn parse_callback(update_id: i64, query: TgCallbackQuery) -> Result<TransformedMessage, ChannelError> {
    let data = query
        .data
        .ok_or_else(|| ChannelError::Structure("callback query without data".to_string()))?;
    let user_id = match &query.message {
        Some(message) => sender_id(&message.chat, Some(&query.from), None),
        None => query.from.id.to_string(),
    };
    let title = query
        .message
        .as_ref()
        .and_then(|m| button_title(m, &data))
        .unwrap_or_else(|| data.clone());

    let mut metadata = MessageMetadata {
        reply_to: query.message.as_ref().map(|m| m.message_id.to_string()),
        ..MessageMetadata::default()
    };
    metadata.insert_platform_data("updateId", update_id);
    metadata.insert_platform_data("callbackQueryId", query.id.clone());

    let timestamp = query
        .message
        .as_ref()
        .map_or_else(chrono::Utc::now, |m| timestamp_from_secs(m.date));

    finish(TransformedMessage {
        user_id,
        content: MessageContent::Interactive(InteractiveContent {
            interactive_type: InteractiveType::Buttons,
            body: query
                .message
                .as_ref()
                .and_then(|m| m.text.clone())
                .unwrap_or_default(),
            header: None,
            footer: None,
            buttons: Vec::new(),
            sections: Vec::new(),
            list_button: None,
            reply: Some(InteractiveReply {
                id: data.clone(),
                title,
                payload: Some(data),
            }),
        }),
        metadata,
        timestamp,
        platform_message_id: query.id,
    })
}

fn button_title(message: &TgMessage, data: &str) -> Option<String> {
    message
        .reply_markup
        .as_ref()?
        .inline_keyboard
        .iter()
        .flatten()
        .find(|b| b.callback_data.as_deref() == Some(data))
        .map(|b| b.text.clone())
}

/// Offsets only stay valid over the untouched text, so cleanup is skipped
/// when any entity maps.
fn formatted_text(
    text: &str,
    entities: &[TgEntity],
) -> Result<(String, Vec<TextFormat>), ChannelError> {
    let formatting = entities_to_formatting(text, entities);
    if formatting.is_empty() {
        Ok((clean_text(text)?, formatting))
    } else {
        Ok((text.to_string(), formatting))
    }
}

fn entities_to_formatting(text: &str, entities: &[TgEntity]) -> Vec<TextFormat> {
    entities
        .iter()
        .filter_map(|entity| {
            let (offset, length) = utf16_to_char_range(text, entity.offset, entity.length)?;
            let covered = || text.chars().skip(offset).take(length).collect::<String>();
            let kind = match entity.kind.as_str() {
                "bold" => FormatKind::Bold,
                "italic" => FormatKind::Italic,
                "strikethrough" => FormatKind::Strikethrough,
                "code" => FormatKind::Code,
                "pre" => FormatKind::Pre,
                "spoiler" => FormatKind::Spoiler,
                "text_link" => FormatKind::Link {
                    url: entity.url.clone()?,
                },
                "url" => FormatKind::Link { url: covered() },
                "text_mention" => FormatKind::Mention {
                    user_id: entity.user.as_ref()?.id.to_string(),
                },
                "mention" => FormatKind::Mention {
                    user_id: covered().trim_start_matches('@').to_string(),
                },
                _ => return None,
            };
            (length > 0).then(|| TextFormat::new(kind, offset, length))
        })
        .collect()
}

fn formatting_to_entities(text: &str, formatting: &[TextFormat]) -> Vec<Value> {
    formatting
        .iter()
        .filter_map(|range| {
            let (offset, length) = char_to_utf16_range(text, range.offset, range.length);
            let mut entity = match &range.kind {
                FormatKind::Bold => json!({ "type": "bold" }),
                FormatKind::Italic => json!({ "type": "italic" }),
                FormatKind::Strikethrough => json!({ "type": "strikethrough" }),
                FormatKind::Code => json!({ "type": "code" }),
                FormatKind::Pre => json!({ "type": "pre" }),
                FormatKind::Spoiler => json!({ "type": "spoiler" }),
                FormatKind::Link { url } => json!({ "type": "text_link", "url": url }),
                // Username mentions are plain `@name` text; only numeric IDs need an entity.
                FormatKind::Mention { user_id } => {
                    let id = user_id.parse::<i64>().ok()?;
                    json!({ "type": "text_mention", "user": { "id": id, "is_bot": false, "first_name": "" } })
                }
            };
            entity["offset"] = json!(offset);
            entity["length"] = json!(length);
            (length > 0).then_some(entity)
        })
        .collect()
}

fn text_payload(chat_id: &str, text: &str, formatting: &[TextFormat]) -> Value {
    let mut payload = json!({ "method": "sendMessage", "chat_id": chat_id, "text": text });
    let entities = formatting_to_entities(text, formatting);
    if !entities.is_empty() {
        payload["entities"] = Value::Array(entities);
    }
    payload
}

const fn media_method(media_type: MediaType) -> (&'static str, &'static str) {
    match media_type {
        MediaType::Image => ("sendPhoto", "photo"),
        MediaType::Video => ("sendVideo", "video"),
        MediaType::Audio => ("sendAudio", "audio"),
        MediaType::Voice => ("sendVoice", "voice"),
        MediaType::Document => ("sendDocument", "document"),
        MediaType::Sticker => ("sendSticker", "sticker"),
    }
}

fn keyboard_payload(chat_id: &str, interactive: &InteractiveContent) -> Value {
    let text = [
        interactive.header.as_deref(),
        Some(interactive.body.as_str()),
        interactive.footer.as_deref(),
    ]
    .into_iter()
    .flatten()
    .filter(|part| !part.is_empty())
    .collect::<Vec<_>>()
    .join("\n\n");

    let rows: Vec<Value> = match interactive.interactive_type {
        InteractiveType::List => interactive
            .sections
            .iter()
            .flat_map(|section| &section.rows)
            .map(|row| json!([{ "text": row.title, "callback_data": row.id }]))
            .collect(),
        InteractiveType::Buttons | InteractiveType::QuickReply => interactive
            .buttons
            .iter()
            .map(|button| {
                json!([{
                    "text": button.title,
                    "callback_data": button.payload.as_deref().unwrap_or(&button.id),
                }])
            })
            .collect(),
    };

    let mut payload = text_payload(chat_id, &text, &[]);
    if !rows.is_empty() {
        payload["reply_markup"] = json!({ "inline_keyboard": rows });
    }
    payload
}

// Telegram wire types

#[derive(Debug, Deserialize)]
struct TgUpdate {
    update_id: i64,
    message: Option<TgMessage>,
    edited_message: Option<TgMessage>,
    channel_post: Option<TgMessage>,
    edited_channel_post: Option<TgMessage>,
    callback_query: Option<TgCallbackQuery>,
}

#[derive(Debug, Deserialize)]
struct TgMessage {
    message_id: i64,
    date: i64,
    chat: TgChat,
    from: Option<TgUser>,
    sender_chat: Option<TgChat>,
    text: Option<String>,
    #[serde(default)]
    entities: Vec<TgEntity>,
    caption: Option<String>,
    #[serde(default)]
    caption_entities: Vec<TgEntity>,
    message_thread_id: Option<i64>,
    reply_to_message: Option<Box<TgMessage>>,
    forward_origin: Option<Value>,
    forward_date: Option<i64>,
    edit_date: Option<i64>,
    #[serde(default)]
    photo: Vec<TgPhotoSize>,
    document: Option<TgFile>,
    video: Option<TgFile>,
    animation: Option<TgFile>,
    audio: Option<TgFile>,
    voice: Option<TgFile>,
    sticker: Option<TgFile>,
    location: Option<TgLocation>,
    venue: Option<TgVenue>,
    contact: Option<TgContact>,
    reply_markup: Option<TgKeyboard>,
}

#[derive(Debug, Deserialize)]
struct TgChat {
    id: i64,
    #[serde(rename = "type")]
    chat_type: String,
}

#[derive(Debug, Deserialize)]
struct TgUser {
    id: i64,
}

#[derive(Debug, Deserialize)]
struct TgEntity {
    #[serde(rename = "type")]
    kind: String,
    offset: usize,
    length: usize,
    url: Option<String>,
    user: Option<TgUser>,
}

#[derive(Debug, Deserialize)]
struct TgPhotoSize {
    file_id: String,
    width: u32,
    height: u32,
    file_size: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct TgFile {
    file_id: String,
    file_name: Option<String>,
    mime_type: Option<String>,
    file_size: Option<u64>,
    duration: Option<u32>,
    width: Option<u32>,
    height: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct TgLocation {
    latitude: f64,
    longitude: f64,
}

#[derive(Debug, Deserialize)]
struct TgVenue {
    location: TgLocation,
    title: String,
    address: String,
}

#[derive(Debug, Deserialize)]
struct TgContact {
    phone_number: String,
    first_name: String,
    last_name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TgCallbackQuery {
    id: String,
    from: TgUser,
    message: Option<TgMessage>,
    data: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TgKeyboard {
    #[serde(default)]
    inline_keyboard: Vec<Vec<TgKeyboardButton>>,
}

#[derive(Debug, Deserialize)]
struct TgKeyboardButton {
    text: String,
    callback_data: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use switchboard_core::content::{
        Button, ListRow, ListSection, create_buttons_content, create_contact_content,
        create_list_content, create_location_content, create_media_content, create_text_content,
    };

    fn update(message: Value) -> Value {
        json!({ "update_id": 10, "message": message })
    }

    fn private_text(text: &str, entities: Value) -> Value {
        update(json!({
            "message_id": 7,
            "date": 1_700_000_000,
            "chat": { "id": 42, "type": "private" },
            "from": { "id": 42, "is_bot": false, "first_name": "Ann" },
            "text": text,
            "entities": entities,
        }))
    }

    #[test]
    fn test_private_text_with_entities() {
        // "hi 👋 bold" : the emoji is two UTF-16 units
        let raw = private_text(
            "hi 👋 bold",
            json!([{ "type": "bold", "offset": 6, "length": 4 }]),
        );
        let message = TelegramTransformer.parse_incoming(&raw).unwrap();
        assert_eq!(message.user_id, "42");
        assert_eq!(message.platform_message_id, "7");
        assert_eq!(
            message.content,
            MessageContent::Text(TextContent {
                text: "hi 👋 bold".to_string(),
                formatting: vec![TextFormat::new(FormatKind::Bold, 5, 4)],
            })
        );
        assert_eq!(message.timestamp.timestamp(), 1_700_000_000);
    }

    #[test]
    fn test_group_message_uses_composite_id() {
        let raw = update(json!({
            "message_id": 8,
            "date": 1_700_000_000,
            "chat": { "id": -100_200, "type": "supergroup" },
            "from": { "id": 42, "is_bot": false, "first_name": "Ann" },
            "text": "hello all",
            "message_thread_id": 5,
            "reply_to_message": {
                "message_id": 3, "date": 1_699_999_000,
                "chat": { "id": -100_200, "type": "supergroup" }
            },
            "forward_origin": { "type": "user" },
        }));
        let message = TelegramTransformer.parse_incoming(&raw).unwrap();
        assert_eq!(message.user_id, "-100200:42");
        assert_eq!(message.metadata.thread_id.as_deref(), Some("5"));
        assert_eq!(message.metadata.reply_to.as_deref(), Some("3"));
        assert!(message.metadata.forwarded);
        assert_eq!(TelegramTransformer.extract_user_id(&raw).unwrap(), "-100200:42");
    }

    #[test]
    fn test_edited_message_sets_edited_at() {
        let raw = json!({
            "update_id": 11,
            "edited_message": {
                "message_id": 7, "date": 1_700_000_000, "edit_date": 1_700_000_060,
                "chat": { "id": 42, "type": "private" },
                "from": { "id": 42, "is_bot": false, "first_name": "Ann" },
                "text": "fixed",
            }
        });
        let message = TelegramTransformer.parse_incoming(&raw).unwrap();
        assert_eq!(message.metadata.edited_at.map(|t| t.timestamp()), Some(1_700_000_060));
    }

    #[test]
    fn test_photo_picks_largest_size() {
        let raw = update(json!({
            "message_id": 9, "date": 1_700_000_000,
            "chat": { "id": 42, "type": "private" },
            "from": { "id": 42, "is_bot": false, "first_name": "Ann" },
            "caption": "sunset",
            "photo": [
                { "file_id": "small", "file_unique_id": "a", "width": 90, "height": 60 },
                { "file_id": "large", "file_unique_id": "b", "width": 1280, "height": 853, "file_size": 120_000 },
            ],
        }));
        let MessageContent::Media(media) = TelegramTransformer.parse_incoming(&raw).unwrap().content else {
            panic!("expected media");
        };
        assert_eq!(media.url, "large");
        assert_eq!(media.caption.as_deref(), Some("sunset"));
        assert_eq!(media.size, Some(120_000));
    }

    #[test]
    fn test_venue_and_contact() {
        let raw = update(json!({
            "message_id": 9, "date": 1_700_000_000,
            "chat": { "id": 42, "type": "private" },
            "from": { "id": 42, "is_bot": false, "first_name": "Ann" },
            "location": { "latitude": 52.52, "longitude": 13.40 },
            "venue": { "location": { "latitude": 52.52, "longitude": 13.40 }, "title": "Cafe", "address": "Main St 1" },
        }));
        let content = TelegramTransformer.parse_incoming(&raw).unwrap().content;
        assert_eq!(
            content,
            create_location_content(52.52, 13.40, Some("Cafe".into()), Some("Main St 1".into())).unwrap()
        );

        let raw = update(json!({
            "message_id": 10, "date": 1_700_000_000,
            "chat": { "id": 42, "type": "private" },
            "from": { "id": 42, "is_bot": false, "first_name": "Ann" },
            "contact": { "phone_number": "+15551234", "first_name": "Bob", "last_name": "Lee" },
        }));
        let MessageContent::Contact(contact) = TelegramTransformer.parse_incoming(&raw).unwrap().content else {
            panic!("expected contact");
        };
        assert_eq!(contact.name, "Bob Lee");
        assert_eq!(contact.phone_numbers[0].number, "+15551234");
    }

    #[test]
    fn test_callback_query_becomes_reply() {
        let raw = json!({
            "update_id": 12,
            "callback_query": {
                "id": "cb-1",
                "from": { "id": 42, "is_bot": false, "first_name": "Ann" },
                "data": "opt_yes",
                "message": {
                    "message_id": 20, "date": 1_700_000_000,
                    "chat": { "id": 42, "type": "private" },
                    "text": "Continue?",
                    "reply_markup": { "inline_keyboard": [[{ "text": "Yes", "callback_data": "opt_yes" }]] },
                }
            }
        });
        let message = TelegramTransformer.parse_incoming(&raw).unwrap();
        let MessageContent::Interactive(interactive) = message.content else {
            panic!("expected interactive");
        };
        let reply = interactive.reply.unwrap();
        assert_eq!(reply.id, "opt_yes");
        assert_eq!(reply.title, "Yes");
        assert_eq!(message.metadata.reply_to.as_deref(), Some("20"));
        assert_eq!(message.platform_message_id, "cb-1");
    }

    #[test]
    fn test_rejects_updates_without_content() {
        let raw = json!({ "update_id": 13, "my_chat_member": {} });
        assert!(!TelegramTransformer.validate_structure(&raw));
        assert!(TelegramTransformer.parse_incoming(&raw).is_err());

        let raw = update(json!({
            "message_id": 9, "date": 1_700_000_000,
            "chat": { "id": 42, "type": "private" },
            "from": { "id": 42, "is_bot": false, "first_name": "Ann" },
            "dice": { "emoji": "🎲", "value": 3 },
        }));
        assert!(TelegramTransformer.validate_structure(&raw));
        assert!(TelegramTransformer.parse_incoming(&raw).is_err());
    }

    #[test]
    fn test_outgoing_text_entities_use_utf16() {
        let content = create_text_content(
            "👋 hi there",
            vec![
                TextFormat::new(FormatKind::Bold, 2, 2),
                TextFormat::new(FormatKind::Link { url: "https://example.com".into() }, 5, 5),
            ],
        )
        .unwrap();
        let payload = TelegramTransformer.format_outgoing("-100200:42", &content, None);
        assert_eq!(
            payload,
            json!({
                "method": "sendMessage",
                "chat_id": "-100200",
                "text": "👋 hi there",
                "entities": [
                    { "type": "bold", "offset": 3, "length": 2 },
                    { "type": "text_link", "url": "https://example.com", "offset": 6, "length": 5 },
                ],
            })
        );
    }

    #[test]
    fn test_text_round_trip() {
        let formatting = vec![
            TextFormat::new(FormatKind::Bold, 0, 4),
            TextFormat::new(FormatKind::Italic, 5, 6),
            TextFormat::new(FormatKind::Code, 12, 4),
        ];
        let content = create_text_content("bold italic code ✓", formatting).unwrap();
        let payload = TelegramTransformer.format_outgoing("42", &content, None);

        let raw = private_text(payload["text"].as_str().unwrap(), payload["entities"].clone());
        let parsed = TelegramTransformer.parse_incoming(&raw).unwrap();
        assert_eq!(parsed.content, content);
    }

    #[test]
    fn test_outgoing_media_location_and_metadata() {
        let photo = create_media_content(MediaType::Image, "https://cdn.example/a.png", Some("look".into()), None).unwrap();
        let metadata = MessageMetadata {
            thread_id: Some("5".into()),
            reply_to: Some("3".into()),
            ..MessageMetadata::default()
        };
        let payload = TelegramTransformer.format_outgoing("42", &photo, Some(&metadata));
        assert_eq!(
            payload,
            json!({
                "method": "sendPhoto",
                "chat_id": "42",
                "photo": "https://cdn.example/a.png",
                "caption": "look",
                "message_thread_id": 5,
                "reply_parameters": { "message_id": 3 },
            })
        );

        let pin = create_location_content(1.5, 2.5, None, None).unwrap();
        assert_eq!(TelegramTransformer.format_outgoing("42", &pin, None)["method"], "sendLocation");
    }

    #[test]
    fn test_outgoing_inline_keyboard() {
        let buttons = create_buttons_content(
            "Continue?",
            vec![Button::new("yes", "Yes"), Button::new("no", "No")],
        )
        .unwrap();
        let payload = TelegramTransformer.format_outgoing("42", &buttons, None);
        assert_eq!(
            payload["reply_markup"],
            json!({ "inline_keyboard": [
                [{ "text": "Yes", "callback_data": "yes" }],
                [{ "text": "No", "callback_data": "no" }],
            ]})
        );

        let list = create_list_content(
            "Pick one",
            "Options",
            vec![ListSection {
                title: None,
                rows: vec![ListRow { id: "r1".into(), title: "First".into(), description: None }],
            }],
        )
        .unwrap();
        let payload = TelegramTransformer.format_outgoing("42", &list, None);
        assert_eq!(payload["reply_markup"]["inline_keyboard"][0][0]["callback_data"], "r1");
    }

    #[test]
    fn test_caption_entities_become_caption_formatting() {
        let raw = update(json!({
            "message_id": 9, "date": 1_700_000_000,
            "chat": { "id": 42, "type": "private" },
            "from": { "id": 42, "is_bot": false, "first_name": "Ann" },
            "caption": "🍲 soup of the day",
            "caption_entities": [
                { "type": "bold", "offset": 3, "length": 4 },
                { "type": "text_link", "offset": 11, "length": 7, "url": "https://example.com/menu" },
            ],
            "document": { "file_id": "BQAD", "file_unique_id": "d", "file_name": "menu.pdf" },
        }));
        let MessageContent::Media(media) = TelegramTransformer.parse_incoming(&raw).unwrap().content else {
            panic!("expected media");
        };
        assert_eq!(media.caption.as_deref(), Some("🍲 soup of the day"));
        assert_eq!(
            media.caption_formatting,
            vec![
                TextFormat::new(FormatKind::Bold, 2, 4),
                TextFormat::new(FormatKind::Link { url: "https://example.com/menu".into() }, 10, 7),
            ]
        );
        assert_eq!(media.filename.as_deref(), Some("menu.pdf"));
    }

    /// Turn an outbound payload into the update Telegram would deliver for it.
    fn echo(payload: &Value) -> Value {
        let mut message = json!({
            "message_id": 30, "date": 1_700_000_000,
            "chat": { "id": 42, "type": "private" },
            "from": { "id": 42, "is_bot": false, "first_name": "Ann" },
        });
        let location = json!({ "latitude": payload["latitude"], "longitude": payload["longitude"] });
        match payload["method"].as_str().unwrap() {
            "sendPhoto" => {
                message["photo"] = json!([
                    { "file_id": payload["photo"], "file_unique_id": "p", "width": 800, "height": 600 },
                ]);
            }
            "sendLocation" => message["location"] = location,
            "sendVenue" => {
                message["venue"] = json!({
                    "location": location,
                    "title": payload["title"],
                    "address": payload["address"],
                });
                message["location"] = location;
            }
            "sendContact" => {
                message["contact"] = json!({
                    "phone_number": payload["phone_number"],
                    "first_name": payload["first_name"],
                });
            }
            other => panic!("unexpected method {other}"),
        }
        for key in ["caption", "caption_entities"] {
            if let Some(value) = payload.get(key) {
                message[key] = value.clone();
            }
        }
        update(message)
    }

    fn round_trip(content: &MessageContent) -> (Value, MessageContent, Value) {
        let first = TelegramTransformer.format_outgoing("42", content, None);
        let parsed = TelegramTransformer.parse_incoming(&echo(&first)).unwrap().content;
        let second = TelegramTransformer.format_outgoing("42", &parsed, None);
        (first, parsed, second)
    }

    #[test]
    fn test_photo_round_trip_keeps_caption_formatting() {
        let content = MessageContent::Media(MediaContent {
            caption: Some("🍲 soup today".into()),
            caption_formatting: vec![TextFormat::new(FormatKind::Bold, 2, 4)],
            ..MediaContent::new(MediaType::Image, "AgACphoto")
        });
        let (first, parsed, second) = round_trip(&content);
        assert_eq!(
            first["caption_entities"],
            json!([{ "type": "bold", "offset": 3, "length": 4 }])
        );
        let MessageContent::Media(media) = parsed else {
            panic!("expected media");
        };
        assert_eq!(media.url, "AgACphoto");
        assert_eq!(media.caption_formatting, vec![TextFormat::new(FormatKind::Bold, 2, 4)]);
        assert_eq!(second, first);
    }

    #[test]
    fn test_venue_round_trip() {
        let content =
            create_location_content(52.52, 13.405, Some("Cafe".into()), Some("Main St 1".into()))
                .unwrap();
        let (first, parsed, second) = round_trip(&content);
        assert_eq!(first["method"], "sendVenue");
        assert_eq!(parsed, content);
        assert_eq!(second, first);
    }

    #[test]
    fn test_location_name_without_address_is_dropped() {
        let content = create_location_content(52.52, 13.405, Some("Cafe".into()), None).unwrap();
        let (first, parsed, second) = round_trip(&content);
        assert_eq!(first["method"], "sendLocation");
        assert_eq!(parsed, create_location_content(52.52, 13.405, None, None).unwrap());
        assert_eq!(second, first);
    }

    #[test]
    fn test_contact_round_trip_drops_emails() {
        let content = create_contact_content(
            "Bob Lee",
            vec![ContactPhone { number: "+15550001".into(), label: Some("work".into()) }],
            vec!["bob@example.com".into()],
            Some("Acme".into()),
        )
        .unwrap();
        let (first, parsed, second) = round_trip(&content);
        assert_eq!(first["method"], "sendContact");
        let MessageContent::Contact(contact) = parsed else {
            panic!("expected contact");
        };
        assert_eq!(contact.name, "Bob Lee");
        assert_eq!(contact.phone_numbers[0].number, "+15550001");
        assert_eq!(contact.phone_numbers[0].label, None);
        assert!(contact.emails.is_empty());
        assert_eq!(contact.organization, None);
        assert_eq!(second, first);
    }

    #[test]
    fn test_keyboard_tap_round_trip_keeps_only_the_reply() {
        let content = create_buttons_content(
            "Continue?",
            vec![Button::new("yes", "Yes"), Button::new("no", "No")],
        )
        .unwrap();
        let first = TelegramTransformer.format_outgoing("42", &content, None);
        let raw = json!({
            "update_id": 14,
            "callback_query": {
                "id": "cb-2",
                "from": { "id": 42, "is_bot": false, "first_name": "Ann" },
                "data": first["reply_markup"]["inline_keyboard"][1][0]["callback_data"],
                "message": {
                    "message_id": 31, "date": 1_700_000_000,
                    "chat": { "id": 42, "type": "private" },
                    "text": first["text"],
                    "reply_markup": first["reply_markup"],
                }
            }
        });
        let parsed = TelegramTransformer.parse_incoming(&raw).unwrap().content;
        let MessageContent::Interactive(interactive) = &parsed else {
            panic!("expected interactive");
        };
        let reply = interactive.reply.as_ref().unwrap();
        assert_eq!((reply.id.as_str(), reply.title.as_str()), ("no", "No"));
        assert!(interactive.buttons.is_empty());

        let second = TelegramTransformer.format_outgoing("42", &parsed, None);
        assert_eq!(
            second,
            json!({ "method": "sendMessage", "chat_id": "42", "text": "Continue?" })
        );
    }
}

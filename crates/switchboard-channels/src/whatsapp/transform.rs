//! WhatsApp Cloud API message <-> normalized message conversion.
//!
//! `parse_incoming` takes one entry of `value.messages`; the envelope
//! (`entry[].changes[].value`) is unpacked by [`collect_webhook`].

use serde::Deserialize;
use serde_json::{Value, json};

use switchboard_core::content::{
    ContactContent, ContactPhone, InteractiveContent, InteractiveReply, InteractiveType,
    LocationContent, MediaContent, MediaType, MessageContent, TextContent,
};
use switchboard_core::types::{
    ChannelType, DeliveryReceipt, DeliveryState, MessageMetadata, TransformedMessage,
    recipient_of, timestamp_from_secs,
};

use crate::traits::{ChannelError, WebhookOutcome};
use crate::transform::{
    Dialect, MessageTransformer, clean_text, decode, finish, parse_markup, render_markup,
};

/// Reply buttons the platform accepts per message.
pub const MAX_REPLY_BUTTONS: usize = 3;
const MAX_BUTTON_TITLE: usize = 20;
const MAX_ROW_TITLE: usize = 24;

/// WhatsApp Cloud API transformer.
#[derive(Debug, Clone, Copy, Default)]
pub struct WhatsAppTransformer;

impl MessageTransformer for WhatsAppTransformer {
    fn channel_type(&self) -> ChannelType {
        ChannelType::WhatsApp
    }

    fn parse_incoming(&self, raw: &Value) -> Result<TransformedMessage, ChannelError> {
        let message: WaMessage = decode(raw)?;
        let content = message_content(&message)?;

        let mut metadata = MessageMetadata {
            channel_message_id: Some(message.id.clone()),
            ..MessageMetadata::default()
        };
        if let Some(context) = &message.context {
            metadata.reply_to.clone_from(&context.id);
            metadata.forwarded = context.forwarded || context.frequently_forwarded;
        }
        metadata.insert_platform_data("messageType", message.kind.clone());

        finish(TransformedMessage {
            user_id: message.from,
            content,
            metadata,
            timestamp: parse_timestamp(&message.timestamp),
            platform_message_id: message.id,
        })
    }

    fn format_outgoing(
        &self,
        user_id: &str,
        content: &MessageContent,
        metadata: Option<&MessageMetadata>,
    ) -> Value {
        let mut payload = json!({
            "messaging_product": "whatsapp",
            "recipient_type": "individual",
            "to": recipient_of(user_id),
        });

        let (kind, body) = match content {
            MessageContent::Text(text) => {
                let body = render_markup(&text.text, &text.formatting, Dialect::WhatsApp);
                let preview = body.contains("https://") || body.contains("http://");
                ("text", json!({ "body": body, "preview_url": preview }))
            }
            MessageContent::Media(media) => media_object(media),
            MessageContent::Location(location) => {
                let mut object = json!({
                    "latitude": location.latitude,
                    "longitude": location.longitude,
                });
                if let Some(name) = &location.name {
                    object["name"] = json!(name);
                }
                if let Some(address) = &location.address {
                    object["address"] = json!(address);
                }
                ("location", object)
            }
            MessageContent::Contact(contact) => ("contacts", json!([contact_object(contact)])),
            MessageContent::Interactive(interactive) => ("interactive", interactive_object(interactive)),
        };
        payload["type"] = json!(kind);
        payload[kind] = body;

        if let Some(reply_to) = metadata.and_then(|m| m.reply_to.as_ref()) {
            payload["context"] = json!({ "message_id": reply_to });
        }
        payload
    }

    fn validate_structure(&self, raw: &Value) -> bool {
        ["from", "id", "type"]
            .iter()
            .all(|key| raw.get(key).is_some_and(Value::is_string))
    }

    fn extract_user_id(&self, raw: &Value) -> Result<String, ChannelError> {
        raw.get("from")
            .and_then(Value::as_str)
            .map(ToString::to_string)
            .ok_or_else(|| ChannelError::Structure("message has no sender".to_string()))
    }
}

/// Unpack a webhook envelope: every message is parsed independently,
/// every status becomes a receipt.
pub(crate) fn collect_webhook(body: &Value, outcome: &mut WebhookOutcome) {
    let values = body
        .get("entry")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .filter_map(|entry| entry.get("changes").and_then(Value::as_array))
        .flatten()
        .filter_map(|change| change.get("value"));

    for value in values {
        let first_new = outcome.messages.len();
        if let Some(messages) = value.get("messages").and_then(Value::as_array) {
            crate::transform::parse_batch(&WhatsAppTransformer, messages, outcome);
        }
        attach_profile_names(value, &mut outcome.messages[first_new..]);

        for status in value.get("statuses").and_then(Value::as_array).into_iter().flatten() {
            match receipt(status) {
                Ok(receipt) => outcome.receipts.push(receipt),
                Err(e) => {
                    tracing::warn!(channel = "whatsapp", error = %e, "Skipping malformed status");
                    outcome.skipped += 1;
                }
            }
        }
    }
}

fn attach_profile_names(value: &Value, messages: &mut [TransformedMessage]) {
    let Some(contacts) = value.get("contacts").and_then(Value::as_array) else {
        return;
    };
    for message in messages {
        let name = contacts
            .iter()
            .find(|c| c.get("wa_id").and_then(Value::as_str) == Some(message.user_id.as_str()))
            .and_then(|c| c.pointer("/profile/name"))
            .and_then(Value::as_str);
        if let Some(name) = name {
            message.metadata.insert_platform_data("profileName", name);
        }
    }
}

fn receipt(raw: &Value) -> Result<DeliveryReceipt, ChannelError> {
    let status: WaStatus = decode(raw)?;
    let state = DeliveryState::from_platform(&status.status)
        .ok_or_else(|| ChannelError::Structure(format!("unknown status {}", status.status)))?;
    Ok(DeliveryReceipt {
        message_id: status.id,
        recipient_id: status.recipient_id,
        status: state,
        timestamp: parse_timestamp(&status.timestamp),
        error: status
            .errors
            .first()
            .map(|e| e.title.clone().unwrap_or_else(|| format!("error {}", e.code))),
    })
}

fn parse_timestamp(raw: &str) -> chrono::DateTime<chrono::Utc> {
    raw.parse::<i64>()
        .map_or_else(|_| chrono::Utc::now(), timestamp_from_secs)
}

fn message_content(message: &WaMessage) -> Result<MessageContent, ChannelError> {
    let missing = || ChannelError::Structure(format!("{} message without payload", message.kind));
    match message.kind.as_str() {
        "text" => {
            let text = message.text.as_ref().ok_or_else(missing)?;
            let (text, formatting) = parse_markup(&clean_text(&text.body)?, Dialect::WhatsApp);
            Ok(MessageContent::Text(TextContent { text, formatting }))
        }
        "image" | "video" | "audio" | "document" | "sticker" => {
            let media = match message.kind.as_str() {
                "image" => message.image.as_ref(),
                "video" => message.video.as_ref(),
                "audio" => message.audio.as_ref(),
                "document" => message.document.as_ref(),
                _ => message.sticker.as_ref(),
            }
            .ok_or_else(missing)?;
            let media_type = match message.kind.as_str() {
                "image" => MediaType::Image,
                "video" => MediaType::Video,
                "audio" if media.voice => MediaType::Voice,
                "audio" => MediaType::Audio,
                "document" => MediaType::Document,
                _ => MediaType::Sticker,
            };
            Ok(MessageContent::Media(MediaContent {
                caption: media.caption.as_deref().map(clean_text).transpose()?,
                filename: media.filename.clone(),
                mime_type: media.mime_type.clone(),
                ..MediaContent::new(media_type, &media.id)
            }))
        }
        "location" => {
            let location = message.location.as_ref().ok_or_else(missing)?;
            Ok(MessageContent::Location(LocationContent {
                latitude: location.latitude,
                longitude: location.longitude,
                name: location.name.clone(),
                address: location.address.clone(),
            }))
        }
        "contacts" => {
            let contact = message.contacts.first().ok_or_else(missing)?;
            Ok(MessageContent::Contact(ContactContent {
                name: contact.name.formatted_name.clone(),
                phone_numbers: contact
                    .phones
                    .iter()
                    .map(|p| ContactPhone {
                        number: p.phone.clone(),
                        label: p.kind.clone(),
                    })
                    .collect(),
                emails: contact.emails.iter().map(|e| e.email.clone()).collect(),
                organization: contact.org.as_ref().and_then(|o| o.company.clone()),
            }))
        }
        "interactive" => {
            let interactive = message.interactive.as_ref().ok_or_else(missing)?;
            let (interactive_type, reply) = match interactive.kind.as_str() {
                "button_reply" => (InteractiveType::Buttons, interactive.button_reply.as_ref()),
                "list_reply" => (InteractiveType::List, interactive.list_reply.as_ref()),
                _ => (InteractiveType::Buttons, None),
            };
            let reply = reply.ok_or_else(missing)?;
            Ok(reply_content(interactive_type, &reply.id, &reply.title, None))
        }
        "button" => {
            let button = message.button.as_ref().ok_or_else(missing)?;
            Ok(reply_content(
                InteractiveType::QuickReply,
                &button.payload,
                &button.text,
                Some(button.payload.clone()),
            ))
        }
        other => Err(ChannelError::Structure(format!(
            "unsupported message type {other}"
        ))),
    }
}

fn reply_content(
    interactive_type: InteractiveType,
    id: &str,
    title: &str,
    payload: Option<String>,
) -> MessageContent {
    MessageContent::Interactive(InteractiveContent {
        interactive_type,
        body: String::new(),
        header: None,
        footer: None,
        buttons: Vec::new(),
        sections: Vec::new(),
        list_button: None,
        reply: Some(InteractiveReply {
            id: id.to_string(),
            title: title.to_string(),
            payload,
        }),
    })
}

fn media_object(media: &MediaContent) -> (&'static str, Value) {
    let kind = match media.media_type {
        MediaType::Image => "image",
        MediaType::Video => "video",
        MediaType::Audio | MediaType::Voice => "audio",
        MediaType::Document => "document",
        MediaType::Sticker => "sticker",
    };
    let mut object = if media.is_external_url() {
        json!({ "link": media.url })
    } else {
        json!({ "id": media.url })
    };
    if let (Some(caption), "image" | "video" | "document") = (&media.caption, kind) {
        object["caption"] = json!(caption);
    }
    if let (Some(filename), "document") = (&media.filename, kind) {
        object["filename"] = json!(filename);
    }
    (kind, object)
}

fn contact_object(contact: &ContactContent) -> Value {
    let mut object = json!({
        "name": { "formatted_name": contact.name, "first_name": contact.name },
        "phones": contact.phone_numbers.iter().map(|p| {
            let mut phone = json!({ "phone": p.number });
            if let Some(label) = &p.label {
                phone["type"] = json!(label);
            }
            phone
        }).collect::<Vec<_>>(),
        "emails": contact.emails.iter().map(|e| json!({ "email": e })).collect::<Vec<_>>(),
    });
    if let Some(org) = &contact.organization {
        object["org"] = json!({ "company": org });
    }
    object
}

fn truncate(text: &str, max: usize) -> String {
    text.chars().take(max).collect()
}

/// Up to three buttons render as reply buttons; more become a single-section list.
fn interactive_object(interactive: &InteractiveContent) -> Value {
    let as_buttons = interactive.interactive_type != InteractiveType::List
        && interactive.buttons.len() <= MAX_REPLY_BUTTONS;

    let mut object = if as_buttons {
        json!({
            "type": "button",
            "body": { "text": interactive.body },
            "action": {
                "buttons": interactive.buttons.iter().map(|b| json!({
                    "type": "reply",
                    "reply": { "id": b.id, "title": truncate(&b.title, MAX_BUTTON_TITLE) },
                })).collect::<Vec<_>>(),
            },
        })
    } else {
        let sections: Vec<Value> = if interactive.sections.is_empty() {
            vec![json!({
                "rows": interactive.buttons.iter().map(|b| json!({
                    "id": b.id,
                    "title": truncate(&b.title, MAX_ROW_TITLE),
                })).collect::<Vec<_>>(),
            })]
        } else {
            interactive
                .sections
                .iter()
                .map(|section| {
                    let mut object = json!({
                        "rows": section.rows.iter().map(|r| {
                            let mut row = json!({ "id": r.id, "title": truncate(&r.title, MAX_ROW_TITLE) });
                            if let Some(description) = &r.description {
                                row["description"] = json!(description);
                            }
                            row
                        }).collect::<Vec<_>>(),
                    });
                    if let Some(title) = &section.title {
                        object["title"] = json!(title);
                    }
                    object
                })
                .collect()
        };
        json!({
            "type": "list",
            "body": { "text": interactive.body },
            "action": {
                "button": interactive.list_button.as_deref().unwrap_or("Options"),
                "sections": sections,
            },
        })
    };

    if let Some(header) = &interactive.header {
        object["header"] = json!({ "type": "text", "text": header });
    }
    if let Some(footer) = &interactive.footer {
        object["footer"] = json!({ "text": footer });
    }
    object
}

// WhatsApp API types

#[derive(Debug, Deserialize)]
struct WaMessage {
    from: String,
    id: String,
    timestamp: String,
    #[serde(rename = "type")]
    kind: String,
    context: Option<WaContext>,
    text: Option<WaText>,
    image: Option<WaMedia>,
    video: Option<WaMedia>,
    audio: Option<WaMedia>,
    document: Option<WaMedia>,
    sticker: Option<WaMedia>,
    location: Option<WaLocation>,
    #[serde(default)]
    contacts: Vec<WaContact>,
    interactive: Option<WaInteractive>,
    button: Option<WaButton>,
}

#[derive(Debug, Deserialize)]
struct WaContext {
    id: Option<String>,
    #[serde(default)]
    forwarded: bool,
    #[serde(default)]
    frequently_forwarded: bool,
}

#[derive(Debug, Deserialize)]
struct WaText {
    body: String,
}

#[derive(Debug, Deserialize)]
struct WaMedia {
    id: String,
    mime_type: Option<String>,
    caption: Option<String>,
    filename: Option<String>,
    #[serde(default)]
    voice: bool,
}

#[derive(Debug, Deserialize)]
struct WaLocation {
    latitude: f64,
    longitude: f64,
    name: Option<String>,
    address: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WaContact {
    name: WaContactName,
    #[serde(default)]
    phones: Vec<WaPhone>,
    #[serde(default)]
    emails: Vec<WaEmail>,
    org: Option<WaOrg>,
}

#[derive(Debug, Deserialize)]
struct WaContactName {
    formatted_name: String,
}

#[derive(Debug, Deserialize)]
struct WaPhone {
    phone: String,
    #[serde(rename = "type")]
    kind: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WaEmail {
    email: String,
}

#[derive(Debug, Deserialize)]
struct WaOrg {
    company: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WaInteractive {
    #[serde(rename = "type")]
    kind: String,
    button_reply: Option<WaReply>,
    list_reply: Option<WaReply>,
}

#[derive(Debug, Deserialize)]
struct WaReply {
    id: String,
    title: String,
}

#[derive(Debug, Deserialize)]
struct WaButton {
    payload: String,
    text: String,
}

#[derive(Debug, Deserialize)]
struct WaStatus {
    id: String,
    status: String,
    timestamp: String,
    recipient_id: Option<String>,
    #[serde(default)]
    errors: Vec<WaError>,
}

#[derive(Debug, Deserialize)]
struct WaError {
    code: i64,
    title: Option<String>,
}

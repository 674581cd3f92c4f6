//! Slack event <-> normalized message conversion.
//!
//! Inbound payloads are either Events API envelopes (`event_callback`) or
//! interactivity payloads (`block_actions`). Outbound payloads are
//! `chat.postMessage` arguments.

use serde::Deserialize;
use serde_json::{Value, json};

use switchboard_core::content::{
    Dimensions, InteractiveContent, InteractiveReply, InteractiveType, MediaContent, MediaType,
    MessageContent, TextContent,
};
use switchboard_core::types::{
    ChannelType, MessageMetadata, TransformedMessage, composite_user_id, recipient_of,
};
use switchboard_core::validation::media_type_from_mime;

use crate::traits::ChannelError;
use crate::transform::{
    Dialect, MessageTransformer, clean_text, decode, finish, parse_markup, render_markup,
};

/// Action ID used for list selections.
pub const LIST_ACTION_ID: &str = "switchboard_list";

/// Slack transformer.
#[derive(Debug, Clone, Copy, Default)]
pub struct SlackTransformer;

impl MessageTransformer for SlackTransformer {
    fn channel_type(&self) -> ChannelType {
        ChannelType::Slack
    }

    fn parse_incoming(&self, raw: &Value) -> Result<TransformedMessage, ChannelError> {
        match raw.get("type").and_then(Value::as_str) {
            Some("event_callback") => {
                let envelope: SlackEnvelope = decode(raw)?;
                parse_event(envelope)
            }
            Some("block_actions") => {
                let payload: BlockActions = decode(raw)?;
                parse_block_actions(payload)
            }
            other => Err(ChannelError::Structure(format!(
                "unsupported Slack payload type {other:?}"
            ))),
        }
    }

    fn format_outgoing(
        &self,
        user_id: &str,
        content: &MessageContent,
        metadata: Option<&MessageMetadata>,
    ) -> Value {
        let mut payload = json!({ "channel": recipient_of(user_id) });

        match content {
            MessageContent::Text(text) => {
                payload["text"] = json!(render_markup(&text.text, &text.formatting, Dialect::Slack));
                payload["mrkdwn"] = json!(true);
            }
            MessageContent::Media(media) => {
                let name = media.filename.as_deref().unwrap_or(media.media_type.as_str());
                if media.media_type == MediaType::Image && media.is_external_url() {
                    let alt = media.caption.as_deref().unwrap_or(name);
                    payload["text"] = json!(alt);
                    payload["blocks"] = json!([{
                        "type": "image",
                        "image_url": media.url,
                        "alt_text": alt,
                    }]);
                } else {
                    let link = format!("<{}|{}>", media.url, escape(name));
                    payload["text"] = json!(match &media.caption {
                        Some(caption) => format!("{}\n{link}", escape(caption)),
                        None => link,
                    });
                }
            }
            MessageContent::Location(location) => {
                payload["text"] = json!(escape(&location.fallback_text()));
            }
            MessageContent::Contact(contact) => {
                payload["text"] = json!(escape(&contact.fallback_text()));
            }
            MessageContent::Interactive(interactive) => {
                payload["text"] = json!(escape(&interactive.fallback_text()));
                payload["blocks"] = Value::Array(interactive_blocks(interactive));
            }
        }

        if let Some(thread) = metadata.and_then(|m| m.thread_id.as_ref()) {
            payload["thread_ts"] = json!(thread);
        }
        payload
    }

    fn validate_structure(&self, raw: &Value) -> bool {
        match raw.get("type").and_then(Value::as_str) {
            Some("event_callback") => raw.get("event").is_some_and(Value::is_object),
            Some("block_actions") => raw.get("actions").is_some_and(Value::is_array),
            _ => false,
        }
    }

    fn extract_user_id(&self, raw: &Value) -> Result<String, ChannelError> {
        self.parse_incoming(raw).map(|m| m.user_id)
    }
}

fn escape(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

fn conversation_user(channel: &str, channel_type: Option<&str>, user: &str) -> String {
    let direct = match channel_type {
        Some(kind) => kind == "im",
        None => channel.starts_with('D'),
    };
    if direct {
        user.to_string()
    } else {
        composite_user_id(channel, user)
    }
}

fn parse_ts(ts: &str) -> chrono::DateTime<chrono::Utc> {
    let (secs, micros) = ts.split_once('.').unwrap_or((ts, "0"));
    let secs = secs.parse::<i64>().unwrap_or_default();
    let micros = micros.parse::<u32>().unwrap_or_default();
    chrono::DateTime::from_timestamp(secs, micros.saturating_mul(1000))
        .unwrap_or_else(chrono::Utc::now)
}

fn parse_event(envelope: SlackEnvelope) -> Result<TransformedMessage, ChannelError> {
    let event = envelope.event;
    if !matches!(event.kind.as_str(), "message" | "app_mention") {
        return Err(ChannelError::Structure(format!(
            "unsupported event type {}",
            event.kind
        )));
    }

    let edited = event.subtype.as_deref() == Some("message_changed");
    let (message, channel_type) = match (event.subtype.as_deref(), event.message) {
        (Some("message_changed"), Some(inner)) => (*inner, event.channel_type),
        (Some("bot_message" | "message_deleted" | "channel_join" | "channel_leave"), _) => {
            return Err(ChannelError::Structure(format!(
                "ignored message subtype {:?}",
                event.subtype
            )));
        }
        (_, _) => (
            SlackMessage {
                user: event.user,
                bot_id: event.bot_id,
                text: event.text,
                ts: event.ts,
                thread_ts: event.thread_ts,
                files: event.files,
                edited: None,
            },
            event.channel_type,
        ),
    };
    if message.bot_id.is_some() && message.user.is_none() {
        return Err(ChannelError::Structure("message from a bot".to_string()));
    }

    let channel = event
        .channel
        .ok_or_else(|| ChannelError::Structure("event has no channel".to_string()))?;
    let user = message
        .user
        .as_deref()
        .ok_or_else(|| ChannelError::Structure("event has no user".to_string()))?;
    let ts = message
        .ts
        .clone()
        .ok_or_else(|| ChannelError::Structure("event has no ts".to_string()))?;

    let mut metadata = MessageMetadata {
        channel_message_id: Some(ts.clone()),
        thread_id: message.thread_ts.clone().filter(|t| *t != ts),
        edited_at: if edited {
            Some(
                message
                    .edited
                    .as_ref()
                    .map_or_else(chrono::Utc::now, |e| parse_ts(&e.ts)),
            )
        } else {
            None
        },
        ..MessageMetadata::default()
    };
    metadata.insert_platform_data("channel", channel.clone());
    if let Some(team) = &envelope.team_id {
        metadata.insert_platform_data("teamId", team.clone());
    }
    if let Some(event_id) = &envelope.event_id {
        metadata.insert_platform_data("eventId", event_id.clone());
    }

    let text = message.text.as_deref().unwrap_or_default();
    let content = match message.files.first() {
        Some(file) if text.trim().is_empty() || message.files.len() == 1 => {
            MessageContent::Media(file_media(file, text)?)
        }
        _ => {
            let (text, formatting) = parse_markup(&clean_text(text)?, Dialect::Slack);
            MessageContent::Text(TextContent { text, formatting })
        }
    };

    finish(TransformedMessage {
        user_id: conversation_user(&channel, channel_type.as_deref(), user),
        content,
        metadata,
        timestamp: parse_ts(&ts),
        platform_message_id: ts,
    })
}

fn file_media(file: &SlackFile, text: &str) -> Result<MediaContent, ChannelError> {
    let url = file
        .url_private
        .clone()
        .unwrap_or_else(|| file.id.clone());
    let media_type = file
        .mimetype
        .as_deref()
        .map_or(MediaType::Document, media_type_from_mime);
    let caption = if text.trim().is_empty() {
        None
    } else {
        Some(parse_markup(&clean_text(text)?, Dialect::Slack).0)
    };
    let dimensions = match (file.original_w, file.original_h) {
        (Some(width), Some(height)) => Some(Dimensions { width, height }),
        _ => None,
    };
    Ok(MediaContent {
        caption,
        filename: file.name.clone(),
        mime_type: file.mimetype.clone(),
        size: file.size,
        dimensions,
        ..MediaContent::new(media_type, url)
    })
}

fn parse_block_actions(payload: BlockActions) -> Result<TransformedMessage, ChannelError> {
    let action = payload
        .actions
        .into_iter()
        .next()
        .ok_or_else(|| ChannelError::Structure("block_actions without actions".to_string()))?;

    let (interactive_type, reply) = match (action.kind.as_str(), action.selected_option) {
        ("static_select", Some(option)) => (
            InteractiveType::List,
            InteractiveReply {
                id: option.value.clone(),
                title: option.text.text,
                payload: Some(option.value),
            },
        ),
        ("button", _) => (
            InteractiveType::Buttons,
            InteractiveReply {
                id: action.action_id,
                title: action.text.map(|t| t.text).unwrap_or_default(),
                payload: action.value,
            },
        ),
        (other, _) => {
            return Err(ChannelError::Structure(format!(
                "unsupported action type {other}"
            )));
        }
    };

    let channel = payload.channel.map(|c| c.id);
    let user_id = match &channel {
        Some(channel) => conversation_user(channel, None, &payload.user.id),
        None => payload.user.id.clone(),
    };
    let message_ts = payload
        .container
        .and_then(|c| c.message_ts)
        .or_else(|| payload.message.and_then(|m| m.ts));

    let mut metadata = MessageMetadata {
        reply_to: message_ts,
        ..MessageMetadata::default()
    };
    if let Some(channel) = channel {
        metadata.insert_platform_data("channel", channel);
    }
    let timestamp = action
        .action_ts
        .as_deref()
        .map_or_else(chrono::Utc::now, parse_ts);

    finish(TransformedMessage {
        user_id,
        content: MessageContent::Interactive(InteractiveContent {
            interactive_type,
            body: String::new(),
            header: None,
            footer: None,
            buttons: Vec::new(),
            sections: Vec::new(),
            list_button: None,
            reply: Some(reply),
        }),
        metadata,
        timestamp,
        platform_message_id: payload.trigger_id.unwrap_or_default(),
    })
}

fn plain_text(text: &str) -> Value {
    json!({ "type": "plain_text", "text": text, "emoji": true })
}

fn interactive_blocks(interactive: &InteractiveContent) -> Vec<Value> {
    let mut blocks = Vec::new();
    if let Some(header) = &interactive.header {
        blocks.push(json!({ "type": "header", "text": plain_text(header) }));
    }

    let body = json!({ "type": "mrkdwn", "text": escape(&interactive.body) });
    match interactive.interactive_type {
        InteractiveType::List => {
            let options: Vec<Value> = interactive
                .options()
                .into_iter()
                .map(|(id, title)| json!({ "text": plain_text(title), "value": id }))
                .collect();
            blocks.push(json!({
                "type": "section",
                "text": body,
                "accessory": {
                    "type": "static_select",
                    "action_id": LIST_ACTION_ID,
                    "placeholder": plain_text(interactive.list_button.as_deref().unwrap_or("Choose")),
                    "options": options,
                },
            }));
        }
        InteractiveType::Buttons | InteractiveType::QuickReply => {
            blocks.push(json!({ "type": "section", "text": body }));
            let elements: Vec<Value> = interactive
                .buttons
                .iter()
                .map(|button| {
                    json!({
                        "type": "button",
                        "text": plain_text(&button.title),
                        "action_id": button.id,
                        "value": button.payload.as_deref().unwrap_or(&button.id),
                    })
                })
                .collect();
            blocks.push(json!({ "type": "actions", "elements": elements }));
        }
    }

    if let Some(footer) = &interactive.footer {
        blocks.push(json!({
            "type": "context",
            "elements": [{ "type": "mrkdwn", "text": escape(footer) }],
        }));
    }
    blocks
}

// Slack API types

#[derive(Debug, Deserialize)]
struct SlackEnvelope {
    team_id: Option<String>,
    event_id: Option<String>,
    event: SlackEvent,
}

#[derive(Debug, Deserialize)]
struct SlackEvent {
    #[serde(rename = "type")]
    kind: String,
    subtype: Option<String>,
    channel: Option<String>,
    channel_type: Option<String>,
    user: Option<String>,
    bot_id: Option<String>,
    text: Option<String>,
    ts: Option<String>,
    thread_ts: Option<String>,
    #[serde(default)]
    files: Vec<SlackFile>,
    message: Option<Box<SlackMessage>>,
}

#[derive(Debug, Deserialize)]
struct SlackMessage {
    user: Option<String>,
    bot_id: Option<String>,
    text: Option<String>,
    ts: Option<String>,
    thread_ts: Option<String>,
    #[serde(default)]
    files: Vec<SlackFile>,
    edited: Option<SlackEdited>,
}

#[derive(Debug, Deserialize)]
struct SlackEdited {
    ts: String,
}

#[derive(Debug, Deserialize)]
struct SlackFile {
    id: String,
    name: Option<String>,
    mimetype: Option<String>,
    url_private: Option<String>,
    size: Option<u64>,
    original_w: Option<u32>,
    original_h: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct BlockActions {
    user: SlackId,
    channel: Option<SlackId>,
    container: Option<SlackContainer>,
    message: Option<SlackMessageRef>,
    trigger_id: Option<String>,
    #[serde(default)]
    actions: Vec<SlackAction>,
}

#[derive(Debug, Deserialize)]
struct SlackId {
    id: String,
}

#[derive(Debug, Deserialize)]
struct SlackContainer {
    message_ts: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SlackMessageRef {
    ts: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SlackAction {
    #[serde(rename = "type")]
    kind: String,
    action_id: String,
    value: Option<String>,
    text: Option<SlackText>,
    selected_option: Option<SlackOption>,
    action_ts: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SlackText {
    text: String,
}

#[derive(Debug, Deserialize)]
struct SlackOption {
    text: SlackText,
    value: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use switchboard_core::content::{
        Button, ContactPhone, FormatKind, ListRow, ListSection, TextFormat, create_buttons_content,
        create_contact_content, create_list_content, create_location_content, create_media_content,
        create_text_content,
    };

    fn event(event: Value) -> Value {
        json!({
            "token": "tok",
            "team_id": "T1",
            "type": "event_callback",
            "event_id": "Ev1",
            "event": event,
        })
    }

    #[test]
    fn test_channel_message_with_mrkdwn() {
        let raw = event(json!({
            "type": "message",
            "channel": "C123",
            "channel_type": "channel",
            "user": "U1",
            "text": "hi <@U2|bob>, see <https://example.com|the docs> &amp; *this*",
            "ts": "1700000000.000100",
            "thread_ts": "1699999999.000200",
        }));
        let message = SlackTransformer.parse_incoming(&raw).unwrap();
        assert_eq!(message.user_id, "C123:U1");
        assert_eq!(message.metadata.thread_id.as_deref(), Some("1699999999.000200"));
        assert_eq!(message.platform_message_id, "1700000000.000100");

        let MessageContent::Text(text) = message.content else {
            panic!("expected text");
        };
        assert_eq!(text.text, "hi @bob, see the docs & this");
        assert!(text.formatting.contains(&TextFormat::new(
            FormatKind::Mention { user_id: "U2".into() },
            3,
            4
        )));
        assert!(text.formatting.contains(&TextFormat::new(
            FormatKind::Link { url: "https://example.com".into() },
            13,
            8
        )));
        assert!(text.formatting.contains(&TextFormat::new(FormatKind::Bold, 24, 4)));
    }

    #[test]
    fn test_direct_message_uses_bare_id() {
        let raw = event(json!({
            "type": "message", "channel": "D999", "channel_type": "im",
            "user": "U1", "text": "psst", "ts": "1700000000.000100",
        }));
        assert_eq!(SlackTransformer.extract_user_id(&raw).unwrap(), "U1");
    }

    #[test]
    fn test_edit_and_bot_messages() {
        let raw = event(json!({
            "type": "message", "subtype": "message_changed", "channel": "C1", "channel_type": "channel",
            "message": { "user": "U1", "text": "fixed", "ts": "1700000000.000100",
                         "edited": { "user": "U1", "ts": "1700000050.000000" } },
        }));
        let message = SlackTransformer.parse_incoming(&raw).unwrap();
        assert_eq!(message.metadata.edited_at.map(|t| t.timestamp()), Some(1_700_000_050));

        let bot = event(json!({
            "type": "message", "subtype": "bot_message", "channel": "C1",
            "bot_id": "B1", "text": "beep", "ts": "1700000000.000100",
        }));
        assert!(SlackTransformer.parse_incoming(&bot).is_err());
    }

    #[test]
    fn test_file_share_becomes_media() {
        let raw = event(json!({
            "type": "message", "subtype": "file_share", "channel": "C1", "channel_type": "channel",
            "user": "U1", "text": "", "ts": "1700000000.000100",
            "files": [{
                "id": "F1", "name": "chart.png", "mimetype": "image/png",
                "url_private": "https://files.slack.com/files-pri/T1-F1/chart.png",
                "size": 2048, "original_w": 640, "original_h": 480,
            }],
        }));
        let MessageContent::Media(media) = SlackTransformer.parse_incoming(&raw).unwrap().content else {
            panic!("expected media");
        };
        assert_eq!(media.media_type, MediaType::Image);
        assert_eq!(media.filename.as_deref(), Some("chart.png"));
        assert_eq!(media.dimensions, Some(Dimensions { width: 640, height: 480 }));
    }

    #[test]
    fn test_block_actions_button_and_select() {
        let raw = json!({
            "type": "block_actions",
            "user": { "id": "U1" },
            "channel": { "id": "C1" },
            "container": { "message_ts": "1700000000.000100" },
            "trigger_id": "trig-1",
            "actions": [{
                "type": "button", "action_id": "approve", "value": "approve:42",
                "text": { "type": "plain_text", "text": "Approve" }, "action_ts": "1700000010.000000",
            }],
        });
        let message = SlackTransformer.parse_incoming(&raw).unwrap();
        assert_eq!(message.user_id, "C1:U1");
        assert_eq!(message.metadata.reply_to.as_deref(), Some("1700000000.000100"));
        let MessageContent::Interactive(interactive) = message.content else {
            panic!("expected interactive");
        };
        assert_eq!(
            interactive.reply,
            Some(InteractiveReply {
                id: "approve".into(),
                title: "Approve".into(),
                payload: Some("approve:42".into()),
            })
        );

        let raw = json!({
            "type": "block_actions",
            "user": { "id": "U1" },
            "channel": { "id": "D1" },
            "actions": [{
                "type": "static_select", "action_id": LIST_ACTION_ID,
                "selected_option": { "text": { "type": "plain_text", "text": "Second" }, "value": "row-2" },
            }],
        });
        let message = SlackTransformer.parse_incoming(&raw).unwrap();
        assert_eq!(message.user_id, "U1");
        let MessageContent::Interactive(interactive) = message.content else {
            panic!("expected interactive");
        };
        assert_eq!(interactive.interactive_type, InteractiveType::List);
        assert_eq!(interactive.reply.unwrap().id, "row-2");
    }

    #[test]
    fn test_text_round_trip() {
        let content = create_text_content(
            "ping @here and read docs",
            vec![
                TextFormat::new(FormatKind::Bold, 0, 4),
                TextFormat::new(FormatKind::Link { url: "https://example.com/docs".into() }, 20, 4),
            ],
        )
        .unwrap();
        let payload = SlackTransformer.format_outgoing("C1:U1", &content, None);
        assert_eq!(payload["channel"], "C1");
        let text = payload["text"].as_str().unwrap();
        assert_eq!(text, "*ping* @here and read <https://example.com/docs|docs>");

        let raw = event(json!({
            "type": "message", "channel": "C1", "channel_type": "channel",
            "user": "U1", "text": text, "ts": "1700000000.000100",
        }));
        assert_eq!(SlackTransformer.parse_incoming(&raw).unwrap().content, content);
    }

    #[test]
    fn test_outgoing_degradations() {
        let image = create_media_content(MediaType::Image, "https://cdn.example.com/a.png", Some("Chart".into()), None).unwrap();
        let payload = SlackTransformer.format_outgoing("C1", &image, None);
        assert_eq!(payload["blocks"][0]["type"], "image");
        assert_eq!(payload["blocks"][0]["alt_text"], "Chart");

        let doc = create_media_content(MediaType::Document, "https://cdn.example.com/r.pdf", None, Some("r.pdf".into())).unwrap();
        let payload = SlackTransformer.format_outgoing("C1", &doc, None);
        assert_eq!(payload["text"], "<https://cdn.example.com/r.pdf|r.pdf>");

        let pin = create_location_content(45.0, -120.0, Some("HQ".into()), None).unwrap();
        let payload = SlackTransformer.format_outgoing("C1", &pin, None);
        assert_eq!(payload["text"], "📍 HQ\nhttps://maps.google.com/?q=45,-120");
    }

    #[test]
    fn test_outgoing_blocks_and_thread() {
        let buttons = create_buttons_content("Deploy?", vec![Button::new("yes", "Yes"), Button::new("no", "No")]).unwrap();
        let metadata = MessageMetadata {
            thread_id: Some("1700000000.000100".into()),
            ..MessageMetadata::default()
        };
        let payload = SlackTransformer.format_outgoing("C1", &buttons, Some(&metadata));
        assert_eq!(payload["thread_ts"], "1700000000.000100");
        assert_eq!(payload["blocks"][1]["type"], "actions");
        assert_eq!(payload["blocks"][1]["elements"][0]["action_id"], "yes");
        assert_eq!(payload["text"], "Deploy?\n1. Yes\n2. No");

        let list = create_list_content(
            "Pick a region",
            "Regions",
            vec![ListSection {
                title: None,
                rows: vec![
                    ListRow { id: "eu".into(), title: "Europe".into(), description: None },
                    ListRow { id: "us".into(), title: "Americas".into(), description: None },
                ],
            }],
        )
        .unwrap();
        let payload = SlackTransformer.format_outgoing("C1", &list, None);
        let accessory = &payload["blocks"][0]["accessory"];
        assert_eq!(accessory["type"], "static_select");
        assert_eq!(accessory["options"][1]["value"], "us");
    }

    /// Post the text of an outbound payload back as a channel message.
    fn echo(payload: &Value) -> Value {
        event(json!({
            "type": "message", "channel": "C1", "channel_type": "channel",
            "user": "U1", "text": payload["text"], "ts": "1700000000.000100",
        }))
    }

    fn round_trip(content: &MessageContent) -> (Value, MessageContent, Value) {
        let first = SlackTransformer.format_outgoing("C1:U1", content, None);
        let parsed = SlackTransformer.parse_incoming(&echo(&first)).unwrap().content;
        let second = SlackTransformer.format_outgoing("C1:U1", &parsed, None);
        (first, parsed, second)
    }

    #[test]
    fn test_location_degrades_to_text_with_map_link() {
        let pin = create_location_content(45.0, -120.0, Some("HQ".into()), Some("1 Main St".into())).unwrap();
        let (first, parsed, second) = round_trip(&pin);
        assert_eq!(first.get("blocks"), None);
        assert_eq!(
            parsed,
            MessageContent::Text(TextContent {
                text: "📍 HQ\n1 Main St\nhttps://maps.google.com/?q=45,-120".into(),
                formatting: Vec::new(),
            })
        );
        assert_eq!(second["text"], first["text"]);
        assert_eq!(second["mrkdwn"], true);
    }

    #[test]
    fn test_contact_degrades_to_text_card() {
        let contact = create_contact_content(
            "Bob <Ops> Lee",
            vec![ContactPhone { number: "+15550001".into(), label: Some("work".into()) }],
            vec!["bob@example.com".into()],
            Some("Acme".into()),
        )
        .unwrap();
        let (first, parsed, second) = round_trip(&contact);
        assert_eq!(first["text"], "👤 Bob &lt;Ops&gt; Lee\nAcme\nwork: +15550001\nbob@example.com");
        let MessageContent::Text(text) = parsed else {
            panic!("expected text");
        };
        assert_eq!(text.text, "👤 Bob <Ops> Lee\nAcme\nwork: +15550001\nbob@example.com");
        assert_eq!(second["text"], first["text"]);
    }

    #[test]
    fn test_document_degrades_to_linked_text() {
        let doc = create_media_content(
            MediaType::Document,
            "https://cdn.example.com/r.pdf",
            Some("Q3 report".into()),
            Some("r.pdf".into()),
        )
        .unwrap();
        let (first, parsed, second) = round_trip(&doc);
        assert_eq!(first["text"], "Q3 report\n<https://cdn.example.com/r.pdf|r.pdf>");
        assert_eq!(
            parsed,
            MessageContent::Text(TextContent {
                text: "Q3 report\nr.pdf".into(),
                formatting: vec![TextFormat::new(
                    FormatKind::Link { url: "https://cdn.example.com/r.pdf".into() },
                    10,
                    5
                )],
            })
        );
        assert_eq!(second["text"], first["text"]);
    }

    #[test]
    fn test_image_block_echoes_as_alt_text() {
        let image = create_media_content(
            MediaType::Image,
            "https://cdn.example.com/a.png",
            Some("Chart".into()),
            None,
        )
        .unwrap();
        let (first, parsed, second) = round_trip(&image);
        assert_eq!(first["blocks"][0]["image_url"], "https://cdn.example.com/a.png");
        assert_eq!(parsed, create_text_content("Chart", Vec::new()).unwrap());
        assert_eq!(second.get("blocks"), None);
    }

    #[test]
    fn test_button_click_round_trip_keeps_only_the_reply() {
        let buttons = create_buttons_content(
            "Deploy?",
            vec![Button::new("yes", "Ship it"), Button::new("no", "Hold")],
        )
        .unwrap();
        let first = SlackTransformer.format_outgoing("C1:U1", &buttons, None);
        let mut clicked = first["blocks"][1]["elements"][0].clone();
        clicked["action_ts"] = json!("1700000010.000000");
        let raw = json!({
            "type": "block_actions",
            "user": { "id": "U1" },
            "channel": { "id": "C1" },
            "actions": [clicked],
        });
        let message = SlackTransformer.parse_incoming(&raw).unwrap();
        assert_eq!(message.user_id, "C1:U1");
        let MessageContent::Interactive(interactive) = &message.content else {
            panic!("expected interactive");
        };
        assert_eq!(
            interactive.reply,
            Some(InteractiveReply {
                id: "yes".into(),
                title: "Ship it".into(),
                payload: Some("yes".into()),
            })
        );

        let second = SlackTransformer.format_outgoing(&message.user_id, &message.content, None);
        assert_eq!(second["channel"], "C1");
        assert_eq!(second["text"], "Ship it");
        assert_eq!(second["blocks"][1]["elements"], json!([]));
    }

    #[test]
    fn test_validate_structure() {
        let message = event(json!({
            "type": "message", "channel": "C1", "user": "U1", "text": "hi", "ts": "1.0",
        }));
        assert!(SlackTransformer.validate_structure(&message));
        assert!(SlackTransformer.validate_structure(&json!({
            "type": "block_actions", "user": { "id": "U1" }, "actions": [],
        })));

        assert!(!SlackTransformer.validate_structure(&json!({
            "type": "url_verification", "challenge": "abc",
        })));
        assert!(!SlackTransformer.validate_structure(&json!({ "type": "event_callback" })));
        assert!(!SlackTransformer.validate_structure(&json!({
            "type": "event_callback", "event": "message",
        })));
        assert!(!SlackTransformer.validate_structure(&json!({
            "type": "block_actions", "actions": { "type": "button" },
        })));
        assert!(!SlackTransformer.validate_structure(&json!({ "event": {} })));
    }

    #[test]
    fn test_extract_user_id_for_conversation_kinds() {
        let in_channel = |channel: &str, channel_type: Option<&str>| {
            let mut body = json!({
                "type": "message", "channel": channel, "user": "U7",
                "text": "hi", "ts": "1700000000.000100",
            });
            if let Some(kind) = channel_type {
                body["channel_type"] = json!(kind);
            }
            SlackTransformer.extract_user_id(&event(body)).unwrap()
        };
        assert_eq!(in_channel("C42", Some("channel")), "C42:U7");
        assert_eq!(in_channel("G42", Some("group")), "G42:U7");
        assert_eq!(in_channel("G42", None), "G42:U7");
        assert_eq!(in_channel("D42", None), "U7");
        assert_eq!(in_channel("D42", Some("im")), "U7");

        let no_user = event(json!({
            "type": "message", "channel": "C42", "text": "hi", "ts": "1700000000.000100",
        }));
        assert!(SlackTransformer.extract_user_id(&no_user).is_err());
    }
}

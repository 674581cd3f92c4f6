//! Browser chat over WebSocket.
//!
//! Unlike the other channels there is no platform API: the gateway accepts
//! sockets and hands them to the tenant's [`ConnectionManager`], and
//! outbound messages go straight to the user's live connections or their
//! offline queue. Inbound traffic never arrives by webhook.

mod auth;
mod frames;
mod manager;

pub use auth::{AuthFailure, Claims, Identity, JwtTokenVerifier, TokenVerifier};
pub use frames::{
    AuthData, ClientFrame, FileUploadData, MessageData, MessageFrame, ReadReceiptData,
    ServerFrame, TypingData,
};
pub use manager::{
    ConnectionHandle, ConnectionId, ConnectionManager, Direction, HistoryEntry, RealtimeError,
    RealtimeEvent, RealtimeStats,
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{Value, json};
use std::sync::Arc;

use switchboard_core::config::{ChannelSettings, RealtimeConfig, WebChatSettings};
use switchboard_core::content::{ContentKind, MessageContent};
use switchboard_core::types::{ChannelType, DeliveryStatus, MessageMetadata, TransformedMessage};

use crate::lifecycle::Lifecycle;
use crate::traits::{
    AdapterHealth, AdapterState, ChannelAdapter, ChannelError, WebhookOutcome, features,
};
use crate::transform::{MessageTransformer, clean_text, decode, finish};
use crate::webhook::{WebhookFailure, WebhookRequest};

const SUPPORTED: &[ContentKind] = &[
    ContentKind::Text,
    ContentKind::Media,
    ContentKind::Location,
    ContentKind::Contact,
    ContentKind::Interactive,
];

/// Transformer for browser chat frames.
///
/// The wire model is the normalized model, so formatting ranges pass
/// through unchanged.
#[derive(Debug, Clone, Copy, Default)]
pub struct WebChatTransformer;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WebChatInbound {
    user_id: String,
    message_id: String,
    #[serde(default)]
    session_id: Option<String>,
    #[serde(default)]
    timestamp: Option<DateTime<Utc>>,
    content: MessageContent,
    #[serde(default)]
    reply_to: Option<String>,
    #[serde(default)]
    thread_id: Option<String>,
}

impl MessageTransformer for WebChatTransformer {
    fn channel_type(&self) -> ChannelType {
        ChannelType::WebChat
    }

    fn parse_incoming(&self, raw: &Value) -> Result<TransformedMessage, ChannelError> {
        let inbound: WebChatInbound = decode(raw)?;
        if inbound.user_id.trim().is_empty() {
            return Err(ChannelError::Structure("empty userId".to_string()));
        }

        let content = match inbound.content {
            MessageContent::Text(mut text) if text.formatting.is_empty() => {
                text.text = clean_text(&text.text)?;
                MessageContent::Text(text)
            }
            other => other,
        };

        let mut metadata = MessageMetadata {
            channel_message_id: Some(inbound.message_id.clone()),
            reply_to: inbound.reply_to,
            thread_id: inbound.thread_id,
            ..MessageMetadata::default()
        };
        if let Some(session_id) = inbound.session_id {
            metadata.insert_platform_data("sessionId", session_id);
        }

        finish(TransformedMessage {
            user_id: inbound.user_id,
            content,
            metadata,
            timestamp: inbound.timestamp.unwrap_or_else(Utc::now),
            platform_message_id: inbound.message_id,
        })
    }

    fn format_outgoing(
        &self,
        user_id: &str,
        content: &MessageContent,
        metadata: Option<&MessageMetadata>,
    ) -> Value {
        json!({
            "userId": user_id,
            "content": content,
            "metadata": metadata,
        })
    }

    fn validate_structure(&self, raw: &Value) -> bool {
        raw.get("userId").is_some_and(Value::is_string)
            && raw.get("content").is_some_and(Value::is_object)
    }

    fn extract_user_id(&self, raw: &Value) -> Result<String, ChannelError> {
        raw.get("userId")
            .and_then(Value::as_str)
            .filter(|id| !id.is_empty())
            .map(ToString::to_string)
            .ok_or_else(|| ChannelError::Structure("missing userId".to_string()))
    }
}

/// Browser chat adapter for one tenant.
pub struct WebChatAdapter {
    channel_id: String,
    lifecycle: Lifecycle,
    manager: Arc<ConnectionManager>,
}

impl WebChatAdapter {
    /// Create an adapter for one tenant.
    ///
    /// # Errors
    ///
    /// Returns `ChannelError::Configuration` if the JWT secret is missing or short.
    pub fn new(
        tenant: &str,
        settings: WebChatSettings,
        realtime: RealtimeConfig,
    ) -> Result<Self, ChannelError> {
        ChannelSettings::WebChat(settings.clone()).validate()?;
        let verifier =
            JwtTokenVerifier::new(&settings.jwt_secret, settings.issuer.as_deref(), tenant);
        Ok(Self::with_verifier(tenant, realtime, Arc::new(verifier)))
    }

    /// Create an adapter with a custom token verifier.
    #[must_use]
    pub fn with_verifier(
        tenant: &str,
        realtime: RealtimeConfig,
        verifier: Arc<dyn TokenVerifier>,
    ) -> Self {
        Self {
            channel_id: format!("webchat:{tenant}"),
            lifecycle: Lifecycle::new(format!("webchat:{tenant}")),
            manager: Arc::new(ConnectionManager::new(realtime, verifier)),
        }
    }
}

#[async_trait]
impl ChannelAdapter for WebChatAdapter {
    fn channel_type(&self) -> ChannelType {
        ChannelType::WebChat
    }

    fn channel_id(&self) -> &str {
        &self.channel_id
    }

    fn channel_name(&self) -> &str {
        "Web Chat"
    }

    fn supported_message_types(&self) -> &'static [ContentKind] {
        SUPPORTED
    }

    fn supports_feature(&self, feature: &str) -> bool {
        matches!(
            feature,
            features::TEXT
                | features::MEDIA
                | features::LOCATION
                | features::CONTACT
                | features::INTERACTIVE
                | features::FORMATTING
                | features::TYPING
                | features::PRESENCE
                | features::READ_RECEIPTS
                | features::OFFLINE_QUEUE
        )
    }

    fn state(&self) -> AdapterState {
        self.lifecycle.state()
    }

    async fn initialize(&self) -> Result<(), ChannelError> {
        self.lifecycle.begin_init()?;
        self.manager.start();
        self.lifecycle.finish_init(&Ok::<(), ChannelError>(()));
        tracing::info!(channel = %self.channel_id, "Web chat connection manager started");
        Ok(())
    }

    async fn send_message(
        &self,
        user_id: &str,
        content: &MessageContent,
        metadata: Option<&MessageMetadata>,
    ) -> Result<DeliveryStatus, ChannelError> {
        self.lifecycle.ensure_running()?;
        let status = self
            .manager
            .deliver(user_id, content.clone(), metadata.cloned())
            .await;
        self.lifecycle.record_send(true);
        Ok(status)
    }

    async fn process_incoming_webhook(
        &self,
        _request: &WebhookRequest,
    ) -> Result<WebhookOutcome, ChannelError> {
        self.lifecycle.ensure_running()?;
        Ok(WebhookOutcome::rejected(WebhookFailure::UnsupportedChannel))
    }

    fn validate_webhook(&self, _request: &WebhookRequest) -> bool {
        false
    }

    async fn health_status(&self) -> AdapterHealth {
        let stats = self.manager.stats().await;
        let mut details = serde_json::Map::new();
        details.insert("connections".to_string(), json!(stats.connections));
        details.insert("onlineUsers".to_string(), json!(stats.online_users));
        details.insert("sessions".to_string(), json!(stats.sessions));
        details.insert("queued".to_string(), json!(stats.queued));
        self.lifecycle.health_from_check(Ok(details))
    }

    async fn shutdown(&self) -> Result<(), ChannelError> {
        if !self.lifecycle.begin_shutdown() {
            return Ok(());
        }
        self.manager.shutdown().await;
        self.lifecycle.finish_shutdown();
        tracing::info!(channel = %self.channel_id, "Web chat adapter stopped");
        Ok(())
    }

    fn realtime_manager(&self) -> Option<Arc<ConnectionManager>> {
        Some(Arc::clone(&self.manager))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use switchboard_core::content::{FormatKind, TextFormat, create_text_content};
    use switchboard_core::secrets::ApiKey;
    use switchboard_core::types::DeliveryState;

    fn adapter() -> WebChatAdapter {
        let settings = WebChatSettings {
            jwt_secret: ApiKey::new(auth::tests::SECRET),
            issuer: None,
        };
        WebChatAdapter::new("acme", settings, RealtimeConfig::default()).unwrap()
    }

    #[test]
    fn test_short_secret_rejected() {
        let settings = WebChatSettings {
            jwt_secret: ApiKey::new("short"),
            issuer: None,
        };
        assert!(matches!(
            WebChatAdapter::new("acme", settings, RealtimeConfig::default()),
            Err(ChannelError::Configuration(_))
        ));
    }

    #[test]
    fn test_parse_incoming_keeps_ranges() {
        let raw = json!({
            "userId": "u1",
            "messageId": "m1",
            "sessionId": "s1",
            "content": {
                "type": "text",
                "text": "héllo world",
                "formatting": [{ "kind": "bold", "offset": 0, "length": 5 }],
            },
            "replyTo": "m0",
        });
        let message = WebChatTransformer.parse_incoming(&raw).unwrap();
        assert_eq!(message.user_id, "u1");
        assert_eq!(message.platform_message_id, "m1");
        assert_eq!(message.metadata.reply_to.as_deref(), Some("m0"));
        assert_eq!(message.metadata.platform_data["sessionId"], "s1");
        let MessageContent::Text(text) = message.content else {
            panic!("expected text");
        };
        assert_eq!(text.formatting, vec![TextFormat::new(FormatKind::Bold, 0, 5)]);

        assert!(WebChatTransformer.parse_incoming(&json!({ "userId": "u1" })).is_err());
        assert!(!WebChatTransformer.validate_structure(&json!({ "content": {} })));
        assert_eq!(WebChatTransformer.extract_user_id(&raw).unwrap(), "u1");
    }

    #[tokio::test]
    async fn test_lifecycle_and_delivery() {
        let adapter = adapter();
        let content = create_text_content("hi", vec![]).unwrap();
        assert!(matches!(
            adapter.send_message("u1", &content, None).await,
            Err(ChannelError::Lifecycle(_))
        ));

        adapter.initialize().await.unwrap();
        let status = adapter.send_message("u1", &content, None).await.unwrap();
        assert_eq!(status.status, DeliveryState::Queued);

        let health = adapter.health_status().await;
        assert_eq!(health.details["queued"], 1);
        assert!(adapter.realtime_manager().is_some());

        let outcome = adapter
            .process_incoming_webhook(&WebhookRequest::post(b"{}".to_vec()))
            .await
            .unwrap();
        assert_eq!(outcome.error, Some(WebhookFailure::UnsupportedChannel));

        adapter.shutdown().await.unwrap();
        adapter.shutdown().await.unwrap();
        assert_eq!(adapter.state(), AdapterState::Shutdown);
    }
}

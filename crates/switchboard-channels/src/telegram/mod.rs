//! Telegram channel adapter using the Bot API.

mod transform;

pub use transform::TelegramTransformer;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{Value, json};
use std::sync::Arc;
use tokio::sync::{RwLock, Semaphore};

use switchboard_core::config::{ChannelSettings, TelegramSettings};
use switchboard_core::content::{ContentKind, MessageContent};
use switchboard_core::secrets::ApiKey;
use switchboard_core::types::{ChannelType, DeliveryStatus, MessageMetadata};

use crate::http::{self, CallFailure};
use crate::lifecycle::Lifecycle;
use crate::traits::{
    AdapterHealth, AdapterState, ChannelAdapter, ChannelError, WebhookOutcome, features,
};
use crate::transform::{MessageTransformer, parse_batch};
use crate::webhook::{WebhookRequest, WebhookSecrets, WebhookValidator};

const TELEGRAM_API_BASE: &str = "https://api.telegram.org";

const SUPPORTED: &[ContentKind] = &[
    ContentKind::Text,
    ContentKind::Media,
    ContentKind::Location,
    ContentKind::Contact,
    ContentKind::Interactive,
];

/// Telegram channel adapter.
pub struct TelegramAdapter {
    client: Client,
    token: ApiKey,
    base_url: String,
    webhook_url: Option<String>,
    channel_id: String,
    lifecycle: Lifecycle,
    sends: Semaphore,
    validator: Arc<WebhookValidator>,
    secrets: WebhookSecrets,
    state: Arc<RwLock<TelegramState>>,
}

#[derive(Debug, Default)]
struct TelegramState {
    bot_id: Option<i64>,
    username: Option<String>,
}

impl TelegramAdapter {
    /// Create an adapter for one tenant.
    ///
    /// # Errors
    ///
    /// Returns `ChannelError::Configuration` if the settings are incomplete.
    pub fn new(
        tenant: &str,
        settings: TelegramSettings,
        validator: Arc<WebhookValidator>,
    ) -> Result<Self, ChannelError> {
        ChannelSettings::Telegram(settings.clone()).validate()?;
        Ok(Self {
            client: http::build_client()?,
            base_url: settings
                .base_url
                .unwrap_or_else(|| TELEGRAM_API_BASE.to_string())
                .trim_end_matches('/')
                .to_string(),
            webhook_url: settings.webhook_url,
            channel_id: format!("telegram:{tenant}"),
            lifecycle: Lifecycle::new(format!("telegram:{tenant}")),
            sends: Semaphore::new(settings.max_concurrent_sends),
            validator,
            secrets: WebhookSecrets {
                secret_token: settings.secret_token,
                ..WebhookSecrets::default()
            },
            token: settings.bot_token,
            state: Arc::new(RwLock::new(TelegramState::default())),
        })
    }

    /// Get the Bot API URL.
    fn api_url(&self, method: &str) -> String {
        format!("{}/bot{}/{}", self.base_url, self.token.expose(), method)
    }

    /// Call a Telegram Bot API method.
    async fn call<T: for<'de> Deserialize<'de>>(
        &self,
        method: &str,
        params: &Value,
    ) -> Result<T, CallFailure> {
        let request = self.client.post(self.api_url(method)).json(params);
        let (status, body) = http::execute(request).await?;
        let envelope: TelegramResponse<T> = http::decode_body(status, body.clone())?;

        match (envelope.ok, envelope.result) {
            (true, Some(result)) => Ok(result),
            (true, None) => Err(CallFailure::platform(status, "Empty response", body)),
            (false, _) => {
                let description = envelope
                    .description
                    .unwrap_or_else(|| "Unknown error".to_string());
                Err(CallFailure::platform(status, &description, body))
            }
        }
    }

    async fn connect(&self) -> Result<(), ChannelError> {
        let me: TelegramUser = self.call("getMe", &json!({})).await?;

        if let Some(url) = &self.webhook_url {
            let mut params = json!({
                "url": url,
                "allowed_updates": ["message", "edited_message", "channel_post", "edited_channel_post", "callback_query"],
            });
            if let Some(secret) = &self.secrets.secret_token {
                params["secret_token"] = json!(secret.expose());
            }
            let _: bool = self.call("setWebhook", &params).await?;
        }

        let mut state = self.state.write().await;
        state.bot_id = Some(me.id);
        state.username.clone_from(&me.username);
        drop(state);

        tracing::info!(channel = %self.channel_id, "Telegram bot connected: {}", me.first_name);
        Ok(())
    }
}

#[async_trait]
impl ChannelAdapter for TelegramAdapter {
    fn channel_type(&self) -> ChannelType {
        ChannelType::Telegram
    }

    fn channel_id(&self) -> &str {
        &self.channel_id
    }

    fn channel_name(&self) -> &str {
        "Telegram"
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
                | features::THREADS
                | features::EDITING
                | features::WEBHOOKS
        )
    }

    fn state(&self) -> AdapterState {
        self.lifecycle.state()
    }

    async fn initialize(&self) -> Result<(), ChannelError> {
        self.lifecycle.begin_init()?;
        let result = self.connect().await;
        self.lifecycle.finish_init(&result);
        result
    }

    async fn send_message(
        &self,
        user_id: &str,
        content: &MessageContent,
        metadata: Option<&MessageMetadata>,
    ) -> Result<DeliveryStatus, ChannelError> {
        self.lifecycle.ensure_running()?;

        let mut payload = TelegramTransformer.format_outgoing(user_id, content, metadata);
        let method = payload
            .as_object_mut()
            .and_then(|p| p.remove("method"))
            .and_then(|m| m.as_str().map(ToString::to_string))
            .unwrap_or_else(|| "sendMessage".to_string());

        let _permit = self
            .sends
            .acquire()
            .await
            .map_err(|_| ChannelError::Lifecycle(format!("{} is shutting down", self.channel_id)))?;

        let result = self.call::<TelegramSent>(&method, &payload).await;
        self.lifecycle.record_send(result.is_ok());
        Ok(match result {
            Ok(sent) => DeliveryStatus::sent(sent.message_id.to_string()),
            Err(failure) => {
                tracing::warn!(channel = %self.channel_id, method = %method, error = %failure.error, "Telegram send failed");
                failure.into_delivery()
            }
        })
    }

    async fn process_incoming_webhook(
        &self,
        request: &WebhookRequest,
    ) -> Result<WebhookOutcome, ChannelError> {
        self.lifecycle.ensure_running()?;
        let body = match self
            .validator
            .admit(ChannelType::Telegram, request, &self.secrets)
        {
            Ok(body) => body,
            Err(outcome) => return Ok(outcome),
        };

        let mut outcome = WebhookOutcome::accepted();
        match &body {
            Value::Array(updates) => parse_batch(&TelegramTransformer, updates, &mut outcome),
            single => parse_batch(&TelegramTransformer, [single], &mut outcome),
        }
        tracing::debug!(
            channel = %self.channel_id,
            messages = outcome.messages.len(),
            skipped = outcome.skipped,
            "Telegram webhook processed"
        );
        Ok(outcome)
    }

    fn validate_webhook(&self, request: &WebhookRequest) -> bool {
        self.validator
            .verify(ChannelType::Telegram, request, &self.secrets)
            .is_valid
    }

    async fn health_status(&self) -> AdapterHealth {
        let check = match self.call::<TelegramUser>("getMe", &json!({})).await {
            Ok(me) => {
                let mut details = serde_json::Map::new();
                details.insert("botId".to_string(), json!(me.id));
                details.insert("username".to_string(), json!(me.username));
                Ok(details)
            }
            Err(failure) => Err(failure.error),
        };
        self.lifecycle.health_from_check(check)
    }

    async fn shutdown(&self) -> Result<(), ChannelError> {
        if !self.lifecycle.begin_shutdown() {
            return Ok(());
        }
        self.sends.close();
        let mut state = self.state.write().await;
        state.bot_id = None;
        drop(state);
        self.lifecycle.finish_shutdown();
        tracing::info!(channel = %self.channel_id, "Telegram adapter stopped");
        Ok(())
    }
}

// Telegram API types

#[derive(Debug, Deserialize)]
struct TelegramResponse<T> {
    ok: bool,
    result: Option<T>,
    description: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TelegramUser {
    id: i64,
    first_name: String,
    username: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TelegramSent {
    message_id: i64,
}

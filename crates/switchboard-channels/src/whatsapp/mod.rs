//! WhatsApp channel adapter using the Cloud API.

mod transform;

pub use transform::{MAX_REPLY_BUTTONS, WhatsAppTransformer};

use async_trait::async_trait;
use reqwest::{Client, Method};
use serde::Deserialize;
use serde_json::{Value, json};
use std::sync::Arc;
use tokio::sync::{RwLock, Semaphore};

use switchboard_core::config::{ChannelSettings, WhatsAppSettings};
use switchboard_core::content::{ContentKind, MessageContent};
use switchboard_core::secrets::ApiKey;
use switchboard_core::types::{ChannelType, DeliveryStatus, MessageMetadata};

use crate::http::{self, CallFailure};
use crate::lifecycle::Lifecycle;
use crate::traits::{
    AdapterHealth, AdapterState, ChannelAdapter, ChannelError, WebhookOutcome, features,
};
use crate::transform::MessageTransformer;
use crate::webhook::{WebhookRequest, WebhookSecrets, WebhookValidator};

const WHATSAPP_API_BASE: &str = "https://graph.facebook.com";

const SUPPORTED: &[ContentKind] = &[
    ContentKind::Text,
    ContentKind::Media,
    ContentKind::Location,
    ContentKind::Contact,
    ContentKind::Interactive,
];

/// WhatsApp channel adapter using the Cloud API (Business Platform).
pub struct WhatsAppAdapter {
    client: Client,
    access_token: ApiKey,
    phone_number_id: String,
    api_base: String,
    channel_id: String,
    lifecycle: Lifecycle,
    sends: Semaphore,
    validator: Arc<WebhookValidator>,
    secrets: WebhookSecrets,
    state: Arc<RwLock<WhatsAppState>>,
}

#[derive(Debug, Default)]
struct WhatsAppState {
    display_phone_number: Option<String>,
    verified_name: Option<String>,
}

impl WhatsAppAdapter {
    /// Create an adapter for one tenant.
    ///
    /// # Errors
    ///
    /// Returns `ChannelError::Configuration` if the settings are incomplete.
    pub fn new(
        tenant: &str,
        settings: WhatsAppSettings,
        validator: Arc<WebhookValidator>,
    ) -> Result<Self, ChannelError> {
        ChannelSettings::WhatsApp(settings.clone()).validate()?;
        let base = settings
            .base_url
            .unwrap_or_else(|| WHATSAPP_API_BASE.to_string());
        Ok(Self {
            client: http::build_client()?,
            api_base: format!("{}/{}", base.trim_end_matches('/'), settings.api_version),
            channel_id: format!("whatsapp:{tenant}"),
            lifecycle: Lifecycle::new(format!("whatsapp:{tenant}")),
            sends: Semaphore::new(settings.max_concurrent_sends),
            validator,
            secrets: WebhookSecrets {
                signing_secret: settings.app_secret,
                verification_token: settings.verify_token,
                secret_token: None,
            },
            access_token: settings.access_token,
            phone_number_id: settings.phone_number_id,
            state: Arc::new(RwLock::new(WhatsAppState::default())),
        })
    }

    /// Call a WhatsApp Cloud API endpoint.
    async fn call<T: for<'de> Deserialize<'de>>(
        &self,
        method: Method,
        endpoint: &str,
        body: Option<&Value>,
    ) -> Result<T, CallFailure> {
        let url = format!("{}{}", self.api_base, endpoint);
        let mut request = self
            .client
            .request(method, &url)
            .bearer_auth(self.access_token.expose());
        if let Some(b) = body {
            request = request.json(b);
        }
        let (status, body) = http::execute(request).await?;
        http::decode_body(status, body)
    }

    async fn phone_number(&self) -> Result<PhoneNumberInfo, CallFailure> {
        let endpoint = format!(
            "/{}?fields=display_phone_number,verified_name",
            self.phone_number_id
        );
        self.call(Method::GET, &endpoint, None).await
    }

    async fn connect(&self) -> Result<(), ChannelError> {
        let info = self.phone_number().await?;
        let mut state = self.state.write().await;
        state.display_phone_number.clone_from(&info.display_phone_number);
        state.verified_name.clone_from(&info.verified_name);
        drop(state);

        tracing::info!(
            channel = %self.channel_id,
            "WhatsApp connected: {}",
            info.verified_name.as_deref().unwrap_or(&self.phone_number_id)
        );
        Ok(())
    }
}

#[async_trait]
impl ChannelAdapter for WhatsAppAdapter {
    fn channel_type(&self) -> ChannelType {
        ChannelType::WhatsApp
    }

    fn channel_id(&self) -> &str {
        &self.channel_id
    }

    fn channel_name(&self) -> &str {
        "WhatsApp"
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
                | features::READ_RECEIPTS
                | features::REACTIONS
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
        let payload = WhatsAppTransformer.format_outgoing(user_id, content, metadata);
        let endpoint = format!("/{}/messages", self.phone_number_id);

        let _permit = self
            .sends
            .acquire()
            .await
            .map_err(|_| ChannelError::Lifecycle(format!("{} is shutting down", self.channel_id)))?;

        let result = self
            .call::<SendMessageResponse>(Method::POST, &endpoint, Some(&payload))
            .await
            .and_then(|response| {
                response
                    .messages
                    .into_iter()
                    .next()
                    .map(|m| m.id)
                    .ok_or_else(|| {
                        CallFailure::new(
                            ChannelError::Transport {
                                status: None,
                                message: "No message ID in response".to_string(),
                            },
                            None,
                        )
                    })
            });
        self.lifecycle.record_send(result.is_ok());

        Ok(match result {
            Ok(message_id) => DeliveryStatus::sent(message_id),
            Err(failure) => {
                tracing::warn!(channel = %self.channel_id, error = %failure.error, "WhatsApp send failed");
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
            .admit(ChannelType::WhatsApp, request, &self.secrets)
        {
            Ok(body) => body,
            Err(outcome) => return Ok(outcome),
        };

        let mut outcome = WebhookOutcome::accepted();
        transform::collect_webhook(&body, &mut outcome);
        tracing::debug!(
            channel = %self.channel_id,
            messages = outcome.messages.len(),
            receipts = outcome.receipts.len(),
            skipped = outcome.skipped,
            "WhatsApp webhook processed"
        );
        Ok(outcome)
    }

    fn validate_webhook(&self, request: &WebhookRequest) -> bool {
        self.validator
            .verify(ChannelType::WhatsApp, request, &self.secrets)
            .is_valid
    }

    async fn health_status(&self) -> AdapterHealth {
        let check = match self.phone_number().await {
            Ok(info) => {
                let mut details = serde_json::Map::new();
                details.insert("phoneNumberId".to_string(), json!(self.phone_number_id));
                details.insert("displayPhoneNumber".to_string(), json!(info.display_phone_number));
                details.insert("verifiedName".to_string(), json!(info.verified_name));
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
        *self.state.write().await = WhatsAppState::default();
        self.lifecycle.finish_shutdown();
        tracing::info!(channel = %self.channel_id, "WhatsApp adapter stopped");
        Ok(())
    }
}

// WhatsApp API types

#[derive(Debug, Deserialize)]
struct PhoneNumberInfo {
    display_phone_number: Option<String>,
    verified_name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SendMessageResponse {
    #[serde(default)]
    messages: Vec<MessageId>,
}

#[derive(Debug, Deserialize)]
struct MessageId {
    id: String,
}

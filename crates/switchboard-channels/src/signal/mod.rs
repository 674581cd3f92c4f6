//! Signal channel adapter using the signal-cli REST bridge.
//!
//! See <https://github.com/bbernhard/signal-cli-rest-api>. The bridge owns
//! the Signal account; this adapter only checks that the configured number
//! is registered there.

mod transform;

pub use transform::SignalTransformer;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{Value, json};
use std::sync::Arc;
use tokio::sync::{RwLock, Semaphore};

use switchboard_core::config::{ChannelSettings, SignalSettings};
use switchboard_core::content::{ContentKind, MessageContent};
use switchboard_core::types::{ChannelType, DeliveryStatus, MessageMetadata};

use crate::http::{self, CallFailure};
use crate::lifecycle::Lifecycle;
use crate::traits::{
    AdapterHealth, AdapterState, ChannelAdapter, ChannelError, WebhookOutcome, features,
};
use crate::transform::MessageTransformer;
use crate::webhook::{WebhookRequest, WebhookSecrets, WebhookValidator};

const SUPPORTED: &[ContentKind] = &[ContentKind::Text];

/// Signal channel adapter.
pub struct SignalAdapter {
    client: Client,
    service_url: String,
    phone_number: String,
    channel_id: String,
    lifecycle: Lifecycle,
    sends: Semaphore,
    validator: Arc<WebhookValidator>,
    secrets: WebhookSecrets,
    state: Arc<RwLock<SignalState>>,
}

#[derive(Debug, Default)]
struct SignalState {
    bridge_version: Option<String>,
    mode: Option<String>,
}

impl SignalAdapter {
    /// Create an adapter for one tenant.
    ///
    /// # Errors
    ///
    /// Returns `ChannelError::Configuration` if the settings are incomplete.
    pub fn new(
        tenant: &str,
        settings: SignalSettings,
        validator: Arc<WebhookValidator>,
    ) -> Result<Self, ChannelError> {
        ChannelSettings::Signal(settings.clone()).validate()?;
        Ok(Self {
            client: http::build_client()?,
            service_url: settings.service_url.trim_end_matches('/').to_string(),
            channel_id: format!("signal:{tenant}"),
            lifecycle: Lifecycle::new(format!("signal:{tenant}")),
            sends: Semaphore::new(settings.max_concurrent_sends),
            validator,
            secrets: WebhookSecrets {
                signing_secret: settings.webhook_secret,
                ..WebhookSecrets::default()
            },
            phone_number: settings.phone_number,
            state: Arc::new(RwLock::new(SignalState::default())),
        })
    }

    async fn call<T: for<'de> Deserialize<'de>>(
        &self,
        method: reqwest::Method,
        endpoint: &str,
        body: Option<&Value>,
    ) -> Result<T, CallFailure> {
        let mut request = self
            .client
            .request(method, format!("{}{endpoint}", self.service_url));
        if let Some(body) = body {
            request = request.json(body);
        }
        let (status, body) = http::execute(request).await?;
        http::decode_body(status, body)
    }

    async fn connect(&self) -> Result<(), ChannelError> {
        let about: SignalAbout = self.call(reqwest::Method::GET, "/v1/about", None).await?;
        let accounts: Vec<String> = self.call(reqwest::Method::GET, "/v1/accounts", None).await?;
        if !accounts.iter().any(|a| a == &self.phone_number) {
            return Err(ChannelError::Configuration(format!(
                "{} is not registered with the Signal bridge",
                self.phone_number
            )));
        }

        let mut state = self.state.write().await;
        state.bridge_version.clone_from(&about.version);
        state.mode.clone_from(&about.mode);
        drop(state);

        tracing::info!(
            channel = %self.channel_id,
            "Signal connected: {} (bridge {})",
            self.phone_number,
            about.version.as_deref().unwrap_or("unknown")
        );
        Ok(())
    }
}

/// `/v2/send` answers with the sent timestamp, as a string or a number.
fn sent_timestamp(body: &Value) -> Option<String> {
    match body.get("timestamp")? {
        Value::String(ts) => Some(ts.clone()),
        Value::Number(ts) => Some(ts.to_string()),
        _ => None,
    }
}

#[async_trait]
impl ChannelAdapter for SignalAdapter {
    fn channel_type(&self) -> ChannelType {
        ChannelType::Signal
    }

    fn channel_id(&self) -> &str {
        &self.channel_id
    }

    fn channel_name(&self) -> &str {
        "Signal"
    }

    fn supported_message_types(&self) -> &'static [ContentKind] {
        SUPPORTED
    }

    fn supports_feature(&self, feature: &str) -> bool {
        matches!(
            feature,
            features::TEXT
                | features::FORMATTING
                | features::REACTIONS
                | features::EDITING
                | features::READ_RECEIPTS
                | features::TYPING
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
        let mut payload = SignalTransformer.format_outgoing(user_id, content, metadata);
        payload["number"] = json!(self.phone_number);

        let _permit = self
            .sends
            .acquire()
            .await
            .map_err(|_| ChannelError::Lifecycle(format!("{} is shutting down", self.channel_id)))?;

        let result = self
            .call::<Value>(reqwest::Method::POST, "/v2/send", Some(&payload))
            .await;
        self.lifecycle.record_send(result.is_ok());
        Ok(match result {
            Ok(body) => match sent_timestamp(&body) {
                Some(ts) => DeliveryStatus::sent(ts),
                None => DeliveryStatus::failed("send response without timestamp")
                    .with_platform_response(body),
            },
            Err(failure) => {
                tracing::warn!(channel = %self.channel_id, error = %failure.error, "Signal send failed");
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
            .admit(ChannelType::Signal, request, &self.secrets)
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
            "Signal webhook processed"
        );
        Ok(outcome)
    }

    fn validate_webhook(&self, request: &WebhookRequest) -> bool {
        self.validator
            .verify(ChannelType::Signal, request, &self.secrets)
            .is_valid
    }

    async fn health_status(&self) -> AdapterHealth {
        let check = match self
            .call::<SignalAbout>(reqwest::Method::GET, "/v1/about", None)
            .await
        {
            Ok(about) => {
                let mut details = serde_json::Map::new();
                details.insert("number".to_string(), json!(self.phone_number));
                details.insert("bridgeVersion".to_string(), json!(about.version));
                details.insert("mode".to_string(), json!(about.mode));
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
        *self.state.write().await = SignalState::default();
        self.lifecycle.finish_shutdown();
        tracing::info!(channel = %self.channel_id, "Signal adapter stopped");
        Ok(())
    }
}

// signal-cli REST types

#[derive(Debug, Deserialize)]
struct SignalAbout {
    version: Option<String>,
    mode: Option<String>,
}

//! Slack channel adapter using the Web API and Events API.

mod transform;

pub use transform::{LIST_ACTION_ID, SlackTransformer};

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{Value, json};
use std::sync::Arc;
use tokio::sync::{RwLock, Semaphore};

use switchboard_core::config::{ChannelSettings, SlackSettings};
use switchboard_core::content::{ContentKind, MessageContent};
use switchboard_core::secrets::ApiKey;
use switchboard_core::types::{ChannelType, DeliveryStatus, MessageMetadata};

use crate::http::{self, CallFailure};
use crate::lifecycle::Lifecycle;
use crate::traits::{
    AdapterHealth, AdapterState, ChannelAdapter, ChannelError, WebhookOutcome, features,
};
use crate::transform::{MessageTransformer, parse_batch};
use crate::webhook::{WebhookFailure, WebhookRequest, WebhookSecrets, WebhookValidator};

const SLACK_API_BASE: &str = "https://slack.com/api";

const SUPPORTED: &[ContentKind] = &[
    ContentKind::Text,
    ContentKind::Media,
    ContentKind::Interactive,
];

/// Slack channel adapter.
pub struct SlackAdapter {
    client: Client,
    token: ApiKey,
    base_url: String,
    channel_id: String,
    lifecycle: Lifecycle,
    sends: Semaphore,
    validator: Arc<WebhookValidator>,
    secrets: WebhookSecrets,
    state: Arc<RwLock<SlackState>>,
}

#[derive(Debug, Default)]
struct SlackState {
    bot_user_id: Option<String>,
    team_id: Option<String>,
    team_name: Option<String>,
}

impl SlackAdapter {
    /// Create an adapter for one tenant.
    ///
    /// # Errors
    ///
    /// Returns `ChannelError::Configuration` if the settings are incomplete.
    pub fn new(
        tenant: &str,
        settings: SlackSettings,
        validator: Arc<WebhookValidator>,
    ) -> Result<Self, ChannelError> {
        ChannelSettings::Slack(settings.clone()).validate()?;
        Ok(Self {
            client: http::build_client()?,
            base_url: settings
                .base_url
                .unwrap_or_else(|| SLACK_API_BASE.to_string())
                .trim_end_matches('/')
                .to_string(),
            channel_id: format!("slack:{tenant}"),
            lifecycle: Lifecycle::new(format!("slack:{tenant}")),
            sends: Semaphore::new(settings.max_concurrent_sends),
            validator,
            secrets: WebhookSecrets {
                signing_secret: Some(settings.signing_secret),
                verification_token: settings.verification_token,
                secret_token: None,
            },
            token: settings.bot_token,
            state: Arc::new(RwLock::new(SlackState::default())),
        })
    }

    /// Call a Slack Web API method.
    async fn call<T: for<'de> Deserialize<'de>>(
        &self,
        method: &str,
        params: &Value,
    ) -> Result<T, CallFailure> {
        let request = self
            .client
            .post(format!("{}/{method}", self.base_url))
            .bearer_auth(self.token.expose())
            .json(params);
        let (status, body) = http::execute(request).await?;

        if body.get("ok").and_then(Value::as_bool) != Some(true) {
            let error = body
                .get("error")
                .and_then(Value::as_str)
                .unwrap_or("unknown_error")
                .to_string();
            if error == "ratelimited" {
                return Err(CallFailure::new(ChannelError::RateLimited, Some(body)));
            }
            return Err(CallFailure::platform(status, &error, body));
        }
        http::decode_body(status, body)
    }

    async fn connect(&self) -> Result<(), ChannelError> {
        let auth: AuthTest = self.call("auth.test", &json!({})).await?;
        let mut state = self.state.write().await;
        state.bot_user_id.clone_from(&auth.user_id);
        state.team_id.clone_from(&auth.team_id);
        state.team_name.clone_from(&auth.team);
        drop(state);

        tracing::info!(
            channel = %self.channel_id,
            "Slack connected to workspace: {}",
            auth.team.as_deref().unwrap_or("unknown")
        );
        Ok(())
    }
}

/// Interactivity payloads arrive form-encoded as `payload=<json>`.
fn decode_webhook_body(request: &WebhookRequest) -> Result<Value, ChannelError> {
    let form = request
        .header("content-type")
        .is_some_and(|ct| ct.starts_with("application/x-www-form-urlencoded"));
    if !form {
        return request.json();
    }
    let body = String::from_utf8_lossy(&request.body);
    let encoded = body
        .split('&')
        .find_map(|pair| pair.strip_prefix("payload="))
        .ok_or_else(|| ChannelError::Structure("form body without payload".to_string()))?;
    let plus_decoded = encoded.replace('+', " ");
    let decoded = urlencoding::decode(&plus_decoded)
        .map_err(|e| ChannelError::Structure(e.to_string()))?;
    Ok(serde_json::from_str(&decoded)?)
}

#[async_trait]
impl ChannelAdapter for SlackAdapter {
    fn channel_type(&self) -> ChannelType {
        ChannelType::Slack
    }

    fn channel_id(&self) -> &str {
        &self.channel_id
    }

    fn channel_name(&self) -> &str {
        "Slack"
    }

    fn supported_message_types(&self) -> &'static [ContentKind] {
        SUPPORTED
    }

    fn supports_feature(&self, feature: &str) -> bool {
        matches!(
            feature,
            features::TEXT
                | features::MEDIA
                | features::INTERACTIVE
                | features::FORMATTING
                | features::THREADS
                | features::REACTIONS
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
        let payload = SlackTransformer.format_outgoing(user_id, content, metadata);

        let _permit = self
            .sends
            .acquire()
            .await
            .map_err(|_| ChannelError::Lifecycle(format!("{} is shutting down", self.channel_id)))?;

        let result = self.call::<PostMessage>("chat.postMessage", &payload).await;
        self.lifecycle.record_send(result.is_ok());
        Ok(match result {
            Ok(posted) => DeliveryStatus::sent(posted.ts),
            Err(failure) => {
                tracing::warn!(channel = %self.channel_id, error = %failure.error, "Slack send failed");
                failure.into_delivery()
            }
        })
    }

    async fn process_incoming_webhook(
        &self,
        request: &WebhookRequest,
    ) -> Result<WebhookOutcome, ChannelError> {
        self.lifecycle.ensure_running()?;
        let verdict = self
            .validator
            .validate(ChannelType::Slack, request, &self.secrets);
        if !verdict.is_valid || verdict.challenge.is_some() {
            return Ok(verdict.into());
        }

        let body = match decode_webhook_body(request) {
            Ok(body) => body,
            Err(e) => {
                tracing::warn!(channel = %self.channel_id, error = %e, "Slack webhook body unreadable");
                return Ok(WebhookOutcome::rejected(WebhookFailure::MalformedBody(
                    e.to_string(),
                )));
            }
        };

        let mut outcome = WebhookOutcome::accepted();
        parse_batch(&SlackTransformer, [&body], &mut outcome);
        tracing::debug!(
            channel = %self.channel_id,
            messages = outcome.messages.len(),
            skipped = outcome.skipped,
            "Slack webhook processed"
        );
        Ok(outcome)
    }

    fn validate_webhook(&self, request: &WebhookRequest) -> bool {
        self.validator
            .verify(ChannelType::Slack, request, &self.secrets)
            .is_valid
    }

    async fn health_status(&self) -> AdapterHealth {
        let check = match self.call::<AuthTest>("auth.test", &json!({})).await {
            Ok(auth) => {
                let mut details = serde_json::Map::new();
                details.insert("team".to_string(), json!(auth.team));
                details.insert("teamId".to_string(), json!(auth.team_id));
                details.insert("botUserId".to_string(), json!(auth.user_id));
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
        *self.state.write().await = SlackState::default();
        self.lifecycle.finish_shutdown();
        tracing::info!(channel = %self.channel_id, "Slack adapter stopped");
        Ok(())
    }
}

// Slack API types

#[derive(Debug, Deserialize)]
struct AuthTest {
    team: Option<String>,
    team_id: Option<String>,
    user_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PostMessage {
    ts: String,
}

//! Typed per-platform channel settings.

use serde::{Deserialize, Serialize};

use super::ConfigError;
use crate::secrets::ApiKey;
use crate::types::ChannelType;
use crate::validation::parse_http_url;

/// Settings for one channel of one tenant.
///
/// Tagged by `type`. Unknown fields are rejected so a typo in a key name
/// fails at load instead of silently disabling a feature.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ChannelSettings {
    /// WhatsApp Business Cloud API.
    WhatsApp(WhatsAppSettings),
    /// Telegram Bot API.
    Telegram(TelegramSettings),
    /// Slack Web API.
    Slack(SlackSettings),
    /// Signal REST bridge.
    Signal(SignalSettings),
    /// Browser chat over WebSocket.
    WebChat(WebChatSettings),
}

impl ChannelSettings {
    /// Channel type these settings configure.
    #[must_use]
    pub const fn channel_type(&self) -> ChannelType {
        match self {
            Self::WhatsApp(_) => ChannelType::WhatsApp,
            Self::Telegram(_) => ChannelType::Telegram,
            Self::Slack(_) => ChannelType::Slack,
            Self::Signal(_) => ChannelType::Signal,
            Self::WebChat(_) => ChannelType::WebChat,
        }
    }

    /// Check required fields and URL overrides.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::MissingField` for blank required fields and
    /// `ConfigError::Validation` for malformed values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let prefix = self.channel_type().as_str();
        match self {
            Self::WhatsApp(s) => {
                require_key(prefix, "accessToken", &s.access_token)?;
                require_str(prefix, "phoneNumberId", &s.phone_number_id)?;
                require_str(prefix, "apiVersion", &s.api_version)?;
                check_base_url(prefix, s.base_url.as_deref())?;
                check_concurrency(prefix, s.max_concurrent_sends)
            }
            Self::Telegram(s) => {
                require_key(prefix, "botToken", &s.bot_token)?;
                check_base_url(prefix, s.base_url.as_deref())?;
                check_concurrency(prefix, s.max_concurrent_sends)
            }
            Self::Slack(s) => {
                require_key(prefix, "botToken", &s.bot_token)?;
                require_key(prefix, "signingSecret", &s.signing_secret)?;
                check_base_url(prefix, s.base_url.as_deref())?;
                check_concurrency(prefix, s.max_concurrent_sends)
            }
            Self::Signal(s) => {
                require_str(prefix, "phoneNumber", &s.phone_number)?;
                require_str(prefix, "serviceUrl", &s.service_url)?;
                check_base_url(prefix, Some(&s.service_url))?;
                check_concurrency(prefix, s.max_concurrent_sends)
            }
            Self::WebChat(s) => {
                require_key(prefix, "jwtSecret", &s.jwt_secret)?;
                if s.jwt_secret.expose().len() < 16 {
                    return Err(ConfigError::Validation(format!(
                        "{prefix}.jwtSecret must be at least 16 bytes"
                    )));
                }
                Ok(())
            }
        }
    }
}

/// WhatsApp Business Cloud API settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct WhatsAppSettings {
    /// Graph API access token.
    pub access_token: ApiKey,
    /// Sending phone number ID.
    pub phone_number_id: String,
    /// Business account ID.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub business_account_id: Option<String>,
    /// App secret used for `x-hub-signature-256`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app_secret: Option<ApiKey>,
    /// Token echoed during webhook subscription.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verify_token: Option<ApiKey>,
    /// Graph API version.
    #[serde(default = "default_whatsapp_api_version")]
    pub api_version: String,
    /// Base URL override.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    /// Concurrent outbound calls.
    #[serde(default = "default_max_concurrent_sends")]
    pub max_concurrent_sends: usize,
}

/// Telegram Bot API settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct TelegramSettings {
    /// Bot token.
    pub bot_token: ApiKey,
    /// Value of `x-telegram-bot-api-secret-token`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_token: Option<ApiKey>,
    /// Public webhook URL, registered on initialize when set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub webhook_url: Option<String>,
    /// Base URL override.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    /// Concurrent outbound calls.
    #[serde(default = "default_max_concurrent_sends")]
    pub max_concurrent_sends: usize,
}

/// Slack Web API settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct SlackSettings {
    /// Bot token (`xoxb-`).
    pub bot_token: ApiKey,
    /// Request signing secret.
    pub signing_secret: ApiKey,
    /// Legacy verification token for `url_verification`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verification_token: Option<ApiKey>,
    /// Base URL override.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    /// Concurrent outbound calls.
    #[serde(default = "default_max_concurrent_sends")]
    pub max_concurrent_sends: usize,
}

/// Signal REST bridge settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct SignalSettings {
    /// Registered account number.
    pub phone_number: String,
    /// Bridge URL.
    #[serde(default = "default_signal_service_url")]
    pub service_url: String,
    /// Shared secret for `x-signal-signature`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub webhook_secret: Option<ApiKey>,
    /// Concurrent outbound calls.
    #[serde(default = "default_max_concurrent_sends")]
    pub max_concurrent_sends: usize,
}

/// Browser chat settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct WebChatSettings {
    /// HS256 key for auth tokens.
    pub jwt_secret: ApiKey,
    /// Expected `iss` claim.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub issuer: Option<String>,
}

fn default_whatsapp_api_version() -> String {
    "v18.0".to_string()
}

fn default_signal_service_url() -> String {
    "http://localhost:8080".to_string()
}

const fn default_max_concurrent_sends() -> usize {
    16
}

fn require_key(prefix: &str, field: &str, value: &ApiKey) -> Result<(), ConfigError> {
    if value.is_blank() {
        return Err(ConfigError::MissingField(format!("{prefix}.{field}")));
    }
    Ok(())
}

fn require_str(prefix: &str, field: &str, value: &str) -> Result<(), ConfigError> {
    if value.trim().is_empty() {
        return Err(ConfigError::MissingField(format!("{prefix}.{field}")));
    }
    Ok(())
}

fn check_base_url(prefix: &str, url: Option<&str>) -> Result<(), ConfigError> {
    if let Some(url) = url {
        parse_http_url(url)
            .map_err(|e| ConfigError::Validation(format!("{prefix}: {e}")))?;
    }
    Ok(())
}

fn check_concurrency(prefix: &str, limit: usize) -> Result<(), ConfigError> {
    if limit == 0 {
        return Err(ConfigError::Validation(format!(
            "{prefix}.maxConcurrentSends must be at least 1"
        )));
    }
    Ok(())
}

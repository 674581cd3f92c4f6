//! Inbound webhook authenticity and policy checks.
//!
//! Every webhook passes the policy layer first (required headers, IP
//! allowlist, per-IP rate limit) and then the platform's own scheme. The
//! first failure wins; there is no partial validation.

mod policy;
pub mod signature;

use std::collections::HashMap;
use std::fmt;
use std::net::IpAddr;
use std::time::Duration;

use reqwest::Method;
use serde_json::Value;

use switchboard_core::config::WebhookConfig;
use switchboard_core::secrets::ApiKey;
use switchboard_core::types::ChannelType;
use switchboard_core::validation::{check_json_depth, limits};

use crate::traits::{ChannelError, WebhookOutcome};

pub use policy::WebhookPolicy;

/// One inbound webhook call, transport-independent.
#[derive(Debug, Clone)]
pub struct WebhookRequest {
    /// HTTP method.
    pub method: Method,
    /// Raw body bytes, exactly as signed.
    pub body: Vec<u8>,
    /// Headers with lower-cased names.
    pub headers: HashMap<String, String>,
    /// Query parameters.
    pub query: HashMap<String, String>,
    /// Client address.
    pub client_ip: Option<IpAddr>,
}

impl WebhookRequest {
    /// POST with a body.
    #[must_use]
    pub fn post(body: impl Into<Vec<u8>>) -> Self {
        Self {
            method: Method::POST,
            body: body.into(),
            headers: HashMap::new(),
            query: HashMap::new(),
            client_ip: None,
        }
    }

    /// GET without a body.
    #[must_use]
    pub fn get() -> Self {
        Self {
            method: Method::GET,
            ..Self::post(Vec::new())
        }
    }

    /// Add a header. The name is lower-cased.
    #[must_use]
    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.insert(name.to_ascii_lowercase(), value.into());
        self
    }

    /// Add a query parameter.
    #[must_use]
    pub fn with_query(mut self, name: &str, value: impl Into<String>) -> Self {
        self.query.insert(name.to_string(), value.into());
        self
    }

    /// Set the client address.
    #[must_use]
    pub const fn with_client_ip(mut self, ip: IpAddr) -> Self {
        self.client_ip = Some(ip);
        self
    }

    /// Header value by (case-insensitive) name.
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    /// Query parameter by name.
    #[must_use]
    pub fn query_param(&self, name: &str) -> Option<&str> {
        self.query.get(name).map(String::as_str)
    }

    /// Parse the body as JSON.
    ///
    /// # Errors
    ///
    /// Returns `ChannelError::Structure` for invalid or overly nested JSON.
    pub fn json(&self) -> Result<Value, ChannelError> {
        let value = serde_json::from_slice(&self.body)?;
        check_json_depth(&value, limits::MAX_JSON_DEPTH)?;
        Ok(value)
    }
}

/// Machine-readable reason a webhook was rejected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WebhookFailure {
    /// A required header is absent.
    MissingHeader(String),
    /// Client address not on the allowlist.
    IpNotAllowed,
    /// Client exceeded its request budget.
    RateLimited,
    /// Signature header absent.
    MissingSignature,
    /// Signature or token does not match.
    InvalidSignature,
    /// Timestamp header absent or unparsable.
    InvalidTimestamp,
    /// Timestamp outside the accepted window.
    StaleTimestamp,
    /// Subscription handshake token mismatch.
    VerificationFailed,
    /// Channel does not accept webhooks.
    UnsupportedChannel,
    /// A secret required to verify the request is not configured.
    MissingSecret,
    /// Body could not be parsed.
    MalformedBody(String),
}

impl WebhookFailure {
    /// Stable code for logs and API responses.
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::MissingHeader(_) => "missing_header",
            Self::IpNotAllowed => "ip_not_allowed",
            Self::RateLimited => "rate_limited",
            Self::MissingSignature => "missing_signature",
            Self::InvalidSignature => "invalid_signature",
            Self::InvalidTimestamp => "invalid_timestamp",
            Self::StaleTimestamp => "stale_timestamp",
            Self::VerificationFailed => "verification_failed",
            Self::UnsupportedChannel => "unsupported_channel",
            Self::MissingSecret => "missing_secret",
            Self::MalformedBody(_) => "malformed_body",
        }
    }
}

impl fmt::Display for WebhookFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingHeader(name) => write!(f, "{}: {name}", self.code()),
            Self::MalformedBody(detail) => write!(f, "{}: {detail}", self.code()),
            _ => f.write_str(self.code()),
        }
    }
}

/// Result of webhook validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WebhookVerdict {
    /// Whether the request is authentic and allowed.
    pub is_valid: bool,
    /// Why it was rejected.
    pub error: Option<WebhookFailure>,
    /// Handshake challenge to echo back.
    pub challenge: Option<String>,
}

impl WebhookVerdict {
    /// Accepted.
    #[must_use]
    pub const fn valid() -> Self {
        Self {
            is_valid: true,
            error: None,
            challenge: None,
        }
    }

    /// Accepted handshake with a challenge to echo.
    #[must_use]
    pub const fn challenge(challenge: String) -> Self {
        Self {
            is_valid: true,
            error: None,
            challenge: Some(challenge),
        }
    }

    /// Rejected.
    #[must_use]
    pub const fn invalid(error: WebhookFailure) -> Self {
        Self {
            is_valid: false,
            error: Some(error),
            challenge: None,
        }
    }
}

impl From<Result<(), WebhookFailure>> for WebhookVerdict {
    fn from(result: Result<(), WebhookFailure>) -> Self {
        match result {
            Ok(()) => Self::valid(),
            Err(e) => Self::invalid(e),
        }
    }
}

/// Secrets a platform scheme may need.
#[derive(Debug, Clone, Default)]
pub struct WebhookSecrets {
    /// HMAC key: WhatsApp app secret, Slack signing secret, Signal webhook secret.
    pub signing_secret: Option<ApiKey>,
    /// Handshake token: WhatsApp verify token, Slack verification token.
    pub verification_token: Option<ApiKey>,
    /// Shared header token: Telegram secret token.
    pub secret_token: Option<ApiKey>,
}

/// Policy plus per-platform verification.
#[derive(Debug)]
pub struct WebhookValidator {
    policy: WebhookPolicy,
    max_timestamp_age: Duration,
}

impl WebhookValidator {
    /// Build from configuration.
    ///
    /// # Errors
    ///
    /// Returns `ChannelError::Configuration` for malformed allowlist entries.
    pub fn new(config: &WebhookConfig) -> Result<Self, ChannelError> {
        Ok(Self {
            policy: WebhookPolicy::new(config)?,
            max_timestamp_age: Duration::from_secs(config.max_timestamp_age_secs),
        })
    }

    /// Validator with no policy restrictions and the default timestamp window.
    #[must_use]
    pub fn permissive() -> Self {
        Self {
            policy: WebhookPolicy::open(),
            max_timestamp_age: Duration::from_secs(300),
        }
    }

    /// Run policy checks, then the platform scheme.
    #[must_use]
    pub fn validate(
        &self,
        channel: ChannelType,
        request: &WebhookRequest,
        secrets: &WebhookSecrets,
    ) -> WebhookVerdict {
        self.validate_at(channel, request, secrets, chrono::Utc::now().timestamp())
    }

    /// [`validate`](Self::validate) against an explicit clock (Unix seconds).
    #[must_use]
    pub fn validate_at(
        &self,
        channel: ChannelType,
        request: &WebhookRequest,
        secrets: &WebhookSecrets,
        now: i64,
    ) -> WebhookVerdict {
        if let Err(failure) = self.policy.check(request) {
            tracing::warn!(channel = %channel, code = failure.code(), ip = ?request.client_ip, "Webhook rejected by policy");
            return WebhookVerdict::invalid(failure);
        }
        let verdict = self.verify_at(channel, request, secrets, now);
        if let Some(failure) = &verdict.error {
            tracing::warn!(channel = %channel, code = failure.code(), "Webhook failed verification");
        }
        verdict
    }

    /// Validate a request and decode its JSON body for processing.
    ///
    /// `Err` carries the outcome to hand back unchanged: a rejection or an
    /// answered handshake.
    pub(crate) fn admit(
        &self,
        channel: ChannelType,
        request: &WebhookRequest,
        secrets: &WebhookSecrets,
    ) -> Result<Value, WebhookOutcome> {
        let verdict = self.validate(channel, request, secrets);
        if !verdict.is_valid || verdict.challenge.is_some() {
            return Err(verdict.into());
        }
        request.json().map_err(|e| {
            tracing::warn!(channel = %channel, error = %e, "Webhook body is not valid JSON");
            WebhookOutcome::rejected(WebhookFailure::MalformedBody(e.to_string()))
        })
    }

    /// Platform scheme only, without consuming rate-limit budget.
    #[must_use]
    pub fn verify(
        &self,
        channel: ChannelType,
        request: &WebhookRequest,
        secrets: &WebhookSecrets,
    ) -> WebhookVerdict {
        self.verify_at(channel, request, secrets, chrono::Utc::now().timestamp())
    }

    fn verify_at(
        &self,
        channel: ChannelType,
        request: &WebhookRequest,
        secrets: &WebhookSecrets,
        now: i64,
    ) -> WebhookVerdict {
        match channel {
            ChannelType::WhatsApp => signature::verify_whatsapp(request, secrets),
            ChannelType::Slack => {
                signature::verify_slack(request, secrets, now, self.max_timestamp_age)
            }
            ChannelType::Telegram => signature::verify_telegram(request, secrets),
            ChannelType::Signal => signature::verify_signal(request, secrets),
            ChannelType::WebChat => WebhookVerdict::invalid(WebhookFailure::UnsupportedChannel),
        }
    }
}

impl Default for WebhookValidator {
    fn default() -> Self {
        Self::permissive()
    }
}

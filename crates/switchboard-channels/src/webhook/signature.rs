//! Per-platform signature and token schemes.

use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::time::Duration;

use super::{WebhookFailure, WebhookRequest, WebhookSecrets, WebhookVerdict};

type HmacSha256 = Hmac<Sha256>;

/// HMAC-SHA256 of `payload`, hex encoded.
#[must_use]
pub fn sign_hex(secret: &[u8], payload: &[u8]) -> String {
    // HMAC accepts keys of any length
    let Ok(mut mac) = HmacSha256::new_from_slice(secret) else {
        return String::new();
    };
    mac.update(payload);
    hex::encode(mac.finalize().into_bytes())
}

/// Constant-time check of a hex HMAC-SHA256 signature.
#[must_use]
pub fn verify_hex(secret: &[u8], payload: &[u8], signature_hex: &str) -> bool {
    let Ok(expected) = hex::decode(signature_hex.trim()) else {
        return false;
    };
    let Ok(mut mac) = HmacSha256::new_from_slice(secret) else {
        return false;
    };
    mac.update(payload);
    mac.verify_slice(&expected).is_ok()
}

/// Constant-time byte comparison.
#[must_use]
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

/// `x-hub-signature-256: sha256=<hex>` over the body, or the GET subscription handshake.
pub(super) fn verify_whatsapp(request: &WebhookRequest, secrets: &WebhookSecrets) -> WebhookVerdict {
    if request.method == reqwest::Method::GET {
        if request.query_param("hub.mode") != Some("subscribe") {
            return WebhookVerdict::invalid(WebhookFailure::VerificationFailed);
        }
        let Some(expected) = &secrets.verification_token else {
            return WebhookVerdict::invalid(WebhookFailure::MissingSecret);
        };
        let supplied = request.query_param("hub.verify_token").unwrap_or_default();
        if !constant_time_eq(supplied.as_bytes(), expected.expose().as_bytes()) {
            return WebhookVerdict::invalid(WebhookFailure::VerificationFailed);
        }
        let challenge = request.query_param("hub.challenge").unwrap_or_default();
        return WebhookVerdict::challenge(challenge.to_string());
    }

    let Some(secret) = &secrets.signing_secret else {
        return WebhookVerdict::invalid(WebhookFailure::MissingSecret);
    };
    let Some(header) = request.header("x-hub-signature-256") else {
        return WebhookVerdict::invalid(WebhookFailure::MissingSignature);
    };
    let Some(signature) = header.strip_prefix("sha256=") else {
        return WebhookVerdict::invalid(WebhookFailure::InvalidSignature);
    };
    if verify_hex(secret.expose().as_bytes(), &request.body, signature) {
        WebhookVerdict::valid()
    } else {
        WebhookVerdict::invalid(WebhookFailure::InvalidSignature)
    }
}

/// `v0=<hex>` over `v0:{timestamp}:{body}` with a bounded timestamp age.
///
/// A `url_verification` body carrying the configured verification token is
/// accepted on the token alone.
pub(super) fn verify_slack(
    request: &WebhookRequest,
    secrets: &WebhookSecrets,
    now: i64,
    max_age: Duration,
) -> WebhookVerdict {
    let handshake = url_verification(request);
    if let (Some((token, challenge)), Some(expected)) = (&handshake, &secrets.verification_token) {
        if constant_time_eq(token.as_bytes(), expected.expose().as_bytes()) {
            return WebhookVerdict::challenge(challenge.clone());
        }
    }

    let Some(secret) = &secrets.signing_secret else {
        return WebhookVerdict::invalid(WebhookFailure::MissingSecret);
    };
    let Some(header) = request.header("x-slack-signature") else {
        return WebhookVerdict::invalid(WebhookFailure::MissingSignature);
    };
    let Some(timestamp) = request
        .header("x-slack-request-timestamp")
        .and_then(|ts| ts.trim().parse::<i64>().ok())
    else {
        return WebhookVerdict::invalid(WebhookFailure::InvalidTimestamp);
    };
    let max_age = i64::try_from(max_age.as_secs()).unwrap_or(i64::MAX);
    if (now - timestamp).abs() > max_age {
        return WebhookVerdict::invalid(WebhookFailure::StaleTimestamp);
    }
    let Some(signature) = header.strip_prefix("v0=") else {
        return WebhookVerdict::invalid(WebhookFailure::InvalidSignature);
    };

    let mut base = format!("v0:{timestamp}:").into_bytes();
    base.extend_from_slice(&request.body);
    if !verify_hex(secret.expose().as_bytes(), &base, signature) {
        return WebhookVerdict::invalid(WebhookFailure::InvalidSignature);
    }

    match handshake {
        Some((_, challenge)) => WebhookVerdict::challenge(challenge),
        None => WebhookVerdict::valid(),
    }
}

fn url_verification(request: &WebhookRequest) -> Option<(String, String)> {
    let body: serde_json::Value = serde_json::from_slice(&request.body).ok()?;
    if body.get("type")?.as_str()? != "url_verification" {
        return None;
    }
    let token = body.get("token").and_then(|t| t.as_str()).unwrap_or_default();
    let challenge = body.get("challenge")?.as_str()?;
    Some((token.to_string(), challenge.to_string()))
}

/// `x-telegram-bot-api-secret-token`, when a secret token is configured.
pub(super) fn verify_telegram(request: &WebhookRequest, secrets: &WebhookSecrets) -> WebhookVerdict {
    let Some(expected) = &secrets.secret_token else {
        return WebhookVerdict::valid();
    };
    let Some(supplied) = request.header("x-telegram-bot-api-secret-token") else {
        return WebhookVerdict::invalid(WebhookFailure::MissingSignature);
    };
    if constant_time_eq(supplied.as_bytes(), expected.expose().as_bytes()) {
        WebhookVerdict::valid()
    } else {
        WebhookVerdict::invalid(WebhookFailure::InvalidSignature)
    }
}

/// `x-signal-signature: <hex>` over the body, when a webhook secret is configured.
pub(super) fn verify_signal(request: &WebhookRequest, secrets: &WebhookSecrets) -> WebhookVerdict {
    let Some(secret) = &secrets.signing_secret else {
        return WebhookVerdict::valid();
    };
    let Some(header) = request.header("x-signal-signature") else {
        return WebhookVerdict::invalid(WebhookFailure::MissingSignature);
    };
    let signature = header.strip_prefix("sha256=").unwrap_or(header);
    if verify_hex(secret.expose().as_bytes(), &request.body, signature) {
        WebhookVerdict::valid()
    } else {
        WebhookVerdict::invalid(WebhookFailure::InvalidSignature)
    }
}

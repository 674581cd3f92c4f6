//! Input validation and sanitization.
//!
//! Everything arriving from a platform or a browser goes through here
//! before it reaches a transformer.

use reqwest::Url;
use std::net::IpAddr;
use thiserror::Error;
use unicode_normalization::UnicodeNormalization;

use crate::content::MediaType;

/// Validation error types.
#[derive(Error, Debug)]
pub enum ValidationError {
    /// Input exceeds maximum allowed length.
    #[error("Input exceeds maximum length ({max} bytes, got {actual})")]
    TooLong {
        /// Maximum allowed length.
        max: usize,
        /// Actual input length.
        actual: usize,
    },

    /// Content violates a structural rule.
    #[error("Invalid content: {0}")]
    InvalidContent(String),

    /// URL could not be parsed or uses a disallowed scheme.
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    /// Address or CIDR block could not be parsed.
    #[error("Invalid IP rule: {0}")]
    InvalidIpRule(String),

    /// Payload nesting exceeds the allowed depth.
    #[error("Payload nesting depth exceeds maximum ({0})")]
    TooDeep(usize),

    /// JSON parsing error.
    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),
}

/// Size limits per input type.
pub mod limits {
    /// Maximum message content length (64KB).
    pub const MAX_MESSAGE_LENGTH: usize = 64 * 1024;

    /// Maximum webhook body size (1MB).
    pub const MAX_WEBHOOK_BODY: usize = 1024 * 1024;

    /// Maximum realtime frame size (64KB).
    pub const MAX_FRAME_SIZE: usize = 64 * 1024;

    /// Maximum config file size (1MB).
    pub const MAX_CONFIG_FILE_SIZE: usize = 1024 * 1024;

    /// Maximum attachment size (50MB).
    pub const MAX_ATTACHMENT_SIZE: usize = 50 * 1024 * 1024;

    /// Maximum JSON nesting depth.
    pub const MAX_JSON_DEPTH: usize = 32;
}

/// Validate and sanitize message text from channels.
///
/// Performs:
/// 1. Length check
/// 2. Strip null bytes and control chars (except newlines/tabs)
/// 3. Unicode normalization (NFC)
///
/// Normalization must not change char counts of already-composed text,
/// since formatting offsets index into the result.
///
/// # Errors
///
/// Returns `ValidationError::TooLong` if input exceeds `max_len`.
pub fn validate_message_content(input: &str, max_len: usize) -> Result<String, ValidationError> {
    if input.len() > max_len {
        return Err(ValidationError::TooLong {
            max: max_len,
            actual: input.len(),
        });
    }

    let sanitized: String = input
        .chars()
        .filter(|c| !c.is_control() || *c == '\n' || *c == '\t' || *c == '\r')
        .collect();

    Ok(sanitized.nfc().collect())
}

/// Whether `value` parses as an absolute http(s) URL.
#[must_use]
pub fn is_valid_url(value: &str) -> bool {
    parse_http_url(value).is_ok()
}

/// Parse an absolute http(s) URL.
///
/// # Errors
///
/// Returns `ValidationError::InvalidUrl` for unparsable input or other schemes.
pub fn parse_http_url(value: &str) -> Result<Url, ValidationError> {
    let url = Url::parse(value).map_err(|e| ValidationError::InvalidUrl(e.to_string()))?;
    match url.scheme() {
        "http" | "https" if url.host_str().is_some() => Ok(url),
        other => Err(ValidationError::InvalidUrl(format!(
            "unsupported scheme or missing host: {other}"
        ))),
    }
}

/// Guess a MIME type from a file name or URL path.
#[must_use]
pub fn mime_from_filename(name: &str) -> Option<String> {
    let path = Url::parse(name)
        .map(|u| u.path().to_string())
        .unwrap_or_else(|_| name.to_string());
    if !path.rsplit('/').next().is_some_and(|f| f.contains('.')) {
        return None;
    }
    mime_guess::from_path(&path)
        .first()
        .map(|m| m.essence_str().to_string())
}

/// Map a MIME type to a media category.
#[must_use]
pub fn media_type_from_mime(mime: &str) -> MediaType {
    let essence = mime.split(';').next().unwrap_or(mime).trim();
    match essence.split('/').next() {
        Some("image") if essence == "image/webp" => MediaType::Sticker,
        Some("image") => MediaType::Image,
        Some("video") => MediaType::Video,
        Some("audio") if essence == "audio/ogg" => MediaType::Voice,
        Some("audio") => MediaType::Audio,
        _ => MediaType::Document,
    }
}

/// Reject JSON nested deeper than `max` levels.
///
/// # Errors
///
/// Returns `ValidationError::TooDeep` when the limit is exceeded.
pub fn check_json_depth(value: &serde_json::Value, max: usize) -> Result<(), ValidationError> {
    fn walk(value: &serde_json::Value, depth: usize, max: usize) -> Result<(), ValidationError> {
        if depth > max {
            return Err(ValidationError::TooDeep(max));
        }
        match value {
            serde_json::Value::Array(arr) => arr.iter().try_for_each(|v| walk(v, depth + 1, max)),
            serde_json::Value::Object(obj) => {
                obj.values().try_for_each(|v| walk(v, depth + 1, max))
            }
            _ => Ok(()),
        }
    }
    walk(value, 0, max)
}

/// An allowlist entry: one address or a CIDR block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IpRule {
    network: IpAddr,
    prefix: u8,
}

impl IpRule {
    /// Whether `addr` falls inside this rule.
    ///
    /// IPv4-mapped IPv6 addresses match IPv4 rules.
    #[must_use]
    pub fn contains(&self, addr: IpAddr) -> bool {
        let addr = match addr {
            IpAddr::V6(v6) => v6.to_ipv4_mapped().map_or(addr, IpAddr::V4),
            IpAddr::V4(_) => addr,
        };
        match (self.network, addr) {
            (IpAddr::V4(net), IpAddr::V4(ip)) => {
                let mask = u32::MAX.checked_shl(32 - u32::from(self.prefix)).unwrap_or(0);
                u32::from(net) & mask == u32::from(ip) & mask
            }
            (IpAddr::V6(net), IpAddr::V6(ip)) => {
                let mask = u128::MAX.checked_shl(128 - u32::from(self.prefix)).unwrap_or(0);
                u128::from(net) & mask == u128::from(ip) & mask
            }
            _ => false,
        }
    }
}

/// Parse `"10.0.0.1"` or `"10.0.0.0/8"` (IPv4 or IPv6).
///
/// # Errors
///
/// Returns `ValidationError::InvalidIpRule` for malformed input or an
/// out-of-range prefix.
pub fn parse_ip_rule(rule: &str) -> Result<IpRule, ValidationError> {
    let invalid = || ValidationError::InvalidIpRule(rule.to_string());
    let (addr, prefix) = match rule.trim().split_once('/') {
        Some((addr, prefix)) => (addr, Some(prefix)),
        None => (rule.trim(), None),
    };
    let network: IpAddr = addr.parse().map_err(|_| invalid())?;
    let max = if network.is_ipv4() { 32 } else { 128 };
    let prefix = match prefix {
        Some(p) => p.parse::<u8>().map_err(|_| invalid())?,
        None => max,
    };
    if prefix > max {
        return Err(invalid());
    }
    Ok(IpRule { network, prefix })
}

//! Transport-level webhook policy: headers, allowlist, rate limit.

use governor::{DefaultKeyedRateLimiter, Quota, RateLimiter};
use std::net::{IpAddr, Ipv4Addr};
use std::num::NonZeroU32;
use std::time::Duration;

use switchboard_core::config::WebhookConfig;
use switchboard_core::validation::{IpRule, parse_ip_rule};

use super::{WebhookFailure, WebhookRequest};
use crate::traits::ChannelError;

/// Tracked client keys before idle entries are pruned.
const PRUNE_THRESHOLD: usize = 10_000;

/// Policy applied before any platform verification.
pub struct WebhookPolicy {
    required_headers: Vec<String>,
    allowlist: Vec<IpRule>,
    limiter: Option<DefaultKeyedRateLimiter<IpAddr>>,
}

impl std::fmt::Debug for WebhookPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebhookPolicy")
            .field("required_headers", &self.required_headers)
            .field("allowlist", &self.allowlist)
            .field("rate_limited", &self.limiter.is_some())
            .finish()
    }
}

impl WebhookPolicy {
    /// Build from configuration.
    ///
    /// The window is enforced as a GCRA quota: `max_requests` burst,
    /// replenished evenly over `window_secs`.
    ///
    /// # Errors
    ///
    /// Returns `ChannelError::Configuration` for malformed allowlist entries.
    pub fn new(config: &WebhookConfig) -> Result<Self, ChannelError> {
        let allowlist = config
            .ip_allowlist
            .iter()
            .map(|rule| parse_ip_rule(rule))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| ChannelError::Configuration(e.to_string()))?;

        let limiter = NonZeroU32::new(config.rate_limit.max_requests).map(|burst| {
            let window = Duration::from_secs(config.rate_limit.window_secs.max(1));
            let quota = Quota::with_period(window / burst.get())
                .map_or_else(|| Quota::per_second(burst), |q| q.allow_burst(burst));
            RateLimiter::keyed(quota)
        });

        Ok(Self {
            required_headers: config
                .required_headers
                .iter()
                .map(|h| h.to_ascii_lowercase())
                .collect(),
            allowlist,
            limiter,
        })
    }

    /// Policy that allows everything.
    #[must_use]
    pub const fn open() -> Self {
        Self {
            required_headers: Vec::new(),
            allowlist: Vec::new(),
            limiter: None,
        }
    }

    /// Check a request. Consumes one unit of the client's budget.
    ///
    /// # Errors
    ///
    /// Returns the first failing rule.
    pub fn check(&self, request: &WebhookRequest) -> Result<(), WebhookFailure> {
        if let Some(missing) = self
            .required_headers
            .iter()
            .find(|h| !request.headers.contains_key(*h))
        {
            return Err(WebhookFailure::MissingHeader(missing.clone()));
        }

        if !self.allowlist.is_empty() {
            let allowed = request
                .client_ip
                .is_some_and(|ip| self.allowlist.iter().any(|rule| rule.contains(ip)));
            if !allowed {
                return Err(WebhookFailure::IpNotAllowed);
            }
        }

        if let Some(limiter) = &self.limiter {
            if limiter.len() > PRUNE_THRESHOLD {
                limiter.retain_recent();
            }
            let key = request
                .client_ip
                .unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED));
            if limiter.check_key(&key).is_err() {
                return Err(WebhookFailure::RateLimited);
            }
        }

        Ok(())
    }
}

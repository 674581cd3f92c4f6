//! Shared plumbing for platform REST calls.

use reqwest::{Client, RequestBuilder, StatusCode};
use serde_json::Value;
use std::time::Duration;

use switchboard_core::types::DeliveryStatus;

use crate::traits::{ChannelError, scrub};

/// Per-request timeout for platform calls.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// A failed platform call, with the response body when one arrived.
#[derive(Debug)]
pub(crate) struct CallFailure {
    pub error: ChannelError,
    pub response: Option<Value>,
}

impl CallFailure {
    pub(crate) fn new(error: ChannelError, response: Option<Value>) -> Self {
        Self { error, response }
    }

    /// Platform-level failure (HTTP 200 with an error flag in the body).
    pub(crate) fn platform(status: StatusCode, message: &str, response: Value) -> Self {
        Self::new(
            ChannelError::Transport {
                status: Some(status.as_u16()),
                message: scrub(message),
            },
            Some(response),
        )
    }

    /// Convert into a failed delivery record.
    pub(crate) fn into_delivery(self) -> DeliveryStatus {
        let status = DeliveryStatus::failed(self.error.to_string());
        match self.response {
            Some(response) => status.with_platform_response(response),
            None => status,
        }
    }
}

impl From<CallFailure> for ChannelError {
    fn from(failure: CallFailure) -> Self {
        failure.error
    }
}

/// HTTP client with the standard timeout.
pub(crate) fn build_client() -> Result<Client, ChannelError> {
    Client::builder()
        .timeout(REQUEST_TIMEOUT)
        .build()
        .map_err(|e| ChannelError::Configuration(format!("HTTP client: {e}")))
}

/// Send a request and read its body as JSON.
///
/// 429 maps to `RateLimited`, other non-success statuses to `Transport`.
/// Bodies that are not JSON come back as a JSON string.
pub(crate) async fn execute(request: RequestBuilder) -> Result<(StatusCode, Value), CallFailure> {
    let response = request
        .send()
        .await
        .map_err(|e| CallFailure::new(ChannelError::network(e), None))?;

    let status = response.status();
    let text = response.text().await.unwrap_or_default();
    let body = serde_json::from_str(&text).unwrap_or(Value::String(text));

    if status == StatusCode::TOO_MANY_REQUESTS {
        return Err(CallFailure::new(ChannelError::RateLimited, Some(body)));
    }
    if !status.is_success() {
        let message = error_message(&body).unwrap_or_else(|| status.to_string());
        return Err(CallFailure::platform(status, &message, body));
    }
    Ok((status, body))
}

/// Best-effort error text from the common platform error shapes.
fn error_message(body: &Value) -> Option<String> {
    let candidates = [
        body.pointer("/error/message"),
        body.get("description"),
        body.get("error"),
        body.get("message"),
    ];
    candidates
        .into_iter()
        .flatten()
        .find_map(|v| v.as_str().map(ToString::to_string))
}

/// Decode a typed value out of a response body.
pub(crate) fn decode_body<T: serde::de::DeserializeOwned>(
    status: StatusCode,
    body: Value,
) -> Result<T, CallFailure> {
    serde_json::from_value(body.clone()).map_err(|e| {
        CallFailure::platform(status, &format!("unexpected response: {e}"), body)
    })
}

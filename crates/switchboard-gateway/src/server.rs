//! Gateway server.

use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    Json, Router,
    body::to_bytes,
    extract::ws::{Message, WebSocket, WebSocketUpgrade, rejection::WebSocketUpgradeRejection},
    extract::{ConnectInfo, Path, Query, Request, State},
    http::{Method, StatusCode, header},
    response::{IntoResponse, Response},
    routing::get,
};
use futures::{SinkExt, StreamExt};
use serde_json::json;
use tokio::task::JoinHandle;
use tower_http::cors::CorsLayer;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

use switchboard_channels::webchat::{ConnectionHandle, ConnectionManager, RealtimeError};
use switchboard_channels::{
    ChannelFactory, PlatformAdapterBuilder, WebhookFailure, WebhookRequest, WebhookValidator,
};
use switchboard_core::config::{Config, GatewayConfig};
use switchboard_core::types::ChannelType;

use crate::GatewayError;
use crate::events::{EventBroadcaster, GatewayEvent};

/// Largest webhook body accepted.
pub const MAX_WEBHOOK_BODY: usize = 1024 * 1024;

/// Gateway server state shared across handlers.
pub struct GatewayState {
    /// Adapter factory.
    pub factory: Arc<ChannelFactory>,
    /// Inbound event broadcaster.
    pub events: EventBroadcaster,
}

/// Gateway server.
pub struct Gateway {
    config: GatewayConfig,
    state: Arc<GatewayState>,
    tasks: Vec<JoinHandle<()>>,
}

impl Gateway {
    /// Create a gateway around an existing factory.
    #[must_use]
    pub fn new(config: GatewayConfig, factory: Arc<ChannelFactory>) -> Self {
        Self {
            config,
            state: Arc::new(GatewayState {
                factory,
                events: EventBroadcaster::new(),
            }),
            tasks: Vec::new(),
        }
    }

    /// Create a gateway and factory from the configuration file.
    ///
    /// # Errors
    ///
    /// Returns error if the webhook policy is invalid.
    pub fn from_config(config: &Config) -> Result<Self, GatewayError> {
        let validator = Arc::new(WebhookValidator::new(&config.webhooks)?);
        let builder = PlatformAdapterBuilder::new(validator, config.realtime.clone());
        let factory = Arc::new(ChannelFactory::new(config.factory.clone(), Arc::new(builder)));
        Ok(Self::new(config.gateway.clone(), factory))
    }

    /// Shared state.
    #[must_use]
    pub fn state(&self) -> &Arc<GatewayState> {
        &self.state
    }

    /// Create every configured adapter, forward browser chat events, and
    /// start the health monitor. Returns the number of adapters that failed.
    pub async fn start_channels(&mut self, config: &Config) -> usize {
        let failures = self.state.factory.create_all(config.channel_settings()).await;

        for tenant in config.tenants.keys() {
            let Some(adapter) = self
                .state
                .factory
                .get_adapter(ChannelType::WebChat, tenant)
                .await
            else {
                continue;
            };
            if let Some(manager) = adapter.realtime_manager() {
                self.tasks
                    .push(self.state.events.forward_realtime(tenant, &manager));
            }
        }
        self.tasks.push(self.state.factory.start_health_monitor());

        let started = self.state.factory.list_configurations().await.len();
        tracing::info!(started, failed = failures.len(), "Channels started");
        failures.len()
    }

    /// Build the router.
    pub fn router(&self) -> Router {
        let mut app = Router::new()
            .route("/health", get(health_handler))
            .route(
                "/webhooks/{channel}/{tenant}",
                get(webhook_handler).post(webhook_handler),
            )
            .route("/ws/{tenant}", get(ws_handler))
            .with_state(Arc::clone(&self.state))
            .layer(TimeoutLayer::new(Duration::from_secs(self.config.timeout_secs)))
            .layer(TraceLayer::new_for_http());
        if self.config.cors {
            app = app.layer(CorsLayer::permissive());
        }
        app
    }

    /// Serve until `shutdown` resolves, then stop every adapter.
    ///
    /// # Errors
    ///
    /// Returns error if the address is invalid or the listener fails.
    pub async fn run(
        self,
        shutdown: impl Future<Output = ()> + Send + 'static,
    ) -> Result<(), GatewayError> {
        let addr: SocketAddr = self
            .config
            .bind_address()
            .parse()
            .map_err(|e| GatewayError::Config(format!("Invalid address: {e}")))?;

        let listener = tokio::net::TcpListener::bind(addr).await?;
        tracing::info!("Gateway listening on http://{}", addr);

        let app = self.router();
        let served = axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(shutdown)
        .await;

        for task in &self.tasks {
            task.abort();
        }
        let failed = self.state.factory.shutdown_all_adapters().await;
        if failed > 0 {
            tracing::warn!(failed, "Some adapters did not shut down cleanly");
        }
        served.map_err(|e| GatewayError::Server(e.to_string()))
    }
}

async fn health_handler(State(state): State<Arc<GatewayState>>) -> Json<serde_json::Value> {
    let adapters = state.factory.list_configurations().await;
    let status = if adapters.iter().all(|record| record.is_active) {
        "ok"
    } else {
        "degraded"
    };
    Json(json!({
        "status": status,
        "adapters": adapters,
        "subscribers": state.events.subscriber_count(),
    }))
}

const fn failure_status(failure: &WebhookFailure) -> StatusCode {
    match failure {
        WebhookFailure::MissingSignature
        | WebhookFailure::InvalidSignature
        | WebhookFailure::InvalidTimestamp
        | WebhookFailure::StaleTimestamp
        | WebhookFailure::VerificationFailed
        | WebhookFailure::MissingSecret => StatusCode::UNAUTHORIZED,
        WebhookFailure::IpNotAllowed => StatusCode::FORBIDDEN,
        WebhookFailure::RateLimited => StatusCode::TOO_MANY_REQUESTS,
        WebhookFailure::MissingHeader(_)
        | WebhookFailure::UnsupportedChannel
        | WebhookFailure::MalformedBody(_) => StatusCode::BAD_REQUEST,
    }
}

fn error_response(status: StatusCode, code: &str, message: impl Into<String>) -> Response {
    (
        status,
        Json(json!({ "error": { "code": code, "message": message.into() } })),
    )
        .into_response()
}

async fn webhook_handler(
    State(state): State<Arc<GatewayState>>,
    Path((channel, tenant)): Path<(String, String)>,
    request: Request,
) -> Response {
    let Ok(channel_type) = channel.parse::<ChannelType>() else {
        return error_response(StatusCode::NOT_FOUND, "unknown_channel", format!("unknown channel {channel}"));
    };
    let Some(adapter) = state.factory.get_adapter(channel_type, &tenant).await else {
        return error_response(
            StatusCode::NOT_FOUND,
            "unknown_adapter",
            format!("no {channel_type} adapter for tenant {tenant}"),
        );
    };

    let webhook = match into_webhook_request(request).await {
        Ok(webhook) => webhook,
        Err(response) => return response,
    };

    let outcome = match adapter.process_incoming_webhook(&webhook).await {
        Ok(outcome) => outcome,
        Err(e) => {
            tracing::warn!(channel = %channel_type, tenant = %tenant, error = %e, "Webhook refused");
            return error_response(StatusCode::SERVICE_UNAVAILABLE, "unavailable", e.to_string());
        }
    };

    if !outcome.is_valid {
        let failure = outcome.error.unwrap_or(WebhookFailure::InvalidSignature);
        tracing::info!(channel = %channel_type, tenant = %tenant, reason = %failure, "Webhook rejected");
        return error_response(failure_status(&failure), failure.code(), failure.to_string());
    }
    if let Some(challenge) = outcome.challenge {
        return (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
            challenge,
        )
            .into_response();
    }

    let summary = json!({
        "received": outcome.messages.len(),
        "receipts": outcome.receipts.len(),
        "skipped": outcome.skipped,
    });
    for message in outcome.messages {
        state.events.broadcast(GatewayEvent::MessageReceived {
            channel: channel_type,
            tenant: tenant.clone(),
            message: Box::new(message),
        });
    }
    for receipt in outcome.receipts {
        state.events.broadcast(GatewayEvent::DeliveryUpdated {
            channel: channel_type,
            tenant: tenant.clone(),
            receipt,
        });
    }
    Json(summary).into_response()
}

async fn into_webhook_request(request: Request) -> Result<WebhookRequest, Response> {
    let (parts, body) = request.into_parts();
    let client_ip = parts
        .extensions
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip());
    let query = Query::<HashMap<String, String>>::try_from_uri(&parts.uri)
        .map(|Query(query)| query)
        .map_err(|e| error_response(StatusCode::BAD_REQUEST, "invalid_query", e.body_text()))?;

    let mut webhook = if parts.method == Method::GET {
        WebhookRequest::get()
    } else {
        let bytes = to_bytes(body, MAX_WEBHOOK_BODY).await.map_err(|_| {
            error_response(StatusCode::PAYLOAD_TOO_LARGE, "payload_too_large", "webhook body too large")
        })?;
        WebhookRequest::post(bytes.to_vec())
    };
    for (name, value) in &parts.headers {
        if let Ok(value) = value.to_str() {
            webhook = webhook.with_header(name.as_str(), value);
        }
    }
    for (name, value) in query {
        webhook = webhook.with_query(&name, value);
    }
    if let Some(ip) = client_ip {
        webhook = webhook.with_client_ip(ip);
    }
    Ok(webhook)
}

async fn ws_handler(
    State(state): State<Arc<GatewayState>>,
    Path(tenant): Path<String>,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    let manager = match state
        .factory
        .get_adapter(ChannelType::WebChat, &tenant)
        .await
        .and_then(|adapter| adapter.realtime_manager())
    {
        Some(manager) => manager,
        None => {
            return error_response(
                StatusCode::NOT_FOUND,
                "unknown_adapter",
                format!("no webchat adapter for tenant {tenant}"),
            );
        }
    };
    let ws = match ws {
        Ok(ws) => ws,
        Err(rejection) => return rejection.into_response(),
    };

    let handle = match manager.open().await {
        Ok(handle) => handle,
        Err(e @ RealtimeError::ConnectionLimit(_)) => {
            return error_response(StatusCode::SERVICE_UNAVAILABLE, "connection_limit", e.to_string());
        }
        Err(e @ RealtimeError::ShutDown) => {
            return error_response(StatusCode::SERVICE_UNAVAILABLE, "shutting_down", e.to_string());
        }
    };
    ws.on_upgrade(move |socket| bridge_socket(socket, manager, handle))
}

/// Pump frames between one socket and the connection manager.
async fn bridge_socket(socket: WebSocket, manager: Arc<ConnectionManager>, handle: ConnectionHandle) {
    let ConnectionHandle { id, mut frames } = handle;
    let (mut sink, mut stream) = socket.split();

    let writer = async {
        while let Some(frame) = frames.recv().await {
            let text = match frame.to_text() {
                Ok(text) => text,
                Err(e) => {
                    tracing::warn!(connection = %id, error = %e, "Failed to encode frame");
                    continue;
                }
            };
            if sink.send(Message::Text(text.into())).await.is_err() {
                return;
            }
        }
        // The manager closed the connection.
        let _ = sink.send(Message::Close(None)).await;
    };

    let reader = async {
        while let Some(message) = stream.next().await {
            match message {
                Ok(Message::Text(text)) => manager.handle_frame(id, text.as_str()).await,
                Ok(Message::Ping(_) | Message::Pong(_)) => manager.touch(id).await,
                Ok(Message::Close(_)) => break,
                Ok(Message::Binary(_)) => {}
                Err(e) => {
                    tracing::debug!(connection = %id, error = %e, "WebSocket receive error");
                    break;
                }
            }
        }
    };

    tokio::select! {
        () = writer => {}
        () = reader => {}
    }
    manager.disconnect(id).await;
    tracing::debug!(connection = %id, "WebSocket connection closed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use pretty_assertions::assert_eq;
    use switchboard_core::config::{
        ChannelSettings, TelegramSettings, WebChatSettings, WhatsAppSettings,
    };
    use switchboard_core::secrets::ApiKey;
    use tower::ServiceExt;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const TOKEN: &str = "123:abc";

    async fn gateway(server: &MockServer) -> Gateway {
        Mock::given(method("POST"))
            .and(path(format!("/bot{TOKEN}/getMe")))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "ok": true,
                "result": { "id": 99, "is_bot": true, "first_name": "Switchboard", "username": "sb_bot" }
            })))
            .mount(server)
            .await;

        let mut config = Config::default();
        config.settings.debug = true;
        let gateway = Gateway::from_config(&config).unwrap();
        let factory = &gateway.state().factory;
        factory
            .create_adapter(
                "acme",
                ChannelSettings::Telegram(TelegramSettings {
                    bot_token: ApiKey::new(TOKEN),
                    secret_token: Some(ApiKey::new("hook-secret")),
                    webhook_url: None,
                    base_url: Some(server.uri()),
                    max_concurrent_sends: 4,
                }),
            )
            .await
            .unwrap();
        factory
            .create_adapter(
                "acme",
                ChannelSettings::WebChat(WebChatSettings {
                    jwt_secret: ApiKey::new("webchat-secret-0123456789"),
                    issuer: None,
                }),
            )
            .await
            .unwrap();
        gateway
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn update() -> String {
        json!({
            "update_id": 1,
            "message": {
                "message_id": 7,
                "date": 1_700_000_000,
                "chat": { "id": 42, "type": "private" },
                "from": { "id": 42, "is_bot": false, "first_name": "Ann" },
                "text": "hello",
            }
        })
        .to_string()
    }

    #[tokio::test]
    async fn test_webhook_is_routed_and_broadcast() {
        let server = MockServer::start().await;
        let gateway = gateway(&server).await;
        let mut events = gateway.state().events.subscribe();

        let request = axum::http::Request::post("/webhooks/telegram/acme")
            .header("content-type", "application/json")
            .header("x-telegram-bot-api-secret-token", "hook-secret")
            .body(Body::from(update()))
            .unwrap();
        let response = gateway.router().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            body_json(response).await,
            json!({ "received": 1, "receipts": 0, "skipped": 0 })
        );

        let GatewayEvent::MessageReceived { channel, tenant, message } = events.recv().await.unwrap().event
        else {
            panic!("expected message event");
        };
        assert_eq!((channel, tenant.as_str()), (ChannelType::Telegram, "acme"));
        assert_eq!(message.user_id, "42");
    }

    #[tokio::test]
    async fn test_webhook_status_mapping() {
        let server = MockServer::start().await;
        let gateway = gateway(&server).await;

        let forged = axum::http::Request::post("/webhooks/telegram/acme")
            .header("x-telegram-bot-api-secret-token", "wrong")
            .body(Body::from(update()))
            .unwrap();
        let response = gateway.router().oneshot(forged).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(body_json(response).await["error"]["code"], "invalid_signature");

        let unknown_tenant = axum::http::Request::post("/webhooks/telegram/globex")
            .body(Body::from(update()))
            .unwrap();
        let response = gateway.router().oneshot(unknown_tenant).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let unknown_channel = axum::http::Request::post("/webhooks/fax/acme")
            .body(Body::empty())
            .unwrap();
        let response = gateway.router().oneshot(unknown_channel).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let webchat = axum::http::Request::post("/webhooks/webchat/acme")
            .body(Body::from("{}"))
            .unwrap();
        let response = gateway.router().oneshot(webchat).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_health_and_ws_lookup() {
        let server = MockServer::start().await;
        let gateway = gateway(&server).await;

        let response = gateway
            .router()
            .oneshot(axum::http::Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let health = body_json(response).await;
        assert_eq!(health["status"], "ok");
        assert_eq!(health["adapters"].as_array().unwrap().len(), 2);
        assert!(health["adapters"][0].get("settings").is_none());

        let response = gateway
            .router()
            .oneshot(axum::http::Request::get("/ws/globex").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        // Known tenant, but not an upgrade request.
        let response = gateway
            .router()
            .oneshot(axum::http::Request::get("/ws/acme").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_ne!(response.status(), StatusCode::NOT_FOUND);
        assert!(response.status().is_client_error());
    }

    #[tokio::test]
    async fn test_subscription_challenge_is_echoed() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v18.0/PNID"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "display_phone_number": "+1 555 000 0000",
                "verified_name": "Acme Support",
                "id": "PNID",
            })))
            .mount(&server)
            .await;
        let gateway = gateway(&server).await;
        gateway
            .state()
            .factory
            .create_adapter(
                "acme",
                ChannelSettings::WhatsApp(WhatsAppSettings {
                    access_token: ApiKey::new("EAAG-token"),
                    phone_number_id: "PNID".into(),
                    business_account_id: None,
                    app_secret: None,
                    verify_token: Some(ApiKey::new("verify me")),
                    api_version: "v18.0".into(),
                    base_url: Some(server.uri()),
                    max_concurrent_sends: 4,
                }),
            )
            .await
            .unwrap();

        let uri = "/webhooks/whatsapp/acme?hub.mode=subscribe&hub.verify_token=verify%20me&hub.challenge=8812";
        let response = gateway
            .router()
            .oneshot(axum::http::Request::get(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&bytes[..], b"8812");
    }
}

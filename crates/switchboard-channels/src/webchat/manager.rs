//! Connection, session, and presence state for browser clients.
//!
//! The manager is transport-agnostic: a transport calls [`ConnectionManager::open`]
//! for each accepted socket, forwards text frames to
//! [`ConnectionManager::handle_frame`], writes out whatever arrives on the
//! returned [`ConnectionHandle::frames`] receiver, and calls
//! [`ConnectionManager::disconnect`] when the socket goes away. When the
//! manager closes a connection it drops the sender, so the receiver yields
//! `None` and the transport should close the socket.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use thiserror::Error;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{RwLock, broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use uuid::Uuid;

use switchboard_core::config::RealtimeConfig;
use switchboard_core::content::{MediaContent, MediaType, MessageContent};
use switchboard_core::types::{DeliveryStatus, MessageMetadata, TransformedMessage};
use switchboard_core::validation::{
    is_valid_url, limits, media_type_from_mime, mime_from_filename,
};

use super::WebChatTransformer;
use super::auth::TokenVerifier;
use super::frames::{AuthData, ClientFrame, FileUploadData, MessageFrame, ServerFrame};
use crate::transform::MessageTransformer;

/// Connection identifier.
pub type ConnectionId = Uuid;

const EVENT_CAPACITY: usize = 1024;

/// Connection admission errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RealtimeError {
    /// Global connection cap reached.
    #[error("connection limit of {0} reached")]
    ConnectionLimit(usize),

    /// Manager was shut down.
    #[error("connection manager is shut down")]
    ShutDown,
}

/// Something that happened on the realtime channel.
#[derive(Debug, Clone, PartialEq)]
pub enum RealtimeEvent {
    /// Transport accepted, not yet authenticated.
    Connected {
        /// Connection.
        connection_id: ConnectionId,
    },
    /// Auth handshake completed.
    Authenticated {
        /// Connection.
        connection_id: ConnectionId,
        /// User.
        user_id: String,
        /// Session created or resumed.
        session_id: String,
    },
    /// A user sent a message or an upload.
    MessageReceived(Box<TransformedMessage>),
    /// Typing indicator.
    Typing {
        /// User.
        user_id: String,
        /// Started or stopped.
        is_typing: bool,
    },
    /// A user read a message.
    ReadReceipt {
        /// User.
        user_id: String,
        /// Message read.
        message_id: String,
    },
    /// Connection closed.
    Disconnected {
        /// Connection.
        connection_id: ConnectionId,
        /// User, when the connection had authenticated.
        user_id: Option<String>,
        /// Why.
        reason: String,
    },
    /// Session expired after inactivity.
    SessionExpired {
        /// Session.
        session_id: String,
        /// Owner.
        user_id: String,
    },
}

/// Transport side of one connection.
#[derive(Debug)]
pub struct ConnectionHandle {
    /// Connection ID to pass back into the manager.
    pub id: ConnectionId,
    /// Frames to write to the client. `None` means the manager closed the connection.
    pub frames: mpsc::Receiver<ServerFrame>,
}

/// Direction of a history entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// From the user.
    Inbound,
    /// To the user.
    Outbound,
}

/// One message in a user's history ring.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryEntry {
    /// Message ID.
    pub message_id: String,
    /// Direction.
    pub direction: Direction,
    /// Body.
    pub content: MessageContent,
    /// When it was recorded.
    pub timestamp: DateTime<Utc>,
}

/// Point-in-time counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RealtimeStats {
    /// Open connections.
    pub connections: usize,
    /// Connections that completed auth.
    pub authenticated: usize,
    /// Users with at least one connection.
    pub online_users: usize,
    /// Live sessions.
    pub sessions: usize,
    /// Messages waiting for offline users.
    pub queued: usize,
}

struct Connection {
    user_id: Option<String>,
    session_id: Option<String>,
    last_activity: Instant,
    sender: mpsc::Sender<ServerFrame>,
}

struct Session {
    user_id: String,
    last_activity: Instant,
}

struct User {
    display_name: Option<String>,
    online: bool,
    last_seen: DateTime<Utc>,
    connections: HashSet<ConnectionId>,
}

/// An authenticated caller.
struct Caller {
    user_id: String,
    session_id: String,
}

#[derive(Default)]
struct Registry {
    connections: HashMap<ConnectionId, Connection>,
    sessions: HashMap<String, Session>,
    users: HashMap<String, User>,
    queues: HashMap<String, VecDeque<MessageFrame>>,
    history: HashMap<String, VecDeque<HistoryEntry>>,
    doomed: Vec<(ConnectionId, &'static str)>,
    closed: bool,
}

impl Registry {
    /// Queue a frame on a connection. A full or closed buffer dooms the connection.
    fn push(&mut self, id: ConnectionId, frame: ServerFrame) -> bool {
        let Some(connection) = self.connections.get(&id) else {
            return false;
        };
        match connection.sender.try_send(frame) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                tracing::warn!(connection = %id, "Closing slow consumer");
                self.doomed.push((id, "slow consumer"));
                false
            }
            Err(TrySendError::Closed(_)) => {
                self.doomed.push((id, "transport closed"));
                false
            }
        }
    }

    /// Remove doomed connections, including any doomed while announcing presence.
    fn reap(&mut self) -> Vec<RealtimeEvent> {
        let mut events = Vec::new();
        while let Some((id, reason)) = self.doomed.pop() {
            if let Some(event) = self.remove_connection(id, reason) {
                events.push(event);
            }
        }
        events
    }

    fn remove_connection(&mut self, id: ConnectionId, reason: &str) -> Option<RealtimeEvent> {
        let connection = self.connections.remove(&id)?;
        if let Some(user_id) = &connection.user_id {
            let went_offline = self.users.get_mut(user_id).and_then(|user| {
                user.connections.remove(&id);
                if user.connections.is_empty() {
                    user.online = false;
                    user.last_seen = Utc::now();
                    Some(user.last_seen)
                } else {
                    None
                }
            });
            if let Some(last_seen) = went_offline {
                self.broadcast_presence(user_id, false, last_seen);
            }
        }
        tracing::debug!(connection = %id, reason, "Realtime connection closed");
        Some(RealtimeEvent::Disconnected {
            connection_id: id,
            user_id: connection.user_id,
            reason: reason.to_string(),
        })
    }

    fn broadcast_presence(&mut self, user_id: &str, online: bool, last_seen: DateTime<Utc>) {
        let targets: Vec<ConnectionId> = self
            .connections
            .iter()
            .filter(|(_, c)| c.user_id.as_deref().is_some_and(|u| u != user_id))
            .map(|(id, _)| *id)
            .collect();
        for target in targets {
            self.push(
                target,
                ServerFrame::Presence {
                    user_id: user_id.to_string(),
                    online,
                    last_seen,
                },
            );
        }
    }

    /// Resume the requested session, else the user's latest, else create one.
    fn resume_session(&mut self, user_id: &str, requested: Option<&str>, now: Instant) -> (String, bool) {
        let requested = requested
            .filter(|id| self.sessions.get(*id).is_some_and(|s| s.user_id == user_id))
            .map(ToString::to_string);
        let latest = || {
            self.sessions
                .iter()
                .filter(|(_, s)| s.user_id == user_id)
                .max_by_key(|(_, s)| s.last_activity)
                .map(|(id, _)| id.clone())
        };
        if let Some(id) = requested.or_else(latest) {
            if let Some(session) = self.sessions.get_mut(&id) {
                session.last_activity = now;
            }
            return (id, true);
        }

        let id = Uuid::new_v4().to_string();
        self.sessions.insert(
            id.clone(),
            Session {
                user_id: user_id.to_string(),
                last_activity: now,
            },
        );
        (id, false)
    }

    fn record_history(&mut self, user_id: &str, entry: HistoryEntry, limit: usize) {
        let ring = self.history.entry(user_id.to_string()).or_default();
        ring.push_back(entry);
        while ring.len() > limit {
            ring.pop_front();
        }
    }

    fn caller(&self, id: ConnectionId) -> Option<Option<Caller>> {
        let connection = self.connections.get(&id)?;
        Some(match (&connection.user_id, &connection.session_id) {
            (Some(user_id), Some(session_id)) => Some(Caller {
                user_id: user_id.clone(),
                session_id: session_id.clone(),
            }),
            _ => None,
        })
    }
}

/// Realtime connection manager for one tenant.
pub struct ConnectionManager {
    config: RealtimeConfig,
    verifier: Arc<dyn TokenVerifier>,
    registry: RwLock<Registry>,
    events: broadcast::Sender<RealtimeEvent>,
    tasks: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl ConnectionManager {
    /// Create a manager. Call [`start`](Self::start) to run its background loops.
    #[must_use]
    pub fn new(config: RealtimeConfig, verifier: Arc<dyn TokenVerifier>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            config,
            verifier,
            registry: RwLock::new(Registry::default()),
            events,
            tasks: std::sync::Mutex::new(Vec::new()),
        }
    }

    /// Subscribe to realtime events.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<RealtimeEvent> {
        self.events.subscribe()
    }

    fn emit(&self, events: impl IntoIterator<Item = RealtimeEvent>) {
        for event in events {
            // No subscribers is fine.
            let _ = self.events.send(event);
        }
    }

    /// Spawn the keepalive and session sweep loops.
    pub fn start(self: &Arc<Self>) {
        let keepalive = Duration::from_secs(self.config.keepalive_interval_secs.max(1));
        let sweep = Duration::from_secs(self.config.session_sweep_interval_secs.max(1));

        let handles = vec![
            spawn_loop(Arc::downgrade(self), keepalive, |manager| async move {
                manager.keepalive_tick().await;
            }),
            spawn_loop(Arc::downgrade(self), sweep, |manager| async move {
                manager.sweep_sessions().await;
            }),
        ];
        if let Ok(mut tasks) = self.tasks.lock() {
            tasks.extend(handles);
        }
    }

    /// Accept a new transport connection.
    ///
    /// # Errors
    ///
    /// Returns `RealtimeError::ConnectionLimit` when the cap is reached and
    /// `RealtimeError::ShutDown` after shutdown.
    pub async fn open(self: &Arc<Self>) -> Result<ConnectionHandle, RealtimeError> {
        let (sender, frames) = mpsc::channel(self.config.outbound_buffer.max(1));
        let id = Uuid::new_v4();
        {
            let mut registry = self.registry.write().await;
            if registry.closed {
                return Err(RealtimeError::ShutDown);
            }
            if registry.connections.len() >= self.config.max_connections {
                tracing::warn!(
                    limit = self.config.max_connections,
                    "Rejecting realtime connection"
                );
                return Err(RealtimeError::ConnectionLimit(self.config.max_connections));
            }
            registry.connections.insert(
                id,
                Connection {
                    user_id: None,
                    session_id: None,
                    last_activity: Instant::now(),
                    sender,
                },
            );
            registry.push(
                id,
                ServerFrame::AuthRequired {
                    timeout_secs: self.config.auth_timeout_secs,
                },
            );
        }

        let manager = Arc::downgrade(self);
        let timeout = Duration::from_secs(self.config.auth_timeout_secs);
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(manager) = manager.upgrade() {
                manager.expire_unauthenticated(id).await;
            }
        });

        self.emit([RealtimeEvent::Connected { connection_id: id }]);
        Ok(ConnectionHandle { id, frames })
    }

    async fn expire_unauthenticated(&self, id: ConnectionId) {
        let mut registry = self.registry.write().await;
        let pending = registry
            .connections
            .get(&id)
            .is_some_and(|c| c.user_id.is_none());
        if !pending {
            return;
        }
        registry.push(id, ServerFrame::error("auth_timeout", "authentication timed out"));
        registry.doomed.push((id, "authentication timeout"));
        let events = registry.reap();
        drop(registry);
        self.emit(events);
    }

    /// The transport closed.
    pub async fn disconnect(&self, id: ConnectionId) {
        let mut registry = self.registry.write().await;
        registry.doomed.push((id, "closed by client"));
        let events = registry.reap();
        drop(registry);
        self.emit(events);
    }

    async fn reply(&self, id: ConnectionId, frame: ServerFrame) {
        let mut registry = self.registry.write().await;
        registry.push(id, frame);
        let events = registry.reap();
        drop(registry);
        self.emit(events);
    }

    /// Handle one text frame from a client. Errors are answered with an
    /// `error` frame, never returned.
    pub async fn handle_frame(&self, id: ConnectionId, text: &str) {
        if text.len() > limits::MAX_FRAME_SIZE {
            self.reply(id, ServerFrame::error("frame_too_large", "frame exceeds size limit"))
                .await;
            return;
        }
        let frame = match ClientFrame::parse(text) {
            Ok(frame) => frame,
            Err(e) => {
                self.reply(id, ServerFrame::error("invalid_frame", e.to_string())).await;
                return;
            }
        };

        let Some(caller) = self.refresh_activity(id).await else {
            return;
        };

        match (frame, caller) {
            (ClientFrame::Ping, _) => self.reply(id, ServerFrame::Pong).await,
            (ClientFrame::Pong, _) => {}
            (ClientFrame::Auth(data), None) => self.authenticate(id, data).await,
            (ClientFrame::Auth(_), Some(_)) => {
                self.reply(id, ServerFrame::error("already_authenticated", "connection is already authenticated"))
                    .await;
            }
            (_, None) => {
                self.reply(id, ServerFrame::error("unauthenticated", "authenticate first"))
                    .await;
            }
            (ClientFrame::Message(data), Some(caller)) => {
                self.accept_inbound(
                    id,
                    &caller,
                    data.content,
                    data.client_message_id,
                    data.reply_to,
                    data.thread_id,
                )
                .await;
            }
            (ClientFrame::FileUpload(data), Some(caller)) => {
                self.accept_upload(id, &caller, data).await;
            }
            (ClientFrame::Typing(data), Some(caller)) => {
                self.emit([RealtimeEvent::Typing {
                    user_id: caller.user_id,
                    is_typing: data.is_typing,
                }]);
            }
            (ClientFrame::ReadReceipt(data), Some(caller)) => {
                self.emit([RealtimeEvent::ReadReceipt {
                    user_id: caller.user_id,
                    message_id: data.message_id,
                }]);
            }
        }
    }

    /// Record transport-level liveness, such as a WebSocket pong.
    pub async fn touch(&self, id: ConnectionId) {
        self.refresh_activity(id).await;
    }

    /// Refresh connection and session activity. `None` if the connection is
    /// gone, otherwise the caller when authenticated.
    async fn refresh_activity(&self, id: ConnectionId) -> Option<Option<Caller>> {
        let mut guard = self.registry.write().await;
        let registry = &mut *guard;
        let now = Instant::now();
        let connection = registry.connections.get_mut(&id)?;
        connection.last_activity = now;
        if let Some(session) = connection
            .session_id
            .as_ref()
            .and_then(|s| registry.sessions.get_mut(s))
        {
            session.last_activity = now;
        }
        registry.caller(id)
    }

    async fn authenticate(&self, id: ConnectionId, data: AuthData) {
        let identity = match self.verifier.verify(&data.token).await {
            Ok(identity) => identity,
            Err(e) => {
                tracing::info!(connection = %id, error = %e, "Realtime authentication failed");
                let mut registry = self.registry.write().await;
                registry.push(id, ServerFrame::AuthError { error: e.to_string() });
                registry.doomed.push((id, "authentication failed"));
                let events = registry.reap();
                drop(registry);
                self.emit(events);
                return;
            }
        };

        let mut registry = self.registry.write().await;
        let unauthenticated = registry
            .connections
            .get(&id)
            .is_some_and(|c| c.user_id.is_none());
        if !unauthenticated {
            return;
        }

        let now = Instant::now();
        let user_id = identity.user_id;
        let (session_id, resumed) =
            registry.resume_session(&user_id, data.session_id.as_deref(), now);
        if let Some(connection) = registry.connections.get_mut(&id) {
            connection.user_id = Some(user_id.clone());
            connection.session_id = Some(session_id.clone());
        }

        let user = registry.users.entry(user_id.clone()).or_insert_with(|| User {
            display_name: None,
            online: false,
            last_seen: Utc::now(),
            connections: HashSet::new(),
        });
        let came_online = !user.online;
        user.online = true;
        user.last_seen = Utc::now();
        user.connections.insert(id);
        if identity.display_name.is_some() {
            user.display_name = identity.display_name;
        }
        let last_seen = user.last_seen;

        let mut pending = registry.queues.remove(&user_id).unwrap_or_default();
        let delivered = registry.push(
            id,
            ServerFrame::AuthSuccess {
                user_id: user_id.clone(),
                session_id: session_id.clone(),
                resumed,
                queued: pending.len(),
            },
        );
        if delivered {
            while let Some(frame) = pending.pop_front() {
                if !registry.push(id, ServerFrame::Message(frame.clone())) {
                    pending.push_front(frame);
                    break;
                }
            }
        }
        if !pending.is_empty() {
            registry.queues.insert(user_id.clone(), pending);
        }
        if came_online {
            registry.broadcast_presence(&user_id, true, last_seen);
        }
        let mut events = vec![RealtimeEvent::Authenticated {
            connection_id: id,
            user_id: user_id.clone(),
            session_id: session_id.clone(),
        }];
        events.extend(registry.reap());
        drop(registry);

        tracing::info!(connection = %id, user = %user_id, session = %session_id, resumed, "Realtime user authenticated");
        self.emit(events);
    }

    async fn accept_upload(&self, id: ConnectionId, caller: &Caller, data: FileUploadData) {
        if data.size > self.config.max_upload_bytes {
            self.reply(
                id,
                ServerFrame::error(
                    "upload_too_large",
                    format!("upload exceeds {} bytes", self.config.max_upload_bytes),
                ),
            )
            .await;
            return;
        }
        if !is_valid_url(&data.url) {
            self.reply(id, ServerFrame::error("invalid_upload", "upload url must be http(s)"))
                .await;
            return;
        }

        let mime_type = data.mime_type.or_else(|| mime_from_filename(&data.filename));
        let media_type = mime_type
            .as_deref()
            .map_or(MediaType::Document, media_type_from_mime);
        let mut media = MediaContent::new(media_type, data.url);
        media.filename = Some(data.filename);
        media.mime_type = mime_type;
        media.size = Some(data.size);
        media.caption = data.caption;

        self.accept_inbound(
            id,
            caller,
            MessageContent::Media(media),
            data.client_message_id,
            None,
            None,
        )
        .await;
    }

    async fn accept_inbound(
        &self,
        id: ConnectionId,
        caller: &Caller,
        content: MessageContent,
        client_message_id: Option<String>,
        reply_to: Option<String>,
        thread_id: Option<String>,
    ) {
        let message_id = Uuid::new_v4().to_string();
        let raw = json!({
            "userId": caller.user_id,
            "messageId": message_id,
            "sessionId": caller.session_id,
            "content": content,
            "replyTo": reply_to,
            "threadId": thread_id,
        });
        let message = match WebChatTransformer.parse_incoming(&raw) {
            Ok(message) => message,
            Err(e) => {
                self.reply(id, ServerFrame::error("invalid_message", e.to_string())).await;
                return;
            }
        };

        let mut registry = self.registry.write().await;
        registry.record_history(
            &caller.user_id,
            HistoryEntry {
                message_id: message_id.clone(),
                direction: Direction::Inbound,
                content: message.content.clone(),
                timestamp: message.timestamp,
            },
            self.config.history_limit,
        );
        registry.push(
            id,
            ServerFrame::MessageAck {
                client_message_id,
                message_id,
                status: "sent".to_string(),
            },
        );
        let mut events = vec![RealtimeEvent::MessageReceived(Box::new(message))];
        events.extend(registry.reap());
        drop(registry);
        self.emit(events);
    }

    /// Deliver a message to every live connection of a user, or queue it
    /// when the user has none.
    pub async fn deliver(
        &self,
        user_id: &str,
        content: MessageContent,
        metadata: Option<MessageMetadata>,
    ) -> DeliveryStatus {
        let frame = MessageFrame {
            message_id: Uuid::new_v4().to_string(),
            content,
            metadata,
            sent_at: Utc::now(),
        };
        let message_id = frame.message_id.clone();

        let mut registry = self.registry.write().await;
        registry.record_history(
            user_id,
            HistoryEntry {
                message_id: message_id.clone(),
                direction: Direction::Outbound,
                content: frame.content.clone(),
                timestamp: frame.sent_at,
            },
            self.config.history_limit,
        );

        let targets: Vec<ConnectionId> = registry
            .users
            .get(user_id)
            .map(|u| u.connections.iter().copied().collect())
            .unwrap_or_default();
        let mut delivered = false;
        for target in targets {
            delivered |= registry.push(target, ServerFrame::Message(frame.clone()));
        }

        let status = if delivered {
            DeliveryStatus::sent(message_id)
        } else {
            let limit = self.config.offline_queue_limit.max(1);
            let queue = registry.queues.entry(user_id.to_string()).or_default();
            while queue.len() >= limit {
                if let Some(dropped) = queue.pop_front() {
                    tracing::warn!(user = %user_id, message = %dropped.message_id, "Offline queue full, dropping oldest message");
                }
            }
            queue.push_back(frame);
            DeliveryStatus::queued(message_id)
        };
        let events = registry.reap();
        drop(registry);
        self.emit(events);
        status
    }

    /// Ping idle connections and close inactive ones.
    pub async fn keepalive_tick(&self) {
        let now = Instant::now();
        let ping_after = Duration::from_secs(self.config.keepalive_interval_secs);
        let close_after = Duration::from_secs(self.config.inactivity_timeout_secs);

        let mut guard = self.registry.write().await;
        let registry = &mut *guard;
        let mut idle = Vec::new();
        for (id, connection) in &registry.connections {
            let quiet = now.saturating_duration_since(connection.last_activity);
            if quiet > close_after {
                registry.doomed.push((*id, "inactive"));
            } else if quiet >= ping_after {
                idle.push(*id);
            }
        }
        for id in idle {
            registry.push(id, ServerFrame::Ping);
        }
        let events = registry.reap();
        drop(guard);
        if !events.is_empty() {
            tracing::debug!(closed = events.len(), "Keepalive closed inactive connections");
        }
        self.emit(events);
    }

    /// Expire sessions idle past the session timeout.
    pub async fn sweep_sessions(&self) {
        let now = Instant::now();
        let timeout = Duration::from_secs(self.config.session_timeout_secs);

        let mut registry = self.registry.write().await;
        let expired: Vec<String> = registry
            .sessions
            .iter()
            .filter(|(_, s)| now.saturating_duration_since(s.last_activity) > timeout)
            .map(|(id, _)| id.clone())
            .collect();
        let events: Vec<RealtimeEvent> = expired
            .into_iter()
            .filter_map(|id| {
                let session = registry.sessions.remove(&id)?;
                Some(RealtimeEvent::SessionExpired {
                    session_id: id,
                    user_id: session.user_id,
                })
            })
            .collect();

        // Forget users with neither a session nor a connection. Queued
        // messages stay until the user returns.
        let Registry {
            sessions,
            users,
            history,
            ..
        } = &mut *registry;
        let active: HashSet<&str> = sessions.values().map(|s| s.user_id.as_str()).collect();
        users.retain(|id, user| !user.connections.is_empty() || active.contains(id.as_str()));
        history.retain(|id, _| users.contains_key(id) || active.contains(id.as_str()));
        drop(registry);
        if !events.is_empty() {
            tracing::debug!(expired = events.len(), "Expired idle realtime sessions");
        }
        self.emit(events);
    }

    /// Stop background loops and close every connection.
    pub async fn shutdown(&self) {
        if let Ok(mut tasks) = self.tasks.lock() {
            for task in tasks.drain(..) {
                task.abort();
            }
        }
        let mut registry = self.registry.write().await;
        registry.closed = true;
        let ids: Vec<ConnectionId> = registry.connections.keys().copied().collect();
        for id in ids {
            registry.push(id, ServerFrame::error("shutting_down", "server is shutting down"));
            registry.doomed.push((id, "shutdown"));
        }
        let events = registry.reap();
        drop(registry);
        self.emit(events);
    }

    /// Current counters.
    pub async fn stats(&self) -> RealtimeStats {
        let registry = self.registry.read().await;
        RealtimeStats {
            connections: registry.connections.len(),
            authenticated: registry
                .connections
                .values()
                .filter(|c| c.user_id.is_some())
                .count(),
            online_users: registry.users.values().filter(|u| u.online).count(),
            sessions: registry.sessions.len(),
            queued: registry.queues.values().map(VecDeque::len).sum(),
        }
    }

    /// Messages waiting for a user.
    pub async fn queued_for(&self, user_id: &str) -> usize {
        self.registry
            .read()
            .await
            .queues
            .get(user_id)
            .map_or(0, VecDeque::len)
    }

    /// A user's history, oldest first.
    pub async fn history(&self, user_id: &str) -> Vec<HistoryEntry> {
        self.registry
            .read()
            .await
            .history
            .get(user_id)
            .map(|ring| ring.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Whether a user has a live connection.
    pub async fn is_online(&self, user_id: &str) -> bool {
        self.registry
            .read()
            .await
            .users
            .get(user_id)
            .is_some_and(|u| u.online)
    }

    /// A user's display name from their last token.
    pub async fn display_name(&self, user_id: &str) -> Option<String> {
        self.registry
            .read()
            .await
            .users
            .get(user_id)
            .and_then(|u| u.display_name.clone())
    }
}

fn spawn_loop<F, Fut>(manager: Weak<ConnectionManager>, period: Duration, tick: F) -> JoinHandle<()>
where
    F: Fn(Arc<ConnectionManager>) -> Fut + Send + 'static,
    Fut: std::future::Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        let mut interval = tokio::time::interval_at(Instant::now() + period, period);
        loop {
            interval.tick().await;
            let Some(manager) = manager.upgrade() else {
                break;
            };
            tick(manager).await;
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::webchat::auth::JwtTokenVerifier;
    use crate::webchat::auth::tests::{SECRET, token};
    use pretty_assertions::assert_eq;
    use switchboard_core::content::create_text_content;
    use switchboard_core::secrets::ApiKey;
    use switchboard_core::types::DeliveryState;

    fn manager(config: RealtimeConfig) -> Arc<ConnectionManager> {
        let verifier = JwtTokenVerifier::new(&ApiKey::new(SECRET), None, "acme");
        Arc::new(ConnectionManager::new(config, Arc::new(verifier)))
    }

    fn auth_frame(user: &str) -> String {
        json!({ "type": "auth", "data": { "token": token(user, Some("acme"), 600) } }).to_string()
    }

    fn text(body: &str) -> MessageContent {
        create_text_content(body, vec![]).unwrap()
    }

    async fn authed(manager: &Arc<ConnectionManager>, user: &str) -> ConnectionHandle {
        let mut handle = manager.open().await.unwrap();
        assert!(matches!(handle.frames.recv().await, Some(ServerFrame::AuthRequired { .. })));
        manager.handle_frame(handle.id, &auth_frame(user)).await;
        assert!(matches!(handle.frames.recv().await, Some(ServerFrame::AuthSuccess { .. })));
        handle
    }

    #[tokio::test]
    async fn test_offline_queue_flushes_in_order_on_auth() {
        let manager = manager(RealtimeConfig::default());
        for body in ["one", "two", "three"] {
            let status = manager.deliver("u1", text(body), None).await;
            assert_eq!(status.status, DeliveryState::Queued);
        }
        assert_eq!(manager.queued_for("u1").await, 3);

        let mut handle = manager.open().await.unwrap();
        assert!(matches!(handle.frames.recv().await, Some(ServerFrame::AuthRequired { timeout_secs: 30 })));
        manager.handle_frame(handle.id, &auth_frame("u1")).await;

        let Some(ServerFrame::AuthSuccess { user_id, queued, resumed, .. }) = handle.frames.recv().await
        else {
            panic!("expected auth_success");
        };
        assert_eq!((user_id.as_str(), queued, resumed), ("u1", 3, false));
        for expected in ["one", "two", "three"] {
            let Some(ServerFrame::Message(frame)) = handle.frames.recv().await else {
                panic!("expected message");
            };
            assert_eq!(frame.content, text(expected));
        }
        assert_eq!(manager.queued_for("u1").await, 0);

        let status = manager.deliver("u1", text("live"), None).await;
        assert_eq!(status.status, DeliveryState::Sent);
        assert_eq!(manager.history("u1").await.len(), 4);
    }

    #[tokio::test]
    async fn test_offline_queue_drops_oldest() {
        let manager = manager(RealtimeConfig {
            offline_queue_limit: 2,
            ..RealtimeConfig::default()
        });
        for body in ["a", "b", "c"] {
            manager.deliver("u1", text(body), None).await;
        }
        let handle = authed(&manager, "u1").await;
        let mut frames = handle.frames;
        let Some(ServerFrame::Message(first)) = frames.recv().await else {
            panic!("expected message");
        };
        assert_eq!(first.content, text("b"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_auth_timeout_closes_connection() {
        let manager = manager(RealtimeConfig::default());
        let mut handle = manager.open().await.unwrap();
        assert!(matches!(handle.frames.recv().await, Some(ServerFrame::AuthRequired { .. })));

        tokio::time::sleep(Duration::from_secs(31)).await;
        let Some(ServerFrame::Error { code, .. }) = handle.frames.recv().await else {
            panic!("expected error frame");
        };
        assert_eq!(code, "auth_timeout");
        assert!(handle.frames.recv().await.is_none());
        assert_eq!(manager.stats().await.connections, 0);
    }

    #[tokio::test]
    async fn test_bad_token_and_unauthenticated_frames() {
        let manager = manager(RealtimeConfig::default());
        let mut handle = manager.open().await.unwrap();
        handle.frames.recv().await;

        manager
            .handle_frame(handle.id, r#"{"type":"typing","data":{"isTyping":true}}"#)
            .await;
        let Some(ServerFrame::Error { code, .. }) = handle.frames.recv().await else {
            panic!("expected error frame");
        };
        assert_eq!(code, "unauthenticated");

        manager.handle_frame(handle.id, r#"{"type":"ping"}"#).await;
        assert_eq!(handle.frames.recv().await, Some(ServerFrame::Pong));

        let forged = json!({ "type": "auth", "data": { "token": "bogus" } }).to_string();
        manager.handle_frame(handle.id, &forged).await;
        assert!(matches!(handle.frames.recv().await, Some(ServerFrame::AuthError { .. })));
        assert!(handle.frames.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_connection_cap() {
        let manager = manager(RealtimeConfig {
            max_connections: 1,
            ..RealtimeConfig::default()
        });
        let _first = manager.open().await.unwrap();
        assert_eq!(manager.open().await.unwrap_err(), RealtimeError::ConnectionLimit(1));
    }

    #[tokio::test]
    async fn test_slow_consumer_is_closed() {
        let manager = manager(RealtimeConfig {
            outbound_buffer: 2,
            ..RealtimeConfig::default()
        });
        let mut handle = manager.open().await.unwrap();
        manager.handle_frame(handle.id, &auth_frame("u1")).await;
        // Buffer now holds auth_required and auth_success; nothing is read.
        let status = manager.deliver("u1", text("overflow"), None).await;
        assert_eq!(status.status, DeliveryState::Queued);

        assert!(matches!(handle.frames.recv().await, Some(ServerFrame::AuthRequired { .. })));
        assert!(matches!(handle.frames.recv().await, Some(ServerFrame::AuthSuccess { .. })));
        assert!(handle.frames.recv().await.is_none());
        assert!(!manager.is_online("u1").await);
        assert_eq!(manager.queued_for("u1").await, 1);
    }

    #[tokio::test]
    async fn test_inbound_message_event_and_ack() {
        let manager = manager(RealtimeConfig::default());
        let mut events = manager.subscribe();
        let mut handle = authed(&manager, "u1").await;

        let frame = json!({
            "type": "message",
            "data": { "content": { "type": "text", "text": "hello" }, "clientMessageId": "c-1" },
        });
        manager.handle_frame(handle.id, &frame.to_string()).await;

        let Some(ServerFrame::MessageAck { client_message_id, status, .. }) = handle.frames.recv().await
        else {
            panic!("expected ack");
        };
        assert_eq!(client_message_id.as_deref(), Some("c-1"));
        assert_eq!(status, "sent");

        let received = loop {
            if let RealtimeEvent::MessageReceived(message) = events.recv().await.unwrap() {
                break message;
            }
        };
        assert_eq!(received.user_id, "u1");
        assert_eq!(received.content, text("hello"));
        assert_eq!(manager.display_name("u1").await.as_deref(), Some("Ann"));
        assert_eq!(manager.history("u1").await[0].direction, Direction::Inbound);
    }

    #[tokio::test]
    async fn test_upload_size_limit() {
        let manager = manager(RealtimeConfig {
            max_upload_bytes: 1024,
            ..RealtimeConfig::default()
        });
        let mut handle = authed(&manager, "u1").await;
        let upload = |size: u64| {
            json!({
                "type": "file_upload",
                "data": { "url": "https://files.example.com/u/1.pdf", "filename": "1.pdf", "size": size },
            })
            .to_string()
        };

        manager.handle_frame(handle.id, &upload(4096)).await;
        let Some(ServerFrame::Error { code, .. }) = handle.frames.recv().await else {
            panic!("expected error frame");
        };
        assert_eq!(code, "upload_too_large");

        manager.handle_frame(handle.id, &upload(512)).await;
        assert!(matches!(handle.frames.recv().await, Some(ServerFrame::MessageAck { .. })));
        let history = manager.history("u1").await;
        let MessageContent::Media(media) = &history[0].content else {
            panic!("expected media");
        };
        assert_eq!(media.media_type, MediaType::Document);
        assert_eq!(media.mime_type.as_deref(), Some("application/pdf"));
    }

    #[tokio::test]
    async fn test_presence_and_session_resume() {
        let manager = manager(RealtimeConfig::default());
        let mut first = authed(&manager, "u1").await;
        let second = authed(&manager, "u2").await;

        let Some(ServerFrame::Presence { user_id, online, .. }) = first.frames.recv().await else {
            panic!("expected presence");
        };
        assert_eq!((user_id.as_str(), online), ("u2", true));

        manager.disconnect(second.id).await;
        let Some(ServerFrame::Presence { online, .. }) = first.frames.recv().await else {
            panic!("expected presence");
        };
        assert!(!online);

        let mut again = manager.open().await.unwrap();
        again.frames.recv().await;
        manager.handle_frame(again.id, &auth_frame("u2")).await;
        let Some(ServerFrame::AuthSuccess { resumed, .. }) = again.frames.recv().await else {
            panic!("expected auth_success");
        };
        assert!(resumed);
        assert_eq!(manager.stats().await.sessions, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_keepalive_and_session_sweep() {
        let manager = manager(RealtimeConfig::default());
        let mut events = manager.subscribe();
        let mut handle = authed(&manager, "u1").await;

        tokio::time::advance(Duration::from_secs(31)).await;
        manager.keepalive_tick().await;
        assert_eq!(handle.frames.recv().await, Some(ServerFrame::Ping));

        tokio::time::advance(Duration::from_secs(30)).await;
        manager.keepalive_tick().await;
        assert!(handle.frames.recv().await.is_none());
        assert_eq!(manager.stats().await.sessions, 1);

        manager.deliver("u2", text("for later"), None).await;
        tokio::time::advance(Duration::from_secs(30 * 60)).await;
        manager.sweep_sessions().await;
        assert_eq!(manager.stats().await.sessions, 0);
        assert!(manager.history("u1").await.is_empty());
        assert!(manager.history("u2").await.is_empty());
        assert_eq!(manager.queued_for("u2").await, 1);
        let expired = loop {
            if let RealtimeEvent::SessionExpired { user_id, .. } = events.recv().await.unwrap() {
                break user_id;
            }
        };
        assert_eq!(expired, "u1");
    }

    #[tokio::test(start_paused = true)]
    async fn test_pong_keeps_quiet_connection_alive() {
        let manager = manager(RealtimeConfig::default());
        let mut handle = authed(&manager, "u1").await;

        tokio::time::advance(Duration::from_secs(31)).await;
        manager.keepalive_tick().await;
        assert_eq!(handle.frames.recv().await, Some(ServerFrame::Ping));
        manager.handle_frame(handle.id, r#"{"type":"pong"}"#).await;

        tokio::time::advance(Duration::from_secs(30)).await;
        manager.keepalive_tick().await;
        assert_eq!(handle.frames.recv().await, Some(ServerFrame::Ping));

        // A WebSocket-level pong counts as activity too.
        manager.touch(handle.id).await;
        tokio::time::advance(Duration::from_secs(45)).await;
        manager.keepalive_tick().await;
        assert_eq!(handle.frames.recv().await, Some(ServerFrame::Ping));

        let status = manager.deliver("u1", text("still here"), None).await;
        assert_eq!(status.status, DeliveryState::Sent);
        assert_eq!(manager.stats().await.connections, 1);
    }

    #[tokio::test]
    async fn test_shutdown_closes_connections() {
        let manager = manager(RealtimeConfig::default());
        manager.start();
        let mut handle = authed(&manager, "u1").await;
        manager.shutdown().await;
        assert!(matches!(handle.frames.recv().await, Some(ServerFrame::Error { .. })));
        assert!(handle.frames.recv().await.is_none());
        assert_eq!(manager.open().await.unwrap_err(), RealtimeError::ShutDown);
    }
}

//! Inbound traffic broadcast.
//!
//! Everything the gateway receives (webhook messages, delivery receipts,
//! browser chat activity) is published here for downstream consumers.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use std::sync::Arc;

use switchboard_channels::{ConnectionManager, RealtimeEvent};
use switchboard_core::types::{ChannelType, DeliveryReceipt, TransformedMessage};

/// Event published by the gateway.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GatewayEvent {
    /// A normalized inbound message.
    MessageReceived {
        /// Source platform.
        channel: ChannelType,
        /// Tenant.
        tenant: String,
        /// The message.
        message: Box<TransformedMessage>,
    },

    /// A status update for an earlier outbound message.
    DeliveryUpdated {
        /// Source platform.
        channel: ChannelType,
        /// Tenant.
        tenant: String,
        /// The receipt.
        receipt: DeliveryReceipt,
    },

    /// A browser user completed the auth handshake.
    UserConnected {
        /// Tenant.
        tenant: String,
        /// User.
        user_id: String,
        /// Session.
        session_id: String,
    },

    /// A browser connection closed.
    UserDisconnected {
        /// Tenant.
        tenant: String,
        /// User, when the connection had authenticated.
        user_id: Option<String>,
        /// Why.
        reason: String,
    },

    /// Typing indicator from a browser user.
    Typing {
        /// Tenant.
        tenant: String,
        /// User.
        user_id: String,
        /// Started or stopped.
        is_typing: bool,
    },

    /// A browser user read a message.
    ReadReceipt {
        /// Tenant.
        tenant: String,
        /// User.
        user_id: String,
        /// Message read.
        message_id: String,
    },

    /// A browser session expired.
    SessionExpired {
        /// Tenant.
        tenant: String,
        /// Owner.
        user_id: String,
        /// Session.
        session_id: String,
    },
}

impl GatewayEvent {
    /// Translate a realtime manager event. Connection-level events without a
    /// user are dropped.
    #[must_use]
    pub fn from_realtime(tenant: &str, event: RealtimeEvent) -> Option<Self> {
        let tenant = tenant.to_string();
        Some(match event {
            RealtimeEvent::Connected { .. } => return None,
            RealtimeEvent::Authenticated {
                user_id,
                session_id,
                ..
            } => Self::UserConnected {
                tenant,
                user_id,
                session_id,
            },
            RealtimeEvent::MessageReceived(message) => Self::MessageReceived {
                channel: ChannelType::WebChat,
                tenant,
                message,
            },
            RealtimeEvent::Typing { user_id, is_typing } => Self::Typing {
                tenant,
                user_id,
                is_typing,
            },
            RealtimeEvent::ReadReceipt {
                user_id,
                message_id,
            } => Self::ReadReceipt {
                tenant,
                user_id,
                message_id,
            },
            RealtimeEvent::Disconnected {
                user_id, reason, ..
            } => Self::UserDisconnected {
                tenant,
                user_id,
                reason,
            },
            RealtimeEvent::SessionExpired {
                session_id,
                user_id,
            } => Self::SessionExpired {
                tenant,
                user_id,
                session_id,
            },
        })
    }
}

/// A wrapper for gateway events with metadata.
#[derive(Debug, Clone, Serialize)]
pub struct EventEnvelope {
    /// Event ID.
    pub id: String,
    /// Timestamp.
    pub timestamp: DateTime<Utc>,
    /// The event payload.
    pub event: GatewayEvent,
}

impl EventEnvelope {
    /// Create a new event envelope.
    #[must_use]
    pub fn new(event: GatewayEvent) -> Self {
        use rand::RngCore;
        let mut bytes = [0u8; 8];
        rand::thread_rng().fill_bytes(&mut bytes);

        Self {
            id: hex::encode(bytes),
            timestamp: Utc::now(),
            event,
        }
    }
}

/// Default channel capacity for event broadcasts.
const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

/// Event broadcaster for distributing gateway events to subscribers.
#[derive(Clone)]
pub struct EventBroadcaster {
    sender: broadcast::Sender<EventEnvelope>,
}

impl EventBroadcaster {
    /// Create a new event broadcaster.
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CHANNEL_CAPACITY)
    }

    /// Create a new event broadcaster with custom capacity.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Broadcast an event. Returns the number of subscribers that received it.
    pub fn broadcast(&self, event: GatewayEvent) -> usize {
        // No subscribers is not an error
        self.sender.send(EventEnvelope::new(event)).unwrap_or(0)
    }

    /// Subscribe to receive events.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<EventEnvelope> {
        self.sender.subscribe()
    }

    /// Get the number of active subscribers.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    /// Republish a tenant's realtime events until the manager shuts down.
    pub fn forward_realtime(&self, tenant: &str, manager: &Arc<ConnectionManager>) -> JoinHandle<()> {
        let mut events = manager.subscribe();
        let broadcaster = self.clone();
        let tenant = tenant.to_string();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => {
                        if let Some(event) = GatewayEvent::from_realtime(&tenant, event) {
                            broadcaster.broadcast(event);
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!(tenant = %tenant, "Realtime event forwarder lagged, missed {n} events");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }
}

impl Default for EventBroadcaster {
    fn default() -> Self {
        Self::new()
    }
}

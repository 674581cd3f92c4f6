//! # Switchboard Core
//!
//! Message model and shared helpers for the Switchboard messaging gateway.
//!
//! This crate provides:
//! - The normalized message model (content variants, metadata, delivery status)
//! - Content constructors and structural validation
//! - Typed per-platform channel settings and the JSON5 configuration file
//! - Secret wrapping and input sanitization

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod config;
pub mod content;
pub mod secrets;
pub mod types;
pub mod validation;

pub use config::{ChannelSettings, Config, ConfigError};
pub use content::{MessageContent, TextFormat, FormatKind, validate_content};
pub use secrets::{ApiKey, scrub_secrets};
pub use types::{
    ChannelType, DeliveryReceipt, DeliveryState, DeliveryStatus, MessageMetadata, TenantId,
    TransformedMessage,
};
pub use validation::{ValidationError, validate_message_content};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::{ChannelSettings, Config};
    pub use crate::content::*;
    pub use crate::secrets::ApiKey;
    pub use crate::types::*;
    pub use crate::validation::validate_message_content;
}

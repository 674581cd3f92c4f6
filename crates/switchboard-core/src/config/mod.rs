//! Configuration loading and validation.
//!
//! JSON5 format with camelCase keys.
//! Config location: `~/.switchboard/switchboard.json`

mod channels;

pub use channels::{
    ChannelSettings, SignalSettings, SlackSettings, TelegramSettings, WebChatSettings,
    WhatsAppSettings,
};

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::validation::{limits, parse_ip_rule};

/// Configuration errors.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// IO error reading config file.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON5 parsing error.
    #[error("Parse error: {0}")]
    Parse(#[from] json5::Error),

    /// Config validation error.
    #[error("Validation error: {0}")]
    Validation(String),

    /// Missing required field.
    #[error("Missing required field: {0}")]
    MissingField(String),
}

/// Main configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// Gateway configuration.
    #[serde(default)]
    pub gateway: GatewayConfig,

    /// Channel factory tuning.
    #[serde(default)]
    pub factory: FactoryConfig,

    /// Webhook validation policy.
    #[serde(default)]
    pub webhooks: WebhookConfig,

    /// Browser chat connection manager.
    #[serde(default)]
    pub realtime: RealtimeConfig,

    /// Tenants by ID.
    #[serde(default)]
    pub tenants: BTreeMap<String, TenantConfig>,

    /// Global settings.
    #[serde(default)]
    pub settings: GlobalSettings,
}

impl Config {
    /// Load configuration from the default location.
    ///
    /// # Errors
    ///
    /// Returns error if config cannot be loaded or parsed.
    pub fn load_default() -> Result<Self, ConfigError> {
        let path = Self::default_path();
        if path.exists() {
            Self::load(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Load configuration from a specific path.
    ///
    /// # Errors
    ///
    /// Returns error if file cannot be read, parsed, or fails validation.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let size = std::fs::metadata(path)?.len();
        if size > limits::MAX_CONFIG_FILE_SIZE as u64 {
            return Err(ConfigError::Validation(format!(
                "config file is {size} bytes, limit is {}",
                limits::MAX_CONFIG_FILE_SIZE
            )));
        }
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    /// Parse and validate configuration text.
    ///
    /// # Errors
    ///
    /// Returns error if the text is not valid JSON5 or fails validation.
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: Self = json5::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a path.
    ///
    /// # Errors
    ///
    /// Returns error if serialization or file write fails.
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = serde_json::to_string_pretty(self)
            .map_err(|e| ConfigError::Validation(e.to_string()))?;
        std::fs::write(path, content)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
        }
        Ok(())
    }

    /// Get the default config file path.
    #[must_use]
    pub fn default_path() -> PathBuf {
        Self::state_dir().join("switchboard.json")
    }

    /// Get the Switchboard state directory.
    ///
    /// Uses `SWITCHBOARD_STATE_DIR` env var if set, otherwise `~/.switchboard`.
    #[must_use]
    pub fn state_dir() -> PathBuf {
        if let Ok(dir) = std::env::var("SWITCHBOARD_STATE_DIR") {
            PathBuf::from(dir)
        } else if let Some(home) = dirs::home_dir() {
            home.join(".switchboard")
        } else {
            PathBuf::from(".switchboard")
        }
    }

    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns the first problem found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.gateway.port == 0 {
            return Err(ConfigError::Validation(
                "Gateway port cannot be 0".to_string(),
            ));
        }

        if self.factory.max_retries == 0 {
            return Err(ConfigError::Validation(
                "factory.maxRetries must be at least 1".to_string(),
            ));
        }

        let rate = &self.webhooks.rate_limit;
        if rate.max_requests == 0 || rate.window_secs == 0 {
            return Err(ConfigError::Validation(
                "webhooks.rateLimit needs maxRequests and windowSecs above 0".to_string(),
            ));
        }
        for rule in &self.webhooks.ip_allowlist {
            parse_ip_rule(rule).map_err(|e| ConfigError::Validation(e.to_string()))?;
        }

        let rt = &self.realtime;
        if rt.max_connections == 0 || rt.offline_queue_limit == 0 || rt.history_limit == 0 {
            return Err(ConfigError::Validation(
                "realtime limits must be above 0".to_string(),
            ));
        }

        for (tenant, tenant_config) in &self.tenants {
            if tenant.trim().is_empty() {
                return Err(ConfigError::Validation("Tenant ID cannot be empty".to_string()));
            }
            let mut seen = HashSet::new();
            for settings in &tenant_config.channels {
                let channel = settings.channel_type();
                if !seen.insert(channel) {
                    return Err(ConfigError::Validation(format!(
                        "Tenant '{tenant}' configures {channel} twice"
                    )));
                }
                settings.validate().map_err(|e| match e {
                    ConfigError::MissingField(f) => {
                        ConfigError::MissingField(format!("tenants.{tenant}.{f}"))
                    }
                    ConfigError::Validation(m) => {
                        ConfigError::Validation(format!("tenants.{tenant}: {m}"))
                    }
                    other => other,
                })?;
            }
        }

        Ok(())
    }

    /// Every `(tenant, settings)` pair, in tenant order.
    pub fn channel_settings(&self) -> impl Iterator<Item = (&str, &ChannelSettings)> {
        self.tenants.iter().flat_map(|(tenant, config)| {
            config
                .channels
                .iter()
                .map(move |settings| (tenant.as_str(), settings))
        })
    }
}

/// Gateway server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayConfig {
    /// Port to listen on.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Bind address mode.
    #[serde(default)]
    pub mode: BindMode,

    /// Enable CORS.
    #[serde(default = "default_true")]
    pub cors: bool,

    /// Request timeout in seconds.
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
}

impl GatewayConfig {
    /// Socket address string for the configured mode and port.
    #[must_use]
    pub fn bind_address(&self) -> String {
        match &self.mode {
            BindMode::Local => format!("127.0.0.1:{}", self.port),
            BindMode::Public => format!("0.0.0.0:{}", self.port),
            BindMode::Custom(host) => format!("{host}:{}", self.port),
        }
    }
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            mode: BindMode::default(),
            cors: true,
            timeout_secs: default_timeout(),
        }
    }
}

const fn default_port() -> u16 {
    18790
}

const fn default_timeout() -> u64 {
    30
}

const fn default_true() -> bool {
    true
}

/// Gateway bind mode.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BindMode {
    /// Bind to localhost only.
    #[default]
    Local,
    /// Bind to all interfaces.
    Public,
    /// Custom bind address.
    Custom(String),
}

/// Channel factory tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FactoryConfig {
    /// Initialization attempts per adapter.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Delay between attempts.
    #[serde(default = "default_retry_delay")]
    pub retry_delay_secs: u64,

    /// Bound on a single initialization attempt.
    #[serde(default = "default_init_timeout")]
    pub init_timeout_secs: u64,

    /// Health poll period.
    #[serde(default = "default_health_interval")]
    pub health_check_interval_secs: u64,

    /// Per-adapter bound during shutdown.
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_secs: u64,
}

impl FactoryConfig {
    /// Delay between attempts.
    #[must_use]
    pub const fn retry_delay(&self) -> Duration {
        Duration::from_secs(self.retry_delay_secs)
    }

    /// Bound on a single initialization attempt.
    #[must_use]
    pub const fn init_timeout(&self) -> Duration {
        Duration::from_secs(self.init_timeout_secs)
    }

    /// Health poll period.
    #[must_use]
    pub const fn health_check_interval(&self) -> Duration {
        Duration::from_secs(self.health_check_interval_secs)
    }

    /// Per-adapter bound during shutdown.
    #[must_use]
    pub const fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }
}

impl Default for FactoryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            retry_delay_secs: default_retry_delay(),
            init_timeout_secs: default_init_timeout(),
            health_check_interval_secs: default_health_interval(),
            shutdown_timeout_secs: default_shutdown_timeout(),
        }
    }
}

const fn default_max_retries() -> u32 {
    3
}

const fn default_retry_delay() -> u64 {
    5
}

const fn default_init_timeout() -> u64 {
    30
}

const fn default_health_interval() -> u64 {
    60
}

const fn default_shutdown_timeout() -> u64 {
    30
}

/// Webhook validation policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookConfig {
    /// Maximum age of a signed timestamp.
    #[serde(default = "default_max_timestamp_age")]
    pub max_timestamp_age_secs: u64,

    /// Per-IP rate limit.
    #[serde(default)]
    pub rate_limit: RateLimitConfig,

    /// Allowed client addresses or CIDR blocks. Empty allows all.
    #[serde(default)]
    pub ip_allowlist: Vec<String>,

    /// Headers that must be present on every webhook.
    #[serde(default)]
    pub required_headers: Vec<String>,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            max_timestamp_age_secs: default_max_timestamp_age(),
            rate_limit: RateLimitConfig::default(),
            ip_allowlist: vec![],
            required_headers: vec![],
        }
    }
}

const fn default_max_timestamp_age() -> u64 {
    300
}

/// Request budget per client IP.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitConfig {
    /// Requests allowed per window.
    #[serde(default = "default_max_requests")]
    pub max_requests: u32,

    /// Window length.
    #[serde(default = "default_window")]
    pub window_secs: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_requests: default_max_requests(),
            window_secs: default_window(),
        }
    }
}

const fn default_max_requests() -> u32 {
    100
}

const fn default_window() -> u64 {
    60
}

/// Browser chat connection manager settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RealtimeConfig {
    /// Time allowed between connect and auth.
    #[serde(default = "default_auth_timeout")]
    pub auth_timeout_secs: u64,
    /// Keepalive tick.
    #[serde(default = "default_keepalive")]
    pub keepalive_interval_secs: u64,
    /// Idle time after which a connection is closed.
    #[serde(default = "default_inactivity")]
    pub inactivity_timeout_secs: u64,
    /// Idle time after which a session expires.
    #[serde(default = "default_session_timeout")]
    pub session_timeout_secs: u64,
    /// Session sweep tick.
    #[serde(default = "default_session_sweep")]
    pub session_sweep_interval_secs: u64,
    /// Messages kept per user.
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,
    /// Undelivered messages kept per offline user.
    #[serde(default = "default_offline_queue_limit")]
    pub offline_queue_limit: usize,
    /// Concurrent connections across all users.
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    /// Largest accepted upload.
    #[serde(default = "default_max_upload")]
    pub max_upload_bytes: u64,
    /// Outbound frames buffered per connection.
    #[serde(default = "default_outbound_buffer")]
    pub outbound_buffer: usize,
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            auth_timeout_secs: default_auth_timeout(),
            keepalive_interval_secs: default_keepalive(),
            inactivity_timeout_secs: default_inactivity(),
            session_timeout_secs: default_session_timeout(),
            session_sweep_interval_secs: default_session_sweep(),
            history_limit: default_history_limit(),
            offline_queue_limit: default_offline_queue_limit(),
            max_connections: default_max_connections(),
            max_upload_bytes: default_max_upload(),
            outbound_buffer: default_outbound_buffer(),
        }
    }
}

const fn default_auth_timeout() -> u64 {
    30
}

const fn default_keepalive() -> u64 {
    30
}

const fn default_inactivity() -> u64 {
    60
}

const fn default_session_timeout() -> u64 {
    30 * 60
}

const fn default_session_sweep() -> u64 {
    5 * 60
}

const fn default_history_limit() -> usize {
    1000
}

const fn default_offline_queue_limit() -> usize {
    100
}

const fn default_max_connections() -> usize {
    10_000
}

const fn default_max_upload() -> u64 {
    25 * 1024 * 1024
}

const fn default_outbound_buffer() -> usize {
    256
}

/// One tenant's channels.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TenantConfig {
    /// Channel settings, at most one per channel type.
    #[serde(default)]
    pub channels: Vec<ChannelSettings>,
}

/// Global settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GlobalSettings {
    /// Enable debug logging.
    #[serde(default)]
    pub debug: bool,

    /// Log format.
    #[serde(default)]
    pub log_format: LogFormat,
}

/// Log format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable format.
    #[default]
    Pretty,
    /// JSON format.
    Json,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ChannelType;
    use tempfile::tempdir;

    const SAMPLE: &str = r#"{
        // comments are fine
        gateway: { port: 8080 },
        webhooks: { ipAllowlist: ["10.0.0.0/8", "192.168.1.5"] },
        tenants: {
            acme: {
                channels: [
                    { type: "telegram", botToken: "123:abc", secretToken: "s3cret" },
                    { type: "slack", botToken: "xoxb-1", signingSecret: "sig" },
                ],
            },
        },
        settings: { logFormat: "json" },
    }"#;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.gateway.port, 18790);
        assert_eq!(config.factory.max_retries, 3);
        assert_eq!(config.realtime.offline_queue_limit, 100);
        assert_eq!(config.webhooks.max_timestamp_age_secs, 300);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_json5_parsing() {
        let config = Config::parse(SAMPLE).unwrap();
        assert_eq!(config.gateway.port, 8080);
        assert_eq!(config.settings.log_format, LogFormat::Json);

        let channels: Vec<_> = config
            .channel_settings()
            .map(|(tenant, s)| (tenant.to_string(), s.channel_type()))
            .collect();
        assert_eq!(
            channels,
            vec![
                ("acme".to_string(), ChannelType::Telegram),
                ("acme".to_string(), ChannelType::Slack),
            ]
        );
    }

    #[test]
    fn test_config_roundtrip() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("switchboard.json");

        let config = Config::parse(SAMPLE).unwrap();
        config.save(&path).unwrap();

        let loaded = Config::load(&path).unwrap();
        assert_eq!(loaded.tenants["acme"].channels, config.tenants["acme"].channels);
    }

    #[test]
    fn test_config_validation() {
        let mut config = Config::default();
        config.gateway.port = 0;
        assert!(config.validate().is_err());

        let duplicate = r#"{ tenants: { t: { channels: [
            { type: "telegram", botToken: "a" },
            { type: "telegram", botToken: "b" },
        ] } } }"#;
        assert!(Config::parse(duplicate).is_err());

        let bad_ip = r#"{ webhooks: { ipAllowlist: ["10.0.0.0/99"] } }"#;
        assert!(Config::parse(bad_ip).is_err());
    }

    #[test]
    fn test_missing_field_is_prefixed() {
        let blank = r#"{ tenants: { acme: { channels: [ { type: "telegram", botToken: "" } ] } } }"#;
        let err = Config::parse(blank).unwrap_err();
        assert!(
            matches!(&err, ConfigError::MissingField(f) if f == "tenants.acme.telegram.botToken"),
            "{err}"
        );
    }

    #[test]
    fn test_bind_address() {
        let mut gateway = GatewayConfig::default();
        assert_eq!(gateway.bind_address(), "127.0.0.1:18790");
        gateway.mode = BindMode::Public;
        assert_eq!(gateway.bind_address(), "0.0.0.0:18790");
    }

    #[test]
    fn test_state_dir() {
        let dir = Config::state_dir();
        assert!(dir.to_str().unwrap().contains("switchboard"));
    }
}

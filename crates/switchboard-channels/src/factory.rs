//! Adapter factory: creation, lookup, reconfiguration, health polling, and
//! coordinated shutdown, keyed by `(channel type, tenant)`.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Weak};

use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::Serialize;
use serde_json::json;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;

use switchboard_core::config::{ChannelSettings, FactoryConfig, RealtimeConfig};
use switchboard_core::types::ChannelType;

use crate::signal::SignalAdapter;
use crate::slack::SlackAdapter;
use crate::telegram::TelegramAdapter;
use crate::traits::{AdapterHealth, ChannelAdapter, ChannelError, HealthStatus};
use crate::webchat::WebChatAdapter;
use crate::webhook::WebhookValidator;
use crate::whatsapp::WhatsAppAdapter;

/// Registry key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AdapterKey {
    /// Platform.
    pub channel_type: ChannelType,
    /// Tenant.
    pub tenant_id: String,
}

impl AdapterKey {
    /// Build a key.
    pub fn new(channel_type: ChannelType, tenant_id: impl Into<String>) -> Self {
        Self {
            channel_type,
            tenant_id: tenant_id.into(),
        }
    }
}

impl fmt::Display for AdapterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.channel_type, self.tenant_id)
    }
}

/// Configuration record of one adapter.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelConfiguration {
    /// Platform.
    pub channel_type: ChannelType,
    /// Tenant.
    pub tenant_id: String,
    /// Cleared by an unhealthy poll, set again by a healthy one.
    pub is_active: bool,
    /// Typed settings. Never serialized: they carry credentials.
    #[serde(skip)]
    pub settings: ChannelSettings,
    /// Description of the live adapter: name, channel id, content kinds.
    pub metadata: serde_json::Map<String, serde_json::Value>,
    /// Created.
    pub created_at: DateTime<Utc>,
    /// Last reconfiguration or restart.
    pub updated_at: DateTime<Utc>,
    /// Result of the last health poll.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_health: Option<AdapterHealth>,
}

impl ChannelConfiguration {
    fn new(tenant_id: &str, settings: ChannelSettings) -> Self {
        let now = Utc::now();
        Self {
            channel_type: settings.channel_type(),
            tenant_id: tenant_id.to_string(),
            is_active: true,
            settings,
            metadata: serde_json::Map::new(),
            created_at: now,
            updated_at: now,
            last_health: None,
        }
    }

    fn describe(&mut self, adapter: &dyn ChannelAdapter) {
        self.metadata = serde_json::Map::from_iter([
            ("channelName".to_string(), json!(adapter.channel_name())),
            ("channelId".to_string(), json!(adapter.channel_id())),
            (
                "supportedMessageTypes".to_string(),
                json!(adapter.supported_message_types()),
            ),
        ]);
    }

    fn key(&self) -> AdapterKey {
        AdapterKey::new(self.channel_type, self.tenant_id.clone())
    }
}

/// Constructs adapters from typed settings.
pub trait AdapterBuilder: Send + Sync {
    /// Build an uninitialized adapter.
    ///
    /// # Errors
    ///
    /// Returns `ChannelError::Configuration` for invalid settings.
    fn build(
        &self,
        tenant: &str,
        settings: &ChannelSettings,
    ) -> Result<Arc<dyn ChannelAdapter>, ChannelError>;
}

/// Builds the platform adapters shipped with this crate.
pub struct PlatformAdapterBuilder {
    validator: Arc<WebhookValidator>,
    realtime: RealtimeConfig,
}

impl PlatformAdapterBuilder {
    /// Share one webhook validator across every HTTP adapter.
    #[must_use]
    pub const fn new(validator: Arc<WebhookValidator>, realtime: RealtimeConfig) -> Self {
        Self {
            validator,
            realtime,
        }
    }
}

impl AdapterBuilder for PlatformAdapterBuilder {
    fn build(
        &self,
        tenant: &str,
        settings: &ChannelSettings,
    ) -> Result<Arc<dyn ChannelAdapter>, ChannelError> {
        let validator = Arc::clone(&self.validator);
        Ok(match settings.clone() {
            ChannelSettings::WhatsApp(s) => Arc::new(WhatsAppAdapter::new(tenant, s, validator)?),
            ChannelSettings::Telegram(s) => Arc::new(TelegramAdapter::new(tenant, s, validator)?),
            ChannelSettings::Slack(s) => Arc::new(SlackAdapter::new(tenant, s, validator)?),
            ChannelSettings::Signal(s) => Arc::new(SignalAdapter::new(tenant, s, validator)?),
            ChannelSettings::WebChat(s) => {
                Arc::new(WebChatAdapter::new(tenant, s, self.realtime.clone())?)
            }
        })
    }
}

/// Owner of every adapter instance and its configuration record.
pub struct ChannelFactory {
    config: FactoryConfig,
    builder: Arc<dyn AdapterBuilder>,
    adapters: RwLock<HashMap<AdapterKey, Arc<dyn ChannelAdapter>>>,
    configurations: RwLock<HashMap<AdapterKey, ChannelConfiguration>>,
}

impl ChannelFactory {
    /// Create an empty factory.
    #[must_use]
    pub fn new(config: FactoryConfig, builder: Arc<dyn AdapterBuilder>) -> Self {
        Self {
            config,
            builder,
            adapters: RwLock::new(HashMap::new()),
            configurations: RwLock::new(HashMap::new()),
        }
    }

    /// Return the live adapter for these settings, creating and initializing
    /// it if there is none.
    ///
    /// # Errors
    ///
    /// Returns the last initialization error once retries are exhausted, or
    /// `ChannelError::Configuration` straight away for invalid settings.
    pub async fn create_adapter(
        &self,
        tenant: &str,
        settings: ChannelSettings,
    ) -> Result<Arc<dyn ChannelAdapter>, ChannelError> {
        let key = AdapterKey::new(settings.channel_type(), tenant);
        if let Some(adapter) = self.get_adapter(key.channel_type, tenant).await {
            return Ok(adapter);
        }

        let adapter = self.initialize_with_retry(&key, &settings).await?;

        let mut adapters = self.adapters.write().await;
        if let Some(existing) = adapters.get(&key).cloned() {
            drop(adapters);
            tracing::debug!(adapter = %key, "Concurrent creation lost the race, discarding duplicate");
            self.stop(&key, adapter).await;
            return Ok(existing);
        }
        adapters.insert(key.clone(), Arc::clone(&adapter));
        drop(adapters);

        let mut record = ChannelConfiguration::new(tenant, settings);
        record.describe(adapter.as_ref());
        self.configurations.write().await.insert(key.clone(), record);
        tracing::info!(adapter = %key, "Adapter created");
        Ok(adapter)
    }

    /// Create every configured adapter, returning the failures.
    pub async fn create_all<'a>(
        &self,
        channels: impl IntoIterator<Item = (&'a str, &'a ChannelSettings)>,
    ) -> Vec<(AdapterKey, ChannelError)> {
        let mut failures = Vec::new();
        for (tenant, settings) in channels {
            if let Err(e) = self.create_adapter(tenant, settings.clone()).await {
                let key = AdapterKey::new(settings.channel_type(), tenant);
                tracing::error!(adapter = %key, error = %e, "Adapter failed to start");
                failures.push((key, e));
            }
        }
        failures
    }

    /// Live adapter for a key.
    pub async fn get_adapter(
        &self,
        channel_type: ChannelType,
        tenant: &str,
    ) -> Option<Arc<dyn ChannelAdapter>> {
        self.adapters
            .read()
            .await
            .get(&AdapterKey::new(channel_type, tenant))
            .cloned()
    }

    /// Configuration record for a key.
    pub async fn get_configuration(
        &self,
        channel_type: ChannelType,
        tenant: &str,
    ) -> Option<ChannelConfiguration> {
        self.configurations
            .read()
            .await
            .get(&AdapterKey::new(channel_type, tenant))
            .cloned()
    }

    /// Every configuration record, ordered by key.
    pub async fn list_configurations(&self) -> Vec<ChannelConfiguration> {
        let mut configurations: Vec<ChannelConfiguration> =
            self.configurations.read().await.values().cloned().collect();
        configurations.sort_by_key(ChannelConfiguration::key);
        configurations
    }

    /// Replace an adapter's settings. The old adapter is fully shut down
    /// before the new one initializes.
    ///
    /// # Errors
    ///
    /// Returns the initialization error of the new adapter. The record keeps
    /// the new settings and is marked inactive.
    pub async fn update_adapter_config(
        &self,
        tenant: &str,
        settings: ChannelSettings,
    ) -> Result<Arc<dyn ChannelAdapter>, ChannelError> {
        let key = AdapterKey::new(settings.channel_type(), tenant);
        self.replace(&key, settings).await
    }

    /// Shut an adapter down and initialize a fresh one with the same settings.
    ///
    /// # Errors
    ///
    /// Returns `ChannelError::Configuration` if nothing is configured for the
    /// key, or the initialization error of the new adapter.
    pub async fn restart_adapter(
        &self,
        channel_type: ChannelType,
        tenant: &str,
    ) -> Result<Arc<dyn ChannelAdapter>, ChannelError> {
        let key = AdapterKey::new(channel_type, tenant);
        let settings = self
            .configurations
            .read()
            .await
            .get(&key)
            .map(|record| record.settings.clone())
            .ok_or_else(|| not_configured(&key))?;
        self.replace(&key, settings).await
    }

    async fn replace(
        &self,
        key: &AdapterKey,
        settings: ChannelSettings,
    ) -> Result<Arc<dyn ChannelAdapter>, ChannelError> {
        let old = self.adapters.write().await.remove(key);
        if let Some(old) = old {
            self.stop(key, old).await;
        }

        let result = self.initialize_with_retry(key, &settings).await;

        if let Ok(adapter) = &result {
            let displaced = self
                .adapters
                .write()
                .await
                .insert(key.clone(), Arc::clone(adapter));
            // A concurrent create_adapter may have filled the gap.
            if let Some(displaced) = displaced {
                tracing::debug!(adapter = %key, "Stopping adapter created during replacement");
                self.stop(key, displaced).await;
            }
        }
        let mut configurations = self.configurations.write().await;
        let record = configurations
            .entry(key.clone())
            .or_insert_with(|| ChannelConfiguration::new(&key.tenant_id, settings.clone()));
        record.settings = settings;
        if let Ok(adapter) = &result {
            record.describe(adapter.as_ref());
        }
        record.is_active = result.is_ok();
        record.updated_at = Utc::now();
        drop(configurations);

        match &result {
            Ok(_) => tracing::info!(adapter = %key, "Adapter replaced"),
            Err(e) => tracing::error!(adapter = %key, error = %e, "Adapter failed to restart"),
        }
        result
    }

    /// Shut an adapter down and forget it. Returns false if nothing was configured.
    pub async fn remove_adapter(&self, channel_type: ChannelType, tenant: &str) -> bool {
        let key = AdapterKey::new(channel_type, tenant);
        let adapter = self.adapters.write().await.remove(&key);
        let record = self.configurations.write().await.remove(&key);
        if let Some(adapter) = adapter {
            self.stop(&key, adapter).await;
        }
        let removed = record.is_some();
        if removed {
            tracing::info!(adapter = %key, "Adapter removed");
        }
        removed
    }

    /// Poll every live adapter once and record the results.
    pub async fn run_health_checks(&self) -> Vec<(AdapterKey, AdapterHealth)> {
        let snapshot: Vec<(AdapterKey, Arc<dyn ChannelAdapter>)> = self
            .adapters
            .read()
            .await
            .iter()
            .map(|(key, adapter)| (key.clone(), Arc::clone(adapter)))
            .collect();

        let check_timeout = self.config.init_timeout();
        let results = join_all(snapshot.into_iter().map(|(key, adapter)| async move {
            let health = tokio::time::timeout(check_timeout, adapter.health_status())
                .await
                .unwrap_or_else(|_| {
                    AdapterHealth::new(HealthStatus::Unhealthy)
                        .with_detail("error", format!("health check timed out after {check_timeout:?}"))
                });
            (key, health)
        }))
        .await;

        let mut configurations = self.configurations.write().await;
        for (key, health) in &results {
            let Some(record) = configurations.get_mut(key) else {
                continue;
            };
            let active = health.status != HealthStatus::Unhealthy;
            if record.is_active != active {
                if active {
                    tracing::info!(adapter = %key, "Adapter recovered, marking active");
                } else {
                    tracing::warn!(adapter = %key, details = ?health.details, "Adapter unhealthy, marking inactive");
                }
            }
            record.is_active = active;
            record.last_health = Some(health.clone());
        }
        drop(configurations);
        results
    }

    /// Poll adapter health on the configured interval until the factory is dropped.
    pub fn start_health_monitor(self: &Arc<Self>) -> JoinHandle<()> {
        let factory: Weak<Self> = Arc::downgrade(self);
        let period = self.config.health_check_interval();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            loop {
                interval.tick().await;
                let Some(factory) = factory.upgrade() else {
                    break;
                };
                let results = factory.run_health_checks().await;
                tracing::debug!(adapters = results.len(), "Health poll complete");
            }
        })
    }

    /// Shut every adapter down concurrently. Returns the number that failed
    /// or timed out.
    pub async fn shutdown_all_adapters(&self) -> usize {
        let adapters: Vec<(AdapterKey, Arc<dyn ChannelAdapter>)> =
            self.adapters.write().await.drain().collect();
        let total = adapters.len();
        let outcomes = join_all(
            adapters
                .into_iter()
                .map(|(key, adapter)| async move { self.stop(&key, adapter).await }),
        )
        .await;

        for record in self.configurations.write().await.values_mut() {
            record.is_active = false;
        }
        let failed = outcomes.iter().filter(|clean| !**clean).count();
        tracing::info!(total, failed, "All adapters shut down");
        failed
    }

    /// Shut one adapter down within the deadline. Returns false on error or timeout.
    async fn stop(&self, key: &AdapterKey, adapter: Arc<dyn ChannelAdapter>) -> bool {
        let deadline = self.config.shutdown_timeout();
        match tokio::time::timeout(deadline, adapter.shutdown()).await {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                tracing::warn!(adapter = %key, error = %e, "Adapter shutdown failed");
                false
            }
            Err(_) => {
                tracing::warn!(adapter = %key, ?deadline, "Adapter shutdown timed out, abandoning");
                false
            }
        }
    }

    async fn initialize_with_retry(
        &self,
        key: &AdapterKey,
        settings: &ChannelSettings,
    ) -> Result<Arc<dyn ChannelAdapter>, ChannelError> {
        let attempts = self.config.max_retries.max(1);
        let init_timeout = self.config.init_timeout();
        let mut attempt = 0;
        loop {
            attempt += 1;
            // A fresh instance per attempt: a timed-out initialize leaves the
            // previous one stuck mid-transition.
            let adapter = self.builder.build(&key.tenant_id, settings)?;
            let error = match tokio::time::timeout(init_timeout, adapter.initialize()).await {
                Ok(Ok(())) => return Ok(adapter),
                Ok(Err(e @ ChannelError::Configuration(_))) => return Err(e),
                Ok(Err(e)) => e,
                Err(_) => ChannelError::Timeout(init_timeout),
            };

            if attempt >= attempts {
                tracing::error!(adapter = %key, attempts, error = %error, "Adapter initialization failed");
                return Err(error);
            }
            tracing::warn!(
                adapter = %key,
                attempt,
                attempts,
                error = %error,
                "Adapter initialization failed, retrying in {:?}",
                self.config.retry_delay()
            );
            tokio::time::sleep(self.config.retry_delay()).await;
        }
    }
}

fn not_configured(key: &AdapterKey) -> ChannelError {
    ChannelError::Configuration(format!("no adapter configured for {key}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traits::{AdapterState, WebhookOutcome};
    use crate::webhook::WebhookRequest;
    use async_trait::async_trait;
    use pretty_assertions::assert_eq;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
    use std::time::Duration;
    use switchboard_core::config::TelegramSettings;
    use switchboard_core::content::{ContentKind, MessageContent};
    use switchboard_core::secrets::ApiKey;
    use switchboard_core::types::{DeliveryStatus, MessageMetadata};

    #[derive(Default)]
    struct Script {
        init_failures: AtomicU32,
        hang_init: AtomicBool,
        hang_shutdown: AtomicBool,
        unhealthy: AtomicBool,
        builds: AtomicU32,
        slow_build: AtomicU32,
        log: Mutex<Vec<String>>,
    }

    impl Script {
        fn record(&self, entry: String) {
            self.log.lock().unwrap().push(entry);
        }
    }

    struct FakeAdapter {
        id: String,
        build: u32,
        script: Arc<Script>,
        running: AtomicBool,
    }

    #[async_trait]
    impl ChannelAdapter for FakeAdapter {
        fn channel_type(&self) -> ChannelType {
            ChannelType::Telegram
        }
        fn channel_id(&self) -> &str {
            &self.id
        }
        fn channel_name(&self) -> &str {
            "Fake"
        }
        fn supported_message_types(&self) -> &'static [ContentKind] {
            &[ContentKind::Text]
        }
        fn supports_feature(&self, _feature: &str) -> bool {
            false
        }
        fn state(&self) -> AdapterState {
            if self.running.load(Ordering::SeqCst) {
                AdapterState::Healthy
            } else {
                AdapterState::Uninitialized
            }
        }
        async fn initialize(&self) -> Result<(), ChannelError> {
            self.script.record(format!("init {}", self.id));
            if self.script.slow_build.load(Ordering::SeqCst) == self.build {
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
            if self.script.hang_init.load(Ordering::SeqCst) {
                std::future::pending::<()>().await;
            }
            let remaining = self.script.init_failures.load(Ordering::SeqCst);
            if remaining > 0 {
                self.script.init_failures.store(remaining - 1, Ordering::SeqCst);
                return Err(ChannelError::network("connection refused"));
            }
            self.running.store(true, Ordering::SeqCst);
            Ok(())
        }
        async fn send_message(
            &self,
            _user_id: &str,
            _content: &MessageContent,
            _metadata: Option<&MessageMetadata>,
        ) -> Result<DeliveryStatus, ChannelError> {
            Ok(DeliveryStatus::sent("1"))
        }
        async fn process_incoming_webhook(
            &self,
            _request: &WebhookRequest,
        ) -> Result<WebhookOutcome, ChannelError> {
            Ok(WebhookOutcome::accepted())
        }
        fn validate_webhook(&self, _request: &WebhookRequest) -> bool {
            true
        }
        async fn health_status(&self) -> AdapterHealth {
            if self.script.unhealthy.load(Ordering::SeqCst) {
                AdapterHealth::new(HealthStatus::Unhealthy)
            } else {
                AdapterHealth::new(HealthStatus::Healthy)
            }
        }
        async fn shutdown(&self) -> Result<(), ChannelError> {
            if self.script.hang_shutdown.load(Ordering::SeqCst) {
                std::future::pending::<()>().await;
            }
            self.script.record(format!("shutdown {}", self.id));
            self.running.store(false, Ordering::SeqCst);
            Ok(())
        }
    }

    struct FakeBuilder(Arc<Script>);

    impl AdapterBuilder for FakeBuilder {
        fn build(
            &self,
            tenant: &str,
            _settings: &ChannelSettings,
        ) -> Result<Arc<dyn ChannelAdapter>, ChannelError> {
            let n = self.0.builds.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(Arc::new(FakeAdapter {
                id: format!("{tenant}#{n}"),
                build: n,
                script: Arc::clone(&self.0),
                running: AtomicBool::new(false),
            }))
        }
    }

    fn telegram() -> ChannelSettings {
        ChannelSettings::Telegram(TelegramSettings {
            bot_token: ApiKey::new("123:abc"),
            secret_token: None,
            webhook_url: None,
            base_url: None,
            max_concurrent_sends: 4,
        })
    }

    fn factory(script: &Arc<Script>) -> ChannelFactory {
        let config = FactoryConfig {
            max_retries: 3,
            retry_delay_secs: 0,
            init_timeout_secs: 5,
            health_check_interval_secs: 60,
            shutdown_timeout_secs: 2,
        };
        ChannelFactory::new(config, Arc::new(FakeBuilder(Arc::clone(script))))
    }

    #[tokio::test]
    async fn test_create_is_idempotent() {
        let script = Arc::new(Script::default());
        let factory = factory(&script);
        let first = factory.create_adapter("acme", telegram()).await.unwrap();
        let second = factory.create_adapter("acme", telegram()).await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(script.builds.load(Ordering::SeqCst), 1);

        let record = factory
            .get_configuration(ChannelType::Telegram, "acme")
            .await
            .unwrap();
        assert!(record.is_active);
        assert_eq!(record.metadata["channelId"], "acme#1");
        assert_eq!(record.metadata["supportedMessageTypes"], serde_json::json!(["text"]));
        assert_eq!(factory.list_configurations().await.len(), 1);
    }

    #[tokio::test]
    async fn test_initialization_retries() {
        let script = Arc::new(Script::default());
        script.init_failures.store(2, Ordering::SeqCst);
        let factory = factory(&script);
        factory.create_adapter("acme", telegram()).await.unwrap();
        assert_eq!(script.builds.load(Ordering::SeqCst), 3);

        script.init_failures.store(3, Ordering::SeqCst);
        let err = factory.create_adapter("globex", telegram()).await.err().expect("expected error");
        assert!(matches!(err, ChannelError::Transport { .. }));
        assert!(factory.get_adapter(ChannelType::Telegram, "globex").await.is_none());
    }

    #[tokio::test]
    async fn test_invalid_settings_fail_fast() {
        let validator = Arc::new(WebhookValidator::permissive());
        let factory = ChannelFactory::new(
            FactoryConfig::default(),
            Arc::new(PlatformAdapterBuilder::new(validator, RealtimeConfig::default())),
        );
        let blank = ChannelSettings::Telegram(TelegramSettings {
            bot_token: ApiKey::new(""),
            secret_token: None,
            webhook_url: None,
            base_url: None,
            max_concurrent_sends: 4,
        });
        assert!(matches!(
            factory.create_adapter("acme", blank).await,
            Err(ChannelError::Configuration(_))
        ));
        assert!(factory.list_configurations().await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_initialization_timeout() {
        let script = Arc::new(Script::default());
        script.hang_init.store(true, Ordering::SeqCst);
        let factory = factory(&script);
        let err = factory.create_adapter("acme", telegram()).await.err().expect("expected error");
        assert!(matches!(err, ChannelError::Timeout(d) if d == Duration::from_secs(5)));
        assert_eq!(script.builds.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_unhealthy_poll_deactivates_without_removing() {
        let script = Arc::new(Script::default());
        let factory = factory(&script);
        factory.create_adapter("acme", telegram()).await.unwrap();

        script.unhealthy.store(true, Ordering::SeqCst);
        factory.run_health_checks().await;
        let record = factory
            .get_configuration(ChannelType::Telegram, "acme")
            .await
            .unwrap();
        assert!(!record.is_active);
        assert_eq!(record.last_health.unwrap().status, HealthStatus::Unhealthy);
        assert!(factory.get_adapter(ChannelType::Telegram, "acme").await.is_some());

        script.unhealthy.store(false, Ordering::SeqCst);
        factory.run_health_checks().await;
        let record = factory
            .get_configuration(ChannelType::Telegram, "acme")
            .await
            .unwrap();
        assert!(record.is_active);
    }

    #[tokio::test]
    async fn test_restart_stops_old_before_new_initializes() {
        let script = Arc::new(Script::default());
        let factory = factory(&script);
        factory.create_adapter("acme", telegram()).await.unwrap();
        factory
            .restart_adapter(ChannelType::Telegram, "acme")
            .await
            .unwrap();

        assert_eq!(
            *script.log.lock().unwrap(),
            vec!["init acme#1", "shutdown acme#1", "init acme#2"]
        );
        assert!(matches!(
            factory.restart_adapter(ChannelType::Slack, "acme").await,
            Err(ChannelError::Configuration(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_restart_stops_adapter_created_in_the_gap() {
        let script = Arc::new(Script::default());
        let factory = Arc::new(factory(&script));
        factory.create_adapter("acme", telegram()).await.unwrap();

        script.slow_build.store(2, Ordering::SeqCst);
        let restarting = {
            let factory = Arc::clone(&factory);
            tokio::spawn(async move { factory.restart_adapter(ChannelType::Telegram, "acme").await })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;

        // The old adapter is gone and the new one is still initializing.
        let intruder = factory.create_adapter("acme", telegram()).await.unwrap();
        assert_eq!(intruder.channel_id(), "acme#3");

        let replacement = restarting.await.unwrap().unwrap();
        assert_eq!(replacement.channel_id(), "acme#2");
        assert_eq!(intruder.state(), AdapterState::Uninitialized);

        let live = factory.get_adapter(ChannelType::Telegram, "acme").await.unwrap();
        assert!(Arc::ptr_eq(&live, &replacement));
        assert!(script.log.lock().unwrap().contains(&"shutdown acme#3".to_string()));
        let record = factory
            .get_configuration(ChannelType::Telegram, "acme")
            .await
            .unwrap();
        assert_eq!(record.metadata["channelId"], "acme#2");
    }

    #[tokio::test]
    async fn test_remove_adapter() {
        let script = Arc::new(Script::default());
        let factory = factory(&script);
        factory.create_adapter("acme", telegram()).await.unwrap();
        assert!(factory.remove_adapter(ChannelType::Telegram, "acme").await);
        assert!(!factory.remove_adapter(ChannelType::Telegram, "acme").await);
        assert!(factory.list_configurations().await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_all_is_best_effort() {
        let script = Arc::new(Script::default());
        let factory = factory(&script);
        factory.create_adapter("acme", telegram()).await.unwrap();
        factory.create_adapter("globex", telegram()).await.unwrap();

        script.hang_shutdown.store(true, Ordering::SeqCst);
        assert_eq!(factory.shutdown_all_adapters().await, 2);
        assert!(factory.get_adapter(ChannelType::Telegram, "acme").await.is_none());
        assert!(
            factory
                .list_configurations()
                .await
                .iter()
                .all(|record| !record.is_active)
        );
    }
}

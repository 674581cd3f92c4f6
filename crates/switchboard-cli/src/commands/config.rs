//! Config check/init commands.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use rand::Rng;
use rand::distributions::Alphanumeric;
use switchboard_core::config::{ChannelSettings, Config, TenantConfig, WebChatSettings};
use switchboard_core::secrets::ApiKey;

use crate::ui;

/// Resolve `--config` or fall back to the default location.
pub fn config_path(explicit: Option<PathBuf>) -> PathBuf {
    explicit.unwrap_or_else(Config::default_path)
}

/// Load and validate a config file, printing a summary.
pub fn run_check(path: &Path) -> Result<Config> {
    if !path.exists() {
        bail!(
            "Config file not found: {} (run 'switchboard config init')",
            path.display()
        );
    }
    let config = Config::load(path).with_context(|| format!("Invalid config {}", path.display()))?;

    ui::success(&format!("{} is valid", path.display()));
    ui::kv("Address", &config.gateway.bind_address());
    ui::kv("Tenants", &config.tenants.len().to_string());
    for (tenant, tenant_config) in &config.tenants {
        let channels: Vec<String> = tenant_config
            .channels
            .iter()
            .map(|settings| settings.channel_type().to_string())
            .collect();
        ui::kv(&format!("  {tenant}"), &channels.join(", "));
    }
    if config.tenants.is_empty() {
        ui::warning("No tenants configured; the gateway will not route any traffic");
    }
    Ok(config)
}

/// Write a starter config with one browser chat tenant.
pub fn run_init(path: &Path, force: bool) -> Result<()> {
    if path.exists() && !force {
        bail!(
            "{} already exists, use --force to overwrite",
            path.display()
        );
    }

    let config = starter_config();
    config
        .save(path)
        .with_context(|| format!("Failed to write {}", path.display()))?;

    ui::success(&format!("Wrote {}", path.display()));
    ui::info("Add platform channels under tenants.default.channels, then run 'switchboard serve'");
    Ok(())
}

fn starter_config() -> Config {
    let secret: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(48)
        .map(char::from)
        .collect();

    let mut config = Config::default();
    config.tenants.insert(
        "default".to_string(),
        TenantConfig {
            channels: vec![ChannelSettings::WebChat(WebChatSettings {
                jwt_secret: ApiKey::new(secret),
                issuer: None,
            })],
        },
    );
    config
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use switchboard_core::types::ChannelType;

    #[test]
    fn test_init_then_check() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("switchboard.json");

        run_init(&path, false).unwrap();
        let config = run_check(&path).unwrap();

        let channels = &config.tenants["default"].channels;
        assert_eq!(channels.len(), 1);
        assert_eq!(channels[0].channel_type(), ChannelType::WebChat);
    }

    #[test]
    fn test_init_refuses_to_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("switchboard.json");
        std::fs::write(&path, "{}").unwrap();

        assert!(run_init(&path, false).is_err());
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "{}");

        run_init(&path, true).unwrap();
        assert!(run_check(&path).is_ok());
    }

    #[test]
    fn test_check_rejects_bad_files() {
        let dir = tempfile::tempdir().unwrap();
        assert!(run_check(&dir.path().join("missing.json")).is_err());

        let path = dir.path().join("switchboard.json");
        std::fs::write(&path, "{ gateway: { port: 0 } }").unwrap();
        let err = run_check(&path).unwrap_err();
        assert!(format!("{err:#}").contains("port"));
    }
}

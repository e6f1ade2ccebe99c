//! Message Manager Configuration Module
//!
//! Provides configuration loading for the message manager.
//! Supports loading from TOML files with environment-specific overrides.

use anyhow::{ensure, Context, Result};
use config_crate::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::defaults;

/// Main message manager configuration structure
#[derive(Debug, Deserialize, Serialize, Clone, Default, PartialEq)]
#[serde(default)]
pub struct MessageManagerConfig {
    /// Subscriber settings
    pub logging: LoggingConfig,

    /// Pipe and handshake timing
    pub transport: TransportConfig,

    /// Script loading
    pub scripts: ScriptsConfig,

    /// Memory reporting
    pub reporter: ReporterConfig,
}

/// Logging settings
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    /// Filter directive, overridden by `RUST_LOG` when set
    pub level: String,
    pub json: bool,
    pub ansi: bool,
}

/// Transport settings
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default)]
pub struct TransportConfig {
    /// 0 waits forever
    pub sync_reply_timeout_ms: u64,
    pub handshake_timeout_ms: u64,
    pub pump_interval_ms: u64,
}

/// Script loader settings
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default)]
pub struct ScriptsConfig {
    pub cache_enabled: bool,

    /// Root for relative `file:` script URLs
    pub base_dir: Option<PathBuf>,
}

/// Memory reporter settings
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default)]
pub struct ReporterConfig {
    pub suspect_referent_count: usize,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: defaults::logging::LEVEL.to_string(),
            json: false,
            ansi: true,
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            sync_reply_timeout_ms: defaults::transport::SYNC_REPLY_TIMEOUT_MS,
            handshake_timeout_ms: defaults::transport::HANDSHAKE_TIMEOUT_MS,
            pump_interval_ms: defaults::transport::PUMP_INTERVAL_MS,
        }
    }
}

impl Default for ScriptsConfig {
    fn default() -> Self {
        Self {
            cache_enabled: defaults::scripts::CACHE_ENABLED,
            base_dir: None,
        }
    }
}

impl Default for ReporterConfig {
    fn default() -> Self {
        Self {
            suspect_referent_count: defaults::reporter::SUSPECT_REFERENT_COUNT,
        }
    }
}

impl TransportConfig {
    /// `None` means block until the reply arrives
    pub fn sync_reply_timeout(&self) -> Option<Duration> {
        match self.sync_reply_timeout_ms {
            0 => None,
            ms => Some(Duration::from_millis(ms)),
        }
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn pump_interval(&self) -> Duration {
        Duration::from_millis(self.pump_interval_ms)
    }
}

impl MessageManagerConfig {
    /// Load configuration from files with environment overrides
    ///
    /// Environment overlays are looked up in an `environments/` directory
    /// next to the base file. Variables use the `MSGMGR_` prefix and `__`
    /// between section and field, e.g. `MSGMGR_TRANSPORT__PUMP_INTERVAL_MS`.
    pub fn load(base_path: Option<&Path>, environment: Option<&str>) -> Result<Self> {
        let base = base_path.unwrap_or(Path::new(defaults::CONFIG_PATH));

        let mut builder = Config::builder().add_source(File::from(base).required(true));

        // Add environment-specific overrides if specified
        if let Some(env) = environment {
            let env_file = base
                .parent()
                .unwrap_or(Path::new("."))
                .join("environments")
                .join(format!("{}.toml", env));

            if env_file.exists() {
                info!("Loading environment config: {:?}", env_file);
                builder = builder.add_source(File::from(env_file));
            } else {
                warn!("Environment config not found: {:?}", env_file);
            }
        }

        builder = builder.add_source(
            Environment::with_prefix(defaults::ENV_PREFIX)
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let config = builder.build().context("Failed to build configuration")?;

        let mut loaded: Self = config
            .try_deserialize()
            .context("Failed to deserialize configuration")?;
        loaded.expand_env_vars()?;
        loaded.validate()?;

        debug!(?loaded, "Message manager configuration loaded");
        Ok(loaded)
    }

    /// Parse a TOML document without touching the filesystem or environment
    pub fn from_toml_str(source: &str) -> Result<Self> {
        let mut parsed: Self = toml::from_str(source).context("Failed to parse TOML configuration")?;
        parsed.expand_env_vars()?;
        parsed.validate()?;
        Ok(parsed)
    }

    /// Expand environment variables in path values
    pub fn expand_env_vars(&mut self) -> Result<()> {
        if let Some(dir) = &self.scripts.base_dir {
            let raw = dir.to_string_lossy();
            let expanded =
                shellexpand::env(raw.as_ref()).context("Failed to expand script base directory")?;
            self.scripts.base_dir = Some(PathBuf::from(expanded.as_ref()));
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(
            self.transport.pump_interval_ms > 0,
            "transport.pump_interval_ms must be positive"
        );
        ensure!(
            self.reporter.suspect_referent_count > 0,
            "reporter.suspect_referent_count must be positive"
        );
        Ok(())
    }
}

/// Convenience function to load configuration from the default location
pub fn load_config(environment: Option<&str>) -> Result<MessageManagerConfig> {
    MessageManagerConfig::load(None, environment)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn test_load_base_config() {
        let dir = tempdir().unwrap();
        let config_path = dir.path().join("message_manager.toml");

        let config_content = r#"
[logging]
level = "debug"
json = true

[transport]
sync_reply_timeout_ms = 250

[reporter]
suspect_referent_count = 12
"#;

        fs::write(&config_path, config_content).unwrap();

        let config = MessageManagerConfig::load(Some(&config_path), None).unwrap();

        assert_eq!(config.logging.level, "debug");
        assert!(config.logging.json);
        assert_eq!(
            config.transport.sync_reply_timeout(),
            Some(Duration::from_millis(250))
        );
        assert_eq!(
            config.transport.handshake_timeout_ms,
            defaults::transport::HANDSHAKE_TIMEOUT_MS
        );
        assert_eq!(config.reporter.suspect_referent_count, 12);
        assert!(config.scripts.cache_enabled);
    }

    #[test]
    fn test_environment_override() {
        let dir = tempdir().unwrap();
        let config_path = dir.path().join("message_manager.toml");
        fs::write(&config_path, "[scripts]\ncache_enabled = true\n").unwrap();

        let env_dir = dir.path().join("environments");
        fs::create_dir(&env_dir).unwrap();
        fs::write(
            env_dir.join("test.toml"),
            "[scripts]\ncache_enabled = false\n[transport]\npump_interval_ms = 3\n",
        )
        .unwrap();

        let config = MessageManagerConfig::load(Some(&config_path), Some("test")).unwrap();
        assert!(!config.scripts.cache_enabled);
        assert_eq!(config.transport.pump_interval(), Duration::from_millis(3));

        // A missing overlay is tolerated
        let config = MessageManagerConfig::load(Some(&config_path), Some("absent")).unwrap();
        assert!(config.scripts.cache_enabled);
    }

    #[test]
    fn test_missing_base_file_fails() {
        let dir = tempdir().unwrap();
        let missing = dir.path().join("nope.toml");
        assert!(MessageManagerConfig::load(Some(&missing), None).is_err());
    }

    #[test]
    fn test_from_toml_str_defaults_and_validation() {
        let config = MessageManagerConfig::from_toml_str("").unwrap();
        assert_eq!(config, MessageManagerConfig::default());
        assert_eq!(config.transport.sync_reply_timeout(), None);

        let err = MessageManagerConfig::from_toml_str("[reporter]\nsuspect_referent_count = 0\n")
            .unwrap_err();
        assert!(err.to_string().contains("suspect_referent_count"));
    }
}

//! Bridge configuration management

use crate::timing::Timings;
use anyhow::{Context, Result, anyhow};
use common::DeviceSelector;
use common::usb_types::{ICLICKER_PRODUCT_ID, ICLICKER_VENDOR_ID};
use protocol::{Frequency, PollType};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// System-wide configuration file, tried after the per-user one
const SYSTEM_CONFIG_PATH: &str = "/etc/iclicker-bridge/bridge.toml";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BridgeConfig {
    #[serde(default)]
    pub bridge: BridgeSettings,
    #[serde(default)]
    pub usb: UsbSettings,
    #[serde(default)]
    pub timing: TimingSettings,
    #[serde(default)]
    pub server: ServerSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeSettings {
    #[serde(default = "BridgeSettings::default_log_level")]
    pub log_level: String,
    /// Poll type for the first poll (alpha, numeric, alphanumeric)
    #[serde(default)]
    pub poll_type: PollType,
    /// Base station frequency as two letters a-d, e.g. "aa"
    #[serde(default)]
    pub frequency: Frequency,
}

impl Default for BridgeSettings {
    fn default() -> Self {
        Self {
            log_level: Self::default_log_level(),
            poll_type: PollType::default(),
            frequency: Frequency::default(),
        }
    }
}

impl BridgeSettings {
    fn default_log_level() -> String {
        "info".to_string()
    }
}

/// Which USB device is the base station
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsbSettings {
    #[serde(default = "UsbSettings::default_vendor_id")]
    pub vendor_id: u16,
    #[serde(default = "UsbSettings::default_product_id")]
    pub product_id: u16,
}

impl Default for UsbSettings {
    fn default() -> Self {
        Self {
            vendor_id: Self::default_vendor_id(),
            product_id: Self::default_product_id(),
        }
    }
}

impl UsbSettings {
    fn default_vendor_id() -> u16 {
        ICLICKER_VENDOR_ID
    }

    fn default_product_id() -> u16 {
        ICLICKER_PRODUCT_ID
    }
}

/// Device pacing, all in milliseconds
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimingSettings {
    #[serde(default = "TimingSettings::default_settle")]
    pub settle: u64,
    #[serde(default = "TimingSettings::default_display_settle")]
    pub display_settle: u64,
    #[serde(default = "TimingSettings::default_read_timeout")]
    pub read_timeout: u64,
    #[serde(default = "TimingSettings::default_idle_sleep")]
    pub idle_sleep: u64,
    #[serde(default = "TimingSettings::default_ack_timeout")]
    pub ack_timeout: u64,
    #[serde(default = "TimingSettings::default_drain_timeout")]
    pub drain_timeout: u64,
    #[serde(default = "TimingSettings::default_refresh_interval")]
    pub refresh_interval: u64,
    #[serde(default = "TimingSettings::default_restart_backoff")]
    pub restart_backoff: u64,
}

impl Default for TimingSettings {
    fn default() -> Self {
        Self {
            settle: Self::default_settle(),
            display_settle: Self::default_display_settle(),
            read_timeout: Self::default_read_timeout(),
            idle_sleep: Self::default_idle_sleep(),
            ack_timeout: Self::default_ack_timeout(),
            drain_timeout: Self::default_drain_timeout(),
            refresh_interval: Self::default_refresh_interval(),
            restart_backoff: Self::default_restart_backoff(),
        }
    }
}

impl TimingSettings {
    fn default_settle() -> u64 {
        200
    }

    fn default_display_settle() -> u64 {
        50
    }

    fn default_read_timeout() -> u64 {
        50
    }

    fn default_idle_sleep() -> u64 {
        10
    }

    fn default_ack_timeout() -> u64 {
        100
    }

    fn default_drain_timeout() -> u64 {
        100
    }

    fn default_refresh_interval() -> u64 {
        1000 // 1 second
    }

    fn default_restart_backoff() -> u64 {
        1000
    }
}

/// Meteor connection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSettings {
    #[serde(default = "ServerSettings::default_reconnect_initial")]
    pub reconnect_initial_ms: u64,
    #[serde(default = "ServerSettings::default_reconnect_max")]
    pub reconnect_max_ms: u64,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            reconnect_initial_ms: Self::default_reconnect_initial(),
            reconnect_max_ms: Self::default_reconnect_max(),
        }
    }
}

impl ServerSettings {
    fn default_reconnect_initial() -> u64 {
        1000 // Start at 1 second
    }

    fn default_reconnect_max() -> u64 {
        30_000 // Max 30 seconds
    }
}

impl BridgeConfig {
    /// Load configuration from the specified path
    ///
    /// Without a path, the per-user file and then the system file are tried.
    pub fn load(path: Option<PathBuf>) -> Result<Self> {
        let config_path = if let Some(p) = path {
            p
        } else {
            let candidates = vec![Self::default_path(), PathBuf::from(SYSTEM_CONFIG_PATH)];

            candidates
                .into_iter()
                .find(|p| p.exists())
                .ok_or_else(|| anyhow!("No configuration file found, using defaults"))?
        };

        let content = fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

        let config: BridgeConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", config_path.display()))?;

        config.validate()?;

        tracing::info!("Loaded configuration from: {}", config_path.display());
        Ok(config)
    }

    /// Load configuration or return defaults if not found
    pub fn load_or_default() -> Self {
        match Self::load(None) {
            Ok(config) => config,
            Err(e) => {
                tracing::debug!("{}, using defaults", e);
                Self::default()
            }
        }
    }

    /// Save configuration to the specified path
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize configuration")?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        tracing::info!("Saved configuration to: {}", path.display());
        Ok(())
    }

    /// Get the default configuration file path
    pub fn default_path() -> PathBuf {
        if let Some(config_dir) = dirs::config_dir() {
            config_dir.join("iclicker-bridge").join("bridge.toml")
        } else {
            PathBuf::from(".config/iclicker-bridge/bridge.toml")
        }
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.bridge.log_level.as_str()) {
            return Err(anyhow!(
                "Invalid log level '{}', must be one of: {}",
                self.bridge.log_level,
                valid_levels.join(", ")
            ));
        }

        if self.timing.refresh_interval == 0 {
            return Err(anyhow!("timing.refresh_interval must be greater than 0"));
        }

        if self.server.reconnect_initial_ms == 0
            || self.server.reconnect_max_ms < self.server.reconnect_initial_ms
        {
            return Err(anyhow!(
                "Invalid reconnect backoff {}ms..{}ms",
                self.server.reconnect_initial_ms,
                self.server.reconnect_max_ms
            ));
        }

        Ok(())
    }

    pub fn selector(&self) -> DeviceSelector {
        DeviceSelector {
            vendor_id: self.usb.vendor_id,
            product_id: self.usb.product_id,
        }
    }

    pub fn timings(&self) -> Timings {
        let t = &self.timing;
        Timings {
            settle: Duration::from_millis(t.settle),
            display_settle: Duration::from_millis(t.display_settle),
            read_timeout: Duration::from_millis(t.read_timeout),
            idle_sleep: Duration::from_millis(t.idle_sleep),
            ack_timeout: Duration::from_millis(t.ack_timeout),
            drain_timeout: Duration::from_millis(t.drain_timeout),
            refresh_interval: Duration::from_millis(t.refresh_interval),
            restart_backoff: Duration::from_millis(t.restart_backoff),
        }
    }

    pub fn reconnect_backoff(&self) -> (Duration, Duration) {
        (
            Duration::from_millis(self.server.reconnect_initial_ms),
            Duration::from_millis(self.server.reconnect_max_ms),
        )
    }
}

/// Expand `~` in a user supplied path
pub fn expand_path(path: &Path) -> PathBuf {
    PathBuf::from(shellexpand::tilde(&path.to_string_lossy()).as_ref())
}

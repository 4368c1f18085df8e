//! Host configuration management

use crate::usb::TransferKind;
use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Invalid driver or profile settings
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid device profile: {0}")]
    InvalidProfile(String),

    #[error("Invalid driver setting: {0}")]
    InvalidSetting(String),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HostConfig {
    #[serde(default)]
    pub host: HostSettings,
    /// Slot table and poll loop tuning
    #[serde(default)]
    pub driver: DriverSettings,
    /// Which interface/endpoint carries the MIDI stream
    #[serde(default)]
    pub profile: DeviceProfile,
    /// Note channel towards consumers
    #[serde(default)]
    pub sink: SinkSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostSettings {
    pub log_level: String,
}

impl Default for HostSettings {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
        }
    }
}

/// What to do when a host call that should never fail does fail
/// (open after discovery, close of a live handle)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FatalPolicy {
    /// Stop the poll loop with an error
    Abort,
    /// Park the affected slot and keep going
    #[default]
    Quarantine,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DriverSettings {
    /// Number of device slots
    #[serde(default = "DriverSettings::default_slot_capacity")]
    pub slot_capacity: usize,
    /// Discovery period in milliseconds
    #[serde(default = "DriverSettings::default_poll_interval")]
    pub poll_interval_ms: u64,
    /// Maximum wait when pumping host events, in milliseconds
    #[serde(default = "DriverSettings::default_pump_timeout")]
    pub event_pump_timeout_ms: u64,
    #[serde(default)]
    pub fatal_policy: FatalPolicy,
    /// Close/Open cycles attempted after a failed claim (0 = never retry)
    #[serde(default)]
    pub claim_retry_limit: u32,
}

impl Default for DriverSettings {
    fn default() -> Self {
        Self {
            slot_capacity: Self::default_slot_capacity(),
            poll_interval_ms: Self::default_poll_interval(),
            event_pump_timeout_ms: Self::default_pump_timeout(),
            fatal_policy: FatalPolicy::default(),
            claim_retry_limit: 0,
        }
    }
}

impl DriverSettings {
    /// Largest table that can hold every address on one bus
    pub const MAX_SLOTS: usize = 127;

    fn default_slot_capacity() -> usize {
        8
    }

    fn default_poll_interval() -> u64 {
        100
    }

    fn default_pump_timeout() -> u64 {
        10
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn event_pump_timeout(&self) -> Duration {
        Duration::from_millis(self.event_pump_timeout_ms)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.slot_capacity == 0 || self.slot_capacity > Self::MAX_SLOTS {
            return Err(ConfigError::InvalidSetting(format!(
                "slot_capacity {} must be in 1..={}",
                self.slot_capacity,
                Self::MAX_SLOTS
            )));
        }
        if self.poll_interval_ms == 0 {
            return Err(ConfigError::InvalidSetting(
                "poll_interval_ms must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// Streaming interface of the target device
///
/// Defaults match a Yamaha keyboard whose USB-MIDI streaming interface is
/// number 3 with a 64-byte bulk IN endpoint at 0x82.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceProfile {
    #[serde(default = "DeviceProfile::default_interface")]
    pub interface: u8,
    #[serde(default = "DeviceProfile::default_endpoint")]
    pub endpoint: u8,
    #[serde(default = "DeviceProfile::default_max_packet_size")]
    pub max_packet_size: usize,
    #[serde(default)]
    pub transfer_kind: TransferKind,
    /// Restrict discovery to one bus (None = all buses)
    #[serde(default)]
    pub bus: Option<u8>,
    /// Devices discovery may open, as "0xVID:0xPID" with `*` wildcards
    /// (empty = every device on the bus)
    #[serde(default = "DeviceProfile::default_filters")]
    pub filters: Vec<String>,
}

impl Default for DeviceProfile {
    fn default() -> Self {
        Self {
            interface: Self::default_interface(),
            endpoint: Self::default_endpoint(),
            max_packet_size: Self::default_max_packet_size(),
            transfer_kind: TransferKind::default(),
            bus: None,
            filters: Self::default_filters(),
        }
    }
}

impl DeviceProfile {
    fn default_interface() -> u8 {
        3
    }

    fn default_endpoint() -> u8 {
        0x82
    }

    fn default_max_packet_size() -> usize {
        64
    }

    /// Yamaha's vendor id, any product
    fn default_filters() -> Vec<String> {
        vec!["0x0499:*".to_string()]
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.endpoint & 0x80 == 0 {
            return Err(ConfigError::InvalidProfile(format!(
                "endpoint {:#04x} is not an IN endpoint",
                self.endpoint
            )));
        }
        if self.endpoint & 0x0F == 0 {
            return Err(ConfigError::InvalidProfile(
                "endpoint 0 cannot carry a stream".to_string(),
            ));
        }
        if self.max_packet_size == 0 || self.max_packet_size % protocol::PACKET_SIZE != 0 {
            return Err(ConfigError::InvalidProfile(format!(
                "max_packet_size {} must be a non-zero multiple of {}",
                self.max_packet_size,
                protocol::PACKET_SIZE
            )));
        }
        if self.max_packet_size > 1024 {
            return Err(ConfigError::InvalidProfile(format!(
                "max_packet_size {} exceeds 1024",
                self.max_packet_size
            )));
        }
        for filter in &self.filters {
            validate_filter(filter)?;
        }
        Ok(())
    }
}

/// Check a VID/PID pair against "0xVID:0xPID" filters
///
/// No filters allows every device. Filters are assumed validated.
pub fn check_filter(vendor_id: u16, product_id: u16, filters: &[String]) -> bool {
    if filters.is_empty() {
        return true;
    }

    filters.iter().any(|filter| {
        let Some((vid, pid)) = filter.split_once(':') else {
            return false;
        };
        filter_part_matches(vid, vendor_id) && filter_part_matches(pid, product_id)
    })
}

fn filter_part_matches(part: &str, id: u16) -> bool {
    if part == "*" {
        return true;
    }
    let hex = part.trim_start_matches("0x").trim_start_matches("0X");
    u16::from_str_radix(hex, 16).is_ok_and(|v| v == id)
}

/// Validate a device filter pattern (VID:PID)
fn validate_filter(filter: &str) -> Result<(), ConfigError> {
    let parts: Vec<&str> = filter.split(':').collect();
    if parts.len() != 2 {
        return Err(ConfigError::InvalidProfile(format!(
            "invalid filter '{}', expected VID:PID (e.g. '0x0499:0x1617' or '0x0499:*')",
            filter
        )));
    }

    for (part, name) in parts.into_iter().zip(["VID", "PID"]) {
        if part != "*" {
            validate_hex_id(part, name)?;
        }
    }
    Ok(())
}

fn validate_hex_id(id: &str, name: &str) -> Result<(), ConfigError> {
    let Some(hex) = id.strip_prefix("0x").or_else(|| id.strip_prefix("0X")) else {
        return Err(ConfigError::InvalidProfile(format!(
            "invalid {} '{}', must start with '0x'",
            name, id
        )));
    };
    if hex.is_empty() || hex.len() > 4 {
        return Err(ConfigError::InvalidProfile(format!(
            "invalid {} '{}', hex part must be 1-4 digits",
            name, id
        )));
    }
    u16::from_str_radix(hex, 16).map_err(|_| {
        ConfigError::InvalidProfile(format!("invalid {} '{}', not a hex number", name, id))
    })?;
    Ok(())
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SinkSettings {
    /// Notes buffered before new ones are dropped
    #[serde(default = "SinkSettings::default_capacity")]
    pub capacity: usize,
}

impl Default for SinkSettings {
    fn default() -> Self {
        Self {
            capacity: Self::default_capacity(),
        }
    }
}

impl SinkSettings {
    fn default_capacity() -> usize {
        10
    }
}

impl HostConfig {
    /// Load configuration from the specified path
    pub fn load(path: Option<PathBuf>) -> Result<Self> {
        let config_path = if let Some(p) = path {
            p
        } else {
            // Try standard locations in order
            let candidates = vec![
                Self::default_path(),
                PathBuf::from("/etc/usb-midi-host/host.toml"),
            ];

            candidates
                .into_iter()
                .find(|p| p.exists())
                .ok_or_else(|| anyhow!("No configuration file found, using defaults"))?
        };

        let content = fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

        let config: HostConfig = toml::from_str(&content)
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
                tracing::warn!("Failed to load config: {}, using defaults", e);
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
            config_dir.join("usb-midi-host").join("host.toml")
        } else {
            PathBuf::from(".config/usb-midi-host/host.toml")
        }
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.host.log_level.as_str()) {
            return Err(anyhow!(
                "Invalid log level '{}', must be one of: {}",
                self.host.log_level,
                valid_levels.join(", ")
            ));
        }

        self.driver.validate()?;
        self.profile.validate()?;

        if self.sink.capacity == 0 {
            return Err(anyhow!("sink capacity must be greater than 0"));
        }

        Ok(())
    }
}

/// Expand a leading `~` in a user-supplied config path
pub fn expand_path(path: &str) -> PathBuf {
    PathBuf::from(shellexpand::tilde(path).as_ref())
}

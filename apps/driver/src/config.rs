//! Driver configuration.
//!
//! Stored as TOML at `$ATVLINK_CONFIG`, or `~/.config/atvlink/driver.toml`
//! when the variable is unset. A default file is written on first start.
//! Durations are given in milliseconds.

use std::path::{Path, PathBuf};
use std::time::Duration;

use atvlink_connection::{DriverSettings, PairingSettings, ReconnectConfig};
use atvlink_protocol::ProtocolKind;
use serde::{Deserialize, Serialize};

const CONFIG_ENV: &str = "ATVLINK_CONFIG";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub bridge: BridgeSection,
    #[serde(default)]
    pub storage: StorageSection,
    #[serde(default)]
    pub reconnect: ReconnectSection,
    #[serde(default)]
    pub dispatch: DispatchSection,
    #[serde(default)]
    pub pairing: PairingSection,
    #[serde(default)]
    pub discovery: DiscoverySection,
    #[serde(default)]
    pub sound_output: SoundOutputSection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeSection {
    /// WebSocket URL of the protocol helper.
    #[serde(default = "default_bridge_url")]
    pub url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageSection {
    /// Directory holding `devices.json`.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconnectSection {
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_backoff_factor")]
    pub backoff_factor: f64,
    #[serde(default = "default_jitter")]
    pub jitter: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchSection {
    #[serde(default = "default_command_timeout_ms")]
    pub command_timeout_ms: u64,
    /// Consecutive command timeouts that force a reconnect.
    #[serde(default = "default_timeouts_before_reconnect")]
    pub timeouts_before_reconnect: u32,
    #[serde(default = "default_wake_grace_ms")]
    pub wake_grace_ms: u64,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_power_on_connect_timeout_ms")]
    pub power_on_connect_timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PairingSection {
    /// Protocols to pair, in order.
    #[serde(default = "default_protocols")]
    pub protocols: Vec<ProtocolKind>,
    #[serde(default = "default_max_pin_attempts")]
    pub max_pin_attempts: u32,
    #[serde(default = "default_pin_timeout_ms")]
    pub pin_timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoverySection {
    #[serde(default = "default_discovery_timeout_ms")]
    pub timeout_ms: u64,
    /// Failed connects after which a device's address is looked up again.
    #[serde(default = "default_rediscover_after")]
    pub rediscover_after: u32,
    /// Report speakers and other non-TV receivers too.
    #[serde(default)]
    pub all_models: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SoundOutputSection {
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_bridge_url() -> String {
    "ws://127.0.0.1:8765".into()
}

fn default_data_dir() -> PathBuf {
    config_dir()
}

fn default_initial_delay_ms() -> u64 {
    2_000
}

fn default_max_delay_ms() -> u64 {
    30_000
}

fn default_backoff_factor() -> f64 {
    2.0
}

fn default_jitter() -> f64 {
    0.2
}

fn default_command_timeout_ms() -> u64 {
    5_000
}

fn default_timeouts_before_reconnect() -> u32 {
    2
}

fn default_wake_grace_ms() -> u64 {
    3_000
}

fn default_connect_timeout_ms() -> u64 {
    15_000
}

fn default_power_on_connect_timeout_ms() -> u64 {
    20_000
}

fn default_protocols() -> Vec<ProtocolKind> {
    vec![ProtocolKind::AirPlay, ProtocolKind::Companion]
}

fn default_max_pin_attempts() -> u32 {
    3
}

fn default_pin_timeout_ms() -> u64 {
    120_000
}

fn default_discovery_timeout_ms() -> u64 {
    5_000
}

fn default_rediscover_after() -> u32 {
    3
}

fn default_true() -> bool {
    true
}

impl Default for BridgeSection {
    fn default() -> Self {
        Self {
            url: default_bridge_url(),
        }
    }
}

impl Default for StorageSection {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
        }
    }
}

impl Default for ReconnectSection {
    fn default() -> Self {
        Self {
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            backoff_factor: default_backoff_factor(),
            jitter: default_jitter(),
        }
    }
}

impl Default for DispatchSection {
    fn default() -> Self {
        Self {
            command_timeout_ms: default_command_timeout_ms(),
            timeouts_before_reconnect: default_timeouts_before_reconnect(),
            wake_grace_ms: default_wake_grace_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
            power_on_connect_timeout_ms: default_power_on_connect_timeout_ms(),
        }
    }
}

impl Default for PairingSection {
    fn default() -> Self {
        Self {
            protocols: default_protocols(),
            max_pin_attempts: default_max_pin_attempts(),
            pin_timeout_ms: default_pin_timeout_ms(),
        }
    }
}

impl Default for DiscoverySection {
    fn default() -> Self {
        Self {
            timeout_ms: default_discovery_timeout_ms(),
            rediscover_after: default_rediscover_after(),
            all_models: false,
        }
    }
}

impl Default for SoundOutputSection {
    fn default() -> Self {
        Self {
            enabled: default_true(),
        }
    }
}

impl Config {
    /// Loads configuration from disk, or creates a default if not found.
    pub fn load() -> anyhow::Result<Self> {
        Self::load_from(&config_path())
    }

    pub fn load_from(path: &Path) -> anyhow::Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            Ok(toml::from_str(&content)?)
        } else {
            let config = Config::default();
            config.save_to(path)?;
            Ok(config)
        }
    }

    pub fn save_to(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, toml::to_string_pretty(self)?)?;
        tracing::debug!(path = %path.display(), "configuration saved");
        Ok(())
    }

    /// Path of the device store.
    pub fn devices_path(&self) -> PathBuf {
        self.storage.data_dir.join("devices.json")
    }

    /// Session thresholds for the device registry.
    pub fn to_settings(&self) -> DriverSettings {
        let ms = Duration::from_millis;
        DriverSettings {
            reconnect: ReconnectConfig {
                initial_delay: ms(self.reconnect.initial_delay_ms),
                max_delay: ms(self.reconnect.max_delay_ms),
                backoff_factor: self.reconnect.backoff_factor,
                jitter: self.reconnect.jitter,
            },
            command_timeout: ms(self.dispatch.command_timeout_ms),
            timeouts_before_reconnect: self.dispatch.timeouts_before_reconnect,
            wake_grace: ms(self.dispatch.wake_grace_ms),
            connect_timeout: ms(self.dispatch.connect_timeout_ms),
            discovery_timeout: ms(self.discovery.timeout_ms),
            rediscover_after: self.discovery.rediscover_after,
            power_on_connect_timeout: ms(self.dispatch.power_on_connect_timeout_ms),
            pairing: PairingSettings {
                protocols: self.pairing.protocols.clone(),
                max_pin_attempts: self.pairing.max_pin_attempts,
                pin_timeout: ms(self.pairing.pin_timeout_ms),
            },
            sound_output_enabled: self.sound_output.enabled,
            ..DriverSettings::default()
        }
    }
}

fn config_dir() -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        let appdata =
            std::env::var("APPDATA").unwrap_or_else(|_| "C:\\Users\\Default\\AppData".into());
        PathBuf::from(appdata).join("atvlink")
    }

    #[cfg(not(target_os = "windows"))]
    {
        let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".into());
        PathBuf::from(home).join(".config").join("atvlink")
    }
}

fn config_path() -> PathBuf {
    match std::env::var_os(CONFIG_ENV) {
        Some(path) if !path.is_empty() => PathBuf::from(path),
        _ => config_dir().join("driver.toml"),
    }
}

//! Bridge settings and their persistence
//!
//! Handles:
//! - MQTT broker settings and credentials
//! - Device hostname and publish interval
//! - Per-category sensor toggles
//! - TOML storage in the OS config directory
//!
//! Invalid values are clamped or defaulted here so the bridge always has a
//! runnable configuration.

use crate::error::{BridgeError, Result};
use crate::topics::SensorCategory;
use serde::{Deserialize, Deserializer, Serialize};
use std::path::PathBuf;
use tracing::{debug, info};

pub const DEFAULT_MQTT_PORT: u16 = 1883;
pub const DEFAULT_PUBLISH_INTERVAL_SECS: u64 = 30;
pub const MIN_PUBLISH_INTERVAL_SECS: u64 = 5;
pub const DEFAULT_HOSTNAME: &str = "steamdeck";
pub const PASSWORD_MASK: &str = "****";

const CONFIG_ENV_VAR: &str = "STEAMDECK_BRIDGE_CONFIG";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    #[serde(deserialize_with = "lenient_text")]
    pub mqtt_host: String,
    #[serde(deserialize_with = "lenient_port")]
    pub mqtt_port: u16,
    #[serde(deserialize_with = "lenient_text")]
    pub mqtt_username: String,
    #[serde(deserialize_with = "lenient_text")]
    pub mqtt_password: String,
    #[serde(deserialize_with = "lenient_text")]
    pub hostname: String,
    #[serde(deserialize_with = "lenient_interval")]
    pub publish_interval: u64,
    #[serde(deserialize_with = "lenient_sensors")]
    pub enabled_sensors: EnabledSensors,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EnabledSensors {
    #[serde(deserialize_with = "lenient_flag")]
    pub battery: bool,
    #[serde(deserialize_with = "lenient_flag")]
    pub disk: bool,
    #[serde(deserialize_with = "lenient_flag")]
    pub network: bool,
    #[serde(deserialize_with = "lenient_flag")]
    pub game: bool,
    #[serde(deserialize_with = "lenient_flag")]
    pub download: bool,
}

impl Default for EnabledSensors {
    fn default() -> Self {
        Self {
            battery: true,
            disk: true,
            network: true,
            game: true,
            download: true,
        }
    }
}

impl EnabledSensors {
    pub fn is_enabled(&self, category: SensorCategory) -> bool {
        match category {
            SensorCategory::Battery => self.battery,
            SensorCategory::Disk => self.disk,
            SensorCategory::Network => self.network,
            SensorCategory::Game => self.game,
            SensorCategory::Download => self.download,
        }
    }

    pub fn enabled(&self) -> impl Iterator<Item = SensorCategory> + '_ {
        SensorCategory::ALL
            .into_iter()
            .filter(move |c| self.is_enabled(*c))
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            mqtt_host: String::new(),
            mqtt_port: DEFAULT_MQTT_PORT,
            mqtt_username: String::new(),
            mqtt_password: String::new(),
            hostname: default_hostname(),
            publish_interval: DEFAULT_PUBLISH_INTERVAL_SECS,
            enabled_sensors: EnabledSensors::default(),
        }
    }
}

impl Settings {
    /// Parse settings coming from the UI layer. Never fails: a missing or
    /// wrong-typed field takes its default without affecting the others, then
    /// the whole struct is clamped. A payload that is not an object at all
    /// yields the defaults.
    pub fn from_json(value: serde_json::Value) -> Self {
        serde_json::from_value::<Settings>(value)
            .unwrap_or_else(|e| {
                debug!("settings payload unusable, using defaults: {}", e);
                Settings::default()
            })
            .normalized()
    }

    /// Clamp values into their valid ranges
    pub fn normalized(mut self) -> Self {
        if self.mqtt_port == 0 {
            self.mqtt_port = DEFAULT_MQTT_PORT;
        }
        if self.publish_interval < MIN_PUBLISH_INTERVAL_SECS {
            self.publish_interval = MIN_PUBLISH_INTERVAL_SECS;
        }
        self.mqtt_host = self.mqtt_host.trim().to_string();
        if self.hostname.trim().is_empty() {
            self.hostname = default_hostname();
        }
        self
    }

    pub fn publish_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.publish_interval.max(MIN_PUBLISH_INTERVAL_SECS))
    }

    pub fn has_broker(&self) -> bool {
        !self.mqtt_host.is_empty()
    }

    /// True when switching from `self` to `other` requires a new connection
    pub fn connection_differs(&self, other: &Settings) -> bool {
        self.mqtt_host != other.mqtt_host
            || self.mqtt_port != other.mqtt_port
            || self.mqtt_username != other.mqtt_username
            || self.mqtt_password != other.mqtt_password
            || self.hostname != other.hostname
    }

    /// Copy for the UI layer, password hidden
    pub fn masked(&self) -> Settings {
        let mut copy = self.clone();
        if !copy.mqtt_password.is_empty() {
            copy.mqtt_password = PASSWORD_MASK.to_string();
        }
        copy
    }

    /// A masked password coming back from the UI keeps the stored one
    pub fn unmask_password(mut self, current: &Settings) -> Settings {
        if self.mqtt_password == PASSWORD_MASK {
            self.mqtt_password = current.mqtt_password.clone();
        }
        self
    }
}

pub fn default_hostname() -> String {
    let name = gethostname::gethostname().to_string_lossy().trim().to_string();
    if name.is_empty() {
        DEFAULT_HOSTNAME.to_string()
    } else {
        name
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum Lenient {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Other(serde::de::IgnoredAny),
}

impl Lenient {
    fn as_i64(&self) -> Option<i64> {
        match self {
            Lenient::Int(v) => Some(*v),
            Lenient::Float(v) if v.is_finite() => Some(v.round() as i64),
            Lenient::Text(s) => s.trim().parse().ok(),
            _ => None,
        }
    }
}

fn lenient_text<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> std::result::Result<String, D::Error> {
    Ok(match Lenient::deserialize(deserializer)? {
        Lenient::Text(s) => s,
        _ => String::new(),
    })
}

/// Sensor toggles default to on
fn lenient_flag<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> std::result::Result<bool, D::Error> {
    Ok(match Lenient::deserialize(deserializer)? {
        Lenient::Bool(b) => b,
        Lenient::Int(v) => v != 0,
        Lenient::Text(s) => !matches!(
            s.trim().to_ascii_lowercase().as_str(),
            "false" | "0" | "no" | "off"
        ),
        _ => true,
    })
}

fn lenient_sensors<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> std::result::Result<EnabledSensors, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Table {
        Sensors(EnabledSensors),
        Other(serde::de::IgnoredAny),
    }

    Ok(match Table::deserialize(deserializer)? {
        Table::Sensors(sensors) => sensors,
        Table::Other(_) => EnabledSensors::default(),
    })
}

fn lenient_port<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<u16, D::Error> {
    let raw = Lenient::deserialize(deserializer)?;
    Ok(raw
        .as_i64()
        .and_then(|v| u16::try_from(v).ok())
        .filter(|v| *v != 0)
        .unwrap_or(DEFAULT_MQTT_PORT))
}

fn lenient_interval<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> std::result::Result<u64, D::Error> {
    let raw = Lenient::deserialize(deserializer)?;
    Ok(match raw.as_i64() {
        Some(v) if v >= MIN_PUBLISH_INTERVAL_SECS as i64 => v as u64,
        Some(_) => MIN_PUBLISH_INTERVAL_SECS,
        None => DEFAULT_PUBLISH_INTERVAL_SECS,
    })
}

/// External key-value store holding the settings
pub trait SettingsStore: Send + Sync {
    fn load(&self) -> Result<Settings>;
    fn save(&self, settings: &Settings) -> Result<()>;
}

/// Settings persisted as TOML
#[derive(Debug, Clone)]
pub struct TomlSettingsStore {
    path: PathBuf,
}

impl TomlSettingsStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// `$STEAMDECK_BRIDGE_CONFIG`, or the OS-specific config directory
    pub fn default_location() -> Result<Self> {
        if let Ok(path) = std::env::var(CONFIG_ENV_VAR) {
            return Ok(Self::new(path));
        }

        let mut path = dirs::config_dir()
            .ok_or_else(|| BridgeError::Settings("Could not find config directory".into()))?;
        path.push("steamdeck-bridge");
        path.push("settings.toml");
        Ok(Self::new(path))
    }

    pub fn path(&self) -> &std::path::Path {
        &self.path
    }
}

impl SettingsStore for TomlSettingsStore {
    fn load(&self) -> Result<Settings> {
        if !self.path.exists() {
            info!("No settings file at {:?}, using defaults", self.path);
            return Ok(Settings::default());
        }

        let content = std::fs::read_to_string(&self.path)?;
        let settings: Settings = toml::from_str(&content)
            .map_err(|e| BridgeError::Settings(format!("{:?}: {}", self.path, e)))?;
        info!("Settings loaded from {:?}", self.path);
        Ok(settings.normalized())
    }

    fn save(&self, settings: &Settings) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(settings)
            .map_err(|e| BridgeError::Settings(e.to_string()))?;
        std::fs::write(&self.path, content)?;
        info!("Settings saved to {:?}", self.path);
        Ok(())
    }
}

//! Home Assistant MQTT discovery documents
//!
//! One retained config document per entity, derived only from the settings
//! (hostname and enabled categories), so the same settings always produce
//! byte-identical documents. Every document shares the status topic as its
//! availability source.

use crate::config::{EnabledSensors, Settings};
use crate::topics::SensorCategory::{self, Battery, Disk, Download, Game, Network};
use crate::topics::{TopicLayout, PAYLOAD_OFFLINE, PAYLOAD_ONLINE};
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Component {
    Sensor,
    BinarySensor,
}

impl Component {
    pub fn as_str(self) -> &'static str {
        match self {
            Component::Sensor => "sensor",
            Component::BinarySensor => "binary_sensor",
        }
    }
}

/// Static description of one entity
#[derive(Debug, Clone, Copy)]
pub struct EntitySpec {
    pub category: SensorCategory,
    pub component: Component,
    pub object_id: &'static str,
    pub name: &'static str,
    pub field: &'static str,
    pub unit: Option<&'static str>,
    pub device_class: Option<&'static str>,
    pub state_class: Option<&'static str>,
    pub icon: Option<&'static str>,
}

const fn sensor(
    category: SensorCategory,
    object_id: &'static str,
    name: &'static str,
    field: &'static str,
    unit: Option<&'static str>,
    icon: Option<&'static str>,
) -> EntitySpec {
    EntitySpec {
        category,
        component: Component::Sensor,
        object_id,
        name,
        field,
        unit,
        device_class: None,
        state_class: None,
        icon,
    }
}

const fn binary(
    category: SensorCategory,
    object_id: &'static str,
    name: &'static str,
    field: &'static str,
    device_class: Option<&'static str>,
    icon: Option<&'static str>,
) -> EntitySpec {
    EntitySpec {
        category,
        component: Component::BinarySensor,
        object_id,
        name,
        field,
        unit: None,
        device_class,
        state_class: None,
        icon,
    }
}

pub const ENTITIES: &[EntitySpec] = &[
    EntitySpec {
        category: Battery,
        component: Component::Sensor,
        object_id: "battery_percent",
        name: "Battery",
        field: "percent",
        unit: Some("%"),
        device_class: Some("battery"),
        state_class: Some("measurement"),
        icon: None,
    },
    binary(Battery, "charging", "Charging", "charging", Some("battery_charging"), None),
    sensor(
        Battery,
        "battery_time_remaining",
        "Battery Time Remaining",
        "time_remaining_min",
        Some("min"),
        Some("mdi:battery-clock"),
    ),
    sensor(
        Disk,
        "disk_free_internal",
        "Internal Storage Free",
        "internal_free_gb",
        Some("GB"),
        Some("mdi:harddisk"),
    ),
    sensor(
        Disk,
        "disk_used_internal",
        "Internal Storage Used",
        "internal_percent_used",
        Some("%"),
        Some("mdi:harddisk"),
    ),
    sensor(Disk, "disk_free_sd", "SD Card Free", "sd_free_gb", Some("GB"), Some("mdi:sd")),
    binary(Disk, "sd_mounted", "SD Card Mounted", "sd_mounted", None, Some("mdi:sd")),
    sensor(Network, "ip_primary", "IP Address", "ip_primary", None, Some("mdi:ip-network")),
    sensor(Network, "ip_wifi", "WiFi IP", "ip_wifi", None, Some("mdi:wifi")),
    sensor(Network, "ip_ethernet", "Ethernet IP", "ip_ethernet", None, Some("mdi:ethernet")),
    sensor(Game, "current_game", "Current Game", "game_name", None, Some("mdi:gamepad-variant")),
    sensor(Game, "current_appid", "Current App ID", "app_id", None, Some("mdi:identifier")),
    binary(Game, "game_running", "Game Running", "is_running", None, Some("mdi:gamepad-variant")),
    binary(Download, "downloading", "Downloading", "downloading", None, Some("mdi:download")),
    sensor(
        Download,
        "download_progress",
        "Download Progress",
        "download_progress",
        Some("%"),
        Some("mdi:download"),
    ),
    sensor(
        Download,
        "download_rate",
        "Download Rate",
        "download_rate_mbps",
        Some("Mbps"),
        Some("mdi:speedometer"),
    ),
];

pub const STATUS_OBJECT_ID: &str = "status";

#[derive(Debug, Clone, Serialize, PartialEq)]
struct HaDeviceInfo {
    identifiers: Vec<String>,
    name: String,
    manufacturer: &'static str,
    model: &'static str,
    sw_version: &'static str,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
struct HaAvailability {
    topic: String,
    payload_available: &'static str,
    payload_not_available: &'static str,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
struct HaEntityConfig {
    name: String,
    unique_id: String,
    state_topic: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    value_template: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    unit_of_measurement: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    device_class: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    state_class: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    icon: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    payload_on: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    payload_off: Option<&'static str>,
    availability: Vec<HaAvailability>,
    device: HaDeviceInfo,
}

/// A retained config message. An empty payload removes the entity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveryDocument {
    pub topic: String,
    pub payload: String,
}

impl DiscoveryDocument {
    pub fn is_retraction(&self) -> bool {
        self.payload.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DiscoveryPublisher {
    topics: TopicLayout,
    device: HaDeviceInfo,
    enabled: EnabledSensors,
}

impl DiscoveryPublisher {
    pub fn new(settings: &Settings) -> Self {
        let topics = TopicLayout::new(&settings.hostname);
        let device = HaDeviceInfo {
            identifiers: vec![format!("steamdeck_{}", topics.device_id())],
            name: format!("Steam Deck ({})", settings.hostname),
            manufacturer: "Valve",
            model: "Steam Deck",
            sw_version: env!("CARGO_PKG_VERSION"),
        };
        Self {
            topics,
            device,
            enabled: settings.enabled_sensors,
        }
    }

    pub fn topics(&self) -> &TopicLayout {
        &self.topics
    }

    /// Config documents for every enabled category, then the status entity
    pub fn documents(&self) -> Vec<DiscoveryDocument> {
        let mut docs: Vec<DiscoveryDocument> = ENTITIES
            .iter()
            .filter(|e| self.enabled.is_enabled(e.category))
            .map(|e| self.entity_document(e))
            .collect();
        docs.push(self.status_document());
        docs
    }

    /// Empty retained configs for entities of categories enabled in
    /// `previous` but not any more
    pub fn retractions(&self, previous: &EnabledSensors) -> Vec<DiscoveryDocument> {
        ENTITIES
            .iter()
            .filter(|e| previous.is_enabled(e.category) && !self.enabled.is_enabled(e.category))
            .map(|e| self.retraction(e.component, e.object_id))
            .collect()
    }

    /// Remove every entity this device ever announced
    pub fn retract_all(&self) -> Vec<DiscoveryDocument> {
        ENTITIES
            .iter()
            .map(|e| self.retraction(e.component, e.object_id))
            .chain(std::iter::once(
                self.retraction(Component::BinarySensor, STATUS_OBJECT_ID),
            ))
            .collect()
    }

    fn retraction(&self, component: Component, object_id: &str) -> DiscoveryDocument {
        DiscoveryDocument {
            topic: self.topics.discovery(component.as_str(), object_id),
            payload: String::new(),
        }
    }

    fn availability(&self) -> Vec<HaAvailability> {
        vec![HaAvailability {
            topic: self.topics.status(),
            payload_available: PAYLOAD_ONLINE,
            payload_not_available: PAYLOAD_OFFLINE,
        }]
    }

    fn entity_document(&self, entity: &EntitySpec) -> DiscoveryDocument {
        let binary = entity.component == Component::BinarySensor;
        let config = HaEntityConfig {
            name: format!("{} {}", self.device.name, entity.name),
            unique_id: self.topics.unique_id(entity.object_id),
            state_topic: self.topics.telemetry(entity.category),
            value_template: Some(format!("{{{{ value_json.{} }}}}", entity.field)),
            unit_of_measurement: entity.unit,
            device_class: entity.device_class,
            state_class: entity.state_class,
            icon: entity.icon,
            payload_on: binary.then_some("True"),
            payload_off: binary.then_some("False"),
            availability: self.availability(),
            device: self.device.clone(),
        };
        self.render(entity.component, entity.object_id, &config)
    }

    fn status_document(&self) -> DiscoveryDocument {
        let config = HaEntityConfig {
            name: format!("{} Status", self.device.name),
            unique_id: self.topics.unique_id(STATUS_OBJECT_ID),
            state_topic: self.topics.status(),
            value_template: None,
            unit_of_measurement: None,
            device_class: Some("connectivity"),
            state_class: None,
            icon: Some("mdi:steam"),
            payload_on: Some(PAYLOAD_ONLINE),
            payload_off: Some(PAYLOAD_OFFLINE),
            availability: self.availability(),
            device: self.device.clone(),
        };
        self.render(Component::BinarySensor, STATUS_OBJECT_ID, &config)
    }

    fn render(
        &self,
        component: Component,
        object_id: &str,
        config: &HaEntityConfig,
    ) -> DiscoveryDocument {
        DiscoveryDocument {
            topic: self.topics.discovery(component.as_str(), object_id),
            // plain structs of strings and vecs always serialize
            payload: serde_json::to_string(config).unwrap_or_default(),
        }
    }
}

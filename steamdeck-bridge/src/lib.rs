//! Steam Deck telemetry bridge
//!
//! Publishes a handheld's battery, storage, network, game and download state
//! to Home Assistant over MQTT:
//! - Home Assistant discovery documents, retained, one per entity
//! - availability on `steamdeck/<host>/status`, backed by a Last-Will
//! - polled hardware telemetry (retained) on a timer
//! - game and download events (transient) as they happen
//!
//! Everything runs inside one actor ([`bridge::Bridge`]); callers talk to it
//! through a [`bridge::BridgeHandle`].

pub mod bridge;
pub mod config;
pub mod discovery;
pub mod error;
pub mod events;
pub mod mqtt;
pub mod platform;
pub mod scheduler;
pub mod session;
pub mod telemetry;
pub mod topics;

pub use bridge::{Bridge, BridgeHandle, ConnectionStatus};
pub use config::{EnabledSensors, Settings, SettingsStore, TomlSettingsStore};
pub use error::{BridgeError, Fault, FaultKind, Result};
pub use events::{EventKind, SystemEvent};
pub use mqtt::MqttConnector;
pub use session::{BrokerConnector, BrokerLink, ConnectOptions, Publication};
pub use telemetry::{LinuxTelemetrySource, TelemetrySnapshot, TelemetrySource};
pub use topics::SensorCategory;

/*!
# Steam Deck bridge devkit

Helpers for running the bridge without a broker or a handheld:
- an in-memory MQTT broker that records every publication, keeps retained
  state and fires Last-Will messages when a link is dropped
- fixed telemetry sources and an in-memory settings store
- a harness that wires them into a running bridge
*/

pub mod mqtt_stub;
pub mod test_utils;

pub use mqtt_stub::{MockBroker, MockMessage};
pub use test_utils::{MemorySettingsStore, StaticTelemetrySource, TestHarness};

/*!
Test harness for the bridge

Starts a real bridge actor wired to:
- the in-memory broker
- an in-memory settings store
- a telemetry source returning fixed readings

and offers assertions on what reached the broker.
*/

use crate::mqtt_stub::MockBroker;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use steamdeck_bridge::telemetry::{InterfaceAddress, RawBattery, RawDisk, VolumeUsage};
use steamdeck_bridge::{
    Bridge, BridgeError, BridgeHandle, EnabledSensors, Result, Settings, SettingsStore,
    TelemetrySource,
};
use tokio::task::JoinHandle;

const GIB: u64 = 1024 * 1024 * 1024;

/// Settings store kept in memory. Saves can be made to fail.
#[derive(Default)]
pub struct MemorySettingsStore {
    settings: Mutex<Settings>,
    saves: AtomicUsize,
    fail_saves: AtomicBool,
}

impl MemorySettingsStore {
    pub fn new(settings: Settings) -> Self {
        Self {
            settings: Mutex::new(settings),
            ..Self::default()
        }
    }

    pub fn current(&self) -> Settings {
        self.settings.lock().clone()
    }

    pub fn save_count(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }

    pub fn set_fail_saves(&self, fail: bool) {
        self.fail_saves.store(fail, Ordering::SeqCst);
    }
}

impl SettingsStore for MemorySettingsStore {
    fn load(&self) -> Result<Settings> {
        Ok(self.current())
    }

    fn save(&self, settings: &Settings) -> Result<()> {
        if self.fail_saves.load(Ordering::SeqCst) {
            return Err(BridgeError::Settings("store is read-only".into()));
        }
        *self.settings.lock() = settings.clone();
        self.saves.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Telemetry source answering with whatever readings it was given
pub struct StaticTelemetrySource {
    battery: Mutex<RawBattery>,
    disk: Mutex<RawDisk>,
    interfaces: Mutex<Vec<InterfaceAddress>>,
    fail_battery: AtomicBool,
}

impl StaticTelemetrySource {
    /// A docked deck: 80% and charging, 512 GB internal, an SD card, WiFi
    pub fn steam_deck() -> Self {
        let ip = |s: &str| s.parse::<IpAddr>().unwrap_or(IpAddr::from([0, 0, 0, 0]));
        Self {
            battery: Mutex::new(RawBattery {
                capacity_percent: Some(80),
                status: Some("Charging".into()),
                energy_now: Some(32_000_000),
                energy_full: Some(40_000_000),
                power_now: Some(16_000_000),
            }),
            disk: Mutex::new(RawDisk {
                internal: Some(VolumeUsage {
                    mount_point: PathBuf::from("/home"),
                    total_bytes: 512 * GIB,
                    available_bytes: 128 * GIB,
                }),
                removable: vec![VolumeUsage {
                    mount_point: PathBuf::from("/run/media/deck/sdcard"),
                    total_bytes: 256 * GIB,
                    available_bytes: 64 * GIB,
                }],
            }),
            interfaces: Mutex::new(vec![
                InterfaceAddress {
                    name: "lo".into(),
                    ip: ip("127.0.0.1"),
                },
                InterfaceAddress {
                    name: "wlan0".into(),
                    ip: ip("192.168.1.42"),
                },
            ]),
            fail_battery: AtomicBool::new(false),
        }
    }

    pub fn set_battery(&self, battery: RawBattery) {
        *self.battery.lock() = battery;
    }

    pub fn set_disk(&self, disk: RawDisk) {
        *self.disk.lock() = disk;
    }

    pub fn set_interfaces(&self, interfaces: Vec<InterfaceAddress>) {
        *self.interfaces.lock() = interfaces;
    }

    pub fn set_fail_battery(&self, fail: bool) {
        self.fail_battery.store(fail, Ordering::SeqCst);
    }
}

impl TelemetrySource for StaticTelemetrySource {
    fn battery(&self) -> Result<RawBattery> {
        if self.fail_battery.load(Ordering::SeqCst) {
            return Err(BridgeError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                "no battery in power_supply",
            )));
        }
        Ok(self.battery.lock().clone())
    }

    fn disk(&self) -> Result<RawDisk> {
        Ok(self.disk.lock().clone())
    }

    fn interfaces(&self) -> Result<Vec<InterfaceAddress>> {
        Ok(self.interfaces.lock().clone())
    }
}

/// A running bridge plus the fakes around it
pub struct TestHarness {
    pub broker: MockBroker,
    pub store: Arc<MemorySettingsStore>,
    pub source: Arc<StaticTelemetrySource>,
    pub handle: BridgeHandle,
    task: Option<JoinHandle<()>>,
}

impl TestHarness {
    /// Settings pointing at the in-memory broker, device "deck"
    pub fn settings() -> Settings {
        Settings {
            mqtt_host: "broker.test".into(),
            hostname: "deck".into(),
            enabled_sensors: EnabledSensors::default(),
            ..Settings::default()
        }
    }

    /// Spawn a bridge with `settings` already stored. Must run inside a
    /// tokio runtime.
    pub fn start(settings: Settings) -> Self {
        Self::start_with(MockBroker::new(), settings)
    }

    pub fn start_with(broker: MockBroker, settings: Settings) -> Self {
        init_logging();

        let store = Arc::new(MemorySettingsStore::new(settings));
        let source = Arc::new(StaticTelemetrySource::steam_deck());
        let (handle, task) = Bridge::spawn(
            store.clone(),
            Arc::new(broker.clone()),
            source.clone(),
        );

        Self {
            broker,
            store,
            source,
            handle,
            task: Some(task),
        }
    }

    /// Poll until a message shows up on `topic`
    pub async fn wait_for_message(&self, topic: &str, timeout_ms: u64) -> anyhow::Result<Option<Value>> {
        self.wait_for_count(topic, 1, timeout_ms).await?;
        self.broker.get_last_json_message(topic)
    }

    /// Poll until at least `count` messages were published on `topic`.
    /// Returns false on timeout.
    pub async fn wait_for_count(&self, topic: &str, count: usize, timeout_ms: u64) -> anyhow::Result<bool> {
        let deadline = tokio::time::Instant::now() + Duration::from_millis(timeout_ms);
        while tokio::time::Instant::now() < deadline {
            if self.broker.find_messages_by_topic(topic).len() >= count {
                return Ok(true);
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        tracing::warn!("Timeout waiting for {} messages on {}", count, topic);
        Ok(false)
    }

    /// Assert that a field of the last JSON message on `topic` has a value.
    /// `field_path` is dot separated.
    pub fn assert_field_equals(&self, topic: &str, field_path: &str, expected: &Value) -> anyhow::Result<()> {
        let Some(msg) = self.broker.get_last_json_message::<Value>(topic)? else {
            anyhow::bail!("No message on {}", topic);
        };
        match nested_field(&msg, field_path) {
            Some(actual) if actual == expected => Ok(()),
            Some(actual) => anyhow::bail!(
                "Field '{}' mismatch on {}: expected {}, got {}",
                field_path,
                topic,
                expected,
                actual
            ),
            None => anyhow::bail!("Field '{}' not found in latest message on {}", field_path, topic),
        }
    }

    pub fn get_stats(&self) -> TestStats {
        let messages = self.broker.published_messages();
        let mut topic_counts = HashMap::new();
        let mut retained = 0;
        for msg in &messages {
            *topic_counts.entry(msg.topic.clone()).or_insert(0) += 1;
            if msg.retain {
                retained += 1;
            }
        }
        TestStats {
            total_messages: messages.len(),
            retained_messages: retained,
            topic_counts,
        }
    }

    /// Shut the bridge down and wait for its task
    pub async fn stop(mut self) -> anyhow::Result<()> {
        self.handle.shutdown().await?;
        if let Some(task) = self.task.take() {
            task.await?;
        }
        Ok(())
    }
}

impl Drop for TestHarness {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

fn nested_field<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.')
        .try_fold(value, |current, part| current.as_object()?.get(part))
}

fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("steamdeck_bridge=debug")),
        )
        .with_test_writer()
        .try_init();
}

#[derive(Debug)]
pub struct TestStats {
    pub total_messages: usize,
    pub retained_messages: usize,
    pub topic_counts: HashMap<String, usize>,
}

impl TestStats {
    pub fn print(&self) {
        println!("Test statistics:");
        println!("  Total messages: {} ({} retained)", self.total_messages, self.retained_messages);
        let mut topics: Vec<_> = self.topic_counts.iter().collect();
        topics.sort();
        for (topic, count) in topics {
            println!("    {}: {}", topic, count);
        }
    }
}

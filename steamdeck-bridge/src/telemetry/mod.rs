//! Telemetry snapshots
//!
//! Raw readings come from a [`TelemetrySource`] (sysfs, mounted volumes,
//! interface addresses). [`TelemetrySampler`] turns them into one immutable
//! [`TelemetrySnapshot`], computing the derived fields: GB and percentages,
//! battery time remaining, SD card detection, and interface classification.

pub mod linux;

pub use linux::LinuxTelemetrySource;

use crate::error::{FaultKind, FaultReporter, Result};
use crate::events::{ActivityState, DownloadActivity, GameActivity};
use serde::Serialize;
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;

const BYTES_PER_GB: f64 = 1024.0 * 1024.0 * 1024.0;

/// Removable volumes at or below this size are not treated as SD cards
pub const MIN_SD_CARD_BYTES: u64 = 1024 * 1024 * 1024;

/// Battery payload
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BatteryReading {
    pub percent: Option<u8>,
    pub charging: bool,
    pub time_remaining_min: Option<u32>,
}

/// Disk payload
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DiskReading {
    pub internal_free_gb: Option<f64>,
    pub internal_total_gb: Option<f64>,
    pub internal_percent_used: Option<f64>,
    pub sd_free_gb: Option<f64>,
    pub sd_total_gb: Option<f64>,
    pub sd_percent_used: Option<f64>,
    pub sd_mounted: bool,
}

/// Network payload
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct NetworkReading {
    pub ip_wifi: Option<String>,
    pub ip_ethernet: Option<String>,
    pub ip_primary: Option<String>,
}

/// Everything known at one instant
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TelemetrySnapshot {
    pub battery: BatteryReading,
    pub disk: DiskReading,
    pub network: NetworkReading,
    pub game: GameActivity,
    pub download: DownloadActivity,
}

/// Raw power-supply attributes, as the kernel reports them (µWh / µW)
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawBattery {
    pub capacity_percent: Option<i64>,
    pub status: Option<String>,
    pub energy_now: Option<u64>,
    pub energy_full: Option<u64>,
    pub power_now: Option<u64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct VolumeUsage {
    pub mount_point: PathBuf,
    pub total_bytes: u64,
    pub available_bytes: u64,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawDisk {
    /// Volume holding user data
    pub internal: Option<VolumeUsage>,
    /// Removable media candidates, in mount order
    pub removable: Vec<VolumeUsage>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct InterfaceAddress {
    pub name: String,
    pub ip: IpAddr,
}

/// Source of raw hardware readings. Calls may block.
pub trait TelemetrySource: Send + Sync {
    fn battery(&self) -> Result<RawBattery>;
    fn disk(&self) -> Result<RawDisk>;
    fn interfaces(&self) -> Result<Vec<InterfaceAddress>>;
}

/// Assembles snapshots. A failing source leaves its section at defaults
/// and is reported as a `Sampling` fault.
#[derive(Clone)]
pub struct TelemetrySampler {
    source: Arc<dyn TelemetrySource>,
    faults: FaultReporter,
}

impl TelemetrySampler {
    pub fn new(source: Arc<dyn TelemetrySource>, faults: FaultReporter) -> Self {
        Self { source, faults }
    }

    pub fn sample(&self, activity: &ActivityState) -> TelemetrySnapshot {
        TelemetrySnapshot {
            battery: self
                .read("battery", || self.source.battery())
                .map(|raw| battery_reading(&raw))
                .unwrap_or_default(),
            disk: self
                .read("disk", || self.source.disk())
                .map(|raw| disk_reading(&raw))
                .unwrap_or_default(),
            network: self
                .read("network", || self.source.interfaces())
                .map(|raw| network_reading(&raw))
                .unwrap_or_default(),
            game: activity.game.clone(),
            download: activity.download.clone(),
        }
    }

    fn read<T>(&self, what: &str, f: impl FnOnce() -> Result<T>) -> Option<T> {
        match f() {
            Ok(value) => Some(value),
            Err(e) => {
                self.faults
                    .report(FaultKind::Sampling, format!("{}: {}", what, e));
                None
            }
        }
    }
}

fn round_to(value: f64, decimals: i32) -> f64 {
    let factor = 10f64.powi(decimals);
    (value * factor).round() / factor
}

fn gigabytes(bytes: u64) -> f64 {
    round_to(bytes as f64 / BYTES_PER_GB, 2)
}

fn percent_used(volume: &VolumeUsage) -> f64 {
    if volume.total_bytes == 0 {
        return 0.0;
    }
    let used = volume.total_bytes.saturating_sub(volume.available_bytes);
    round_to(used as f64 / volume.total_bytes as f64 * 100.0, 1)
}

pub fn battery_reading(raw: &RawBattery) -> BatteryReading {
    let charging = matches!(raw.status.as_deref(), Some("Charging") | Some("Full"));

    let time_remaining_min = match (raw.energy_now, raw.power_now) {
        (Some(now), Some(power)) if power > 0 => {
            let energy = match raw.energy_full {
                Some(full) if charging => full.saturating_sub(now),
                _ => now,
            };
            let minutes = energy as f64 / power as f64 * 60.0;
            u32::try_from(minutes as u64).ok()
        }
        _ => None,
    };

    BatteryReading {
        percent: raw.capacity_percent.map(|p| p.clamp(0, 100) as u8),
        charging,
        time_remaining_min,
    }
}

pub fn disk_reading(raw: &RawDisk) -> DiskReading {
    let mut reading = DiskReading::default();

    if let Some(internal) = &raw.internal {
        reading.internal_free_gb = Some(gigabytes(internal.available_bytes));
        reading.internal_total_gb = Some(gigabytes(internal.total_bytes));
        reading.internal_percent_used = Some(percent_used(internal));
    }

    if let Some(sd) = raw
        .removable
        .iter()
        .find(|v| v.total_bytes > MIN_SD_CARD_BYTES)
    {
        reading.sd_free_gb = Some(gigabytes(sd.available_bytes));
        reading.sd_total_gb = Some(gigabytes(sd.total_bytes));
        reading.sd_percent_used = Some(percent_used(sd));
        reading.sd_mounted = true;
    }

    reading
}

/// `wl*` is WiFi, `en*`/`eth*` is Ethernet; primary is the first usable IPv4
pub fn network_reading(interfaces: &[InterfaceAddress]) -> NetworkReading {
    let mut reading = NetworkReading::default();

    for iface in interfaces {
        let IpAddr::V4(v4) = iface.ip else {
            continue;
        };
        if v4.is_loopback() {
            continue;
        }
        let ip = v4.to_string();

        if iface.name.starts_with("wl") {
            reading.ip_wifi = Some(ip.clone());
        } else if iface.name.starts_with("en") || iface.name.starts_with("eth") {
            reading.ip_ethernet = Some(ip.clone());
        }
        if reading.ip_primary.is_none() {
            reading.ip_primary = Some(ip);
        }
    }

    reading
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::BridgeError;
    use crate::events::SystemEvent;

    const GIB: u64 = 1024 * 1024 * 1024;

    fn volume(path: &str, total: u64, available: u64) -> VolumeUsage {
        VolumeUsage {
            mount_point: PathBuf::from(path),
            total_bytes: total,
            available_bytes: available,
        }
    }

    fn iface(name: &str, ip: &str) -> InterfaceAddress {
        InterfaceAddress {
            name: name.into(),
            ip: ip.parse().unwrap(),
        }
    }

    #[test]
    fn test_battery_discharging() {
        let reading = battery_reading(&RawBattery {
            capacity_percent: Some(80),
            status: Some("Discharging".into()),
            energy_now: Some(30_000_000),
            energy_full: Some(40_000_000),
            power_now: Some(10_000_000),
        });
        assert_eq!(reading.percent, Some(80));
        assert!(!reading.charging);
        assert_eq!(reading.time_remaining_min, Some(180));
    }

    #[test]
    fn test_battery_charging_time_to_full() {
        let reading = battery_reading(&RawBattery {
            capacity_percent: Some(120),
            status: Some("Charging".into()),
            energy_now: Some(30_000_000),
            energy_full: Some(40_000_000),
            power_now: Some(20_000_000),
        });
        assert_eq!(reading.percent, Some(100));
        assert!(reading.charging);
        assert_eq!(reading.time_remaining_min, Some(30));
    }

    #[test]
    fn test_battery_missing_readings() {
        let reading = battery_reading(&RawBattery {
            status: Some("Full".into()),
            power_now: Some(0),
            energy_now: Some(1),
            ..RawBattery::default()
        });
        assert_eq!(reading.percent, None);
        assert!(reading.charging);
        assert_eq!(reading.time_remaining_min, None);
    }

    #[test]
    fn test_disk_internal_and_sd() {
        let reading = disk_reading(&RawDisk {
            internal: Some(volume("/home", 64 * GIB, 16 * GIB)),
            removable: vec![
                volume("/run/media/deck/tiny", GIB / 2, GIB / 4),
                volume("/run/media/deck/sd", 256 * GIB, 192 * GIB),
            ],
        });
        assert_eq!(reading.internal_total_gb, Some(64.0));
        assert_eq!(reading.internal_free_gb, Some(16.0));
        assert_eq!(reading.internal_percent_used, Some(75.0));
        assert!(reading.sd_mounted);
        assert_eq!(reading.sd_total_gb, Some(256.0));
        assert_eq!(reading.sd_percent_used, Some(25.0));
    }

    #[test]
    fn test_disk_no_sd() {
        let reading = disk_reading(&RawDisk {
            internal: Some(volume("/", 0, 0)),
            removable: vec![volume("/run/media/deck/usb", GIB, GIB)],
        });
        assert_eq!(reading.internal_percent_used, Some(0.0));
        assert!(!reading.sd_mounted);
        assert_eq!(reading.sd_free_gb, None);
    }

    #[test]
    fn test_network_classification() {
        let reading = network_reading(&[
            iface("lo", "127.0.0.1"),
            iface("wlan0", "fe80::1"),
            iface("wlan0", "192.168.1.50"),
            iface("enp4s0", "10.0.0.2"),
        ]);
        assert_eq!(reading.ip_wifi.as_deref(), Some("192.168.1.50"));
        assert_eq!(reading.ip_ethernet.as_deref(), Some("10.0.0.2"));
        assert_eq!(reading.ip_primary.as_deref(), Some("192.168.1.50"));

        let tunnel_only = network_reading(&[iface("tun0", "10.8.0.1")]);
        assert_eq!(tunnel_only.ip_primary.as_deref(), Some("10.8.0.1"));
        assert_eq!(tunnel_only.ip_wifi, None);
    }

    struct BrokenSource;

    impl TelemetrySource for BrokenSource {
        fn battery(&self) -> Result<RawBattery> {
            Err(BridgeError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                "no battery",
            )))
        }
        fn disk(&self) -> Result<RawDisk> {
            Ok(RawDisk::default())
        }
        fn interfaces(&self) -> Result<Vec<InterfaceAddress>> {
            Ok(vec![])
        }
    }

    #[tokio::test]
    async fn test_sampler_reports_failures() {
        let faults = FaultReporter::new();
        let mut rx = faults.subscribe();
        let sampler = TelemetrySampler::new(Arc::new(BrokenSource), faults);

        let mut activity = ActivityState::default();
        activity.apply(&SystemEvent::game_started(730));

        let snapshot = sampler.sample(&activity);
        assert_eq!(snapshot.battery, BatteryReading::default());
        assert!(snapshot.game.is_running);

        let fault = rx.recv().await.unwrap();
        assert_eq!(fault.kind, FaultKind::Sampling);
        assert!(fault.detail.starts_with("battery"));
    }
}

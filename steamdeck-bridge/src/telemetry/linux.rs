//! Default telemetry source for a Linux handheld
//!
//! - battery: `/sys/class/power_supply/<dev>` with `type == Battery`
//! - disks: `sysinfo`, internal storage at `/home` (falling back to `/`),
//!   removable media under `/run/media`
//! - interfaces: `if-addrs`

use super::{InterfaceAddress, RawBattery, RawDisk, TelemetrySource, VolumeUsage};
use crate::error::Result;
use std::fs;
use std::path::{Path, PathBuf};
use sysinfo::Disks;
use tracing::debug;

const POWER_SUPPLY_DIR: &str = "/sys/class/power_supply";
const REMOVABLE_MEDIA_DIR: &str = "/run/media";
const USER_DATA_PATH: &str = "/home";

#[derive(Debug, Clone)]
pub struct LinuxTelemetrySource {
    power_supply_dir: PathBuf,
    removable_media_dir: PathBuf,
    user_data_path: PathBuf,
}

impl Default for LinuxTelemetrySource {
    fn default() -> Self {
        Self {
            power_supply_dir: PathBuf::from(POWER_SUPPLY_DIR),
            removable_media_dir: PathBuf::from(REMOVABLE_MEDIA_DIR),
            user_data_path: PathBuf::from(USER_DATA_PATH),
        }
    }
}

impl LinuxTelemetrySource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Read batteries from another sysfs tree
    pub fn with_power_supply_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.power_supply_dir = dir.into();
        self
    }

    fn find_battery(&self) -> Option<PathBuf> {
        let entries = fs::read_dir(&self.power_supply_dir).ok()?;
        entries
            .flatten()
            .map(|entry| entry.path())
            .find(|dev| read_trimmed(&dev.join("type")).as_deref() == Some("Battery"))
    }
}

fn read_trimmed(path: &Path) -> Option<String> {
    fs::read_to_string(path).ok().map(|s| s.trim().to_string())
}

fn read_number<T: std::str::FromStr>(path: &Path) -> Option<T> {
    read_trimmed(path)?.parse().ok()
}

/// The mounted volume holding `path`: the longest mount point prefix
fn volume_for<'a>(volumes: &'a [VolumeUsage], path: &Path) -> Option<&'a VolumeUsage> {
    volumes
        .iter()
        .filter(|v| path.starts_with(&v.mount_point))
        .max_by_key(|v| v.mount_point.components().count())
}

impl TelemetrySource for LinuxTelemetrySource {
    fn battery(&self) -> Result<RawBattery> {
        let Some(dev) = self.find_battery() else {
            debug!("No battery under {:?}", self.power_supply_dir);
            return Ok(RawBattery::default());
        };

        Ok(RawBattery {
            capacity_percent: read_number(&dev.join("capacity")),
            status: read_trimmed(&dev.join("status")),
            energy_now: read_number(&dev.join("energy_now")),
            energy_full: read_number(&dev.join("energy_full")),
            power_now: read_number(&dev.join("power_now")),
        })
    }

    fn disk(&self) -> Result<RawDisk> {
        let disks = Disks::new_with_refreshed_list();
        let volumes: Vec<VolumeUsage> = disks
            .list()
            .iter()
            .map(|disk| VolumeUsage {
                mount_point: disk.mount_point().to_path_buf(),
                total_bytes: disk.total_space(),
                available_bytes: disk.available_space(),
            })
            .collect();

        let internal = volume_for(&volumes, &self.user_data_path)
            .or_else(|| volume_for(&volumes, Path::new("/")))
            .cloned();

        let removable = volumes
            .iter()
            .filter(|v| {
                v.mount_point.starts_with(&self.removable_media_dir)
                    && v.mount_point != self.removable_media_dir
            })
            .cloned()
            .collect();

        Ok(RawDisk {
            internal,
            removable,
        })
    }

    fn interfaces(&self) -> Result<Vec<InterfaceAddress>> {
        let interfaces = if_addrs::get_if_addrs()?;
        Ok(interfaces
            .into_iter()
            .map(|iface| InterfaceAddress {
                ip: iface.ip(),
                name: iface.name,
            })
            .collect())
    }
}

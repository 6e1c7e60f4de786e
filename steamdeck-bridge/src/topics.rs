//! Topic layout shared by discovery, status and telemetry publication
//!
//! ```text
//! homeassistant/<component>/<hostname>_<sensor>/config   discovery, retained
//! steamdeck/<hostname>/status                             online|offline, retained, Last-Will
//! steamdeck/<hostname>/telemetry/<category>               JSON state
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;

pub const DISCOVERY_PREFIX: &str = "homeassistant";
pub const STATE_TOPIC_PREFIX: &str = "steamdeck";

pub const PAYLOAD_ONLINE: &str = "online";
pub const PAYLOAD_OFFLINE: &str = "offline";

/// Telemetry category, one state topic each
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SensorCategory {
    Battery,
    Disk,
    Network,
    Game,
    Download,
}

impl SensorCategory {
    pub const ALL: [SensorCategory; 5] = [
        SensorCategory::Battery,
        SensorCategory::Disk,
        SensorCategory::Network,
        SensorCategory::Game,
        SensorCategory::Download,
    ];

    pub fn slug(self) -> &'static str {
        match self {
            SensorCategory::Battery => "battery",
            SensorCategory::Disk => "disk",
            SensorCategory::Network => "network",
            SensorCategory::Game => "game",
            SensorCategory::Download => "download",
        }
    }

    /// Hardware categories are sampled by the scheduler and retained;
    /// game and download are event driven and transient.
    pub fn is_polled(self) -> bool {
        matches!(
            self,
            SensorCategory::Battery | SensorCategory::Disk | SensorCategory::Network
        )
    }
}

impl fmt::Display for SensorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.slug())
    }
}

/// Lowercase, with spaces, dashes and dots turned into underscores.
pub fn sanitize_identifier(name: &str) -> String {
    name.to_lowercase()
        .chars()
        .map(|c| match c {
            ' ' | '-' | '.' => '_',
            other => other,
        })
        .collect()
}

/// Topics for one device, derived from its configured hostname
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicLayout {
    device_id: String,
}

impl TopicLayout {
    pub fn new(hostname: &str) -> Self {
        Self {
            device_id: sanitize_identifier(hostname),
        }
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn status(&self) -> String {
        format!("{}/{}/status", STATE_TOPIC_PREFIX, self.device_id)
    }

    pub fn telemetry(&self, category: SensorCategory) -> String {
        format!(
            "{}/{}/telemetry/{}",
            STATE_TOPIC_PREFIX,
            self.device_id,
            category.slug()
        )
    }

    pub fn discovery(&self, component: &str, object_id: &str) -> String {
        format!(
            "{}/{}/{}_{}/config",
            DISCOVERY_PREFIX, component, self.device_id, object_id
        )
    }

    pub fn unique_id(&self, object_id: &str) -> String {
        format!("{}_{}_{}", STATE_TOPIC_PREFIX, self.device_id, object_id)
    }
}

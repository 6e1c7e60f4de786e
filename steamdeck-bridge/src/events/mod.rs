//! Semantic system events and the activity they describe
//!
//! - [`SystemEvent`]: one clean lifecycle transition, produced by the
//!   [`EventNormalizer`] or ingested from the UI layer
//! - [`ActivityState`]: game/download projection folded from those events,
//!   published on the event-driven topics and reported by `getTelemetry`

pub mod normalizer;

pub use normalizer::EventNormalizer;

use crate::platform::coerce;
use crate::topics::SensorCategory;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Steam application identifier
pub type AppId = u32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    GameStarted,
    GameStopped,
    DownloadStarted,
    DownloadProgress,
    DownloadCompleted,
    DownloadStopped,
    SystemSuspending,
    SystemResuming,
    SystemShuttingDown,
}

impl EventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::GameStarted => "game_started",
            EventKind::GameStopped => "game_stopped",
            EventKind::DownloadStarted => "download_started",
            EventKind::DownloadProgress => "download_progress",
            EventKind::DownloadCompleted => "download_completed",
            EventKind::DownloadStopped => "download_stopped",
            EventKind::SystemSuspending => "system_suspending",
            EventKind::SystemResuming => "system_resuming",
            EventKind::SystemShuttingDown => "system_shutting_down",
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        Some(match name {
            "game_started" => EventKind::GameStarted,
            "game_stopped" => EventKind::GameStopped,
            "download_started" => EventKind::DownloadStarted,
            "download_progress" => EventKind::DownloadProgress,
            "download_completed" => EventKind::DownloadCompleted,
            "download_stopped" => EventKind::DownloadStopped,
            "system_suspending" => EventKind::SystemSuspending,
            "system_resuming" => EventKind::SystemResuming,
            "system_shutting_down" => EventKind::SystemShuttingDown,
            _ => return None,
        })
    }

    /// Topic category for game and download events; `None` for system events
    pub fn category(self) -> Option<SensorCategory> {
        match self {
            EventKind::GameStarted | EventKind::GameStopped => Some(SensorCategory::Game),
            EventKind::DownloadStarted
            | EventKind::DownloadProgress
            | EventKind::DownloadCompleted
            | EventKind::DownloadStopped => Some(SensorCategory::Download),
            _ => None,
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A semantic lifecycle event.
///
/// `progress` and `rate` only ever appear on `download_progress`, and
/// `app_id` never appears on system events; the constructors below are the
/// only way the bridge builds events, which keeps that true.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SystemEvent {
    #[serde(rename = "type")]
    pub kind: EventKind,
    /// Wall clock, milliseconds since the epoch
    pub timestamp: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub app_id: Option<AppId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub app_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub progress: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rate: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub downloading: Option<bool>,
}

pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

impl SystemEvent {
    fn bare(kind: EventKind) -> Self {
        Self {
            kind,
            timestamp: now_millis(),
            app_id: None,
            app_name: None,
            progress: None,
            rate: None,
            downloading: None,
        }
    }

    pub fn game_started(app_id: AppId) -> Self {
        Self {
            app_id: Some(app_id),
            ..Self::bare(EventKind::GameStarted)
        }
    }

    pub fn game_stopped() -> Self {
        Self::bare(EventKind::GameStopped)
    }

    pub fn download_started(app_id: Option<AppId>) -> Self {
        Self {
            app_id,
            downloading: Some(true),
            ..Self::bare(EventKind::DownloadStarted)
        }
    }

    pub fn download_progress(app_id: Option<AppId>, progress: u8, rate: f64) -> Self {
        Self {
            app_id,
            progress: Some(progress.min(100)),
            rate: Some(rate),
            downloading: Some(true),
            ..Self::bare(EventKind::DownloadProgress)
        }
    }

    pub fn download_completed(app_id: Option<AppId>) -> Self {
        Self {
            app_id,
            downloading: Some(false),
            ..Self::bare(EventKind::DownloadCompleted)
        }
    }

    pub fn download_stopped(app_id: Option<AppId>) -> Self {
        Self {
            app_id,
            downloading: Some(false),
            ..Self::bare(EventKind::DownloadStopped)
        }
    }

    pub fn suspending() -> Self {
        Self::bare(EventKind::SystemSuspending)
    }

    pub fn resuming() -> Self {
        Self::bare(EventKind::SystemResuming)
    }

    pub fn shutting_down() -> Self {
        Self::bare(EventKind::SystemShuttingDown)
    }

    pub fn with_timestamp(mut self, timestamp: i64) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn with_app_name(mut self, name: impl Into<String>) -> Self {
        if self.app_id.is_some() {
            self.app_name = Some(name.into());
        }
        self
    }

    /// Rebuild an event from an untyped payload (UI layer `ingestEvent`).
    ///
    /// Unknown `type` yields `None`; individual fields that are missing or
    /// of the wrong type are dropped, and the result goes through the
    /// constructors so the field invariants still hold.
    pub fn from_json(value: &serde_json::Value) -> Option<Self> {
        let kind = value
            .get("type")
            .and_then(|v| v.as_str())
            .and_then(EventKind::parse)?;
        let app_id = coerce::app_id(value.get("app_id"));

        let mut event = match kind {
            EventKind::GameStarted => SystemEvent::game_started(app_id?),
            EventKind::GameStopped => SystemEvent::game_stopped(),
            EventKind::DownloadStarted => SystemEvent::download_started(app_id),
            EventKind::DownloadProgress => {
                let progress = coerce::u64_or(value.get("progress"), 0).min(100) as u8;
                let rate = coerce::f64_or(value.get("rate"), 0.0).max(0.0);
                SystemEvent::download_progress(app_id, progress, rate)
            }
            EventKind::DownloadCompleted => SystemEvent::download_completed(app_id),
            EventKind::DownloadStopped => SystemEvent::download_stopped(app_id),
            EventKind::SystemSuspending => SystemEvent::suspending(),
            EventKind::SystemResuming => SystemEvent::resuming(),
            EventKind::SystemShuttingDown => SystemEvent::shutting_down(),
        };

        if let Some(ts) = value.get("timestamp").and_then(coerce::as_i64) {
            event.timestamp = ts;
        }
        if let Some(name) = value.get("app_name").and_then(|v| v.as_str()) {
            event = event.with_app_name(name);
        }
        Some(event)
    }
}

/// Game state as published on the game topic
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct GameActivity {
    pub game_name: Option<String>,
    pub app_id: Option<AppId>,
    pub is_running: bool,
}

/// Download state as published on the download topic
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DownloadActivity {
    pub downloading: bool,
    pub download_progress: Option<u8>,
    pub download_rate_mbps: Option<f64>,
    pub download_app_name: Option<String>,
    #[serde(skip)]
    pub app_id: Option<AppId>,
}

/// Projection of the event stream, owned by the bridge actor
#[derive(Debug, Clone, Default)]
pub struct ActivityState {
    pub game: GameActivity,
    pub download: DownloadActivity,
    /// Bumped every time a download begins, so a delayed clear scheduled
    /// for an older completion can tell it is stale
    pub download_generation: u64,
}

impl ActivityState {
    /// Fold an event in and return the categories whose published state
    /// changed, in publication order.
    pub fn apply(&mut self, event: &SystemEvent) -> Vec<SensorCategory> {
        match event.kind {
            EventKind::GameStarted => {
                self.game.is_running = true;
                self.game.app_id = event.app_id;
                self.game.game_name = event.app_name.clone();
                vec![SensorCategory::Game]
            }
            EventKind::GameStopped => {
                self.game = GameActivity::default();
                vec![SensorCategory::Game]
            }
            EventKind::DownloadStarted => {
                self.download_generation += 1;
                self.download = DownloadActivity {
                    downloading: true,
                    download_progress: Some(0),
                    download_rate_mbps: Some(0.0),
                    download_app_name: event.app_name.clone(),
                    app_id: event.app_id,
                };
                vec![SensorCategory::Download]
            }
            EventKind::DownloadProgress => {
                self.download.downloading = true;
                self.download.download_progress = event.progress;
                self.download.download_rate_mbps = event.rate;
                if event.app_id.is_some() {
                    self.download.app_id = event.app_id;
                }
                vec![SensorCategory::Download]
            }
            EventKind::DownloadCompleted => {
                self.download.downloading = false;
                self.download.download_progress = Some(100);
                self.download.download_rate_mbps = Some(0.0);
                vec![SensorCategory::Download]
            }
            EventKind::DownloadStopped => {
                self.download = DownloadActivity::default();
                vec![SensorCategory::Download]
            }
            EventKind::SystemSuspending => {
                let mut touched = Vec::new();
                if self.game.is_running {
                    self.game.is_running = false;
                    touched.push(SensorCategory::Game);
                }
                if self.download.downloading {
                    self.download.downloading = false;
                    touched.push(SensorCategory::Download);
                }
                touched
            }
            EventKind::SystemResuming => Vec::new(),
            EventKind::SystemShuttingDown => {
                self.game.is_running = false;
                self.game.app_id = None;
                self.download.downloading = false;
                vec![SensorCategory::Game, SensorCategory::Download]
            }
        }
    }

    /// Drop the lingering 100% after a completed download, unless a newer
    /// download has started since. Returns true when something was cleared.
    pub fn expire_completed_download(&mut self, generation: u64) -> bool {
        if generation != self.download_generation || self.download.downloading {
            return false;
        }
        self.download.download_progress = None;
        self.download.download_rate_mbps = None;
        self.download.app_id = None;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_event_serialization() {
        let event = SystemEvent::download_progress(Some(730), 42, 1.5).with_timestamp(1000);
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "download_progress");
        assert_eq!(value["timestamp"], 1000);
        assert_eq!(value["app_id"], 730);
        assert_eq!(value["progress"], 42);
        assert_eq!(value["rate"], 1.5);

        let stopped = serde_json::to_value(SystemEvent::game_stopped()).unwrap();
        assert!(stopped.get("app_id").is_none());
        assert!(stopped.get("progress").is_none());
    }

    #[test]
    fn test_payload_invariants() {
        for event in [
            SystemEvent::game_started(1),
            SystemEvent::download_started(Some(2)),
            SystemEvent::download_completed(Some(2)),
            SystemEvent::download_stopped(None),
        ] {
            assert!(event.progress.is_none());
            assert!(event.rate.is_none());
        }
        for event in [
            SystemEvent::suspending(),
            SystemEvent::resuming(),
            SystemEvent::shutting_down(),
        ] {
            assert!(event.app_id.is_none());
            assert_eq!(event.kind.category(), None);
        }
    }

    #[test]
    fn test_from_json_coerces_fields() {
        let event = SystemEvent::from_json(&json!({
            "type": "download_progress",
            "timestamp": 1700000000000i64,
            "app_id": "570",
            "progress": 250,
            "rate": "oops"
        }))
        .unwrap();
        assert_eq!(event.kind, EventKind::DownloadProgress);
        assert_eq!(event.timestamp, 1_700_000_000_000);
        assert_eq!(event.app_id, Some(570));
        assert_eq!(event.progress, Some(100));
        assert_eq!(event.rate, Some(0.0));
    }

    #[test]
    fn test_from_json_rejects_unknown() {
        assert!(SystemEvent::from_json(&json!({ "type": "coffee_brewed" })).is_none());
        assert!(SystemEvent::from_json(&json!({ "app_id": 1 })).is_none());
        // game_started without an app id has nothing to report
        assert!(SystemEvent::from_json(&json!({ "type": "game_started" })).is_none());
    }

    #[test]
    fn test_system_events_drop_payload() {
        let event = SystemEvent::from_json(&json!({
            "type": "system_suspending",
            "app_id": 10,
            "progress": 50
        }))
        .unwrap();
        assert!(event.app_id.is_none());
        assert!(event.progress.is_none());
    }

    #[test]
    fn test_activity_game_cycle() {
        let mut activity = ActivityState::default();
        let touched = activity.apply(&SystemEvent::game_started(1091500).with_app_name("Cyberpunk 2077"));
        assert_eq!(touched, vec![SensorCategory::Game]);
        assert!(activity.game.is_running);
        assert_eq!(activity.game.app_id, Some(1091500));
        assert_eq!(activity.game.game_name.as_deref(), Some("Cyberpunk 2077"));

        activity.apply(&SystemEvent::game_stopped());
        assert_eq!(activity.game, GameActivity::default());
    }

    #[test]
    fn test_activity_download_completion_expiry() {
        let mut activity = ActivityState::default();
        activity.apply(&SystemEvent::download_started(Some(10)));
        activity.apply(&SystemEvent::download_progress(Some(10), 55, 12.5));
        assert_eq!(activity.download.download_progress, Some(55));

        activity.apply(&SystemEvent::download_completed(Some(10)));
        assert!(!activity.download.downloading);
        assert_eq!(activity.download.download_progress, Some(100));
        assert_eq!(activity.download.download_rate_mbps, Some(0.0));

        let generation = activity.download_generation;
        assert!(activity.expire_completed_download(generation));
        assert_eq!(activity.download.download_progress, None);
        assert_eq!(activity.download.app_id, None);
    }

    #[test]
    fn test_stale_expiry_ignored() {
        let mut activity = ActivityState::default();
        activity.apply(&SystemEvent::download_started(Some(10)));
        activity.apply(&SystemEvent::download_completed(Some(10)));
        let stale = activity.download_generation;

        activity.apply(&SystemEvent::download_started(Some(20)));
        assert!(!activity.expire_completed_download(stale));
        assert_eq!(activity.download.app_id, Some(20));
    }

    #[test]
    fn test_suspend_only_touches_active() {
        let mut activity = ActivityState::default();
        assert!(activity.apply(&SystemEvent::suspending()).is_empty());

        activity.apply(&SystemEvent::game_started(5));
        let touched = activity.apply(&SystemEvent::suspending());
        assert_eq!(touched, vec![SensorCategory::Game]);
        assert!(!activity.game.is_running);

        assert!(activity.apply(&SystemEvent::resuming()).is_empty());
        assert_eq!(
            activity.apply(&SystemEvent::shutting_down()),
            vec![SensorCategory::Game, SensorCategory::Download]
        );
    }

    #[test]
    fn test_download_payload_shape() {
        let activity = DownloadActivity {
            downloading: true,
            download_progress: Some(3),
            download_rate_mbps: Some(0.25),
            download_app_name: None,
            app_id: Some(9),
        };
        let value = serde_json::to_value(&activity).unwrap();
        assert_eq!(value["downloading"], true);
        assert_eq!(value["download_progress"], 3);
        assert!(value.get("app_id").is_none());
        assert!(value["download_app_name"].is_null());
    }
}

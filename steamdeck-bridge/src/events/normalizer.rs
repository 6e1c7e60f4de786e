//! Turns raw platform callbacks into a clean sequence of [`SystemEvent`]s.
//!
//! The platform repeats itself: the same app-lifetime notification can fire
//! several times, and the download queue reports its whole item list on every
//! change. The normalizer remembers what was last reported so only real
//! transitions produce events.

use super::{AppId, SystemEvent};
use crate::platform::{DownloadItem, DownloadOverview};

/// What the normalizer last observed
#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct RuntimeState {
    current_app_id: Option<AppId>,
    is_game_running: bool,
    is_downloading: bool,
    download_app_id: Option<AppId>,
}

#[derive(Debug, Default)]
pub struct EventNormalizer {
    state: RuntimeState,
}

impl EventNormalizer {
    pub fn new() -> Self {
        Self::default()
    }

    #[cfg(test)]
    fn state(&self) -> &RuntimeState {
        &self.state
    }

    /// Forget everything observed so far
    pub fn reset(&mut self) {
        self.state = RuntimeState::default();
    }

    pub fn on_game_lifetime(&mut self, app_id: AppId, running: bool) -> Option<SystemEvent> {
        if running {
            if self.state.is_game_running && self.state.current_app_id == Some(app_id) {
                return None;
            }
            self.state.is_game_running = true;
            self.state.current_app_id = Some(app_id);
            Some(SystemEvent::game_started(app_id))
        } else {
            if !self.state.is_game_running {
                return None;
            }
            self.state.is_game_running = false;
            self.state.current_app_id = None;
            Some(SystemEvent::game_stopped())
        }
    }

    /// Rules are checked in order: start, finish, switch to another app.
    pub fn on_download_items(
        &mut self,
        is_downloading: bool,
        items: &[DownloadItem],
    ) -> Option<SystemEvent> {
        let active_app = items
            .iter()
            .find(|item| item.active)
            .and_then(|item| item.app_id);

        if is_downloading && !self.state.is_downloading {
            self.state.is_downloading = true;
            self.state.download_app_id = active_app;
            return Some(SystemEvent::download_started(active_app));
        }

        if !is_downloading && self.state.is_downloading {
            self.state.is_downloading = false;
            let app_id = self.state.download_app_id.take();
            return Some(if items.iter().any(|item| item.completed) {
                SystemEvent::download_completed(app_id)
            } else {
                SystemEvent::download_stopped(app_id)
            });
        }

        if is_downloading && active_app.is_some() && active_app != self.state.download_app_id {
            self.state.download_app_id = active_app;
            return Some(SystemEvent::download_started(active_app));
        }

        None
    }

    pub fn on_download_overview(&mut self, overview: &DownloadOverview) -> Option<SystemEvent> {
        if !self.state.is_downloading {
            return None;
        }

        let progress = progress_percent(overview.bytes_downloaded, overview.bytes_to_download);
        let rate = megabits_per_second(overview.bytes_per_second.unwrap_or(0));
        let app_id = overview.app_id.or(self.state.download_app_id);
        Some(SystemEvent::download_progress(app_id, progress, rate))
    }

    pub fn on_suspend(&mut self) -> Option<SystemEvent> {
        Some(SystemEvent::suspending())
    }

    pub fn on_resume(&mut self) -> Option<SystemEvent> {
        Some(SystemEvent::resuming())
    }

    pub fn on_shutdown(&mut self) -> Option<SystemEvent> {
        Some(SystemEvent::shutting_down())
    }
}

/// Percentage rounded to the nearest integer, 0 when the total is unknown
pub fn progress_percent(done: u64, total: u64) -> u8 {
    if total == 0 {
        return 0;
    }
    let pct = (done as f64 / total as f64 * 100.0).round();
    pct.clamp(0.0, 100.0) as u8
}

/// Bytes per second to megabits per second, two decimals
pub fn megabits_per_second(bytes_per_second: u64) -> f64 {
    if bytes_per_second == 0 {
        return 0.0;
    }
    (bytes_per_second as f64 * 8.0 / 1_000_000.0 * 100.0).round() / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventKind;

    fn item(app_id: u32, active: bool, completed: bool) -> DownloadItem {
        DownloadItem {
            app_id: Some(app_id),
            active,
            completed,
        }
    }

    fn overview(app_id: Option<u32>, done: u64, total: u64, bps: Option<u64>) -> DownloadOverview {
        DownloadOverview {
            app_id,
            bytes_downloaded: done,
            bytes_to_download: total,
            bytes_per_second: bps,
        }
    }

    #[test]
    fn test_duplicate_game_callbacks_suppressed() {
        let mut normalizer = EventNormalizer::new();
        let calls = [
            (730, true),
            (730, true),
            (730, false),
            (730, false),
            (570, true),
            (440, true),
            (440, false),
        ];

        let emitted: Vec<_> = calls
            .iter()
            .filter_map(|(app, running)| normalizer.on_game_lifetime(*app, *running))
            .map(|e| (e.kind, e.app_id))
            .collect();

        assert_eq!(
            emitted,
            vec![
                (EventKind::GameStarted, Some(730)),
                (EventKind::GameStopped, None),
                (EventKind::GameStarted, Some(570)),
                (EventKind::GameStarted, Some(440)),
                (EventKind::GameStopped, None),
            ]
        );
        assert!(!normalizer.state().is_game_running);
    }

    #[test]
    fn test_no_consecutive_duplicates_under_noise() {
        let mut normalizer = EventNormalizer::new();
        let mut last: Option<(EventKind, Option<u32>)> = None;
        // deterministic pseudo-random walk over a few apps
        let mut seed: u32 = 17;
        for _ in 0..500 {
            seed = seed.wrapping_mul(1103515245).wrapping_add(12345);
            let app = 100 + (seed >> 16) % 3;
            let running = (seed >> 8) % 2 == 0;
            if let Some(event) = normalizer.on_game_lifetime(app, running) {
                let key = (event.kind, event.app_id);
                assert_ne!(Some(key), last);
                assert_eq!(normalizer.state().is_game_running, running);
                last = Some(key);
            }
        }
    }

    #[test]
    fn test_download_start_and_complete() {
        let mut normalizer = EventNormalizer::new();
        let started = normalizer
            .on_download_items(true, &[item(10, true, false)])
            .unwrap();
        assert_eq!(started.kind, EventKind::DownloadStarted);
        assert_eq!(started.app_id, Some(10));

        let done = normalizer
            .on_download_items(false, &[item(10, false, true)])
            .unwrap();
        assert_eq!(done.kind, EventKind::DownloadCompleted);
        assert_eq!(done.app_id, Some(10));
        assert_eq!(normalizer.state().download_app_id, None);
    }

    #[test]
    fn test_download_stopped_without_completion() {
        let mut normalizer = EventNormalizer::new();
        normalizer.on_download_items(true, &[item(10, true, false)]);

        let stopped = normalizer.on_download_items(false, &[]).unwrap();
        assert_eq!(stopped.kind, EventKind::DownloadStopped);
        assert_eq!(stopped.app_id, Some(10));
    }

    #[test]
    fn test_download_switch_to_new_app() {
        let mut normalizer = EventNormalizer::new();
        normalizer.on_download_items(true, &[item(10, true, false)]);
        assert!(normalizer
            .on_download_items(true, &[item(10, true, false), item(20, false, false)])
            .is_none());

        let switched = normalizer
            .on_download_items(true, &[item(10, false, true), item(20, true, false)])
            .unwrap();
        assert_eq!(switched.kind, EventKind::DownloadStarted);
        assert_eq!(switched.app_id, Some(20));
        assert!(normalizer.state().is_downloading);
    }

    #[test]
    fn test_idle_download_items_noop() {
        let mut normalizer = EventNormalizer::new();
        assert!(normalizer.on_download_items(false, &[]).is_none());
        assert!(normalizer.on_download_items(false, &[]).is_none());
        assert_eq!(normalizer.state(), &RuntimeState::default());
    }

    #[test]
    fn test_overview_ignored_when_idle() {
        let mut normalizer = EventNormalizer::new();
        assert!(normalizer
            .on_download_overview(&overview(Some(10), 50, 100, Some(1000)))
            .is_none());
    }

    #[test]
    fn test_overview_progress_and_rate() {
        let mut normalizer = EventNormalizer::new();
        normalizer.on_download_items(true, &[item(10, true, false)]);

        let event = normalizer
            .on_download_overview(&overview(None, 333, 1000, Some(125_000)))
            .unwrap();
        assert_eq!(event.kind, EventKind::DownloadProgress);
        assert_eq!(event.progress, Some(33));
        assert_eq!(event.rate, Some(1.0));
        assert_eq!(event.app_id, Some(10));

        let zero_total = normalizer
            .on_download_overview(&overview(Some(11), 5_000, 0, None))
            .unwrap();
        assert_eq!(zero_total.progress, Some(0));
        assert_eq!(zero_total.rate, Some(0.0));
        assert_eq!(zero_total.app_id, Some(11));
    }

    #[test]
    fn test_progress_bounds() {
        assert_eq!(progress_percent(0, 0), 0);
        assert_eq!(progress_percent(123_456, 0), 0);
        assert_eq!(progress_percent(1, 200), 1);
        assert_eq!(progress_percent(500, 100), 100);
        assert_eq!(progress_percent(100, 100), 100);
    }

    #[test]
    fn test_rate_conversion() {
        assert_eq!(megabits_per_second(125_000), 1.0);
        assert_eq!(megabits_per_second(0), 0.0);
        assert_eq!(megabits_per_second(1_234_567), 9.88);
    }

    #[test]
    fn test_system_events_pass_through() {
        let mut normalizer = EventNormalizer::new();
        normalizer.on_game_lifetime(730, true);

        for event in [
            normalizer.on_suspend(),
            normalizer.on_resume(),
            normalizer.on_shutdown(),
        ] {
            let event = event.unwrap();
            assert!(event.app_id.is_none());
            assert!(event.progress.is_none());
        }
        // system events do not touch the tracked state
        assert!(normalizer.state().is_game_running);
    }

    #[test]
    fn test_reset() {
        let mut normalizer = EventNormalizer::new();
        normalizer.on_game_lifetime(730, true);
        normalizer.on_download_items(true, &[item(10, true, false)]);
        normalizer.reset();
        assert_eq!(normalizer.state(), &RuntimeState::default());
        assert!(normalizer.on_game_lifetime(730, true).is_some());
    }
}

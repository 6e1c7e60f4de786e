//! The bridge actor
//!
//! One task owns the normalizer, the activity projection and the broker
//! session. Platform callbacks, scheduler ticks and UI requests all reach it
//! as [`Command`]s on a single queue, so state is only ever touched from
//! that task and events go out in arrival order.
//!
//! [`BridgeHandle`] is the cloneable front door; every UI-facing operation
//! is a request/response over the queue.

use crate::config::{Settings, SettingsStore};
use crate::error::{BridgeError, Fault, FaultKind, FaultReporter, Result};
use crate::events::{ActivityState, EventKind, EventNormalizer, SystemEvent};
use crate::platform::{PowerNotification, RawNotification};
use crate::scheduler::TelemetryScheduler;
use crate::session::{probe, BrokerConnector, BrokerSessionManager};
use crate::telemetry::{TelemetrySampler, TelemetrySnapshot, TelemetrySource};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// How long a finished download keeps showing 100%
pub const COMPLETED_DOWNLOAD_LINGER: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ConnectionStatus {
    pub connected: bool,
}

type Reply<T> = oneshot::Sender<T>;

pub enum Command {
    Raw(RawNotification),
    Ingest {
        event: SystemEvent,
        reply: Reply<()>,
    },
    Tick {
        reply: Reply<Result<usize>>,
    },
    Connect {
        reply: Reply<Result<()>>,
    },
    Disconnect {
        reply: Reply<Result<()>>,
    },
    TestConnection {
        reply: Reply<Result<()>>,
    },
    Status {
        reply: Reply<ConnectionStatus>,
    },
    PublishNow {
        reply: Reply<Result<usize>>,
    },
    GetTelemetry {
        reply: Reply<TelemetrySnapshot>,
    },
    GetSettings {
        reply: Reply<Settings>,
    },
    SaveSettings {
        settings: Settings,
        reply: Reply<bool>,
    },
    ExpireCompletedDownload {
        generation: u64,
    },
    Shutdown {
        reply: Reply<()>,
    },
}

pub struct Bridge {
    store: Arc<dyn SettingsStore>,
    session: BrokerSessionManager,
    normalizer: EventNormalizer,
    activity: ActivityState,
    sampler: TelemetrySampler,
    scheduler: Option<TelemetryScheduler>,
    faults: FaultReporter,
    handle: BridgeHandle,
    rx: mpsc::UnboundedReceiver<Command>,
}

impl Bridge {
    /// Load settings, start the actor and its scheduler, and connect right
    /// away when a broker is configured. The actor runs until
    /// [`BridgeHandle::shutdown`].
    pub fn spawn(
        store: Arc<dyn SettingsStore>,
        connector: Arc<dyn BrokerConnector>,
        source: Arc<dyn TelemetrySource>,
    ) -> (BridgeHandle, JoinHandle<()>) {
        let faults = FaultReporter::new();
        let settings = match store.load() {
            Ok(settings) => settings,
            Err(e) => {
                faults.report(FaultKind::Settings, format!("using defaults: {}", e));
                Settings::default()
            }
        };

        let session = BrokerSessionManager::new(connector, settings, faults.clone());
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = BridgeHandle {
            tx,
            abort: session.abort_handle(),
            faults: faults.clone(),
        };

        let bridge = Bridge {
            store,
            session,
            normalizer: EventNormalizer::new(),
            activity: ActivityState::default(),
            sampler: TelemetrySampler::new(source, faults.clone()),
            scheduler: None,
            faults,
            handle: handle.clone(),
            rx,
        };
        let task = tokio::spawn(bridge.run());
        (handle, task)
    }

    async fn run(mut self) {
        info!(
            "Bridge started for device {}",
            self.session.topics().device_id()
        );

        if self.session.settings().has_broker() {
            if let Err(e) = self.session.connect().await {
                warn!("Auto-connect failed: {}", e);
            }
        }
        self.scheduler = Some(TelemetryScheduler::spawn(
            self.handle.clone(),
            self.session.settings().publish_interval(),
        ));

        while let Some(command) = self.rx.recv().await {
            if let Command::Shutdown { reply } = command {
                self.stop().await;
                let _ = reply.send(());
                return;
            }
            self.handle_command(command).await;
        }
        self.stop().await;
    }

    async fn stop(&mut self) {
        if let Some(scheduler) = self.scheduler.take() {
            scheduler.shutdown();
        }
        if let Err(e) = self.session.disconnect().await {
            warn!("Disconnect during shutdown failed: {}", e);
        }
        self.rx.close();
        info!("Bridge stopped");
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Raw(notification) => {
                if let Some(event) = self.normalize(notification) {
                    self.process_event(event).await;
                }
            }
            Command::Ingest { event, reply } => {
                self.process_event(event).await;
                let _ = reply.send(());
            }
            Command::Tick { reply } => {
                let _ = reply.send(self.scheduled_publish().await);
            }
            Command::Connect { reply } => {
                let _ = reply.send(self.session.connect().await);
            }
            Command::Disconnect { reply } => {
                let _ = reply.send(self.session.disconnect().await);
            }
            Command::TestConnection { reply } => match self.session.test_options() {
                // runs off the actor so a slow broker doesn't stall the queue
                Ok(options) => {
                    let connector = self.session.connector();
                    tokio::spawn(async move {
                        let _ = reply.send(probe(connector, options).await);
                    });
                }
                Err(e) => {
                    let _ = reply.send(Err(e));
                }
            },
            Command::Status { reply } => {
                let _ = reply.send(ConnectionStatus {
                    connected: self.session.is_connected(),
                });
            }
            Command::PublishNow { reply } => {
                let _ = reply.send(self.publish_now().await);
            }
            Command::GetTelemetry { reply } => {
                let _ = reply.send(self.sample().await);
            }
            Command::GetSettings { reply } => {
                let _ = reply.send(self.session.settings().masked());
            }
            Command::SaveSettings { settings, reply } => {
                let _ = reply.send(self.save_settings(settings).await);
            }
            Command::ExpireCompletedDownload { generation } => {
                if self.activity.expire_completed_download(generation) {
                    debug!("Cleared completed download state");
                }
            }
            Command::Shutdown { reply } => {
                let _ = reply.send(());
            }
        }
    }

    fn normalize(&mut self, notification: RawNotification) -> Option<SystemEvent> {
        match notification {
            RawNotification::AppLifetime(n) => {
                if n.running && n.app_id == 0 {
                    debug!("Ignoring app start without an app id");
                    return None;
                }
                self.normalizer.on_game_lifetime(n.app_id, n.running)
            }
            RawNotification::DownloadItems(update) => self
                .normalizer
                .on_download_items(update.is_downloading, &update.items),
            RawNotification::DownloadOverview(overview) => {
                self.normalizer.on_download_overview(&overview)
            }
            RawNotification::Power(PowerNotification::Suspend) => self.normalizer.on_suspend(),
            RawNotification::Power(PowerNotification::Resume) => self.normalizer.on_resume(),
            RawNotification::Power(PowerNotification::Shutdown) => self.normalizer.on_shutdown(),
        }
    }

    async fn process_event(&mut self, event: SystemEvent) {
        match event.kind {
            EventKind::GameStarted if self.activity.game.is_running => warn!(
                "game_started for {:?} while {:?} is running",
                event.app_id, self.activity.game.app_id
            ),
            EventKind::GameStopped if !self.activity.game.is_running => {
                warn!("game_stopped while no game is running")
            }
            EventKind::DownloadStarted if self.activity.download.downloading => {
                warn!("download_started for {:?} while a download is active", event.app_id)
            }
            _ => {}
        }
        info!(event = %event.kind, app_id = ?event.app_id, "system event");

        let touched = self.activity.apply(&event);
        self.session
            .publish_event(&event, &touched, &self.activity)
            .await;

        if event.kind == EventKind::DownloadCompleted {
            let generation = self.activity.download_generation;
            let tx = self.handle.tx.clone();
            tokio::spawn(async move {
                tokio::time::sleep(COMPLETED_DOWNLOAD_LINGER).await;
                let _ = tx.send(Command::ExpireCompletedDownload { generation });
            });
        }
    }

    /// Sampling reads sysfs and mount tables, so it runs on the blocking pool
    fn sample(&self) -> impl std::future::Future<Output = TelemetrySnapshot> + Send + 'static {
        let sampler = self.sampler.clone();
        let activity = self.activity.clone();
        let faults = self.faults.clone();
        async move {
            let fallback = TelemetrySnapshot {
                game: activity.game.clone(),
                download: activity.download.clone(),
                ..TelemetrySnapshot::default()
            };
            match tokio::task::spawn_blocking(move || sampler.sample(&activity)).await {
                Ok(snapshot) => snapshot,
                Err(e) => {
                    faults.report(FaultKind::Sampling, e.to_string());
                    fallback
                }
            }
        }
    }

    async fn scheduled_publish(&mut self) -> Result<usize> {
        if !self.session.is_connected() {
            self.faults.report(
                FaultKind::PublishSkipped,
                "scheduled snapshot skipped: not connected",
            );
            return Ok(0);
        }
        let snapshot = self.sample().await;
        Ok(self.session.publish_snapshot(&snapshot).await)
    }

    async fn publish_now(&mut self) -> Result<usize> {
        if !self.session.is_connected() {
            return Err(BridgeError::NotConnected);
        }
        let snapshot = self.sample().await;
        let published = self.session.publish_snapshot(&snapshot).await;
        if !self.session.is_connected() {
            return Err(BridgeError::NotConnected);
        }
        Ok(published)
    }

    async fn save_settings(&mut self, submitted: Settings) -> bool {
        let current = self.session.settings().clone();
        let next = submitted.unmask_password(&current).normalized();

        if let Err(e) = self.store.save(&next) {
            self.faults.report(FaultKind::Settings, e.to_string());
            return false;
        }
        if let Some(scheduler) = &self.scheduler {
            scheduler.set_period(next.publish_interval());
        }

        let was_connected = self.session.is_connected();
        let connection_changed = current.connection_differs(&next);

        if was_connected && connection_changed {
            if current.hostname != next.hostname {
                self.session.retract_discovery().await;
            }
            if let Err(e) = self.session.disconnect().await {
                warn!("Disconnect before reconnect failed: {}", e);
            }
        }

        let previous = self.session.apply_settings(next);
        info!("Settings saved");

        if connection_changed || !was_connected {
            if self.session.settings().has_broker() {
                if let Err(e) = self.session.connect().await {
                    warn!("Reconnect after save failed: {}", e);
                }
            }
        } else {
            let retractions = crate::discovery::DiscoveryPublisher::new(self.session.settings())
                .retractions(&previous.enabled_sensors);
            self.session.republish_discovery(retractions).await;
        }
        true
    }
}

/// Cloneable handle to the bridge actor
#[derive(Clone)]
pub struct BridgeHandle {
    tx: mpsc::UnboundedSender<Command>,
    abort: Arc<Notify>,
    faults: FaultReporter,
}

impl BridgeHandle {
    async fn request<T>(&self, make: impl FnOnce(Reply<T>) -> Command) -> Result<T> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(make(reply))
            .map_err(|_| BridgeError::ActorGone)?;
        rx.await.map_err(|_| BridgeError::ActorGone)
    }

    /// A handle with no actor behind it; the caller answers the commands
    #[cfg(test)]
    pub(crate) fn detached() -> (Self, mpsc::UnboundedReceiver<Command>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = Self {
            tx,
            abort: Arc::new(Notify::new()),
            faults: FaultReporter::new(),
        };
        (handle, rx)
    }

    pub async fn connect(&self) -> Result<()> {
        self.request(|reply| Command::Connect { reply }).await?
    }

    /// Safe at any time; an in-flight connect is abandoned first
    pub async fn disconnect(&self) -> Result<()> {
        self.abort.notify_waiters();
        self.request(|reply| Command::Disconnect { reply }).await?
    }

    /// Connect and disconnect with the saved settings, leaving the live
    /// session alone
    pub async fn test_connection(&self) -> Result<()> {
        self.request(|reply| Command::TestConnection { reply }).await?
    }

    pub async fn connection_status(&self) -> Result<ConnectionStatus> {
        self.request(|reply| Command::Status { reply }).await
    }

    /// Sample and publish immediately; fails when not connected
    pub async fn publish_now(&self) -> Result<usize> {
        self.request(|reply| Command::PublishNow { reply }).await?
    }

    pub(crate) async fn tick(&self) -> Result<usize> {
        self.request(|reply| Command::Tick { reply }).await?
    }

    pub async fn telemetry(&self) -> Result<TelemetrySnapshot> {
        self.request(|reply| Command::GetTelemetry { reply }).await
    }

    /// Current settings with the password masked
    pub async fn settings(&self) -> Result<Settings> {
        self.request(|reply| Command::GetSettings { reply }).await
    }

    pub async fn save_settings(&self, settings: Settings) -> bool {
        self.request(|reply| Command::SaveSettings { settings, reply })
            .await
            .unwrap_or(false)
    }

    /// `save_settings` for an untyped payload; bad fields become defaults.
    /// A payload that is not an object is refused and nothing is saved.
    pub async fn save_settings_json(&self, value: serde_json::Value) -> bool {
        if !value.is_object() {
            warn!("Settings payload is not an object: {}", value);
            return false;
        }
        self.save_settings(Settings::from_json(value)).await
    }

    pub async fn ingest_event(&self, event: SystemEvent) -> Result<()> {
        self.request(|reply| Command::Ingest { event, reply }).await
    }

    /// Ingest an untyped event. Returns false for unknown event types.
    pub async fn ingest_json(&self, value: &serde_json::Value) -> Result<bool> {
        match SystemEvent::from_json(value) {
            Some(event) => self.ingest_event(event).await.map(|_| true),
            None => {
                warn!("Unknown event: {}", value);
                Ok(false)
            }
        }
    }

    /// Queue a raw platform callback. Never blocks.
    pub fn notify_raw(&self, notification: RawNotification) {
        if self.tx.send(Command::Raw(notification)).is_err() {
            debug!("Bridge gone, dropping platform notification");
        }
    }

    pub fn faults(&self) -> broadcast::Receiver<Fault> {
        self.faults.subscribe()
    }

    pub fn fault_reporter(&self) -> &FaultReporter {
        &self.faults
    }

    /// Stop the scheduler, publish `offline` if connected and end the actor
    pub async fn shutdown(&self) -> Result<()> {
        self.abort.notify_waiters();
        self.request(|reply| Command::Shutdown { reply }).await
    }
}

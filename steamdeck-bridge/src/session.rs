//! Broker session management
//!
//! [`BrokerSessionManager`] owns the one connection to the broker and walks
//! it through `Disconnected -> Connecting -> Connected`. It registers the
//! Last-Will, announces availability, republishes discovery and routes
//! snapshots (retained) and events (transient) onto their topics.
//!
//! The transport sits behind [`BrokerConnector`] / [`BrokerLink`] so the
//! manager runs unchanged against rumqttc or an in-memory broker.

use crate::config::Settings;
use crate::discovery::{DiscoveryDocument, DiscoveryPublisher};
use crate::error::{BridgeError, FaultKind, FaultReporter, Result};
use crate::events::{ActivityState, SystemEvent};
use crate::telemetry::TelemetrySnapshot;
use crate::topics::{SensorCategory, TopicLayout, PAYLOAD_OFFLINE, PAYLOAD_ONLINE};
use futures::future::BoxFuture;
use rumqttc::QoS;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tracing::{debug, info, warn};

pub const KEEP_ALIVE: Duration = Duration::from_secs(60);

/// One outgoing message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Publication {
    pub topic: String,
    pub payload: String,
    pub qos: QoS,
    pub retain: bool,
}

impl Publication {
    pub fn retained(topic: impl Into<String>, payload: impl Into<String>, qos: QoS) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            qos,
            retain: true,
        }
    }

    pub fn transient(topic: impl Into<String>, payload: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            qos: QoS::AtMostOnce,
            retain: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectOptions {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub client_id: String,
    pub keep_alive: Duration,
    pub last_will: Option<Publication>,
}

/// Opens connections to a broker
pub trait BrokerConnector: Send + Sync + 'static {
    /// Resolves once the broker has accepted the connection
    fn connect(&self, options: ConnectOptions) -> BoxFuture<'_, Result<Box<dyn BrokerLink>>>;
}

/// An established connection
pub trait BrokerLink: Send {
    fn publish(&mut self, publication: Publication) -> BoxFuture<'_, Result<()>>;

    /// False once the transport has dropped underneath us
    fn is_alive(&self) -> bool;

    fn close(self: Box<Self>) -> BoxFuture<'static, Result<()>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Connected,
}

pub struct BrokerSession {
    link: Box<dyn BrokerLink>,
    connected_at: Instant,
    publish_failures: u32,
}

/// Connect, wait for the ack, and hang up again
pub async fn probe(connector: Arc<dyn BrokerConnector>, options: ConnectOptions) -> Result<()> {
    let host = format!("{}:{}", options.host, options.port);
    let link = connector.connect(options).await?;
    if let Err(e) = link.close().await {
        debug!("closing test connection to {} failed: {}", host, e);
    }
    info!("Test connection to {} succeeded", host);
    Ok(())
}

pub struct BrokerSessionManager {
    connector: Arc<dyn BrokerConnector>,
    settings: Settings,
    discovery: DiscoveryPublisher,
    faults: FaultReporter,
    abort: Arc<Notify>,
    session: Option<BrokerSession>,
    state: SessionState,
}

impl BrokerSessionManager {
    pub fn new(connector: Arc<dyn BrokerConnector>, settings: Settings, faults: FaultReporter) -> Self {
        Self {
            connector,
            discovery: DiscoveryPublisher::new(&settings),
            settings,
            faults,
            abort: Arc::new(Notify::new()),
            session: None,
            state: SessionState::Disconnected,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state == SessionState::Connected
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn topics(&self) -> &TopicLayout {
        self.discovery.topics()
    }

    pub fn connector(&self) -> Arc<dyn BrokerConnector> {
        Arc::clone(&self.connector)
    }

    /// Wakes an in-flight `connect` and makes it give up
    pub fn abort_handle(&self) -> Arc<Notify> {
        Arc::clone(&self.abort)
    }

    /// Time since the current session was established
    pub fn uptime(&self) -> Option<Duration> {
        self.session.as_ref().map(|s| s.connected_at.elapsed())
    }

    /// Publishes that failed on the current session
    pub fn publish_failures(&self) -> u32 {
        self.session.as_ref().map_or(0, |s| s.publish_failures)
    }

    /// Swap in new settings; returns the old ones. The live session keeps
    /// running, callers decide whether to reconnect or republish.
    pub fn apply_settings(&mut self, settings: Settings) -> Settings {
        self.discovery = DiscoveryPublisher::new(&settings);
        std::mem::replace(&mut self.settings, settings)
    }

    fn base_options(&self, client_id: String) -> Result<ConnectOptions> {
        if !self.settings.has_broker() {
            return Err(BridgeError::connectivity("MQTT host is not configured"));
        }
        let non_empty = |s: &str| (!s.is_empty()).then(|| s.to_string());
        Ok(ConnectOptions {
            host: self.settings.mqtt_host.clone(),
            port: self.settings.mqtt_port,
            username: non_empty(&self.settings.mqtt_username),
            password: non_empty(&self.settings.mqtt_password),
            client_id,
            keep_alive: KEEP_ALIVE,
            last_will: None,
        })
    }

    /// Options for a throwaway connection: fresh client id, no Last-Will
    pub fn test_options(&self) -> Result<ConnectOptions> {
        self.base_options(format!("steamdeck-bridge-test-{}", uuid::Uuid::new_v4()))
    }

    pub async fn test_connection(&self) -> Result<()> {
        probe(self.connector(), self.test_options()?).await
    }

    /// Establish the session. Connecting while connected reconnects.
    pub async fn connect(&mut self) -> Result<()> {
        if self.session.is_some() {
            info!("Reconnecting to MQTT broker");
            self.disconnect().await?;
        }

        let client_id = format!("steamdeck-bridge-{}", self.topics().device_id());
        let mut options = match self.base_options(client_id) {
            Ok(options) => options,
            Err(e) => {
                self.faults.report(FaultKind::Connectivity, e.to_string());
                return Err(e);
            }
        };
        options.last_will = Some(Publication::retained(
            self.topics().status(),
            PAYLOAD_OFFLINE,
            QoS::AtLeastOnce,
        ));

        self.state = SessionState::Connecting;
        info!("Connecting to MQTT broker {}:{}", options.host, options.port);

        let connector = Arc::clone(&self.connector);
        let abort = Arc::clone(&self.abort);
        let attempt = tokio::select! {
            result = connector.connect(options) => result,
            _ = abort.notified() => Err(BridgeError::Cancelled),
        };

        let link = match attempt {
            Ok(link) => link,
            Err(e) => {
                self.state = SessionState::Disconnected;
                self.faults.report(FaultKind::Connectivity, e.to_string());
                return Err(e);
            }
        };

        self.session = Some(BrokerSession {
            link,
            connected_at: Instant::now(),
            publish_failures: 0,
        });
        self.state = SessionState::Connected;

        let online = Publication::retained(self.topics().status(), PAYLOAD_ONLINE, QoS::AtLeastOnce);
        if let Err(e) = self.send(online).await {
            self.disconnect().await?;
            return Err(BridgeError::connectivity(e.to_string()));
        }

        let published = self.publish_documents(self.discovery.documents()).await;
        info!(
            "Connected to MQTT broker as {}, {} discovery documents published",
            self.topics().device_id(),
            published
        );
        Ok(())
    }

    /// Publish `offline` (if we ever got connected) and close. Always ends
    /// in `Disconnected`; calling it while disconnected does nothing.
    pub async fn disconnect(&mut self) -> Result<()> {
        self.state = SessionState::Disconnected;
        let Some(mut session) = self.session.take() else {
            return Ok(());
        };

        if session.link.is_alive() {
            let offline = Publication::retained(self.topics().status(), PAYLOAD_OFFLINE, QoS::AtLeastOnce);
            if let Err(e) = session.link.publish(offline).await {
                self.faults
                    .report(FaultKind::PublishFailed, format!("offline status: {}", e));
            }
        }

        if let Err(e) = session.link.close().await {
            warn!("Closing MQTT connection failed: {}", e);
        }
        info!(
            "Disconnected from MQTT broker after {:?}",
            session.connected_at.elapsed()
        );
        Ok(())
    }

    /// Drop a session whose transport died. The broker has already fired
    /// the Last-Will.
    fn check_link(&mut self) -> bool {
        let alive = match &self.session {
            Some(session) => session.link.is_alive(),
            None => return false,
        };
        if !alive {
            self.session = None;
            self.state = SessionState::Disconnected;
            self.faults
                .report(FaultKind::Connectivity, "connection to MQTT broker lost");
        }
        alive
    }

    async fn send(&mut self, publication: Publication) -> Result<()> {
        let Some(session) = self.session.as_mut() else {
            return Err(BridgeError::NotConnected);
        };

        let topic = publication.topic.clone();
        match session.link.publish(publication).await {
            Ok(()) => {
                debug!("Published to {}", topic);
                Ok(())
            }
            Err(e) => {
                session.publish_failures += 1;
                self.faults
                    .report(FaultKind::PublishFailed, format!("{}: {}", topic, e));
                Err(e)
            }
        }
    }

    async fn publish_documents(&mut self, documents: Vec<DiscoveryDocument>) -> usize {
        let mut published = 0;
        for doc in documents {
            let publication = Publication::retained(doc.topic, doc.payload, QoS::AtMostOnce);
            if self.send(publication).await.is_ok() {
                published += 1;
            }
        }
        published
    }

    fn skip(&self, what: impl std::fmt::Display) {
        self.faults.report(
            FaultKind::PublishSkipped,
            format!("{} skipped: not connected", what),
        );
    }

    /// Publish retractions, then the full document set for the current
    /// settings. Skipped when disconnected; the next connect publishes them.
    pub async fn republish_discovery(&mut self, retractions: Vec<DiscoveryDocument>) -> usize {
        if !self.check_link() {
            self.skip("discovery");
            return 0;
        }
        let mut documents = retractions;
        documents.extend(self.discovery.documents());
        self.publish_documents(documents).await
    }

    /// Remove every entity announced under the current hostname
    pub async fn retract_discovery(&mut self) -> usize {
        if !self.check_link() {
            self.skip("discovery retraction");
            return 0;
        }
        let documents = self.discovery.retract_all();
        self.publish_documents(documents).await
    }

    /// Heartbeat, then one retained message per enabled hardware category.
    /// Returns the number of telemetry messages sent.
    pub async fn publish_snapshot(&mut self, snapshot: &TelemetrySnapshot) -> usize {
        if !self.check_link() {
            self.skip("snapshot");
            return 0;
        }

        let heartbeat = Publication::retained(self.topics().status(), PAYLOAD_ONLINE, QoS::AtLeastOnce);
        if self.send(heartbeat).await.is_err() {
            return 0;
        }

        let mut published = 0;
        for category in SensorCategory::ALL {
            if !category.is_polled() || !self.settings.enabled_sensors.is_enabled(category) {
                continue;
            }
            let payload = match category {
                SensorCategory::Battery => serde_json::to_string(&snapshot.battery),
                SensorCategory::Disk => serde_json::to_string(&snapshot.disk),
                SensorCategory::Network => serde_json::to_string(&snapshot.network),
                SensorCategory::Game | SensorCategory::Download => continue,
            };
            let payload = match payload {
                Ok(payload) => payload,
                Err(e) => {
                    self.faults
                        .report(FaultKind::PublishFailed, format!("{}: {}", category, e));
                    continue;
                }
            };

            let topic = self.topics().telemetry(category);
            if self
                .send(Publication::retained(topic, payload, QoS::AtMostOnce))
                .await
                .is_ok()
            {
                published += 1;
            }
        }
        published
    }

    /// Publish the state `event` produced on each of `touched` that is
    /// enabled. Non-retained; dropped when disconnected.
    pub async fn publish_event(
        &mut self,
        event: &SystemEvent,
        touched: &[SensorCategory],
        activity: &ActivityState,
    ) -> usize {
        if touched.is_empty() {
            return 0;
        }
        if !self.check_link() {
            self.skip(format_args!("event {}", event.kind));
            return 0;
        }

        let mut published = 0;
        for &category in touched {
            if !self.settings.enabled_sensors.is_enabled(category) {
                continue;
            }
            let payload = match event_payload(event, category, activity) {
                Ok(payload) => payload,
                Err(e) => {
                    self.faults
                        .report(FaultKind::PublishFailed, format!("{}: {}", category, e));
                    continue;
                }
            };
            let topic = self.topics().telemetry(category);
            if self.send(Publication::transient(topic, payload)).await.is_ok() {
                published += 1;
            }
        }
        published
    }
}

/// Projected state of `category` plus the event that caused it
fn event_payload(
    event: &SystemEvent,
    category: SensorCategory,
    activity: &ActivityState,
) -> Result<String> {
    let mut value = match category {
        SensorCategory::Game => serde_json::to_value(&activity.game)?,
        SensorCategory::Download => {
            let mut v = serde_json::to_value(&activity.download)?;
            if let Value::Object(map) = &mut v {
                map.insert(
                    "app_id".into(),
                    json!(event.app_id.or(activity.download.app_id)),
                );
            }
            v
        }
        other => return Err(BridgeError::publish(other.slug(), "not an event category")),
    };

    if let Value::Object(map) = &mut value {
        map.insert("event".into(), json!(event.kind));
        map.insert("timestamp".into(), json!(event.timestamp));
    }
    Ok(serde_json::to_string(&value)?)
}

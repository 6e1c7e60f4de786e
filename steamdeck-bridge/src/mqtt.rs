//! rumqttc transport
//!
//! `connect` polls the event loop until the broker's CONNACK arrives, then
//! hands the event loop to a driver task. The driver keeps the connection
//! moving until we send DISCONNECT or the transport fails, and flips the
//! link's `alive` flag when it stops.

use crate::error::{BridgeError, Result};
use crate::session::{BrokerConnector, BrokerLink, ConnectOptions, Publication};
use futures::future::BoxFuture;
use rumqttc::{
    AsyncClient, ConnectReturnCode, Event, EventLoop, Incoming, LastWill, MqttOptions, Outgoing,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, warn};

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);
const REQUEST_CAPACITY: usize = 32;

#[derive(Debug, Clone)]
pub struct MqttConnector {
    connect_timeout: Duration,
}

impl Default for MqttConnector {
    fn default() -> Self {
        Self {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }
}

impl MqttConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_connect_timeout(mut self, connect_timeout: Duration) -> Self {
        self.connect_timeout = connect_timeout;
        self
    }
}

fn mqtt_options(options: &ConnectOptions) -> MqttOptions {
    let mut mqtt = MqttOptions::new(&options.client_id, &options.host, options.port);
    mqtt.set_keep_alive(options.keep_alive);
    mqtt.set_clean_session(true);

    if let Some(username) = &options.username {
        mqtt.set_credentials(username, options.password.clone().unwrap_or_default());
    }
    if let Some(will) = &options.last_will {
        mqtt.set_last_will(LastWill::new(
            &will.topic,
            will.payload.clone(),
            will.qos,
            will.retain,
        ));
    }
    mqtt
}

async fn wait_for_connack(eventloop: &mut EventLoop) -> Result<()> {
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Incoming::ConnAck(ack))) => {
                return if ack.code == ConnectReturnCode::Success {
                    Ok(())
                } else {
                    Err(BridgeError::connectivity(format!(
                        "broker refused connection: {:?}",
                        ack.code
                    )))
                };
            }
            Ok(_) => {}
            Err(e) => return Err(BridgeError::connectivity(e.to_string())),
        }
    }
}

async fn drive(mut eventloop: EventLoop, alive: Arc<AtomicBool>) {
    loop {
        match eventloop.poll().await {
            Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                debug!("MQTT disconnect sent");
                break;
            }
            Ok(Event::Incoming(Incoming::Disconnect)) => {
                warn!("MQTT broker closed the session");
                break;
            }
            Ok(_) => {}
            Err(e) => {
                warn!("MQTT connection lost: {}", e);
                break;
            }
        }
    }
    alive.store(false, Ordering::SeqCst);
}

impl BrokerConnector for MqttConnector {
    fn connect(&self, options: ConnectOptions) -> BoxFuture<'_, Result<Box<dyn BrokerLink>>> {
        Box::pin(async move {
            let (client, mut eventloop) = AsyncClient::new(mqtt_options(&options), REQUEST_CAPACITY);

            match timeout(self.connect_timeout, wait_for_connack(&mut eventloop)).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => return Err(e),
                Err(_) => {
                    return Err(BridgeError::connectivity(format!(
                        "no answer from {}:{} within {:?}",
                        options.host, options.port, self.connect_timeout
                    )))
                }
            }

            let alive = Arc::new(AtomicBool::new(true));
            let driver = tokio::spawn(drive(eventloop, Arc::clone(&alive)));
            Ok(Box::new(MqttLink {
                client,
                alive,
                driver,
            }) as Box<dyn BrokerLink>)
        })
    }
}

pub struct MqttLink {
    client: AsyncClient,
    alive: Arc<AtomicBool>,
    driver: JoinHandle<()>,
}

impl BrokerLink for MqttLink {
    fn publish(&mut self, publication: Publication) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            if !self.is_alive() {
                return Err(BridgeError::publish(publication.topic, "connection closed"));
            }
            let topic = publication.topic;
            self.client
                .publish(
                    topic.clone(),
                    publication.qos,
                    publication.retain,
                    publication.payload.into_bytes(),
                )
                .await
                .map_err(|e| BridgeError::publish(topic, e))
        })
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    fn close(self: Box<Self>) -> BoxFuture<'static, Result<()>> {
        Box::pin(async move {
            let MqttLink {
                client,
                alive,
                mut driver,
            } = *self;

            let sent = client.disconnect().await;
            if timeout(CLOSE_TIMEOUT, &mut driver).await.is_err() {
                debug!("MQTT driver did not stop in time, aborting it");
                driver.abort();
            }
            alive.store(false, Ordering::SeqCst);
            sent.map_err(|e| BridgeError::connectivity(e.to_string()))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::KEEP_ALIVE;
    use rumqttc::QoS;

    fn options(port: u16) -> ConnectOptions {
        ConnectOptions {
            host: "127.0.0.1".into(),
            port,
            username: Some("deck".into()),
            password: Some("secret".into()),
            client_id: "steamdeck-bridge-test".into(),
            keep_alive: KEEP_ALIVE,
            last_will: Some(Publication::retained(
                "steamdeck/deck/status",
                "offline",
                QoS::AtLeastOnce,
            )),
        }
    }

    #[test]
    fn test_options_carry_will_and_credentials() {
        let mqtt = mqtt_options(&options(1883));
        assert_eq!(mqtt.broker_address(), ("127.0.0.1".to_string(), 1883));
        assert_eq!(mqtt.keep_alive(), KEEP_ALIVE);
        assert_eq!(mqtt.credentials(), Some(("deck".to_string(), "secret".to_string())));

        let will = mqtt.last_will().unwrap();
        assert_eq!(will.topic, "steamdeck/deck/status");
        assert_eq!(&will.message[..], b"offline");
        assert!(will.retain);
    }

    #[tokio::test]
    async fn test_connection_refused() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let err = MqttConnector::new().connect(options(port)).await.err().unwrap();
        assert!(matches!(err, BridgeError::Connectivity { .. }));
    }

    #[tokio::test]
    async fn test_silent_broker_times_out() {
        // accepts TCP but never answers CONNECT
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let _server = tokio::spawn(async move {
            let _conn = listener.accept().await;
            futures::future::pending::<()>().await;
        });

        let connector = MqttConnector::new().with_connect_timeout(Duration::from_millis(200));
        let err = connector.connect(options(port)).await.err().unwrap();
        assert!(err.to_string().contains("no answer"));
    }
}

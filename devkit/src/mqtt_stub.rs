/*!
In-memory MQTT broker

Implements the bridge's `BrokerConnector`, so a bridge can run against it
without a real broker. Every accepted publication is recorded with the
client id that sent it; retained publications also update a per-topic
retained store (an empty payload clears it, as on a real broker). Dropping
a connection from the broker side fires that client's Last-Will.
*/

use futures::future::BoxFuture;
use parking_lot::Mutex;
use rumqttc::QoS;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use steamdeck_bridge::session::{BrokerConnector, BrokerLink, ConnectOptions, Publication};
use steamdeck_bridge::{BridgeError, Result};

#[derive(Debug, Clone, PartialEq)]
pub struct MockMessage {
    pub client_id: String,
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: QoS,
    pub retain: bool,
}

impl MockMessage {
    pub fn payload_str(&self) -> &str {
        std::str::from_utf8(&self.payload).unwrap_or("")
    }

    pub fn json(&self) -> Option<Value> {
        serde_json::from_slice(&self.payload).ok()
    }
}

struct Connection {
    options: ConnectOptions,
    alive: Arc<AtomicBool>,
}

#[derive(Default)]
struct BrokerState {
    published: Mutex<Vec<MockMessage>>,
    retained: Mutex<HashMap<String, MockMessage>>,
    connects: Mutex<Vec<ConnectOptions>>,
    open: Mutex<Vec<Connection>>,
    refuse: AtomicBool,
    connect_delay: Mutex<Option<Duration>>,
}

impl BrokerState {
    fn record(&self, client_id: &str, publication: Publication) {
        let message = MockMessage {
            client_id: client_id.to_string(),
            topic: publication.topic,
            payload: publication.payload.into_bytes(),
            qos: publication.qos,
            retain: publication.retain,
        };

        if message.retain {
            let mut retained = self.retained.lock();
            if message.payload.is_empty() {
                retained.remove(&message.topic);
            } else {
                retained.insert(message.topic.clone(), message.clone());
            }
        }
        tracing::debug!("[MOCK] {} published to {}", message.client_id, message.topic);
        self.published.lock().push(message);
    }
}

/// Shared handle to the in-memory broker. Clones see the same state.
#[derive(Clone, Default)]
pub struct MockBroker {
    state: Arc<BrokerState>,
}

impl MockBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Refuse (or accept again) new connections
    pub fn set_refuse_connections(&self, refuse: bool) {
        self.state.refuse.store(refuse, Ordering::SeqCst);
    }

    /// Hold every CONNECT this long before answering
    pub fn set_connect_delay(&self, delay: Option<Duration>) {
        *self.state.connect_delay.lock() = delay;
    }

    /// Kill every open connection as if the network went away. Each
    /// client's Last-Will is published.
    pub fn drop_connections(&self) {
        let open: Vec<Connection> = self.state.open.lock().drain(..).collect();
        for connection in open {
            if !connection.alive.swap(false, Ordering::SeqCst) {
                continue;
            }
            if let Some(will) = connection.options.last_will {
                self.state.record(&connection.options.client_id, will);
            }
        }
    }

    pub fn open_connections(&self) -> usize {
        self.state
            .open
            .lock()
            .iter()
            .filter(|c| c.alive.load(Ordering::SeqCst))
            .count()
    }

    /// Options of every CONNECT received, accepted or not
    pub fn connect_attempts(&self) -> Vec<ConnectOptions> {
        self.state.connects.lock().clone()
    }

    pub fn published_messages(&self) -> Vec<MockMessage> {
        self.state.published.lock().clone()
    }

    pub fn find_messages_by_topic(&self, topic: &str) -> Vec<MockMessage> {
        self.state
            .published
            .lock()
            .iter()
            .filter(|msg| msg.topic == topic)
            .cloned()
            .collect()
    }

    pub fn find_messages_by_prefix(&self, prefix: &str) -> Vec<MockMessage> {
        self.state
            .published
            .lock()
            .iter()
            .filter(|msg| msg.topic.starts_with(prefix))
            .cloned()
            .collect()
    }

    /// What a subscriber joining now would receive for `topic`
    pub fn retained(&self, topic: &str) -> Option<MockMessage> {
        self.state.retained.lock().get(topic).cloned()
    }

    /// Parse the last message published on a topic
    pub fn get_last_json_message<T>(&self, topic: &str) -> anyhow::Result<Option<T>>
    where
        T: for<'de> serde::Deserialize<'de>,
    {
        match self.find_messages_by_topic(topic).last() {
            Some(last) => Ok(Some(serde_json::from_slice(&last.payload)?)),
            None => Ok(None),
        }
    }

    /// Forget the publication log. Retained state and connections stay.
    pub fn clear(&self) {
        self.state.published.lock().clear();
        self.state.connects.lock().clear();
    }
}

impl BrokerConnector for MockBroker {
    fn connect(&self, options: ConnectOptions) -> BoxFuture<'_, Result<Box<dyn BrokerLink>>> {
        Box::pin(async move {
            self.state.connects.lock().push(options.clone());

            let delay = *self.state.connect_delay.lock();
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            if self.state.refuse.load(Ordering::SeqCst) {
                return Err(BridgeError::connectivity(format!(
                    "connection refused by {}:{}",
                    options.host, options.port
                )));
            }

            let alive = Arc::new(AtomicBool::new(true));
            let client_id = options.client_id.clone();
            self.state.open.lock().push(Connection {
                options,
                alive: Arc::clone(&alive),
            });
            tracing::debug!("[MOCK] {} connected", client_id);

            Ok(Box::new(MockLink {
                client_id,
                state: Arc::clone(&self.state),
                alive,
            }) as Box<dyn BrokerLink>)
        })
    }
}

struct MockLink {
    client_id: String,
    state: Arc<BrokerState>,
    alive: Arc<AtomicBool>,
}

impl BrokerLink for MockLink {
    fn publish(&mut self, publication: Publication) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            if !self.alive.load(Ordering::SeqCst) {
                return Err(BridgeError::publish(publication.topic, "connection closed"));
            }
            self.state.record(&self.client_id, publication);
            Ok(())
        })
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    // graceful close: the will is discarded
    fn close(self: Box<Self>) -> BoxFuture<'static, Result<()>> {
        Box::pin(async move {
            self.alive.store(false, Ordering::SeqCst);
            let alive = &self.alive;
            self.state
                .open
                .lock()
                .retain(|c| !Arc::ptr_eq(&c.alive, alive));
            tracing::debug!("[MOCK] {} disconnected", self.client_id);
            Ok(())
        })
    }
}

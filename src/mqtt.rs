use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use rumqttc::{AsyncClient, Event, MqttOptions, Outgoing, Packet, QoS, SubscribeFilter};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::config::Config;
use crate::error::{BridgeError, Result};

/// Capacity of the inbound message channel and the rumqttc request queue.
const CHANNEL_CAPACITY: usize = 256;

/// A PUBLISH received from the broker.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Vec<u8>,
}

/// Publish/subscribe contract the bridge consumes. Safe to share between
/// every entity's tasks.
#[async_trait]
pub trait Broker: Send + Sync {
    async fn subscribe(&self, topics: &[String]) -> Result<()>;

    async fn publish(&self, topic: &str, payload: &str, retain: bool) -> Result<()>;

    /// From here on, publishes and the disconnect fail instead of waiting
    /// for room in a full outbound queue.
    fn begin_shutdown(&self) {}

    /// Returns once everything published before it has been handed to the
    /// transport.
    async fn disconnect(&self) -> Result<()>;
}

/// An established session plus its stream of inbound messages.
pub struct Connection {
    pub broker: Arc<dyn Broker>,
    pub inbound: mpsc::Receiver<InboundMessage>,
}

#[async_trait]
pub trait Connector: Send + Sync {
    /// Fails with `Connection` if the broker is unreachable or refuses us.
    async fn connect(&self) -> Result<Connection>;
}

// ── rumqttc implementation ───────────────────────────────

pub struct RumqttConnector {
    host: String,
    port: u16,
    client_id: String,
    credentials: Option<(String, String)>,
    keep_alive: Duration,
    qos: QoS,
}

impl RumqttConnector {
    pub fn from_config(config: &Config) -> Self {
        let credentials = config.mqtt.username.clone().map(|user| {
            let password = config.mqtt.password.clone().unwrap_or_default();
            (user, password)
        });
        Self {
            host: config.mqtt.host.clone(),
            port: config.mqtt.port,
            client_id: config.client_id(),
            credentials,
            keep_alive: Duration::from_secs(config.mqtt.keep_alive_secs),
            qos: qos_from(config.qos),
        }
    }
}

pub fn qos_from(level: u8) -> QoS {
    match level {
        0 => QoS::AtMostOnce,
        1 => QoS::AtLeastOnce,
        _ => QoS::ExactlyOnce,
    }
}

#[async_trait]
impl Connector for RumqttConnector {
    async fn connect(&self) -> Result<Connection> {
        let mut options = MqttOptions::new(&self.client_id, &self.host, self.port);
        options.set_keep_alive(self.keep_alive);
        options.set_clean_session(true);
        if let Some((user, password)) = &self.credentials {
            options.set_credentials(user, password);
        }

        let (client, mut eventloop) = AsyncClient::new(options, CHANNEL_CAPACITY);

        // The session only counts as established once the broker acks it.
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(_))) => break,
                Ok(_) => continue,
                Err(e) => {
                    return Err(BridgeError::connection(format!(
                        "{}:{}: {}",
                        self.host, self.port, e
                    )))
                }
            }
        }
        tracing::info!(
            "Connected to MQTT broker {}:{} as {}",
            self.host,
            self.port,
            self.client_id
        );

        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        let subscriptions = Arc::new(Mutex::new(Vec::new()));
        let stopping = Arc::new(AtomicBool::new(false));

        let pump = tokio::spawn(pump(
            eventloop,
            client.clone(),
            tx,
            subscriptions.clone(),
            stopping.clone(),
            self.qos,
        ));

        let broker = MqttBroker {
            client,
            qos: self.qos,
            subscriptions,
            stopping,
            pump: Mutex::new(Some(pump)),
        };
        Ok(Connection {
            broker: Arc::new(broker),
            inbound: rx,
        })
    }
}

pub struct MqttBroker {
    client: AsyncClient,
    qos: QoS,
    /// Command topics, replayed after every reconnect.
    subscriptions: Arc<Mutex<Vec<String>>>,
    stopping: Arc<AtomicBool>,
    pump: Mutex<Option<JoinHandle<()>>>,
}

#[async_trait]
impl Broker for MqttBroker {
    async fn subscribe(&self, topics: &[String]) -> Result<()> {
        if topics.is_empty() {
            return Ok(());
        }
        self.subscriptions
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .extend(topics.iter().cloned());
        let filters = topics
            .iter()
            .map(|t| SubscribeFilter::new(t.clone(), self.qos));
        self.client
            .subscribe_many(filters)
            .await
            .map_err(|e| BridgeError::transient("subscribe", e))?;
        tracing::info!("Subscribed to {} command topics", topics.len());
        Ok(())
    }

    async fn publish(&self, topic: &str, payload: &str, retain: bool) -> Result<()> {
        let payload = payload.as_bytes().to_vec();
        let sent = if self.stopping.load(Ordering::SeqCst) {
            self.client.try_publish(topic, self.qos, retain, payload)
        } else {
            self.client.publish(topic, self.qos, retain, payload).await
        };
        sent.map_err(|e| BridgeError::transient(format!("publish {}", topic), e))
    }

    fn begin_shutdown(&self) {
        self.stopping.store(true, Ordering::SeqCst);
    }

    async fn disconnect(&self) -> Result<()> {
        self.begin_shutdown();
        let sent = self
            .client
            .try_disconnect()
            .map_err(|e| BridgeError::transient("disconnect", e));

        let pump = self
            .pump
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take();
        if let Some(pump) = pump {
            if sent.is_err() {
                pump.abort();
            }
            match pump.await {
                Err(e) if e.is_panic() => tracing::error!("MQTT event loop task panicked: {}", e),
                _ => tracing::debug!("MQTT event loop stopped"),
            }
        }
        sent
    }
}

/// Drive the event loop: forward PUBLISH packets, resubscribe after
/// reconnects, stop once our DISCONNECT has been flushed.
async fn pump(
    mut eventloop: rumqttc::EventLoop,
    client: AsyncClient,
    tx: mpsc::Sender<InboundMessage>,
    subscriptions: Arc<Mutex<Vec<String>>>,
    stopping: Arc<AtomicBool>,
    qos: QoS,
) {
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                let msg = InboundMessage {
                    topic: publish.topic,
                    payload: publish.payload.to_vec(),
                };
                if tx.send(msg).await.is_err() {
                    tracing::debug!("MQTT inbound receiver closed; dropping message");
                }
            }
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                let topics = subscriptions
                    .lock()
                    .unwrap_or_else(std::sync::PoisonError::into_inner)
                    .clone();
                tracing::info!("MQTT reconnected, resubscribing {} topics", topics.len());
                if !topics.is_empty() {
                    let filters = topics.into_iter().map(|t| SubscribeFilter::new(t, qos));
                    // The request queue is drained by this very loop, so never block on it.
                    if let Err(e) = client.try_subscribe_many(filters) {
                        tracing::warn!("MQTT resubscribe failed: {}", e);
                    }
                }
            }
            Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                tracing::debug!("MQTT disconnect flushed");
                break;
            }
            Ok(_) => {}
            Err(e) => {
                if stopping.load(Ordering::SeqCst) {
                    tracing::debug!("MQTT event loop closed during shutdown: {}", e);
                    break;
                }
                tracing::warn!("MQTT connection error: {}; retrying", e);
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }
    }
}

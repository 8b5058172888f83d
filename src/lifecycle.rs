//! Startup and shutdown orchestration.
//!
//! starting -> ready -> stopping -> stopped, never re-entered.
//!
//! Startup: acquire hardware, connect, subscribe, then per entity (all
//! concurrently) attach the monitor listener and publish state and
//! discovery. Once ready: `online`, then the heartbeat.
//!
//! Shutdown runs once, in this order, and every step runs even if an
//! earlier one failed: cancel heartbeat, publish `offline` everywhere,
//! disconnect, release hardware.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};

use futures::future::join_all;
use tokio::task::JoinHandle;

use crate::config::Config;
use crate::discovery::DiscoveryContext;
use crate::entity::Availability;
use crate::error::{BridgeError, Result};
use crate::hardware::HardwareLayer;
use crate::heartbeat::{announce, Heartbeat};
use crate::mqtt::{Broker, Connector};
use crate::registry::Registry;
use crate::sync::Synchronizer;
use crate::topics::{Category, TopicNamer};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LifecycleState {
    Starting = 0,
    Ready = 1,
    Stopping = 2,
    Stopped = 3,
}

impl LifecycleState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => LifecycleState::Starting,
            1 => LifecycleState::Ready,
            2 => LifecycleState::Stopping,
            _ => LifecycleState::Stopped,
        }
    }
}

/// Lifecycle state shared between the bridge and its timer.
#[derive(Debug)]
pub struct StateCell(AtomicU8);

impl StateCell {
    pub fn new() -> Self {
        Self(AtomicU8::new(LifecycleState::Starting as u8))
    }

    pub fn get(&self) -> LifecycleState {
        LifecycleState::from_u8(self.0.load(Ordering::SeqCst))
    }

    pub fn set(&self, state: LifecycleState) {
        self.0.store(state as u8, Ordering::SeqCst);
    }

    /// Atomically move `from` -> `to`. False if the state was not `from`.
    pub fn transition(&self, from: LifecycleState, to: LifecycleState) -> bool {
        self.0
            .compare_exchange(from as u8, to as u8, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }
}

impl Default for StateCell {
    fn default() -> Self {
        Self::new()
    }
}

pub struct Bridge {
    state: Arc<StateCell>,
    registry: Arc<Registry>,
    broker: Arc<dyn Broker>,
    topics: TopicNamer,
    heartbeat: Mutex<Option<Heartbeat>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Bridge {
    /// Bring the bridge to `ready`. Any error here is fatal; hardware acquired
    /// before the failure is released.
    pub async fn start(
        config: &Config,
        hardware: &dyn HardwareLayer,
        connector: &dyn Connector,
    ) -> Result<Self> {
        let state = Arc::new(StateCell::new());
        tracing::info!(
            "Starting bridge {} with {} entities",
            config.device_id,
            config.entities.len()
        );

        let registry = Arc::new(Registry::acquire(config.entities.clone(), hardware).await?);

        let connection = match connector.connect().await {
            Ok(c) => c,
            Err(e) => {
                registry.release_all().await;
                return Err(e);
            }
        };
        let broker = connection.broker;
        let topics = TopicNamer::new(&config.namespace, &config.discovery_prefix);

        let command_topics: Vec<String> = registry
            .iter()
            .map(|e| topics.topic(&e.entity.id, Category::Command))
            .collect();
        if let Err(e) = broker.subscribe(&command_topics).await {
            if let Err(d) = broker.disconnect().await {
                tracing::warn!("Disconnect after failed subscribe: {}", d);
            }
            registry.release_all().await;
            return Err(BridgeError::connection(format!("subscribe failed: {}", e)));
        }

        let sync = Arc::new(Synchronizer::new(
            registry.clone(),
            broker.clone(),
            topics.clone(),
        ));
        let ctx = DiscoveryContext::new(&config.device_id, config.device_name(), config.qos);

        let mut tasks = Vec::new();
        for entry in registry.iter() {
            if let Some(listener) = sync.attach_listener(&entry.entity.id) {
                tasks.push(listener);
            }
        }
        join_all(
            registry
                .iter()
                .map(|entry| sync.publish_initial(&entry.entity.id, &ctx)),
        )
        .await;

        tasks.extend(sync.spawn_command_workers(connection.inbound));

        state.set(LifecycleState::Ready);
        tracing::info!("Bridge ready");

        announce(broker.as_ref(), &registry, &topics, Availability::Online).await;
        let heartbeat = Heartbeat::start(
            broker.clone(),
            registry.clone(),
            topics.clone(),
            config.availability_interval(),
            state.clone(),
        );

        Ok(Self {
            state,
            registry,
            broker,
            topics,
            heartbeat: Mutex::new(Some(heartbeat)),
            tasks: Mutex::new(tasks),
        })
    }

    pub fn state(&self) -> LifecycleState {
        self.state.get()
    }

    /// Run the shutdown sequence. Returns false without doing anything if
    /// shutdown already started.
    pub async fn shutdown(&self) -> bool {
        if !self
            .state
            .transition(LifecycleState::Ready, LifecycleState::Stopping)
        {
            tracing::debug!("Shutdown already in progress");
            return false;
        }
        tracing::info!("Shutting down");

        let heartbeat = self
            .heartbeat
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take();
        if let Some(heartbeat) = heartbeat {
            heartbeat.cancel().await;
        }

        self.broker.begin_shutdown();
        let failures = announce(
            self.broker.as_ref(),
            &self.registry,
            &self.topics,
            Availability::Offline,
        )
        .await;
        if !failures.is_empty() {
            tracing::error!("offline not delivered for {} entities", failures.len());
        }

        if let Err(e) = self.broker.disconnect().await {
            tracing::error!("Broker disconnect failed: {}", e);
        }

        let failures = self.registry.release_all().await;
        if !failures.is_empty() {
            tracing::error!("Hardware release failed for {} entities", failures.len());
        }

        let tasks = std::mem::take(
            &mut *self
                .tasks
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner),
        );
        for task in tasks {
            task.abort();
        }

        self.state.set(LifecycleState::Stopped);
        tracing::info!("Bridge stopped");
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::fake::FakeHardware;
    use crate::mqtt::mock::{message, MockConnector, Op, RecordingBroker};
    use std::sync::atomic::Ordering as AtomicOrdering;
    use std::time::Duration;

    const CONFIG: &str = r#"
device_id: hallway
entities:
  - { id: front-door, name: Front Door, domain: lock, control: "17", monitor: "27" }
  - { id: pump, name: Pump, domain: switch, control: "5", monitor: "6" }
  - { id: garage, name: Garage, domain: cover, control: "13", monitor: "19" }
"#;

    fn config() -> Config {
        Config::from_yaml(CONFIG).unwrap()
    }

    fn position(ops: &[Op], pred: impl Fn(&Op) -> bool) -> usize {
        ops.iter().position(pred).expect("operation not found")
    }

    fn is_publish(op: &Op, topic: &str, payload: &str) -> bool {
        matches!(op, Op::Publish { topic: t, payload: p, .. } if t == topic && p == payload)
    }

    async fn started(
        hw: &FakeHardware,
    ) -> (
        Bridge,
        Arc<RecordingBroker>,
        tokio::sync::mpsc::Sender<crate::mqtt::InboundMessage>,
    ) {
        let (connector, broker, tx) = MockConnector::new();
        let bridge = Bridge::start(&config(), hw, &connector).await.unwrap();
        (bridge, broker, tx)
    }

    #[tokio::test]
    async fn test_startup_sequence() {
        let hw = FakeHardware::new();
        hw.set_initial("17", true);
        let (bridge, broker, _tx) = started(&hw).await;
        assert_eq!(bridge.state(), LifecycleState::Ready);
        assert_eq!(hw.acquired(), 3);

        let ops = broker.ops();
        assert_eq!(
            ops[0],
            Op::Subscribe(vec![
                "pulsebridge/front-door/set".to_string(),
                "pulsebridge/pump/set".to_string(),
                "pulsebridge/garage/set".to_string(),
            ])
        );
        assert_eq!(
            broker.published_to("pulsebridge/front-door/state"),
            vec![("ACTIVE".to_string(), true)]
        );
        assert_eq!(
            broker.published_to("pulsebridge/pump/state"),
            vec![("INACTIVE".to_string(), true)]
        );
        for topic in [
            "homeassistant/lock/hallway_front-door/config",
            "homeassistant/switch/hallway_pump/config",
            "homeassistant/cover/hallway_garage/config",
        ] {
            let published = broker.published_to(topic);
            assert_eq!(published.len(), 1, "{}", topic);
            assert!(published[0].1);
        }

        // online comes after every state and discovery publish
        let first_online = position(&ops, |op| {
            matches!(op, Op::Publish { payload, .. } if payload == "online")
        });
        let last_discovery = ops
            .iter()
            .rposition(|op| matches!(op, Op::Publish { topic, .. } if topic.ends_with("/config")))
            .unwrap();
        assert!(first_online > last_discovery);
        for id in ["front-door", "pump", "garage"] {
            assert_eq!(
                broker.published_to(&format!("pulsebridge/{}/availability", id)),
                vec![("online".to_string(), false)]
            );
        }
    }

    #[tokio::test]
    async fn test_hardware_failure_aborts_before_connecting() {
        let hw = FakeHardware::new();
        hw.make_unavailable("5");
        let (connector, broker, _tx) = MockConnector::new();

        let result = Bridge::start(&config(), &hw, &connector).await;
        assert!(matches!(result, Err(BridgeError::HardwareUnavailable { .. })));
        assert!(broker.ops().is_empty());
    }

    #[tokio::test]
    async fn test_connection_failure_releases_hardware() {
        let hw = FakeHardware::new();
        let connector = MockConnector::refusing();

        let result = Bridge::start(&config(), &hw, &connector).await;
        assert!(matches!(result, Err(BridgeError::Connection(_))));
        assert!(hw.binding("17").released());
        assert!(hw.binding("5").released());
    }

    #[tokio::test]
    async fn test_commands_flow_after_ready() {
        let hw = FakeHardware::toggling();
        let (_bridge, broker, tx) = started(&hw).await;

        tx.send(message("pulsebridge/garage/set", "ACTIVE")).await.unwrap();
        tokio::time::timeout(Duration::from_secs(2), async {
            while broker.published_to("pulsebridge/garage/state").len() < 2 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        assert_eq!(hw.binding("13").pulses(), 1);
        assert_eq!(
            broker.published_to("pulsebridge/garage/state").last().unwrap(),
            &("ACTIVE".to_string(), true)
        );
    }

    #[tokio::test]
    async fn test_shutdown_order() {
        let hw = FakeHardware::new();
        let (bridge, broker, _tx) = started(&hw).await;
        broker.clear();

        assert!(bridge.shutdown().await);
        assert_eq!(bridge.state(), LifecycleState::Stopped);

        let ops = broker.ops();
        let disconnect = position(&ops, |op| *op == Op::Disconnect);
        for id in ["front-door", "pump", "garage"] {
            let topic = format!("pulsebridge/{}/availability", id);
            let offline = position(&ops, |op| is_publish(op, &topic, "offline"));
            assert!(offline < disconnect, "offline for {} after disconnect", id);
        }
        assert_eq!(disconnect, ops.len() - 1);
        // Outbound queue switched to non-blocking before the first offline.
        assert_eq!(broker.shutdown_mark(), Some(0));
        for control in ["17", "5", "13"] {
            assert!(hw.binding(control).released());
        }
    }

    #[tokio::test]
    async fn test_shutdown_runs_once() {
        let hw = FakeHardware::new();
        let (bridge, broker, _tx) = started(&hw).await;
        broker.clear();

        let (first, second) = tokio::join!(bridge.shutdown(), bridge.shutdown());
        assert!(first ^ second);
        assert!(!bridge.shutdown().await);

        let disconnects = broker.ops().iter().filter(|op| **op == Op::Disconnect).count();
        assert_eq!(disconnects, 1);
        assert_eq!(broker.published_to("pulsebridge/pump/availability").len(), 1);
    }

    #[tokio::test]
    async fn test_shutdown_is_best_effort() {
        let hw = FakeHardware::new();
        let (bridge, broker, _tx) = started(&hw).await;
        broker.clear();
        broker.fail_publish_to("pulsebridge/front-door/availability");
        broker.fail_disconnect.store(true, AtomicOrdering::SeqCst);
        hw.binding("5").fail_release.store(true, AtomicOrdering::SeqCst);

        assert!(bridge.shutdown().await);
        assert_eq!(bridge.state(), LifecycleState::Stopped);

        let ops = broker.ops();
        let disconnect = position(&ops, |op| *op == Op::Disconnect);
        for id in ["pump", "garage"] {
            let topic = format!("pulsebridge/{}/availability", id);
            assert!(position(&ops, |op| is_publish(op, &topic, "offline")) < disconnect);
        }
        for control in ["17", "5", "13"] {
            assert!(hw.binding(control).released());
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_stops_before_offline() {
        let hw = FakeHardware::new();
        let (bridge, broker, _tx) = started(&hw).await;

        tokio::time::sleep(Duration::from_secs(125)).await;
        // initial online plus two ticks at 60s and 120s
        assert_eq!(broker.published_to("pulsebridge/pump/availability").len(), 3);

        bridge.shutdown().await;
        tokio::time::sleep(Duration::from_secs(300)).await;
        let availability = broker.published_to("pulsebridge/pump/availability");
        assert_eq!(availability.len(), 4);
        assert_eq!(availability.last().unwrap().0, "offline");
    }

    #[test]
    fn test_state_cell_transitions() {
        let cell = StateCell::new();
        assert_eq!(cell.get(), LifecycleState::Starting);
        assert!(!cell.transition(LifecycleState::Ready, LifecycleState::Stopping));
        cell.set(LifecycleState::Ready);
        assert!(cell.transition(LifecycleState::Ready, LifecycleState::Stopping));
        assert!(!cell.transition(LifecycleState::Ready, LifecycleState::Stopping));
        assert_eq!(cell.get(), LifecycleState::Stopping);
    }
}

//! State synchronization between the broker and the hardware.
//!
//! Two event sources per entity:
//!
//! - command path: a token on `ns/E/set` is compared against a fresh monitor
//!   read and the control line is pulsed only when they differ. A retained
//!   or repeated command for the state the device is already in is a no-op.
//! - hardware path: every monitor transition is published, retained, to
//!   `ns/E/state`.
//!
//! Hardware failures drop the command; there is no retry.
//!
//! Known race: the monitor is read fresh for every command and nothing
//! records that a pulse is in flight, so two commands that arrive before
//! the first pulse shows up on the monitor line can pulse twice.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::discovery::{discovery_message, DiscoveryContext};
use crate::entity::Status;
use crate::error::Result;
use crate::mqtt::{Broker, InboundMessage};
use crate::registry::Registry;
use crate::topics::{Category, TopicNamer};

/// Commands buffered per entity before further ones are dropped.
const COMMAND_QUEUE: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandOutcome {
    Pulsed,
    AlreadyInState,
    /// Payload was not a canonical token, or the entity is unknown.
    Ignored,
    /// Hardware read or pulse failed; command dropped.
    Failed,
}

pub struct Synchronizer {
    registry: Arc<Registry>,
    broker: Arc<dyn Broker>,
    topics: TopicNamer,
}

impl Synchronizer {
    pub fn new(registry: Arc<Registry>, broker: Arc<dyn Broker>, topics: TopicNamer) -> Self {
        Self {
            registry,
            broker,
            topics,
        }
    }

    pub async fn handle_command(&self, entity_id: &str, payload: &[u8]) -> CommandOutcome {
        let Some(entry) = self.registry.get(entity_id) else {
            tracing::debug!("Command for unknown entity {}", entity_id);
            return CommandOutcome::Ignored;
        };
        let Some(wanted) = Status::from_payload(payload) else {
            tracing::debug!(
                "{}: ignoring command payload {:?}",
                entity_id,
                String::from_utf8_lossy(payload)
            );
            return CommandOutcome::Ignored;
        };

        let binding = entry.binding();
        let current = match binding.read_monitor().await {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!(
                    "{}: dropping {} command, monitor read failed: {}",
                    entity_id,
                    wanted.as_str(),
                    e
                );
                return CommandOutcome::Failed;
            }
        };

        if current == wanted.as_bool() {
            tracing::debug!("{}: already {}, no pulse", entity_id, wanted.as_str());
            return CommandOutcome::AlreadyInState;
        }

        match binding.pulse_control().await {
            Ok(()) => {
                tracing::info!("{}: pulsed towards {}", entity_id, wanted.as_str());
                CommandOutcome::Pulsed
            }
            Err(e) => {
                tracing::warn!(
                    "{}: dropping {} command, pulse failed: {}",
                    entity_id,
                    wanted.as_str(),
                    e
                );
                CommandOutcome::Failed
            }
        }
    }

    /// Retained publish of a monitor value to the entity's state topic.
    pub async fn publish_state(&self, entity_id: &str, value: bool) -> Result<()> {
        let status = Status::from(value);
        let topic = self.topics.topic(entity_id, Category::State);
        tracing::debug!("{} -> {}", topic, status.as_str());
        self.broker.publish(&topic, status.as_str(), true).await
    }

    /// Start forwarding monitor transitions for one entity. The receiver is
    /// taken before returning so no transition after this call is missed.
    pub fn attach_listener(self: &Arc<Self>, entity_id: &str) -> Option<JoinHandle<()>> {
        let mut rx = self.registry.get(entity_id)?.binding().watch();
        let sync = Arc::clone(self);
        let id = entity_id.to_string();
        Some(tokio::spawn(async move {
            while rx.changed().await.is_ok() {
                let value = *rx.borrow_and_update();
                if let Err(e) = sync.publish_state(&id, value).await {
                    tracing::warn!("{}: state publish failed: {}", id, e);
                }
            }
            tracing::debug!("{}: monitor listener closed", id);
        }))
    }

    /// Read the monitor and publish it, then announce the entity for discovery.
    /// Failures are logged; startup carries on.
    pub async fn publish_initial(&self, entity_id: &str, ctx: &DiscoveryContext) {
        let Some(entry) = self.registry.get(entity_id) else {
            return;
        };
        match entry.binding().read_monitor().await {
            Ok(value) => {
                if let Err(e) = self.publish_state(entity_id, value).await {
                    tracing::warn!("{}: initial state publish failed: {}", entity_id, e);
                }
            }
            Err(e) => tracing::warn!("{}: initial monitor read failed: {}", entity_id, e),
        }

        let msg = discovery_message(&entry.entity, ctx, &self.topics);
        if let Err(e) = self.broker.publish(&msg.topic, &msg.payload, true).await {
            tracing::warn!("{}: discovery publish failed: {}", entity_id, e);
        }
    }

    /// Fan inbound messages out to one worker per entity. Returns the
    /// dispatcher and worker handles.
    pub fn spawn_command_workers(
        self: &Arc<Self>,
        inbound: mpsc::Receiver<InboundMessage>,
    ) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::with_capacity(self.registry.len() + 1);
        let mut queues = HashMap::with_capacity(self.registry.len());

        for entry in self.registry.iter() {
            let (tx, mut rx) = mpsc::channel::<Vec<u8>>(COMMAND_QUEUE);
            queues.insert(entry.entity.id.clone(), tx);
            let sync = Arc::clone(self);
            let id = entry.entity.id.clone();
            handles.push(tokio::spawn(async move {
                while let Some(payload) = rx.recv().await {
                    sync.handle_command(&id, &payload).await;
                }
            }));
        }

        handles.push(tokio::spawn(dispatch(self.topics.clone(), inbound, queues)));
        handles
    }
}

async fn dispatch(
    topics: TopicNamer,
    mut inbound: mpsc::Receiver<InboundMessage>,
    queues: HashMap<String, mpsc::Sender<Vec<u8>>>,
) {
    while let Some(msg) = inbound.recv().await {
        let Some(queue) = topics.command_entity(&msg.topic).and_then(|id| queues.get(id)) else {
            tracing::debug!("No entity for topic {}", msg.topic);
            continue;
        };
        // A busy entity must not hold up the others.
        if let Err(e) = queue.try_send(msg.payload) {
            tracing::warn!("Dropping command on {}: {}", msg.topic, e);
        }
    }
    tracing::debug!("Inbound channel closed, dispatcher exiting");
}

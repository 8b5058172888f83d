//! Availability signaling.
//!
//! One timer for the whole bridge. Each tick publishes `online` (not
//! retained) to every entity's availability topic while the bridge is ready.

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

use crate::entity::Availability;
use crate::error::BridgeError;
use crate::lifecycle::{LifecycleState, StateCell};
use crate::mqtt::Broker;
use crate::registry::Registry;
use crate::topics::{Category, TopicNamer};

/// Publish `availability` to every entity concurrently and wait for all of
/// them. Returns the entities whose publish failed.
pub async fn announce(
    broker: &dyn Broker,
    registry: &Registry,
    topics: &TopicNamer,
    availability: Availability,
) -> Vec<(String, BridgeError)> {
    let results = join_all(registry.iter().map(|entry| async move {
        let topic = topics.topic(&entry.entity.id, Category::Availability);
        let result = broker.publish(&topic, availability.as_str(), false).await;
        (entry.entity.id.clone(), result)
    }))
    .await;

    let mut failures = Vec::new();
    for (id, result) in results {
        if let Err(e) = result {
            tracing::warn!("{}: {} publish failed: {}", id, availability.as_str(), e);
            failures.push((id, e));
        }
    }
    failures
}

pub struct Heartbeat {
    handle: JoinHandle<()>,
}

impl Heartbeat {
    /// First tick fires one `period` from now; the caller publishes the
    /// initial `online` itself.
    pub fn start(
        broker: Arc<dyn Broker>,
        registry: Arc<Registry>,
        topics: TopicNamer,
        period: Duration,
        lifecycle: Arc<StateCell>,
    ) -> Self {
        let handle = tokio::spawn(async move {
            let mut ticks = interval_at(Instant::now() + period, period);
            ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticks.tick().await;
                if lifecycle.get() != LifecycleState::Ready {
                    break;
                }
                announce(broker.as_ref(), &registry, &topics, Availability::Online).await;
            }
        });
        tracing::debug!("Availability heartbeat every {:?}", period);
        Self { handle }
    }

    /// Stop the timer. Any tick in progress is abandoned.
    pub async fn cancel(self) {
        self.handle.abort();
        match self.handle.await {
            Err(e) if e.is_panic() => tracing::error!("Heartbeat task panicked: {}", e),
            _ => tracing::debug!("Heartbeat cancelled"),
        }
    }
}

//! Entity registry: configured entities and their hardware bindings.
//!
//! Built once at startup and read-only afterwards. Every binding is acquired
//! concurrently; if any acquisition fails the ones that succeeded are
//! released and startup aborts.

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::join_all;

use crate::entity::Entity;
use crate::error::{BridgeError, Result};
use crate::hardware::{Binding, HardwareLayer};

pub struct RegisteredEntity {
    pub entity: Entity,
    binding: Arc<dyn Binding>,
}

impl RegisteredEntity {
    pub fn binding(&self) -> &dyn Binding {
        self.binding.as_ref()
    }
}

pub struct Registry {
    entries: Vec<RegisteredEntity>,
    by_id: HashMap<String, usize>,
}

impl Registry {
    pub async fn acquire(entities: Vec<Entity>, hardware: &dyn HardwareLayer) -> Result<Self> {
        let results = join_all(entities.iter().map(|e| hardware.acquire(e))).await;

        let mut entries = Vec::with_capacity(entities.len());
        let mut failure = None;
        for (entity, result) in entities.into_iter().zip(results) {
            match result {
                Ok(binding) => entries.push(RegisteredEntity { entity, binding }),
                Err(e) => {
                    tracing::error!("Hardware acquisition failed for {}: {}", entity.id, e);
                    if failure.is_none() {
                        failure = Some(match e {
                            BridgeError::HardwareUnavailable { .. } => e,
                            other => BridgeError::hardware(&entity.id, other),
                        });
                    }
                }
            }
        }

        let registry = Self::from_entries(entries);
        if let Some(err) = failure {
            registry.release_all().await;
            return Err(err);
        }
        tracing::info!("Acquired hardware for {} entities", registry.len());
        Ok(registry)
    }

    fn from_entries(entries: Vec<RegisteredEntity>) -> Self {
        let by_id = entries
            .iter()
            .enumerate()
            .map(|(i, e)| (e.entity.id.clone(), i))
            .collect();
        Self { entries, by_id }
    }

    pub fn get(&self, id: &str) -> Option<&RegisteredEntity> {
        self.by_id.get(id).map(|&i| &self.entries[i])
    }

    pub fn iter(&self) -> impl Iterator<Item = &RegisteredEntity> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Release every binding. Failures are logged and returned; one failure
    /// never stops the others from being released.
    pub async fn release_all(&self) -> Vec<(String, BridgeError)> {
        let results = join_all(self.entries.iter().map(|e| async move {
            (e.entity.id.clone(), e.binding.release().await)
        }))
        .await;

        let mut failures = Vec::new();
        for (id, result) in results {
            if let Err(e) = result {
                tracing::warn!("Releasing hardware for {} failed: {}", id, e);
                failures.push((id, e));
            }
        }
        failures
    }
}

#[cfg(test)]
pub(crate) fn test_entity(id: &str, domain: crate::entity::Domain) -> Entity {
    Entity {
        id: id.to_string(),
        name: id.to_string(),
        domain,
        control: format!("{}-ctl", id),
        monitor: format!("{}-mon", id),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::Domain;
    use crate::hardware::fake::FakeHardware;
    use std::sync::atomic::Ordering;

    #[tokio::test]
    async fn test_acquire_all() {
        let hw = FakeHardware::new();
        let registry = Registry::acquire(
            vec![
                test_entity("front-door", Domain::Lock),
                test_entity("pump", Domain::Switch),
            ],
            &hw,
        )
        .await
        .unwrap();

        assert_eq!(registry.len(), 2);
        assert_eq!(hw.acquired(), 2);
        assert_eq!(registry.get("pump").unwrap().entity.domain, Domain::Switch);
        assert!(registry.get("garage").is_none());
        let ids: Vec<_> = registry.iter().map(|e| e.entity.id.as_str()).collect();
        assert_eq!(ids, vec!["front-door", "pump"]);
    }

    #[tokio::test]
    async fn test_one_failure_aborts_and_releases_the_rest() {
        let hw = FakeHardware::new();
        hw.make_unavailable("pump-ctl");
        let result = Registry::acquire(
            vec![
                test_entity("front-door", Domain::Lock),
                test_entity("pump", Domain::Switch),
            ],
            &hw,
        )
        .await;

        match result {
            Err(BridgeError::HardwareUnavailable { entity, .. }) => assert_eq!(entity, "pump"),
            Err(other) => panic!("unexpected error: {}", other),
            Ok(_) => panic!("acquisition should have failed"),
        }
        assert!(hw.binding("front-door-ctl").released());
    }

    #[tokio::test]
    async fn test_release_all_continues_past_failures() {
        let hw = FakeHardware::new();
        let registry = Registry::acquire(
            vec![test_entity("a", Domain::Lock), test_entity("b", Domain::Cover)],
            &hw,
        )
        .await
        .unwrap();
        hw.binding("a-ctl").fail_release.store(true, Ordering::SeqCst);

        let failures = registry.release_all().await;
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].0, "a");
        assert!(hw.binding("a-ctl").released());
        assert!(hw.binding("b-ctl").released());
    }
}

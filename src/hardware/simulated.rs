//! In-process hardware: a pulse toggles the monitor line after `settle`.
//!
//! Useful for running the bridge without GPIO attached.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;

use super::{Binding, HardwareLayer};
use crate::entity::Entity;
use crate::error::{BridgeError, Result};

pub struct SimulatedHardware {
    settle: Duration,
    /// Control and monitor handles currently held.
    claimed: Arc<Mutex<HashSet<String>>>,
}

impl SimulatedHardware {
    pub fn new(settle: Duration) -> Self {
        Self {
            settle,
            claimed: Arc::new(Mutex::new(HashSet::new())),
        }
    }
}

#[async_trait]
impl HardwareLayer for SimulatedHardware {
    async fn acquire(&self, entity: &Entity) -> Result<Arc<dyn Binding>> {
        let mut claimed = self
            .claimed
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        for handle in [&entity.control, &entity.monitor] {
            if claimed.contains(handle) {
                return Err(BridgeError::hardware(
                    &entity.id,
                    format!("line {} already claimed", handle),
                ));
            }
        }
        claimed.insert(entity.control.clone());
        claimed.insert(entity.monitor.clone());

        tracing::debug!(
            "simulated: {} bound (control {}, monitor {})",
            entity.id,
            entity.control,
            entity.monitor
        );
        let (tx, _) = watch::channel(false);
        Ok(Arc::new(SimulatedBinding {
            handles: [entity.control.clone(), entity.monitor.clone()],
            claimed: self.claimed.clone(),
            state: Arc::new(AtomicBool::new(false)),
            tx: Arc::new(tx),
            settle: self.settle,
        }))
    }
}

pub struct SimulatedBinding {
    handles: [String; 2],
    claimed: Arc<Mutex<HashSet<String>>>,
    state: Arc<AtomicBool>,
    tx: Arc<watch::Sender<bool>>,
    settle: Duration,
}

#[async_trait]
impl Binding for SimulatedBinding {
    async fn read_monitor(&self) -> Result<bool> {
        Ok(self.state.load(Ordering::SeqCst))
    }

    async fn pulse_control(&self) -> Result<()> {
        let state = self.state.clone();
        let tx = self.tx.clone();
        let flip = move || {
            let next = !state.load(Ordering::SeqCst);
            state.store(next, Ordering::SeqCst);
            tx.send_replace(next);
        };
        if self.settle.is_zero() {
            flip();
        } else {
            // The device moves after the pulse returns, like real hardware.
            let settle = self.settle;
            tokio::spawn(async move {
                tokio::time::sleep(settle).await;
                flip();
            });
        }
        Ok(())
    }

    fn watch(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }

    async fn release(&self) -> Result<()> {
        let mut claimed = self
            .claimed
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        for handle in &self.handles {
            claimed.remove(handle);
        }
        Ok(())
    }
}

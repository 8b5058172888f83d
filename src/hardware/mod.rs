//! Hardware access layer.
//!
//! A binding drives one entity's control line and observes its monitor line.
//! The bridge only depends on the traits here; backends live in the
//! submodules and are chosen from config.

pub mod simulated;
pub mod sysfs;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;

use crate::config::{Backend, HardwareConfig};
use crate::entity::Entity;
use crate::error::Result;

/// Acquires bindings for configured entities.
#[async_trait]
pub trait HardwareLayer: Send + Sync {
    /// Fails with `HardwareUnavailable` if either line cannot be claimed.
    async fn acquire(&self, entity: &Entity) -> Result<Arc<dyn Binding>>;
}

/// Live handle to one entity's hardware.
#[async_trait]
pub trait Binding: Send + Sync {
    async fn read_monitor(&self) -> Result<bool>;

    /// Pulse the control line once.
    async fn pulse_control(&self) -> Result<()>;

    /// Receiver notified on every monitor transition. Only the latest value
    /// is kept; intermediate transitions may be skipped.
    fn watch(&self) -> watch::Receiver<bool>;

    /// Best-effort release of the underlying lines.
    async fn release(&self) -> Result<()>;
}

pub fn from_config(config: &HardwareConfig) -> Arc<dyn HardwareLayer> {
    let pulse = Duration::from_millis(config.pulse_ms);
    match config.backend {
        Backend::Simulated => Arc::new(simulated::SimulatedHardware::new(pulse)),
        Backend::Sysfs => Arc::new(sysfs::SysfsGpio::new(
            &config.gpio_root,
            pulse,
            Duration::from_millis(config.poll_ms),
        )),
    }
}

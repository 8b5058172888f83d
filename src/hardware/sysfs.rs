//! Linux sysfs GPIO backend.
//!
//! Control and monitor handles are GPIO line numbers under `gpio_root`
//! (normally `/sys/class/gpio`). A pulse drives the control line high for
//! `pulse` and back low; the monitor line is polled every `poll` and
//! watchers are notified on each transition.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use super::{Binding, HardwareLayer};
use crate::entity::Entity;
use crate::error::{BridgeError, Result};

pub struct SysfsGpio {
    root: PathBuf,
    pulse: Duration,
    poll: Duration,
}

impl SysfsGpio {
    pub fn new(root: impl AsRef<Path>, pulse: Duration, poll: Duration) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
            pulse,
            poll,
        }
    }

    fn line_dir(&self, line: &str) -> PathBuf {
        self.root.join(format!("gpio{}", line))
    }

    async fn export(&self, line: &str, direction: &str) -> std::io::Result<PathBuf> {
        if line.is_empty() || !line.chars().all(|c| c.is_ascii_digit()) {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("'{}' is not a GPIO line number", line),
            ));
        }
        let dir = self.line_dir(line);
        if !tokio::fs::try_exists(&dir).await? {
            tokio::fs::write(self.root.join("export"), line).await?;
        }
        tokio::fs::write(dir.join("direction"), direction).await?;
        Ok(dir.join("value"))
    }

    /// Best-effort cleanup after a failed acquire.
    async fn unexport(&self, entity_id: &str, lines: &[&str]) {
        for line in lines {
            if let Err(e) = unexport_line(&self.root, line).await {
                tracing::warn!("sysfs: {} cleanup failed: {}", entity_id, e);
            }
        }
    }
}

#[async_trait]
impl HardwareLayer for SysfsGpio {
    async fn acquire(&self, entity: &Entity) -> Result<Arc<dyn Binding>> {
        let control = self.export(&entity.control, "low").await.map_err(|e| {
            BridgeError::hardware(&entity.id, format!("control {}: {}", entity.control, e))
        })?;

        let monitor = match self.export(&entity.monitor, "in").await {
            Ok(monitor) => monitor,
            Err(e) => {
                self.unexport(&entity.id, &[entity.control.as_str()]).await;
                return Err(BridgeError::hardware(
                    &entity.id,
                    format!("monitor {}: {}", entity.monitor, e),
                ));
            }
        };
        let initial = match read_line(&monitor).await {
            Ok(initial) => initial,
            Err(e) => {
                self.unexport(&entity.id, &[entity.control.as_str(), entity.monitor.as_str()])
                    .await;
                return Err(BridgeError::hardware(&entity.id, e));
            }
        };
        let (tx, _) = watch::channel(initial);
        let tx = Arc::new(tx);

        let poller = tokio::spawn(poll_monitor(
            entity.id.clone(),
            monitor.clone(),
            initial,
            self.poll,
            tx.clone(),
        ));

        tracing::info!(
            "sysfs: {} bound to gpio{} (control) / gpio{} (monitor)",
            entity.id,
            entity.control,
            entity.monitor
        );

        Ok(Arc::new(SysfsBinding {
            entity_id: entity.id.clone(),
            lines: [entity.control.clone(), entity.monitor.clone()],
            root: self.root.clone(),
            control,
            monitor,
            pulse: self.pulse,
            tx,
            poller: Mutex::new(Some(poller)),
        }))
    }
}

pub struct SysfsBinding {
    entity_id: String,
    lines: [String; 2],
    root: PathBuf,
    control: PathBuf,
    monitor: PathBuf,
    pulse: Duration,
    tx: Arc<watch::Sender<bool>>,
    poller: Mutex<Option<JoinHandle<()>>>,
}

#[async_trait]
impl Binding for SysfsBinding {
    async fn read_monitor(&self) -> Result<bool> {
        read_line(&self.monitor)
            .await
            .map_err(|e| BridgeError::transient(format!("read monitor {}", self.entity_id), e))
    }

    async fn pulse_control(&self) -> Result<()> {
        let op = || format!("pulse control {}", self.entity_id);
        tokio::fs::write(&self.control, "1")
            .await
            .map_err(|e| BridgeError::transient(op(), e))?;
        tokio::time::sleep(self.pulse).await;
        tokio::fs::write(&self.control, "0")
            .await
            .map_err(|e| BridgeError::transient(op(), e))
    }

    fn watch(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }

    async fn release(&self) -> Result<()> {
        let poller = self
            .poller
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take();
        if let Some(poller) = poller {
            poller.abort();
        }
        let mut first_error = None;
        if let Err(e) = tokio::fs::write(&self.control, "0").await {
            tracing::warn!("sysfs: {} driving control low failed: {}", self.entity_id, e);
            first_error = Some(BridgeError::transient(
                format!("release control {}", self.entity_id),
                e,
            ));
        }
        for line in &self.lines {
            if let Err(e) = unexport_line(&self.root, line).await {
                tracing::warn!("sysfs: {} {}", self.entity_id, e);
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

impl Drop for SysfsBinding {
    fn drop(&mut self) {
        if let Ok(mut poller) = self.poller.lock() {
            if let Some(poller) = poller.take() {
                poller.abort();
            }
        }
    }
}

async fn unexport_line(root: &Path, line: &str) -> Result<()> {
    tokio::fs::write(root.join("unexport"), line)
        .await
        .map_err(|e| BridgeError::transient(format!("unexport gpio{}", line), e))
}

async fn read_line(path: &Path) -> std::result::Result<bool, String> {
    let raw = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| format!("{}: {}", path.display(), e))?;
    match raw.trim() {
        "1" => Ok(true),
        "0" => Ok(false),
        other => Err(format!("{}: unexpected value '{}'", path.display(), other)),
    }
}

async fn poll_monitor(
    entity_id: String,
    path: PathBuf,
    mut last: bool,
    period: Duration,
    tx: Arc<watch::Sender<bool>>,
) {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        interval.tick().await;
        match read_line(&path).await {
            Ok(value) if value != last => {
                tracing::debug!("sysfs: {} monitor -> {}", entity_id, value);
                last = value;
                tx.send_replace(value);
            }
            Ok(_) => {}
            Err(e) => tracing::warn!("sysfs: {} monitor poll failed: {}", entity_id, e),
        }
    }
}

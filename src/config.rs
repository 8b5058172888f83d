//! Bridge configuration (YAML).
//!
//! ```yaml
//! device_id: hallway
//! mqtt:
//!   host: 192.168.1.10
//! hardware:
//!   backend: sysfs
//! entities:
//!   - id: front-door
//!     name: Front Door
//!     domain: lock
//!     control: "17"
//!     monitor: "27"
//! ```

use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::entity::Entity;
use crate::error::{BridgeError, Result};

pub const PASSWORD_ENV: &str = "PULSEBRIDGE_MQTT_PASSWORD";

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub device_id: String,
    #[serde(default)]
    pub device_name: Option<String>,
    #[serde(default = "default_namespace")]
    pub namespace: String,
    #[serde(default = "default_discovery_prefix")]
    pub discovery_prefix: String,
    #[serde(default = "default_qos")]
    pub qos: u8,
    #[serde(default = "default_availability_interval")]
    pub availability_interval_secs: u64,
    #[serde(default)]
    pub mqtt: MqttConfig,
    #[serde(default)]
    pub hardware: HardwareConfig,
    pub entities: Vec<Entity>,
}

fn default_namespace() -> String {
    "pulsebridge".to_string()
}

fn default_discovery_prefix() -> String {
    "homeassistant".to_string()
}

fn default_qos() -> u8 {
    1
}

fn default_availability_interval() -> u64 {
    60
}

/// Broker address and credentials.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MqttConfig {
    pub host: String,
    pub port: u16,
    /// Defaults to `pulsebridge-{device_id}` when unset.
    pub client_id: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub keep_alive_secs: u64,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 1883,
            client_id: None,
            username: None,
            password: None,
            keep_alive_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    Simulated,
    Sysfs,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HardwareConfig {
    pub backend: Backend,
    /// How long the control line is held high for one pulse.
    pub pulse_ms: u64,
    /// Monitor line polling period (sysfs backend).
    pub poll_ms: u64,
    pub gpio_root: String,
}

impl Default for HardwareConfig {
    fn default() -> Self {
        Self {
            backend: Backend::Simulated,
            pulse_ms: 250,
            poll_ms: 100,
            gpio_root: "/sys/class/gpio".to_string(),
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            BridgeError::configuration(format!("cannot read {}: {}", path.display(), e))
        })?;
        let mut config = Self::from_yaml(&contents)?;
        if let Ok(password) = std::env::var(PASSWORD_ENV) {
            config.mqtt.password = Some(password);
        }
        Ok(config)
    }

    /// Parse and validate. Unknown domains surface here as configuration errors.
    pub fn from_yaml(contents: &str) -> Result<Self> {
        let config: Config = serde_yaml::from_str(contents)
            .map_err(|e| BridgeError::configuration(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if !is_topic_safe(&self.device_id) {
            return Err(BridgeError::configuration(format!(
                "device_id '{}' must be non-empty and contain no '/', '+', '#' or whitespace",
                self.device_id
            )));
        }
        for (field, value) in [
            ("namespace", &self.namespace),
            ("discovery_prefix", &self.discovery_prefix),
        ] {
            if !is_topic_prefix_safe(value) {
                return Err(BridgeError::configuration(format!(
                    "{} '{}' needs non-empty '/' levels without '+', '#' or whitespace",
                    field, value
                )));
            }
        }
        if self.qos > 2 {
            return Err(BridgeError::configuration(format!(
                "qos must be 0, 1 or 2 (got {})",
                self.qos
            )));
        }
        if self.availability_interval_secs == 0 {
            return Err(BridgeError::configuration(
                "availability_interval_secs must be greater than zero",
            ));
        }
        if self.hardware.poll_ms == 0 {
            return Err(BridgeError::configuration(
                "hardware.poll_ms must be greater than zero",
            ));
        }
        if self.hardware.backend == Backend::Sysfs && self.hardware.pulse_ms == 0 {
            return Err(BridgeError::configuration(
                "hardware.pulse_ms must be greater than zero for the sysfs backend",
            ));
        }
        if self.entities.is_empty() {
            return Err(BridgeError::configuration("no entities configured"));
        }

        let mut seen = HashSet::new();
        for entity in &self.entities {
            if !is_topic_safe(&entity.id) {
                return Err(BridgeError::configuration(format!(
                    "entity id '{}' must be non-empty and contain no '/', '+', '#' or whitespace",
                    entity.id
                )));
            }
            if !seen.insert(entity.id.as_str()) {
                return Err(BridgeError::configuration(format!(
                    "duplicate entity id '{}'",
                    entity.id
                )));
            }
            if entity.name.trim().is_empty() {
                return Err(BridgeError::configuration(format!(
                    "entity '{}' has an empty name",
                    entity.id
                )));
            }
        }
        Ok(())
    }

    pub fn device_name(&self) -> &str {
        self.device_name.as_deref().unwrap_or(&self.device_id)
    }

    pub fn client_id(&self) -> String {
        self.mqtt
            .client_id
            .clone()
            .unwrap_or_else(|| format!("pulsebridge-{}", self.device_id))
    }

    pub fn availability_interval(&self) -> Duration {
        Duration::from_secs(self.availability_interval_secs)
    }
}

fn is_topic_safe(s: &str) -> bool {
    !s.is_empty() && !s.chars().any(|c| matches!(c, '/' | '+' | '#') || c.is_whitespace())
}

/// Like [`is_topic_safe`] but allows interior `/` between non-empty levels.
fn is_topic_prefix_safe(s: &str) -> bool {
    !s.is_empty() && s.split('/').all(is_topic_safe)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::Domain;

    const MINIMAL: &str = r#"
device_id: hallway
entities:
  - id: front-door
    name: Front Door
    domain: lock
    control: "17"
    monitor: "27"
"#;

    #[test]
    fn test_defaults() {
        let config = Config::from_yaml(MINIMAL).unwrap();
        assert_eq!(config.namespace, "pulsebridge");
        assert_eq!(config.discovery_prefix, "homeassistant");
        assert_eq!(config.qos, 1);
        assert_eq!(config.availability_interval(), Duration::from_secs(60));
        assert_eq!(config.mqtt.host, "localhost");
        assert_eq!(config.mqtt.port, 1883);
        assert_eq!(config.client_id(), "pulsebridge-hallway");
        assert_eq!(config.device_name(), "hallway");
        assert_eq!(config.hardware.backend, Backend::Simulated);
        assert_eq!(config.hardware.pulse_ms, 250);
        assert_eq!(config.entities[0].domain, Domain::Lock);
    }

    #[test]
    fn test_full_config() {
        let yaml = r#"
device_id: garage
device_name: Garage Controller
namespace: home/garage
discovery_prefix: ha
qos: 2
availability_interval_secs: 15
mqtt:
  host: mqtt.example.com
  port: 8883
  client_id: garage-bridge
  username: bridge
  password: secret
hardware:
  backend: sysfs
  pulse_ms: 500
  poll_ms: 50
  gpio_root: /tmp/gpio
entities:
  - id: door
    name: Door
    domain: cover
    control: "5"
    monitor: "6"
  - id: light
    name: Light
    domain: switch
    control: "13"
    monitor: "19"
"#;
        let config = Config::from_yaml(yaml).unwrap();
        assert_eq!(config.device_name(), "Garage Controller");
        assert_eq!(config.namespace, "home/garage");
        assert_eq!(config.qos, 2);
        assert_eq!(config.client_id(), "garage-bridge");
        assert_eq!(config.mqtt.username.as_deref(), Some("bridge"));
        assert_eq!(config.hardware.backend, Backend::Sysfs);
        assert_eq!(config.hardware.gpio_root, "/tmp/gpio");
        assert_eq!(config.entities.len(), 2);
        assert_eq!(config.entities[1].domain, Domain::Switch);
    }

    #[test]
    fn test_unknown_domain_is_configuration_error() {
        let yaml = MINIMAL.replace("domain: lock", "domain: light");
        let err = Config::from_yaml(&yaml).unwrap_err();
        assert!(matches!(err, BridgeError::Configuration(_)));
    }

    #[test]
    fn test_duplicate_ids_rejected() {
        let yaml = r#"
device_id: hallway
entities:
  - { id: a, name: A, domain: lock, control: "1", monitor: "2" }
  - { id: a, name: B, domain: switch, control: "3", monitor: "4" }
"#;
        let err = Config::from_yaml(yaml).unwrap_err();
        assert!(err.to_string().contains("duplicate entity id 'a'"));
    }

    #[test]
    fn test_malformed_entity_ids_rejected() {
        for bad in ["a/b", "a+", "#", "with space", "\"\""] {
            let yaml = MINIMAL.replace("id: front-door", &format!("id: {}", bad));
            assert!(
                matches!(Config::from_yaml(&yaml), Err(BridgeError::Configuration(_))),
                "id {} should be rejected",
                bad
            );
        }
    }

    #[test]
    fn test_empty_name_rejected() {
        let yaml = MINIMAL.replace("name: Front Door", "name: \"  \"");
        assert!(Config::from_yaml(&yaml).is_err());
    }

    #[test]
    fn test_no_entities_rejected() {
        let yaml = "device_id: hallway\nentities: []\n";
        let err = Config::from_yaml(yaml).unwrap_err();
        assert!(err.to_string().contains("no entities"));
    }

    #[test]
    fn test_bad_qos_and_interval_rejected() {
        let yaml = format!("qos: 3\n{}", MINIMAL);
        assert!(Config::from_yaml(&yaml).is_err());
        let yaml = format!("availability_interval_secs: 0\n{}", MINIMAL);
        assert!(Config::from_yaml(&yaml).is_err());
    }

    #[test]
    fn test_zero_poll_rejected() {
        let yaml = format!("hardware:\n  poll_ms: 0\n{}", MINIMAL);
        let err = Config::from_yaml(&yaml).unwrap_err();
        assert!(err.to_string().contains("poll_ms"));

        let yaml = format!("hardware:\n  backend: sysfs\n  pulse_ms: 0\n{}", MINIMAL);
        let err = Config::from_yaml(&yaml).unwrap_err();
        assert!(err.to_string().contains("pulse_ms"));

        // The simulated backend treats a zero pulse as an instant toggle.
        let yaml = format!("hardware:\n  pulse_ms: 0\n{}", MINIMAL);
        assert!(Config::from_yaml(&yaml).is_ok());
    }

    #[test]
    fn test_topic_prefixes_validated() {
        let yaml = format!("namespace: site/bridges\n{}", MINIMAL);
        assert_eq!(Config::from_yaml(&yaml).unwrap().namespace, "site/bridges");

        for bad in ["\"\"", "a/+", "\"#\"", "/lead", "trail/", "a//b", "\"with space\""] {
            for field in ["namespace", "discovery_prefix"] {
                let yaml = format!("{}: {}\n{}", field, bad, MINIMAL);
                assert!(
                    matches!(Config::from_yaml(&yaml), Err(BridgeError::Configuration(_))),
                    "{} {} should be rejected",
                    field,
                    bad
                );
            }
        }
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pulsebridge.yaml");
        std::fs::write(&path, MINIMAL).unwrap();
        let config = Config::load(&path).unwrap();
        assert_eq!(config.device_id, "hallway");
    }

    #[test]
    fn test_load_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = Config::load(&dir.path().join("missing.yaml")).unwrap_err();
        assert!(matches!(err, BridgeError::Configuration(_)));
    }
}

//! TOML config file loading and validation.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::collections::HashSet;

use crate::device::DeviceSettings;

// ---------------------------------------------------------------------------
// Config file structures
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Config {
    pub device: DeviceSection,
    #[serde(default)]
    pub polling: PollingSection,
    #[serde(default)]
    pub mqtt: MqttSection,
    #[serde(default)]
    pub variables: Vec<VariableEntry>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct DeviceSection {
    pub host: String,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub use_tls: bool,
    pub password: String,
    #[serde(default)]
    pub accept_invalid_certs: bool,
    /// Sensor slots (1, 2) the bridge should not report on.
    #[serde(default)]
    pub ignored_sensor_slots: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct PollingSection {
    pub status_interval_sec: u64,
    pub push_interval_sec: u64,
}

impl Default for PollingSection {
    fn default() -> Self {
        Self {
            status_interval_sec: 60,
            push_interval_sec: 300,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct MqttSection {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    /// Prefix the controller publishes its own messages under.
    pub device_topic: String,
    /// Prefix for decoded values published by the bridge.
    pub state_topic: String,
    /// Where the variable push map goes.
    pub push_topic: String,
}

impl Default for MqttSection {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 1883,
            client_id: "sprinkler-bridge".into(),
            device_topic: "opensprinkler".into(),
            state_topic: "sprinkler".into(),
            push_topic: "opensprinkler/weather".into(),
        }
    }
}

/// An external value forwarded to the controller: the last payload seen on
/// `topic` is pushed under `key`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct VariableEntry {
    pub topic: String,
    pub key: String,
    #[serde(default = "enabled_by_default")]
    pub enabled: bool,
}

fn enabled_by_default() -> bool {
    true
}

impl DeviceSection {
    pub fn settings(&self) -> DeviceSettings {
        DeviceSettings {
            host: self.host.trim().to_string(),
            port: self.port,
            use_tls: self.use_tls,
            password: self.password.clone(),
            accept_invalid_certs: self.accept_invalid_certs,
        }
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

impl Config {
    /// Validate all sections. Returns `Ok(())` or an error describing every
    /// violation found (not just the first one).
    pub fn validate(&self) -> Result<()> {
        let mut errors: Vec<String> = Vec::new();

        self.validate_device(&mut errors);
        self.validate_polling(&mut errors);
        self.validate_mqtt(&mut errors);
        self.validate_variables(&mut errors);

        if errors.is_empty() {
            Ok(())
        } else {
            bail!(
                "config validation failed ({} error{}):\n  - {}",
                errors.len(),
                if errors.len() == 1 { "" } else { "s" },
                errors.join("\n  - ")
            );
        }
    }

    fn validate_device(&self, errors: &mut Vec<String>) {
        let d = &self.device;
        if d.host.trim().is_empty() {
            errors.push("device: host is empty".into());
        }
        if d.password.is_empty() {
            errors.push("device: password is empty".into());
        }
        if d.port == Some(0) {
            errors.push("device: port must not be 0".into());
        }
        let mut seen: HashSet<u8> = HashSet::new();
        for slot in &d.ignored_sensor_slots {
            if !(1..=2).contains(slot) {
                errors.push(format!("device: ignored sensor slot {slot} out of range [1, 2]"));
            } else if !seen.insert(*slot) {
                errors.push(format!("device: ignored sensor slot {slot} listed twice"));
            }
        }
    }

    fn validate_polling(&self, errors: &mut Vec<String>) {
        if self.polling.status_interval_sec < 1 {
            errors.push("polling: status_interval_sec must be at least 1".into());
        }
        if self.polling.push_interval_sec < 1 {
            errors.push("polling: push_interval_sec must be at least 1".into());
        }
    }

    fn validate_mqtt(&self, errors: &mut Vec<String>) {
        let m = &self.mqtt;
        if m.host.trim().is_empty() {
            errors.push("mqtt: host is empty".into());
        }
        if m.client_id.trim().is_empty() {
            errors.push("mqtt: client_id is empty".into());
        }
        for (name, topic) in [
            ("device_topic", &m.device_topic),
            ("state_topic", &m.state_topic),
            ("push_topic", &m.push_topic),
        ] {
            if topic.trim_end_matches('/').is_empty() {
                errors.push(format!("mqtt: {name} is empty"));
            } else if topic.contains(['#', '+']) {
                errors.push(format!("mqtt: {name} '{topic}' must not contain wildcards"));
            }
        }
    }

    fn validate_variables(&self, errors: &mut Vec<String>) {
        let mut seen_keys: HashSet<&str> = HashSet::new();

        for (i, v) in self.variables.iter().enumerate() {
            let ctx = || {
                if v.key.is_empty() {
                    format!("variables[{i}]")
                } else {
                    format!("variable '{}'", v.key)
                }
            };

            if v.key.trim().is_empty() {
                errors.push(format!("{}: key is empty", ctx()));
            } else if !seen_keys.insert(&v.key) {
                errors.push(format!("{}: duplicate key", ctx()));
            }

            if v.topic.trim().is_empty() {
                errors.push(format!("{}: topic is empty", ctx()));
            } else if v.topic.contains(['#', '+']) {
                errors.push(format!("{}: topic '{}' must not contain wildcards", ctx(), v.topic));
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Load
// ---------------------------------------------------------------------------

/// Read, parse, and validate a TOML config file.
pub fn load(path: &str) -> Result<Config> {
    let contents =
        std::fs::read_to_string(path).with_context(|| format!("failed to read config: {path}"))?;
    let config: Config =
        toml::from_str(&contents).with_context(|| format!("failed to parse config: {path}"))?;
    config
        .validate()
        .with_context(|| format!("invalid config: {path}"))?;

    tracing::info!(
        host = %config.device.host,
        variables = config.variables.len(),
        status_interval_sec = config.polling.status_interval_sec,
        push_interval_sec = config.polling.push_interval_sec,
        "config loaded"
    );

    Ok(config)
}

// ===========================================================================
// Tests
// ===========================================================================

//! Test configuration.
//!
//! Settings are read from TOML into a permissive [`TestConfigInput`] and
//! resolved into a validated [`TestConfig`]. Resolution normalizes the
//! destination node id and enforces the probe interval floor.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use meshtenna_common::models::{ConnectionType, ProbePayload, UNKNOWN_NODE_NAME};

use crate::transport::TransportTarget;

/// Shortest allowed gap between probes.
pub const MIN_INTERVAL_SECS: u32 = 30;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config TOML: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("missing required field `{0}`")]
    MissingField(&'static str),
    #[error("{0}")]
    ConnectionType(String),
}

/// Interval as written by the operator: a number or free text.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum IntervalInput {
    Seconds(i64),
    Text(String),
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct TestConfigInput {
    pub antenna_name: String,
    pub url: String,
    pub notes: String,
    pub location: String,
    pub node_name: Option<String>,
    pub connection_type: Option<String>,
    pub tcp_host: String,
    pub ble_device: String,
    pub destination_node_id: String,
    pub interval_seconds: Option<IntervalInput>,
    pub visible_message: bool,
    pub message_text: String,
}

/// Validated settings for one test run.
#[derive(Debug, Clone, PartialEq)]
pub struct TestConfig {
    pub antenna_name: String,
    pub url: String,
    pub notes: String,
    pub location: String,
    pub node_name: String,
    pub target: TransportTarget,
    /// Normalized to a single leading `!`.
    pub destination_node_id: String,
    /// Never below [`MIN_INTERVAL_SECS`].
    pub interval_seconds: u32,
    pub payload: ProbePayload,
}

/// Effective interval for free-text input. Anything that is not a plain
/// run of digits counts as non-numeric and falls back to the floor.
pub fn clamp_interval(raw: &str) -> u32 {
    let raw = raw.trim();
    if raw.is_empty() || !raw.bytes().all(|b| b.is_ascii_digit()) {
        return MIN_INTERVAL_SECS;
    }
    raw.parse::<u32>()
        .map(|secs| secs.max(MIN_INTERVAL_SECS))
        .unwrap_or(MIN_INTERVAL_SECS)
}

/// Effective interval for numeric input.
pub fn clamp_interval_secs(secs: i64) -> u32 {
    u32::try_from(secs)
        .map(|secs| secs.max(MIN_INTERVAL_SECS))
        .unwrap_or(MIN_INTERVAL_SECS)
}

/// Strip any leading `!` and add exactly one back. Returns `None` when no
/// id remains.
pub fn normalize_node_id(raw: &str) -> Option<String> {
    let id = raw.trim().trim_start_matches('!').trim();
    if id.is_empty() {
        None
    } else {
        Some(format!("!{id}"))
    }
}

fn required(value: String, field: &'static str) -> Result<String, ConfigError> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        Err(ConfigError::MissingField(field))
    } else {
        Ok(trimmed.to_string())
    }
}

impl IntervalInput {
    pub fn effective_secs(&self) -> u32 {
        match self {
            IntervalInput::Seconds(secs) => clamp_interval_secs(*secs),
            IntervalInput::Text(text) => clamp_interval(text),
        }
    }
}

impl TestConfigInput {
    pub fn resolve(self) -> Result<TestConfig, ConfigError> {
        let antenna_name = required(self.antenna_name, "antenna_name")?;
        let location = required(self.location, "location")?;
        let destination_node_id = normalize_node_id(&self.destination_node_id)
            .ok_or(ConfigError::MissingField("destination_node_id"))?;

        let connection_type = match self.connection_type.as_deref() {
            None => ConnectionType::Tcp,
            Some(raw) => raw.parse().map_err(ConfigError::ConnectionType)?,
        };
        let target = match connection_type {
            ConnectionType::Tcp => TransportTarget::Tcp {
                host: required(self.tcp_host, "tcp_host")?,
            },
            ConnectionType::Ble => TransportTarget::Ble {
                device: required(self.ble_device, "ble_device")?,
            },
        };

        let interval_seconds = self
            .interval_seconds
            .map(|i| i.effective_secs())
            .unwrap_or(MIN_INTERVAL_SECS);

        let payload = if self.visible_message {
            ProbePayload::Text(self.message_text)
        } else {
            ProbePayload::Empty
        };

        let node_name = self
            .node_name
            .map(|n| n.trim().to_string())
            .filter(|n| !n.is_empty())
            .unwrap_or_else(|| UNKNOWN_NODE_NAME.to_string());

        Ok(TestConfig {
            antenna_name,
            url: self.url.trim().to_string(),
            notes: self.notes.trim().to_string(),
            location,
            node_name,
            target,
            destination_node_id,
            interval_seconds,
            payload,
        })
    }
}

impl TestConfig {
    pub fn from_toml_str(input: &str) -> Result<Self, ConfigError> {
        let parsed: TestConfigInput = toml::from_str(input)?;
        parsed.resolve()
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_seconds.into())
    }

    /// Override the interval from operator input, applying the floor.
    pub fn set_interval(&mut self, raw: &str) {
        self.interval_seconds = clamp_interval(raw);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASE: &str = r#"
        antenna_name = "Diamond X50"
        location = "Hilltop"
        tcp_host = "192.168.1.40"
        destination_node_id = "a1b2c3d4"
    "#;

    #[test]
    fn parse_toml_config_basic() {
        let toml = r#"
            antenna_name = " Diamond X50 "
            url = "https://example.com/x50"
            notes = "mast 6m"
            location = "Hilltop"
            connection_type = "ble"
            ble_device = "Meshtastic_12ab"
            destination_node_id = "!!a1b2c3d4"
            interval_seconds = 45
            visible_message = true
            message_text = "antenna test"
        "#;

        let cfg = TestConfig::from_toml_str(toml).unwrap();
        assert_eq!(cfg.antenna_name, "Diamond X50");
        assert_eq!(cfg.url, "https://example.com/x50");
        assert_eq!(cfg.node_name, UNKNOWN_NODE_NAME);
        assert_eq!(
            cfg.target,
            TransportTarget::Ble {
                device: "Meshtastic_12ab".into()
            }
        );
        assert_eq!(cfg.destination_node_id, "!a1b2c3d4");
        assert_eq!(cfg.interval_seconds, 45);
        assert_eq!(cfg.payload, ProbePayload::Text("antenna test".into()));
    }

    #[test]
    fn defaults_to_tcp_and_empty_payload() {
        let cfg = TestConfig::from_toml_str(BASE).unwrap();
        assert_eq!(
            cfg.target,
            TransportTarget::Tcp {
                host: "192.168.1.40".into()
            }
        );
        assert_eq!(cfg.payload, ProbePayload::Empty);
        assert_eq!(cfg.interval_seconds, MIN_INTERVAL_SECS);
    }

    #[test]
    fn sub_floor_and_non_numeric_intervals_clamp() {
        for raw in ["0", "29", "", "abc", "-5", "12.5", " ", "99999999999999"] {
            assert_eq!(clamp_interval(raw), MIN_INTERVAL_SECS, "input {raw:?}");
        }
        assert_eq!(clamp_interval("30"), 30);
        assert_eq!(clamp_interval(" 120 "), 120);
        assert_eq!(clamp_interval_secs(-1), MIN_INTERVAL_SECS);
        assert_eq!(clamp_interval_secs(10), MIN_INTERVAL_SECS);
        assert_eq!(clamp_interval_secs(31), 31);
    }

    #[test]
    fn textual_interval_in_toml_clamps() {
        let toml = format!("{BASE}\ninterval_seconds = \"soon\"");
        let cfg = TestConfig::from_toml_str(&toml).unwrap();
        assert_eq!(cfg.interval_seconds, MIN_INTERVAL_SECS);

        let toml = format!("{BASE}\ninterval_seconds = \"90\"");
        let cfg = TestConfig::from_toml_str(&toml).unwrap();
        assert_eq!(cfg.interval_seconds, 90);
    }

    #[test]
    fn node_id_normalization() {
        assert_eq!(normalize_node_id("abcd").as_deref(), Some("!abcd"));
        assert_eq!(normalize_node_id("!!!abcd ").as_deref(), Some("!abcd"));
        assert_eq!(normalize_node_id("!"), None);
        assert_eq!(normalize_node_id("  "), None);
    }

    #[test]
    fn missing_fields_are_reported() {
        let err = TestConfig::from_toml_str(r#"location = "x""#).unwrap_err();
        assert!(matches!(err, ConfigError::MissingField("antenna_name")));

        let toml = r#"
            antenna_name = "a"
            location = "b"
            destination_node_id = "!c"
        "#;
        let err = TestConfig::from_toml_str(toml).unwrap_err();
        assert!(matches!(err, ConfigError::MissingField("tcp_host")));
    }

    #[test]
    fn unknown_connection_type_is_rejected() {
        let toml = format!("{BASE}\nconnection_type = \"serial\"");
        let err = TestConfig::from_toml_str(&toml).unwrap_err();
        assert!(matches!(err, ConfigError::ConnectionType(_)));
    }
}

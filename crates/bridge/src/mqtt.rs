use std::time::Duration;

use anyhow::{Context, Result};
use rumqttc::{AsyncClient, MqttOptions, QoS};
use serde::Deserialize;
use serde_json::Value;

use crate::config::MqttSection;

// ---------------------------------------------------------------------------
// Publisher seam
// ---------------------------------------------------------------------------

/// Fire-and-forget publishing. The engine only ever needs this much of the
/// bus, which keeps it testable without a broker.
pub trait Publisher: Send + Sync + 'static {
    fn publish(&self, topic: &str, payload: String, retain: bool) -> Result<()>;
}

impl Publisher for AsyncClient {
    fn publish(&self, topic: &str, payload: String, retain: bool) -> Result<()> {
        self.try_publish(topic, QoS::AtLeastOnce, retain, payload.into_bytes())
            .with_context(|| format!("mqtt publish to {topic} failed"))
    }
}

pub fn options(cfg: &MqttSection) -> MqttOptions {
    let mut opts = MqttOptions::new(&cfg.client_id, &cfg.host, cfg.port);
    opts.set_keep_alive(Duration::from_secs(30));
    opts
}

// ---------------------------------------------------------------------------
// MQTT message types
// ---------------------------------------------------------------------------

/// Station update pushed by the controller on `<device>/station/<n>`.
#[derive(Debug, Deserialize)]
pub(crate) struct StationMsg {
    pub(crate) state: u8,
}

// ---------------------------------------------------------------------------
// Topic / payload helpers
// ---------------------------------------------------------------------------

/// `prefix/suffix`, tolerating a trailing slash on the prefix.
pub(crate) fn join_topic(prefix: &str, suffix: &str) -> String {
    format!("{}/{suffix}", prefix.trim_end_matches('/'))
}

/// Extract the part after `<prefix>/`; `None` for other topics or an empty
/// remainder.
pub(crate) fn strip_prefix<'a>(topic: &'a str, prefix: &str) -> Option<&'a str> {
    let rest = topic.strip_prefix(prefix.trim_end_matches('/'))?;
    let rest = rest.strip_prefix('/')?;
    if rest.is_empty() {
        None
    } else {
        Some(rest)
    }
}

/// Extract the station index from "station/<n>".
pub(crate) fn station_index(suffix: &str) -> Option<usize> {
    let parts: Vec<&str> = suffix.split('/').collect();
    if parts.len() == 2 && parts[0] == "station" {
        parts[1].parse().ok()
    } else {
        None
    }
}

/// Parse a `{"state": 0|1}` payload.
pub(crate) fn parse_station_state(payload: &[u8]) -> Result<bool, String> {
    match serde_json::from_slice::<StationMsg>(payload) {
        Ok(StationMsg { state: 0 }) => Ok(false),
        Ok(StationMsg { state: 1 }) => Ok(true),
        Ok(StationMsg { state }) => Err(format!("unknown station state {state}")),
        Err(e) => Err(format!("bad station json: {e}")),
    }
}

/// JSON when it parses, otherwise the trimmed text as a string.
pub(crate) fn payload_value(payload: &[u8]) -> Value {
    serde_json::from_slice(payload)
        .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(payload).trim().to_string()))
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    // -- join_topic ---------------------------------------------------------

    #[test]
    fn join_topic_plain() {
        assert_eq!(join_topic("sprinkler", "wifi_rssi"), "sprinkler/wifi_rssi");
    }

    #[test]
    fn join_topic_trailing_slash() {
        assert_eq!(join_topic("sprinkler/", "config/zones"), "sprinkler/config/zones");
    }

    // -- strip_prefix -------------------------------------------------------

    #[test]
    fn strip_prefix_valid_topic() {
        assert_eq!(
            strip_prefix("opensprinkler/availability", "opensprinkler"),
            Some("availability")
        );
        assert_eq!(
            strip_prefix("opensprinkler/station/3", "opensprinkler/"),
            Some("station/3")
        );
    }

    #[test]
    fn strip_prefix_other_topic() {
        assert_eq!(strip_prefix("garden/temp", "opensprinkler"), None);
    }

    #[test]
    fn strip_prefix_needs_separator() {
        assert_eq!(strip_prefix("opensprinklerx/station/1", "opensprinkler"), None);
        assert_eq!(strip_prefix("opensprinkler", "opensprinkler"), None);
        assert_eq!(strip_prefix("opensprinkler/", "opensprinkler"), None);
    }

    // -- station_index ------------------------------------------------------

    #[test]
    fn station_index_valid() {
        assert_eq!(station_index("station/0"), Some(0));
        assert_eq!(station_index("station/17"), Some(17));
    }

    #[test]
    fn station_index_rejects_other_shapes() {
        assert_eq!(station_index("station"), None);
        assert_eq!(station_index("station/x"), None);
        assert_eq!(station_index("station/1/extra"), None);
        assert_eq!(station_index("sensor/1"), None);
    }

    // -- parse_station_state ------------------------------------------------

    #[test]
    fn parse_station_state_on_off() {
        assert_eq!(parse_station_state(br#"{"state":1}"#), Ok(true));
        assert_eq!(parse_station_state(br#"{"state":0,"duration":600}"#), Ok(false));
    }

    #[test]
    fn parse_station_state_garbage() {
        assert!(parse_station_state(br#"{"state":7}"#).is_err());
        assert!(parse_station_state(b"ON").is_err());
        assert!(parse_station_state(b"{}").is_err());
    }

    // -- payload_value ------------------------------------------------------

    #[test]
    fn payload_value_json_or_text() {
        assert_eq!(payload_value(b"21.5"), json!(21.5));
        assert_eq!(payload_value(br#"{"a":1}"#), json!({"a": 1}));
        assert_eq!(payload_value(b" online \n"), json!("online"));
    }
}

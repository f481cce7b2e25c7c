//! Sync engine: lifecycle, status poll cycle, configuration retrieval,
//! variable push cycle and inbound device messages.
//!
//! ```text
//! Uninitialized ──configure──▶ Configured ──fetch ok──▶ Active
//!                                  │                     ▲  │
//!                                  │           fetch ok  │  │ transient error
//!                                  │                     │  ▼
//!                                  └──fatal error──▶ Inactive ◀──fatal── Degraded
//! ```
//!
//! Device requests always run without holding the state lock. The decode,
//! diff, publish and commit of one poll happen under a single write lock, so
//! state fields leave in the order they were committed. A field counts as
//! published only once the bus accepted it.

use std::collections::BTreeMap;

use serde::Serialize;
use serde_json::{Map, Value};
use tracing::{debug, error, info, warn};

use crate::config::{Config, VariableEntry};
use crate::db::{self, Db};
use crate::descriptors::decode_config;
use crate::device::{DeviceClient, DeviceSettings, FetchError};
use crate::mqtt::{self, Publisher};
use crate::state::{BridgeState, Lifecycle, SharedState};
use crate::status::decode_status;

/// Result of one poll cycle.
#[derive(Debug, PartialEq)]
pub enum PollOutcome {
    /// Lifecycle does not allow polling; no request was made.
    Skipped,
    /// Fetch and decode succeeded; this many fields were published.
    Published(usize),
    Failed(FetchError),
}

pub struct SyncEngine<P: Publisher> {
    device: DeviceSettings,
    client: Option<DeviceClient>,
    ignored_sensor_slots: Vec<u8>,
    device_topic: String,
    state_topic: String,
    push_topic: String,
    variables: Vec<VariableEntry>,
    db: Db,
    shared: SharedState,
    bus: P,
}

impl<P: Publisher> SyncEngine<P> {
    pub fn new(config: &Config, db: Db, shared: SharedState, bus: P) -> Self {
        let device = config.device.settings();
        let client = match DeviceClient::new(&device) {
            Ok(c) => Some(c),
            Err(e) => {
                error!("engine: cannot build device client: {e:#}");
                None
            }
        };

        Self {
            device,
            client,
            ignored_sensor_slots: config.device.ignored_sensor_slots.clone(),
            device_topic: config.mqtt.device_topic.clone(),
            state_topic: config.mqtt.state_topic.clone(),
            push_topic: config.mqtt.push_topic.clone(),
            variables: config.variables.clone(),
            db,
            shared,
            bus,
        }
    }

    pub fn shared(&self) -> &SharedState {
        &self.shared
    }

    /// Topics the bus client must subscribe to for [`Self::handle_message`].
    pub fn subscriptions(&self) -> Vec<String> {
        let mut topics = vec![mqtt::join_topic(&self.device_topic, "#")];
        for v in &self.variables {
            if !topics.contains(&v.topic) {
                topics.push(v.topic.clone());
            }
        }
        topics
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// Enter `Configured` when host, password and HTTP client are usable,
    /// otherwise `Inactive`.
    pub async fn configure(&self) -> Lifecycle {
        let next = if self.device.host.is_empty() || self.device.password.is_empty() {
            Lifecycle::Inactive {
                reason: "device host or password missing".into(),
            }
        } else if self.client.is_none() {
            Lifecycle::Inactive {
                reason: "device client unavailable".into(),
            }
        } else {
            Lifecycle::Configured
        };

        info!(host = %self.device.host, lifecycle = ?next, "engine configured");
        let mut st = self.shared.write().await;
        st.transition(next.clone());
        next
    }

    /// Suspend polling, e.g. after a configuration reload failed.
    pub async fn deactivate(&self, reason: String) {
        warn!(%reason, "engine deactivated");
        let mut st = self.shared.write().await;
        st.record_error(reason.clone());
        st.transition(Lifecycle::Inactive { reason });
    }

    /// Client to use for the next request, or `None` when the lifecycle says
    /// no requests should be made.
    async fn ready_client(&self) -> Option<&DeviceClient> {
        let polls = self.shared.read().await.lifecycle.polls();
        if polls {
            self.client.as_ref()
        } else {
            None
        }
    }

    async fn record_failure(&self, what: &str, err: &FetchError) {
        let next = if err.is_fatal() {
            error!(%err, "{what} failed, polling suspended");
            Lifecycle::Inactive {
                reason: err.to_string(),
            }
        } else {
            warn!(%err, "{what} failed");
            Lifecycle::Degraded {
                error: err.to_string(),
            }
        };
        let mut st = self.shared.write().await;
        st.record_error(format!("{what} failed: {err}"));
        st.transition(next);
    }

    // -----------------------------------------------------------------------
    // Status poll
    // -----------------------------------------------------------------------

    pub async fn poll_status(&self) -> PollOutcome {
        let Some(client) = self.ready_client().await else {
            debug!("poll skipped");
            return PollOutcome::Skipped;
        };

        let doc = match client.fetch_status().await {
            Ok(doc) => doc,
            Err(e) => {
                self.record_failure("status poll", &e).await;
                return PollOutcome::Failed(e);
            }
        };

        let mut st = self.shared.write().await;

        let mut calibration = st.calibration.clone();
        let snapshot = decode_status(&doc, &mut calibration, &st.config.sensors);
        if calibration != st.calibration {
            info!(
                tz_offset_sec = calibration.timezone_offset_sec,
                pulse_volume = calibration.pulse_volume,
                "calibration updated"
            );
            if let Err(e) = self.db.set_attribute(db::ATTR_CALIBRATION, &calibration).await {
                error!("db: persisting calibration failed: {e:#}");
            }
            st.calibration = calibration;
        }

        let fields = snapshot.fields(&st.config.zones);
        st.snapshot = Some(snapshot);
        st.transition(Lifecycle::Active);
        let delivered = self.publish_fields(&mut st, fields).await;
        st.record_poll(delivered);

        info!(changed = delivered, "status poll ok");
        PollOutcome::Published(delivered)
    }

    /// Publish every field that differs from the last delivered value,
    /// retained. A field is remembered in memory and in the store only once
    /// the bus accepted it, so a rejected one goes out again next cycle.
    /// Returns how many fields were delivered.
    async fn publish_fields(&self, st: &mut BridgeState, fields: BTreeMap<String, Value>) -> usize {
        let mut delivered = 0;
        for (field, value) in fields {
            if st.published.get(&field) == Some(&value) {
                continue;
            }
            let topic = mqtt::join_topic(&self.state_topic, &field);
            if let Err(e) = self.bus.publish(&topic, value.to_string(), true) {
                error!(%field, "{e:#}");
                st.record_error(format!("publishing {field} failed: {e:#}"));
                continue;
            }
            if let Err(e) = self.db.upsert_value(&field, &value).await {
                error!("db: {e:#}");
            }
            st.published.insert(field, value);
            delivered += 1;
        }
        delivered
    }

    // -----------------------------------------------------------------------
    // Configuration retrieval
    // -----------------------------------------------------------------------

    /// Fetch and decode the device configuration. Returns the names of the
    /// descriptor lists that changed; unchanged lists are neither stored
    /// nor published.
    pub async fn retrieve_config(&self) -> Result<Vec<&'static str>, FetchError> {
        let Some(client) = self.ready_client().await else {
            debug!("config retrieval skipped");
            return Ok(Vec::new());
        };

        let docs = match client.fetch_config().await {
            Ok(docs) => docs,
            Err(e) => {
                self.record_failure("config retrieval", &e).await;
                return Err(e);
            }
        };
        let fresh = decode_config(&docs, &self.ignored_sensor_slots);

        let mut updates: Vec<(&'static str, &'static str, Value)> = Vec::new();
        {
            let mut st = self.shared.write().await;
            if st.config.zones != fresh.zones {
                updates.push(("zones", db::ATTR_ZONES, to_json(&fresh.zones)));
            }
            if st.config.sensors != fresh.sensors {
                updates.push(("sensors", db::ATTR_SENSORS, to_json(&fresh.sensors)));
            }
            if st.config.programs != fresh.programs {
                updates.push(("programs", db::ATTR_PROGRAMS, to_json(&fresh.programs)));
            }
            st.config = fresh;
            st.transition(Lifecycle::Active);
            let names: Vec<&str> = updates.iter().map(|(n, _, _)| *n).collect();
            st.record_config(if names.is_empty() {
                "configuration unchanged".into()
            } else {
                format!("configuration updated: {}", names.join(", "))
            });
        }

        for (name, attr, value) in &updates {
            if let Err(e) = self.db.set_attribute(attr, value).await {
                error!("db: persisting {name} failed: {e:#}");
            }
            let topic = mqtt::join_topic(&self.state_topic, &format!("config/{name}"));
            if let Err(e) = self.bus.publish(&topic, value.to_string(), true) {
                error!("{e:#}");
            }
        }

        let names: Vec<&'static str> = updates.into_iter().map(|(n, _, _)| n).collect();
        info!(changed = ?names, "configuration retrieved");
        Ok(names)
    }

    // -----------------------------------------------------------------------
    // Variable push
    // -----------------------------------------------------------------------

    /// Publish every enabled variable with a known value as one JSON map.
    /// Returns the map, or `None` when nothing resolved.
    pub async fn push_variables(&self) -> Option<Map<String, Value>> {
        let map: Map<String, Value> = {
            let st = self.shared.read().await;
            self.variables
                .iter()
                .filter(|v| v.enabled)
                .filter_map(|v| st.variables.get(&v.topic).map(|val| (v.key.clone(), val.clone())))
                .collect()
        };

        if map.is_empty() {
            debug!("variable push: nothing to send");
            return None;
        }

        let payload = Value::Object(map.clone()).to_string();
        match self.bus.publish(&self.push_topic, payload, false) {
            Ok(()) => {
                info!(count = map.len(), topic = %self.push_topic, "variables pushed");
                let keys: Vec<&str> = map.keys().map(String::as_str).collect();
                self.shared
                    .write()
                    .await
                    .record_publish(format!("pushed {}", keys.join(", ")));
            }
            Err(e) => {
                error!("{e:#}");
                self.shared.write().await.record_error(format!("{e:#}"));
            }
        }
        Some(map)
    }

    // -----------------------------------------------------------------------
    // Inbound messages
    // -----------------------------------------------------------------------

    pub async fn handle_message(&self, topic: &str, payload: &[u8]) {
        if self.variables.iter().any(|v| v.topic == topic) {
            let value = mqtt::payload_value(payload);
            debug!(%topic, %value, "variable source updated");
            self.shared
                .write()
                .await
                .variables
                .insert(topic.to_string(), value);
        }

        if topic == self.push_topic {
            return;
        }
        let Some(suffix) = mqtt::strip_prefix(topic, &self.device_topic) else {
            return;
        };

        if suffix == "availability" {
            let availability = String::from_utf8_lossy(payload).trim().to_string();
            info!(%availability, "device availability");
            let mut st = self.shared.write().await;
            st.record_device(format!("availability: {availability}"));
            st.device_availability = Some(availability);
        } else if let Some(index) = mqtt::station_index(suffix) {
            match mqtt::parse_station_state(payload) {
                Ok(on) => self.apply_station_state(index, on).await,
                Err(msg) => {
                    warn!(%topic, "{msg}");
                    self.shared.write().await.record_error(msg);
                }
            }
        } else {
            match serde_json::from_slice::<Value>(payload) {
                Ok(value) => {
                    let mut st = self.shared.write().await;
                    st.record_device(format!("{suffix}: {value}"));
                    st.device_messages.insert(suffix.to_string(), value);
                }
                Err(e) => {
                    warn!(%topic, "bad device json: {e}");
                    self.shared
                        .write()
                        .await
                        .record_error(format!("bad device json on {topic}: {e}"));
                }
            }
        }
    }

    /// A station switched between polls. The live flag is folded into the
    /// current snapshot and published straight away. Stations outside the
    /// known zones, or past the last polled bitmap, are ignored.
    async fn apply_station_state(&self, index: usize, on: bool) {
        let mut st = self.shared.write().await;

        let known_zone =
            st.config.zones.is_empty() || st.config.zones.iter().any(|z| z.index == index);
        let polled = st.snapshot.as_ref().and_then(|s| s.station_active.as_ref());
        if !known_zone || polled.is_some_and(|a| index >= a.len()) {
            debug!(index, "station message for unknown station ignored");
            return;
        }

        if let Some(active) = st
            .snapshot
            .as_mut()
            .and_then(|s| s.station_active.as_mut())
            .and_then(|a| a.get_mut(index))
        {
            *active = on;
        }
        st.record_device(format!("station {index} {}", if on { "on" } else { "off" }));

        let fields = BTreeMap::from([(format!("station/{index}/active"), Value::Bool(on))]);
        self.publish_fields(&mut st, fields).await;
    }
}

fn to_json<T: Serialize>(value: &T) -> Value {
    serde_json::to_value(value).unwrap_or(Value::Null)
}

/// Restore what the store remembers into a fresh state.
pub async fn restore(db: &Db, shared: &SharedState) -> anyhow::Result<()> {
    let calibration = db.get_attribute(db::ATTR_CALIBRATION).await?;
    let zones = db.get_attribute(db::ATTR_ZONES).await?;
    let sensors = db.get_attribute(db::ATTR_SENSORS).await?;
    let programs = db.get_attribute(db::ATTR_PROGRAMS).await?;
    let published: BTreeMap<String, Value> = db.load_values().await?;

    let mut st = shared.write().await;
    if let Some(cal) = calibration {
        st.calibration = cal;
    }
    if let Some(z) = zones {
        st.config.zones = z;
    }
    if let Some(s) = sensors {
        st.config.sensors = s;
    }
    if let Some(p) = programs {
        st.config.programs = p;
    }
    st.published = published;
    let summary = format!(
        "restored {} zone(s), {} sensor(s), {} program(s), {} value(s)",
        st.config.zones.len(),
        st.config.sensors.len(),
        st.config.programs.len(),
        st.published.len()
    );
    st.record_system(summary);
    Ok(())
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::CalibrationState;
    use crate::config::{DeviceSection, MqttSection, PollingSection};
    use crate::descriptors::{SensorDescriptor, SensorType, ZoneDescriptor};
    use crate::state::BridgeState;
    use mockito::Matcher;
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{Arc, Mutex};

    // -- Test helpers -------------------------------------------------------

    #[derive(Clone, Default)]
    struct RecordingBus {
        sent: Arc<Mutex<Vec<(String, String, bool)>>>,
        full: Arc<AtomicBool>,
    }

    impl RecordingBus {
        fn take(&self) -> Vec<(String, String, bool)> {
            std::mem::take(&mut *self.sent.lock().unwrap())
        }

        /// Reject every publish, like a full client request queue.
        fn set_full(&self, full: bool) {
            self.full.store(full, Ordering::SeqCst);
        }
    }

    impl Publisher for RecordingBus {
        fn publish(&self, topic: &str, payload: String, retain: bool) -> anyhow::Result<()> {
            if self.full.load(Ordering::SeqCst) {
                anyhow::bail!("mqtt request queue full");
            }
            self.sent
                .lock()
                .unwrap()
                .push((topic.to_string(), payload, retain));
            Ok(())
        }
    }

    fn test_config(server: &mockito::ServerGuard) -> Config {
        let addr = server.socket_address();
        Config {
            device: DeviceSection {
                host: addr.ip().to_string(),
                port: Some(addr.port()),
                use_tls: false,
                password: "opendoor".into(),
                accept_invalid_certs: false,
                ignored_sensor_slots: vec![],
            },
            polling: PollingSection::default(),
            mqtt: MqttSection::default(),
            variables: vec![
                VariableEntry {
                    topic: "garden/temperature".into(),
                    key: "t".into(),
                    enabled: true,
                },
                VariableEntry {
                    topic: "garden/humidity".into(),
                    key: "h".into(),
                    enabled: true,
                },
                VariableEntry {
                    topic: "garden/wind".into(),
                    key: "w".into(),
                    enabled: false,
                },
            ],
        }
    }

    async fn test_engine(
        server: &mockito::ServerGuard,
    ) -> (SyncEngine<RecordingBus>, RecordingBus, Db) {
        let db = Db::connect("sqlite::memory:").await.unwrap();
        db.migrate().await.unwrap();
        let bus = RecordingBus::default();
        let engine = SyncEngine::new(
            &test_config(server),
            db.clone(),
            BridgeState::shared(),
            bus.clone(),
        );
        (engine, bus, db)
    }

    fn status_body() -> String {
        json!({
            "settings": {"en": 1, "devt": 1_700_003_600, "RSSI": -60, "nbrd": 1, "sbits": [1], "ps": []},
            "options": {"tz": 52, "wl": 100},
        })
        .to_string()
    }

    async fn mock_status(server: &mut mockito::ServerGuard, status: usize, body: &str) -> mockito::Mock {
        server
            .mock("GET", "/ja")
            .match_query(Matcher::Any)
            .with_status(status)
            .with_body(body)
            .create_async()
            .await
    }

    async fn lifecycle(engine: &SyncEngine<RecordingBus>) -> Lifecycle {
        engine.shared().read().await.lifecycle.clone()
    }

    // -- lifecycle ----------------------------------------------------------

    #[tokio::test]
    async fn unconfigured_engine_does_not_poll() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/ja")
            .match_query(Matcher::Any)
            .expect(0)
            .create_async()
            .await;
        let (engine, bus, _db) = test_engine(&server).await;

        assert_eq!(engine.poll_status().await, PollOutcome::Skipped);
        assert!(bus.take().is_empty());
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn missing_password_deactivates() {
        let server = mockito::Server::new_async().await;
        let mut cfg = test_config(&server);
        cfg.device.password.clear();
        let db = Db::connect("sqlite::memory:").await.unwrap();
        let engine = SyncEngine::new(&cfg, db, BridgeState::shared(), RecordingBus::default());

        assert!(matches!(engine.configure().await, Lifecycle::Inactive { .. }));
        assert_eq!(engine.poll_status().await, PollOutcome::Skipped);
    }

    #[tokio::test]
    async fn first_successful_poll_activates() {
        let mut server = mockito::Server::new_async().await;
        let _m = mock_status(&mut server, 200, &status_body()).await;
        let (engine, bus, db) = test_engine(&server).await;

        assert_eq!(engine.configure().await, Lifecycle::Configured);
        let outcome = engine.poll_status().await;
        assert!(matches!(outcome, PollOutcome::Published(n) if n > 0));
        assert_eq!(lifecycle(&engine).await, Lifecycle::Active);

        let sent = bus.take();
        assert!(sent
            .iter()
            .any(|(t, p, r)| t == "sprinkler/device_time" && p == "1700000000" && *r));
        assert!(sent
            .iter()
            .any(|(t, p, _)| t == "sprinkler/station/0/active" && p == "true"));

        let values = db.load_values().await.unwrap();
        assert_eq!(values["wifi_rssi"], json!(-60));
        let cal: CalibrationState = db.get_attribute(db::ATTR_CALIBRATION).await.unwrap().unwrap();
        assert_eq!(cal.timezone_offset_sec, 3600);
    }

    #[tokio::test]
    async fn identical_second_poll_publishes_nothing() {
        let mut server = mockito::Server::new_async().await;
        let _m = mock_status(&mut server, 200, &status_body()).await;
        let (engine, bus, _db) = test_engine(&server).await;
        engine.configure().await;

        engine.poll_status().await;
        bus.take();

        assert_eq!(engine.poll_status().await, PollOutcome::Published(0));
        assert!(bus.take().is_empty());
    }

    #[tokio::test]
    async fn changed_field_is_the_only_publish() {
        let mut server = mockito::Server::new_async().await;
        let first = mock_status(&mut server, 200, &status_body()).await;
        let (engine, bus, _db) = test_engine(&server).await;
        engine.configure().await;
        engine.poll_status().await;
        bus.take();
        first.remove_async().await;

        let mut doc: Value = serde_json::from_str(&status_body()).unwrap();
        doc["settings"]["RSSI"] = json!(-71);
        let _second = mock_status(&mut server, 200, &doc.to_string()).await;

        assert_eq!(engine.poll_status().await, PollOutcome::Published(1));
        assert_eq!(
            bus.take(),
            vec![("sprinkler/wifi_rssi".to_string(), "-71".to_string(), true)]
        );
    }

    #[tokio::test]
    async fn rejected_publish_is_retried_next_poll() {
        let mut server = mockito::Server::new_async().await;
        let _m = mock_status(&mut server, 200, &status_body()).await;
        let (engine, bus, db) = test_engine(&server).await;
        engine.configure().await;

        bus.set_full(true);
        assert_eq!(engine.poll_status().await, PollOutcome::Published(0));
        assert!(engine.shared().read().await.published.is_empty());
        assert!(db.load_values().await.unwrap().is_empty());
        assert!(engine
            .shared()
            .read()
            .await
            .events
            .iter()
            .any(|e| e.detail.contains("publishing wifi_rssi failed")));

        bus.set_full(false);
        assert!(matches!(engine.poll_status().await, PollOutcome::Published(n) if n > 0));
        assert!(bus
            .take()
            .iter()
            .any(|(t, p, r)| t == "sprinkler/wifi_rssi" && p == "-60" && *r));
        assert_eq!(db.load_values().await.unwrap()["wifi_rssi"], json!(-60));
    }

    #[tokio::test]
    async fn server_error_degrades_and_keeps_snapshot() {
        let mut server = mockito::Server::new_async().await;
        let ok = mock_status(&mut server, 200, &status_body()).await;
        let (engine, bus, _db) = test_engine(&server).await;
        engine.configure().await;
        engine.poll_status().await;
        bus.take();
        ok.remove_async().await;
        let before = engine.shared().read().await.snapshot.clone();

        let _err = mock_status(&mut server, 503, "").await;
        assert_eq!(
            engine.poll_status().await,
            PollOutcome::Failed(FetchError::Server(503))
        );
        assert!(matches!(lifecycle(&engine).await, Lifecycle::Degraded { .. }));
        assert_eq!(engine.shared().read().await.snapshot, before);
        assert!(bus.take().is_empty());
    }

    #[tokio::test]
    async fn degraded_engine_recovers_on_success() {
        let mut server = mockito::Server::new_async().await;
        let err = mock_status(&mut server, 200, r#"{"result":2}"#).await;
        let (engine, _bus, _db) = test_engine(&server).await;
        engine.configure().await;

        assert_eq!(
            engine.poll_status().await,
            PollOutcome::Failed(FetchError::Unauthorized)
        );
        assert!(matches!(lifecycle(&engine).await, Lifecycle::Degraded { .. }));

        err.remove_async().await;
        let _ok = mock_status(&mut server, 200, &status_body()).await;
        engine.poll_status().await;
        assert_eq!(lifecycle(&engine).await, Lifecycle::Active);
    }

    #[tokio::test]
    async fn fatal_result_stops_polling() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/ja")
            .match_query(Matcher::Any)
            .with_body(r#"{"result":48}"#)
            .expect(1)
            .create_async()
            .await;
        let (engine, bus, _db) = test_engine(&server).await;
        engine.configure().await;

        assert_eq!(
            engine.poll_status().await,
            PollOutcome::Failed(FetchError::Forbidden(48))
        );
        assert!(matches!(lifecycle(&engine).await, Lifecycle::Inactive { .. }));

        assert_eq!(engine.poll_status().await, PollOutcome::Skipped);
        assert_eq!(engine.poll_status().await, PollOutcome::Skipped);
        assert!(bus.take().is_empty());
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn malformed_body_degrades() {
        let mut server = mockito::Server::new_async().await;
        let _m = mock_status(&mut server, 200, "not json").await;
        let (engine, _bus, _db) = test_engine(&server).await;
        engine.configure().await;

        assert_eq!(
            engine.poll_status().await,
            PollOutcome::Failed(FetchError::MalformedBody)
        );
        assert!(matches!(lifecycle(&engine).await, Lifecycle::Degraded { .. }));
    }

    #[tokio::test]
    async fn sensors_follow_retrieved_config() {
        let mut server = mockito::Server::new_async().await;
        let body = json!({
            "settings": {"sn1": 1, "flcrt": 30, "flwrt": 30},
            "options": {"fpr0": 50, "fpr1": 0},
        })
        .to_string();
        let _m = mock_status(&mut server, 200, &body).await;
        let (engine, bus, _db) = test_engine(&server).await;
        engine.configure().await;

        engine.poll_status().await;
        assert!(!bus.take().iter().any(|(t, _, _)| t == "sprinkler/sensor/1"));

        engine.shared().write().await.config.sensors = vec![
            SensorDescriptor {
                index: 1,
                sensor_type: SensorType::Rain,
                contact_option: None,
                calibration_factor: None,
                in_use: true,
            },
            SensorDescriptor {
                index: 2,
                sensor_type: SensorType::Flow,
                contact_option: None,
                calibration_factor: Some(0.5),
                in_use: true,
            },
        ];
        engine.poll_status().await;
        let sent = bus.take();
        assert!(sent.iter().any(|(t, p, _)| t == "sprinkler/sensor/1" && p == "true"));
        // 30 pulses * 0.5 over 30s
        assert!(sent.iter().any(|(t, p, _)| t == "sprinkler/flow_rate" && p == "30.0"));
    }

    // -- configuration ------------------------------------------------------

    async fn mock_config(server: &mut mockito::ServerGuard, names: &[&str]) -> Vec<mockito::Mock> {
        let stations = json!({
            "snames": names,
            "maxlen": 32,
            "stn_dis": [0],
            "stn_spe": [0],
            "ignore_rain": [0],
            "stn_grp": [0, 0, 0, 0, 0, 0, 0, 0],
        });
        let mut mocks = Vec::new();
        for (path, body) in [
            ("/jn", stations.to_string()),
            ("/jp", json!({"nprogs": 0, "pd": []}).to_string()),
            ("/jo", json!({"sn1t": 1, "sn1o": 1}).to_string()),
            ("/je", "{}".to_string()),
        ] {
            mocks.push(
                server
                    .mock("GET", path)
                    .match_query(Matcher::Any)
                    .with_body(body)
                    .create_async()
                    .await,
            );
        }
        mocks
    }

    #[tokio::test]
    async fn config_publishes_only_changed_lists() {
        let mut server = mockito::Server::new_async().await;
        let first = mock_config(&mut server, &["Front", "Back"]).await;
        let (engine, bus, db) = test_engine(&server).await;
        engine.configure().await;

        let changed = engine.retrieve_config().await.unwrap();
        assert_eq!(changed, vec!["zones", "sensors"]);
        let topics: Vec<String> = bus.take().into_iter().map(|(t, _, _)| t).collect();
        assert_eq!(topics, vec!["sprinkler/config/zones", "sprinkler/config/sensors"]);
        assert_eq!(lifecycle(&engine).await, Lifecycle::Active);

        // identical documents: nothing stored or published
        assert!(engine.retrieve_config().await.unwrap().is_empty());
        assert!(bus.take().is_empty());

        for m in first {
            m.remove_async().await;
        }
        let _second = mock_config(&mut server, &["Front", "Side"]).await;
        assert_eq!(engine.retrieve_config().await.unwrap(), vec!["zones"]);
        let stored: Vec<crate::descriptors::ZoneDescriptor> =
            db.get_attribute(db::ATTR_ZONES).await.unwrap().unwrap();
        assert_eq!(stored[1].name, "Side");
    }

    #[tokio::test]
    async fn config_failure_classifies() {
        let mut server = mockito::Server::new_async().await;
        let _m = server
            .mock("GET", "/jn")
            .match_query(Matcher::Any)
            .with_body(r#"{"result":32}"#)
            .create_async()
            .await;
        let (engine, bus, _db) = test_engine(&server).await;
        engine.configure().await;

        assert_eq!(engine.retrieve_config().await, Err(FetchError::Forbidden(32)));
        assert!(matches!(lifecycle(&engine).await, Lifecycle::Inactive { .. }));
        assert!(bus.take().is_empty());
    }

    #[tokio::test]
    async fn restore_loads_persisted_state() {
        let server = mockito::Server::new_async().await;
        let (_engine, _bus, db) = test_engine(&server).await;
        let mut cal = CalibrationState::default();
        cal.set_timezone_code(44);
        db.set_attribute(db::ATTR_CALIBRATION, &cal).await.unwrap();
        db.upsert_value("wifi_rssi", &json!(-50)).await.unwrap();

        let shared = BridgeState::shared();
        restore(&db, &shared).await.unwrap();
        let st = shared.read().await;
        assert_eq!(st.calibration.timezone_offset_sec, -3600);
        assert_eq!(st.published["wifi_rssi"], json!(-50));
        assert!(st.config.zones.is_empty());
    }

    // -- variable push ------------------------------------------------------

    #[tokio::test]
    async fn push_skips_unresolved_and_disabled() {
        let server = mockito::Server::new_async().await;
        let (engine, bus, _db) = test_engine(&server).await;

        assert_eq!(engine.push_variables().await, None);
        assert!(bus.take().is_empty());

        engine.handle_message("garden/temperature", b"21.5").await;
        engine.handle_message("garden/wind", b"4").await;

        let map = engine.push_variables().await.unwrap();
        assert_eq!(Value::Object(map), json!({"t": 21.5}));
        assert_eq!(
            bus.take(),
            vec![(
                "opensprinkler/weather".to_string(),
                r#"{"t":21.5}"#.to_string(),
                false
            )]
        );
    }

    #[tokio::test]
    async fn push_uses_latest_values() {
        let server = mockito::Server::new_async().await;
        let (engine, _bus, _db) = test_engine(&server).await;

        engine.handle_message("garden/temperature", b"20").await;
        engine.handle_message("garden/temperature", b"22").await;
        engine.handle_message("garden/humidity", b"high").await;

        let map = engine.push_variables().await.unwrap();
        assert_eq!(Value::Object(map), json!({"t": 22, "h": "high"}));
    }

    // -- inbound ------------------------------------------------------------

    #[tokio::test]
    async fn availability_is_stored_raw() {
        let server = mockito::Server::new_async().await;
        let (engine, _bus, _db) = test_engine(&server).await;

        engine.handle_message("opensprinkler/availability", b"offline").await;
        assert_eq!(
            engine.shared().read().await.device_availability.as_deref(),
            Some("offline")
        );
    }

    #[tokio::test]
    async fn station_message_publishes_change_once() {
        let server = mockito::Server::new_async().await;
        let (engine, bus, _db) = test_engine(&server).await;

        engine.handle_message("opensprinkler/station/3", br#"{"state":1}"#).await;
        engine.handle_message("opensprinkler/station/3", br#"{"state":1}"#).await;
        assert_eq!(
            bus.take(),
            vec![("sprinkler/station/3/active".to_string(), "true".to_string(), true)]
        );

        engine.handle_message("opensprinkler/station/3", br#"{"state":0}"#).await;
        assert_eq!(bus.take().len(), 1);
    }

    #[tokio::test]
    async fn rejected_station_publish_is_not_remembered() {
        let server = mockito::Server::new_async().await;
        let (engine, bus, _db) = test_engine(&server).await;

        bus.set_full(true);
        engine.handle_message("opensprinkler/station/3", br#"{"state":1}"#).await;
        bus.set_full(false);
        engine.handle_message("opensprinkler/station/3", br#"{"state":1}"#).await;
        assert_eq!(
            bus.take(),
            vec![("sprinkler/station/3/active".to_string(), "true".to_string(), true)]
        );
    }

    #[tokio::test]
    async fn station_message_outside_known_zones_is_ignored() {
        let mut server = mockito::Server::new_async().await;
        let _m = mock_status(&mut server, 200, &status_body()).await;
        let (engine, bus, db) = test_engine(&server).await;
        engine.configure().await;
        engine.poll_status().await;
        bus.take();

        // one board polled: stations 0..8
        engine.handle_message("opensprinkler/station/9", br#"{"state":1}"#).await;
        assert!(bus.take().is_empty());

        engine.shared().write().await.config.zones = vec![ZoneDescriptor {
            index: 1,
            name: "Lawn".into(),
            group: 'A',
            interface_kind: None,
            interface_label: "S02".into(),
            interface_detail: None,
            notes: Default::default(),
        }];
        engine.handle_message("opensprinkler/station/4", br#"{"state":1}"#).await;
        assert!(bus.take().is_empty());
        engine.handle_message("opensprinkler/station/1", br#"{"state":1}"#).await;
        assert_eq!(
            bus.take(),
            vec![("sprinkler/station/1/active".to_string(), "true".to_string(), true)]
        );

        let values = db.load_values().await.unwrap();
        assert!(!values.contains_key("station/9/active"));
        assert!(!values.contains_key("station/4/active"));
        assert_eq!(values["station/1/active"], json!(true));
    }

    #[tokio::test]
    async fn other_device_messages_are_recorded() {
        let server = mockito::Server::new_async().await;
        let (engine, bus, _db) = test_engine(&server).await;

        engine.handle_message("opensprinkler/raindelay", br#"{"state":1}"#).await;
        engine.handle_message("opensprinkler/weather", br#"{"t":20}"#).await;
        engine.handle_message("opensprinkler/sensor1", b"garbage").await;
        engine.handle_message("elsewhere/topic", b"1").await;

        let st = engine.shared().read().await;
        assert_eq!(st.device_messages.len(), 1);
        assert_eq!(st.device_messages["raindelay"], json!({"state": 1}));
        assert!(st.events.iter().any(|e| e.detail.contains("bad device json")));
        assert!(bus.take().is_empty());
    }

    #[tokio::test]
    async fn subscriptions_cover_device_and_variables() {
        let server = mockito::Server::new_async().await;
        let (engine, _bus, _db) = test_engine(&server).await;
        assert_eq!(
            engine.subscriptions(),
            vec![
                "opensprinkler/#",
                "garden/temperature",
                "garden/humidity",
                "garden/wind"
            ]
        );
    }
}

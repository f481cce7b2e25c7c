use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Instant;
use time::OffsetDateTime;
use tokio::sync::RwLock;

use crate::codec::CalibrationState;
use crate::descriptors::DeviceConfig;
use crate::status::DeviceSnapshot;

/// Maximum number of events retained in the ring buffer.
const MAX_EVENTS: usize = 200;

// ---------------------------------------------------------------------------
// Public type alias
// ---------------------------------------------------------------------------

pub type SharedState = Arc<RwLock<BridgeState>>;

// ---------------------------------------------------------------------------
// Core types
// ---------------------------------------------------------------------------

/// Where the sync engine stands with the device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum Lifecycle {
    Uninitialized,
    Configured,
    Active,
    /// Last fetch failed with a transient error; polling continues.
    Degraded { error: String },
    /// Polling is suspended until the configuration changes.
    Inactive { reason: String },
}

impl Lifecycle {
    pub fn polls(&self) -> bool {
        !matches!(self, Lifecycle::Uninitialized | Lifecycle::Inactive { .. })
    }
}

pub struct BridgeState {
    pub started_at: Instant,
    pub mqtt_connected: bool,
    pub lifecycle: Lifecycle,
    pub calibration: CalibrationState,
    pub snapshot: Option<DeviceSnapshot>,
    pub last_poll_at: Option<OffsetDateTime>,
    /// Last value published per field; the diff baseline for the next poll.
    pub published: BTreeMap<String, Value>,
    pub config: DeviceConfig,
    /// Raw availability string the controller last announced.
    pub device_availability: Option<String>,
    /// Other messages the controller pushed, by topic suffix.
    pub device_messages: BTreeMap<String, Value>,
    /// Live values of variable source topics, by topic.
    pub variables: HashMap<String, Value>,
    pub events: VecDeque<SystemEvent>,
}

#[derive(Clone, Serialize)]
pub struct SystemEvent {
    #[serde(with = "time::serde::rfc3339")]
    pub ts: OffsetDateTime,
    pub kind: EventKind,
    pub detail: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Poll,
    Publish,
    Config,
    Device,
    Error,
    System,
}

// ---------------------------------------------------------------------------
// JSON response (what the API returns)
// ---------------------------------------------------------------------------

#[derive(Serialize)]
pub struct StatusResponse {
    pub uptime_secs: u64,
    pub mqtt_connected: bool,
    pub lifecycle: Lifecycle,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_poll_at: Option<OffsetDateTime>,
    pub device_availability: Option<String>,
    pub calibration: CalibrationState,
    pub snapshot: Option<DeviceSnapshot>,
    pub config: DeviceConfig,
    pub published: BTreeMap<String, Value>,
    pub events: Vec<SystemEvent>,
}

// ---------------------------------------------------------------------------
// Construction & mutation
// ---------------------------------------------------------------------------

impl BridgeState {
    pub fn new() -> Self {
        Self {
            started_at: Instant::now(),
            mqtt_connected: false,
            lifecycle: Lifecycle::Uninitialized,
            calibration: CalibrationState::default(),
            snapshot: None,
            last_poll_at: None,
            published: BTreeMap::new(),
            config: DeviceConfig::default(),
            device_availability: None,
            device_messages: BTreeMap::new(),
            variables: HashMap::new(),
            events: VecDeque::with_capacity(MAX_EVENTS),
        }
    }

    pub fn shared() -> SharedState {
        Arc::new(RwLock::new(Self::new()))
    }

    /// Move to `next`, logging an event when the state actually changes.
    pub fn transition(&mut self, next: Lifecycle) {
        if self.lifecycle == next {
            return;
        }
        let detail = format!("lifecycle {:?} -> {next:?}", self.lifecycle);
        self.lifecycle = next;
        self.push_event(EventKind::System, detail);
    }

    pub fn record_poll(&mut self, changed: usize) {
        self.last_poll_at = Some(OffsetDateTime::now_utc());
        self.push_event(EventKind::Poll, format!("status poll ok, {changed} field(s) changed"));
    }

    pub fn record_publish(&mut self, detail: String) {
        self.push_event(EventKind::Publish, detail);
    }

    pub fn record_config(&mut self, detail: String) {
        self.push_event(EventKind::Config, detail);
    }

    pub fn record_device(&mut self, detail: String) {
        self.push_event(EventKind::Device, detail);
    }

    /// Record an error event.
    pub fn record_error(&mut self, detail: String) {
        self.push_event(EventKind::Error, detail);
    }

    /// Record a generic system event.
    pub fn record_system(&mut self, detail: String) {
        self.push_event(EventKind::System, detail);
    }

    /// Build the JSON-serialisable status snapshot.
    pub fn to_status(&self) -> StatusResponse {
        StatusResponse {
            uptime_secs: self.started_at.elapsed().as_secs(),
            mqtt_connected: self.mqtt_connected,
            lifecycle: self.lifecycle.clone(),
            last_poll_at: self.last_poll_at,
            device_availability: self.device_availability.clone(),
            calibration: self.calibration.clone(),
            snapshot: self.snapshot.clone(),
            config: self.config.clone(),
            published: self.published.clone(),
            events: self.events.iter().rev().cloned().collect(),
        }
    }

    fn push_event(&mut self, kind: EventKind, detail: String) {
        if self.events.len() >= MAX_EVENTS {
            self.events.pop_front();
        }
        self.events.push_back(SystemEvent {
            ts: OffsetDateTime::now_utc(),
            kind,
            detail,
        });
    }
}

impl Default for BridgeState {
    fn default() -> Self {
        Self::new()
    }
}

// ===========================================================================
// Tests
// ===========================================================================

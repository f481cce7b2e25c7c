//! Status decoding: one `/ja` document in, one [`DeviceSnapshot`] out.
//!
//! The document groups values under `settings` (live controller variables),
//! `options` (persistent options), `status`, `programs` and `stations`. Each
//! field is read on its own; a field the firmware does not send stays unset
//! in the snapshot and is never published.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::codec::bits::{test_bit, STATIONS_PER_BOARD};
use crate::codec::CalibrationState;
use crate::descriptors::{SensorDescriptor, ZoneDescriptor};
use crate::json::{self, json_path, FromJson};

// ---------------------------------------------------------------------------
// Snapshot types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RebootCause {
    None,
    FactoryReset,
    Button,
    ApReset,
    Timer,
    Web,
    WifiDone,
    FirmwareUpdate,
    WeatherFailure,
    NetworkFailure,
    NtpSync,
    Program,
    PowerOn,
    Unknown(i64),
}

impl RebootCause {
    pub fn from_code(code: i64) -> Self {
        match code {
            0 => Self::None,
            1 => Self::FactoryReset,
            2 => Self::Button,
            3 => Self::ApReset,
            4 => Self::Timer,
            5 => Self::Web,
            6 => Self::WifiDone,
            7 => Self::FirmwareUpdate,
            8 => Self::WeatherFailure,
            9 => Self::NetworkFailure,
            10 => Self::NtpSync,
            11 => Self::Program,
            99 => Self::PowerOn,
            other => Self::Unknown(other),
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::FactoryReset => "factory reset",
            Self::Button => "button",
            Self::ApReset => "reset to AP mode",
            Self::Timer => "api reboot",
            Self::Web => "web reboot",
            Self::WifiDone => "wifi configured",
            Self::FirmwareUpdate => "firmware update",
            Self::WeatherFailure => "weather call failure",
            Self::NetworkFailure => "network failure",
            Self::NtpSync => "time sync",
            Self::Program => "program",
            Self::PowerOn => "power on",
            Self::Unknown(_) => "unknown",
        }
    }
}

/// Outcome of the controller's last weather service call (`wterr`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WeatherStatus {
    Ok,
    NotReceived,
    ConnectFailed,
    Timeout,
    EmptyResponse,
    ServiceError(i64),
    Unknown(i64),
}

impl WeatherStatus {
    pub fn from_code(code: i64) -> Self {
        match code {
            0 => Self::Ok,
            -1 => Self::NotReceived,
            -2 => Self::ConnectFailed,
            -3 => Self::Timeout,
            -4 => Self::EmptyResponse,
            c if c > 0 => Self::ServiceError(c),
            c => Self::Unknown(c),
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Ok => "ok",
            Self::NotReceived => "request not received",
            Self::ConnectFailed => "cannot connect to weather server",
            Self::Timeout => "request timed out",
            Self::EmptyResponse => "empty response",
            Self::ServiceError(_) => "weather service error",
            Self::Unknown(_) => "unknown",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "state", content = "until")]
pub enum RainDelay {
    Inactive,
    Until(i64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LastRun {
    pub station_index: i64,
    pub program_index: i64,
    pub duration_sec: i64,
    pub end_utc: i64,
}

/// A station that is running or waiting in the device's run queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueuedRun {
    pub station_index: usize,
    pub program_index: i64,
    pub remaining_sec: i64,
    pub start_utc: Option<i64>,
    pub group_id: Option<i64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeviceSnapshot {
    pub controller_enabled: Option<bool>,
    pub watering_level_percent: Option<i64>,
    pub rain_delay_until: Option<RainDelay>,
    pub device_time_utc: Option<i64>,
    pub wifi_rssi: Option<i64>,
    pub last_reboot_at: Option<i64>,
    pub last_reboot_cause: Option<RebootCause>,
    pub current_draw_ma: Option<i64>,
    pub weather_query_at: Option<i64>,
    pub weather_query_status: Option<WeatherStatus>,
    /// Keyed by 1-based sensor slot.
    pub sensor_states: BTreeMap<u8, bool>,
    pub flow_rate: Option<f64>,
    pub last_run: Option<LastRun>,
    pub station_active: Option<Vec<bool>>,
    pub program_queue: Option<Vec<QueuedRun>>,
}

// ---------------------------------------------------------------------------
// Decoding
// ---------------------------------------------------------------------------

/// Decode a status document.
///
/// Timezone and flow calibration are read first and written into
/// `calibration`, so timestamps and flow in the same document already use
/// the new values. `sensors` is the current sensor configuration; switch and
/// flow readings are only taken for slots it marks as in use.
pub fn decode_status(
    doc: &Value,
    calibration: &mut CalibrationState,
    sensors: &[SensorDescriptor],
) -> DeviceSnapshot {
    update_calibration(doc, calibration);
    let cal: &CalibrationState = calibration;

    let int = |key: &str| json::get::<i64>(doc, json_path!["settings", key]);
    let timestamp = |key: &str| int(key).filter(|ts| *ts > 0).map(|ts| cal.to_utc(ts));

    let mut snap = DeviceSnapshot {
        controller_enabled: json::get::<bool>(doc, json_path!["settings", "en"]),
        watering_level_percent: json::get::<i64>(doc, json_path!["options", "wl"]),
        device_time_utc: timestamp("devt"),
        wifi_rssi: int("RSSI"),
        last_reboot_at: timestamp("lupt"),
        last_reboot_cause: int("lrbtc").map(RebootCause::from_code),
        current_draw_ma: int("curr"),
        weather_query_at: timestamp("lswc"),
        weather_query_status: int("wterr").map(WeatherStatus::from_code),
        ..Default::default()
    };

    snap.rain_delay_until = json::get::<bool>(doc, json_path!["settings", "rd"]).map(|active| {
        match timestamp("rdst") {
            Some(until) if active => RainDelay::Until(until),
            _ => RainDelay::Inactive,
        }
    });

    for sensor in sensors {
        if sensor.reports_state() {
            let key = format!("sn{}", sensor.index);
            if let Some(state) = json::get::<bool>(doc, json_path!["settings", key.as_str()]) {
                snap.sensor_states.insert(sensor.index, state);
            }
        }
    }

    if sensors.iter().any(SensorDescriptor::reports_flow) {
        if let Some(pulses) = int("flcrt") {
            snap.flow_rate = cal.flow_rate(pulses, int("flwrt"));
        }
    }

    snap.station_active = decode_station_bits(doc);
    snap.program_queue = decode_program_queue(doc, cal);
    snap.last_run = decode_last_run(doc, cal);

    snap
}

/// Timezone code and flow calibration bytes.
fn update_calibration(doc: &Value, calibration: &mut CalibrationState) {
    if let Some(tz) = json::get::<i64>(doc, json_path!["options", "tz"]) {
        calibration.set_timezone_code(tz);
    }
    if let (Some(low), Some(high)) = (
        json::get::<u8>(doc, json_path!["options", "fpr0"]),
        json::get::<u8>(doc, json_path!["options", "fpr1"]),
    ) {
        calibration.set_flow_calibration(low, high);
    }
}

fn decode_station_bits(doc: &Value) -> Option<Vec<bool>> {
    let sbits = json::get::<Vec<u8>>(doc, json_path!["settings", "sbits"])?;
    // nbrd can only narrow the bitmap, never extend it past the bytes sent.
    let boards = json::get::<i64>(doc, json_path!["settings", "nbrd"])
        .and_then(|n| usize::try_from(n).ok())
        .map_or(sbits.len(), |n| n.min(sbits.len()));
    let count = boards.saturating_mul(STATIONS_PER_BOARD);
    Some((0..count).map(|i| test_bit(&sbits, i)).collect())
}

/// `ps` holds `[pid, remaining, start, gid?]` per station; pid 0 is idle.
fn decode_program_queue(doc: &Value, cal: &CalibrationState) -> Option<Vec<QueuedRun>> {
    let entries = json::lookup(doc, json_path!["settings", "ps"])?.as_array()?;
    let queue = entries
        .iter()
        .enumerate()
        .filter_map(|(station_index, entry)| {
            let fields = Vec::<i64>::from_json(entry)?;
            let (&pid, &remaining, &start) = match fields.as_slice() {
                [pid, rem, start, ..] => (pid, rem, start),
                _ => return None,
            };
            if pid == 0 {
                return None;
            }
            Some(QueuedRun {
                station_index,
                program_index: pid,
                remaining_sec: remaining,
                start_utc: (start > 0).then(|| cal.to_utc(start)),
                group_id: fields.get(3).copied(),
            })
        })
        .collect();
    Some(queue)
}

/// `lrun` is `[sid, pid, duration, end]`; an end time of 0 means no run yet.
fn decode_last_run(doc: &Value, cal: &CalibrationState) -> Option<LastRun> {
    let at = |i: usize| json::get::<i64>(doc, json_path!["settings", "lrun", i]);
    let end = at(3).filter(|end| *end > 0)?;
    Some(LastRun {
        station_index: at(0)?,
        program_index: at(1)?,
        duration_sec: at(2)?,
        end_utc: cal.to_utc(end),
    })
}

// ---------------------------------------------------------------------------
// Publishable fields
// ---------------------------------------------------------------------------

impl DeviceSnapshot {
    /// Flatten into the key/value pairs that get published. Unset fields are
    /// left out. Once zones are known only their stations are listed, so
    /// disabled stations never show up.
    pub fn fields(&self, zones: &[ZoneDescriptor]) -> BTreeMap<String, Value> {
        let mut out = BTreeMap::new();
        let mut put = |key: &str, value: Option<Value>| {
            if let Some(v) = value {
                out.insert(key.to_string(), v);
            }
        };

        put("controller_enabled", self.controller_enabled.map(Value::from));
        put("watering_level", self.watering_level_percent.map(Value::from));
        put(
            "rain_delay_until",
            self.rain_delay_until.map(|rd| match rd {
                RainDelay::Inactive => Value::Null,
                RainDelay::Until(ts) => Value::from(ts),
            }),
        );
        put("device_time", self.device_time_utc.map(Value::from));
        put("wifi_rssi", self.wifi_rssi.map(Value::from));
        put("last_reboot_at", self.last_reboot_at.map(Value::from));
        put("last_reboot_cause", self.last_reboot_cause.map(|c| Value::from(c.label())));
        put("current_ma", self.current_draw_ma.map(Value::from));
        put("weather_query_at", self.weather_query_at.map(Value::from));
        put(
            "weather_query_status",
            self.weather_query_status.map(|s| Value::from(s.label())),
        );
        put("flow_rate", self.flow_rate.map(|r| json!((r * 100.0).round() / 100.0)));
        put("last_run", self.last_run.map(|r| json!(r)));
        put("program_queue", self.program_queue.as_ref().map(|q| json!(q)));

        for (slot, state) in &self.sensor_states {
            out.insert(format!("sensor/{slot}"), Value::from(*state));
        }

        if let Some(active) = &self.station_active {
            for (index, on) in active.iter().enumerate() {
                if zones.is_empty() || zones.iter().any(|z| z.index == index) {
                    out.insert(format!("station/{index}/active"), Value::from(*on));
                }
            }
        }

        out
    }
}

// ===========================================================================
// Tests
// ===========================================================================

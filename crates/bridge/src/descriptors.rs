//! Station, sensor and program configuration decoding.
//!
//! Inputs are the controller's configuration documents:
//!
//! - `/jn` station attributes: names plus one bitmap per attribute
//!   (`stn_dis`, `stn_spe`, `ignore_rain`, `ignore_sn1`, `ignore_sn2`,
//!   `stn_seq`) and, on newer firmware, a per-station group array `stn_grp`
//! - `/jp` programs: `pd` holds one tuple per program
//! - `/jo` options: sensor types/options and flow calibration bytes
//! - `/je` special stations: `{"<sid>": {"st": type, "sd": data}}`

use std::collections::BTreeSet;
use std::net::Ipv4Addr;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use crate::codec::bits::{bit_field, bit_flag, test_bit, STATIONS_PER_BOARD};
use crate::codec::flow::decode_calibration_factor;
use crate::json::{self, json_path};

/// Physical sensor inputs on the controller.
pub const SENSOR_SLOTS: [u8; 2] = [1, 2];

// ---------------------------------------------------------------------------
// Zones
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InterfaceKind {
    Local,
    Rf,
    RemoteIp,
    Gpio,
    Http,
    Https,
    RemoteOtc,
}

impl InterfaceKind {
    /// Map the `st` code of a special-station record.
    pub fn from_special_type(st: i64) -> Option<Self> {
        match st {
            0 => Some(Self::Local),
            1 => Some(Self::Rf),
            2 => Some(Self::RemoteIp),
            3 => Some(Self::Gpio),
            4 => Some(Self::Http),
            5 => Some(Self::Https),
            6 => Some(Self::RemoteOtc),
            _ => None,
        }
    }
}

/// Target of a station that is switched on another controller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteTarget {
    pub ip: Ipv4Addr,
    pub port: u16,
    pub station: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ZoneNote {
    IgnoresRain,
    IgnoresSensor1,
    IgnoresSensor2,
    NoFlowMeasuring,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ZoneDescriptor {
    pub index: usize,
    pub name: String,
    /// `A`..`D` sequential group, `P` parallel, `?` unknown.
    pub group: char,
    /// `None` when the special-station type is not one we know.
    pub interface_kind: Option<InterfaceKind>,
    pub interface_label: String,
    pub interface_detail: Option<RemoteTarget>,
    pub notes: BTreeSet<ZoneNote>,
}

// ---------------------------------------------------------------------------
// Sensors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SensorType {
    None,
    Rain,
    Flow,
    Soil,
    ProgramSwitch,
}

impl SensorType {
    pub fn from_code(code: i64) -> Self {
        match code {
            1 => Self::Rain,
            2 => Self::Flow,
            3 => Self::Soil,
            240 => Self::ProgramSwitch,
            _ => Self::None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContactOption {
    NormallyOpen,
    NormallyClosed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorDescriptor {
    /// 1-based slot, matching `sn1`/`sn2` on the device.
    pub index: u8,
    pub sensor_type: SensorType,
    pub contact_option: Option<ContactOption>,
    pub calibration_factor: Option<f64>,
    pub in_use: bool,
}

impl SensorDescriptor {
    /// Whether status reads should report this slot's switch state.
    pub fn reports_state(&self) -> bool {
        self.in_use && matches!(self.sensor_type, SensorType::Rain | SensorType::Soil)
    }

    pub fn reports_flow(&self) -> bool {
        self.in_use && self.sensor_type == SensorType::Flow
    }
}

// ---------------------------------------------------------------------------
// Programs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DayRestriction {
    None,
    Odd,
    Even,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum Schedule {
    /// Bit 0 = Monday .. bit 6 = Sunday.
    Weekdays { mask: u8 },
    Interval { every_days: u8, remainder: u8 },
    Other { code: u8 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum StartTime {
    Disabled,
    AtMinute { minute: u16 },
    Sunrise { offset_min: i16 },
    Sunset { offset_min: i16 },
}

const START_DISABLED_BIT: u8 = 15;
const START_SUNRISE_BIT: u8 = 14;
const START_SUNSET_BIT: u8 = 13;
const START_NEGATIVE_BIT: u8 = 12;
const START_MAGNITUDE_MASK: u16 = 0x07FF;

impl StartTime {
    /// Decode one start-time word. Negative values are how the JSON carries a
    /// set bit 15.
    pub fn decode(raw: i64) -> Self {
        if raw < 0 || raw > i64::from(u16::MAX) {
            return Self::Disabled;
        }
        let word = raw as u16;
        if bit_flag(word, START_DISABLED_BIT) {
            return Self::Disabled;
        }
        let magnitude = (word & START_MAGNITUDE_MASK) as i16;
        let offset_min = if bit_flag(word, START_NEGATIVE_BIT) {
            -magnitude
        } else {
            magnitude
        };
        if bit_flag(word, START_SUNRISE_BIT) {
            Self::Sunrise { offset_min }
        } else if bit_flag(word, START_SUNSET_BIT) {
            Self::Sunset { offset_min }
        } else {
            Self::AtMinute {
                minute: word & START_MAGNITUDE_MASK,
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum Starts {
    Fixed { times: Vec<StartTime> },
    Repeating {
        first: StartTime,
        repeat_count: i64,
        interval_min: i64,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MonthDay {
    pub month: u8,
    pub day: u8,
}

impl MonthDay {
    /// `(month << 5) | day`
    fn decode(raw: u16) -> Self {
        Self {
            month: bit_field(raw, 5, 0x0F) as u8,
            day: bit_field(raw, 0, 0x1F) as u8,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateRange {
    pub from: MonthDay,
    pub to: MonthDay,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgramDescriptor {
    pub index: usize,
    pub name: String,
    pub enabled: bool,
    pub uses_weather_adjustment: bool,
    pub total_duration_sec: u64,
    pub day_restriction: DayRestriction,
    pub schedule: Schedule,
    pub starts: Starts,
    pub date_range: Option<DateRange>,
}

// ---------------------------------------------------------------------------
// Decoding
// ---------------------------------------------------------------------------

/// The raw documents one configuration retrieval fetches.
#[derive(Debug, Clone, Default)]
pub struct ConfigDocuments {
    pub stations: Value,
    pub programs: Value,
    pub options: Value,
    pub special: Value,
}

/// Everything a configuration retrieval yields.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeviceConfig {
    pub zones: Vec<ZoneDescriptor>,
    pub sensors: Vec<SensorDescriptor>,
    pub programs: Vec<ProgramDescriptor>,
}

pub fn decode_config(docs: &ConfigDocuments, ignored_sensor_slots: &[u8]) -> DeviceConfig {
    let sensors = derive_sensors(&docs.options, ignored_sensor_slots);
    let zones = derive_zones(&docs.stations, &docs.special, &sensors);
    let programs = derive_programs(&docs.programs);
    DeviceConfig {
        zones,
        sensors,
        programs,
    }
}

/// One descriptor per slot configured as rain, flow or soil sensor.
pub fn derive_sensors(options: &Value, ignored_slots: &[u8]) -> Vec<SensorDescriptor> {
    let calibration = match (
        json::get::<u8>(options, json_path!["fpr0"]),
        json::get::<u8>(options, json_path!["fpr1"]),
    ) {
        (Some(low), Some(high)) => Some(decode_calibration_factor(low, high)),
        _ => None,
    };

    SENSOR_SLOTS
        .iter()
        .filter_map(|&slot| {
            let type_key = format!("sn{slot}t");
            let option_key = format!("sn{slot}o");
            let sensor_type =
                SensorType::from_code(json::get::<i64>(options, json_path![type_key.as_str()])?);

            let (contact_option, calibration_factor) = match sensor_type {
                SensorType::Rain | SensorType::Soil => {
                    let contact = json::get::<i64>(options, json_path![option_key.as_str()]).map(|o| {
                        if o == 1 {
                            ContactOption::NormallyOpen
                        } else {
                            ContactOption::NormallyClosed
                        }
                    });
                    (contact, None)
                }
                SensorType::Flow => (None, calibration),
                _ => return None,
            };

            Some(SensorDescriptor {
                index: slot,
                sensor_type,
                contact_option,
                calibration_factor,
                in_use: !ignored_slots.contains(&slot),
            })
        })
        .collect()
}

/// One descriptor per station that is not disabled.
pub fn derive_zones(
    stations: &Value,
    special: &Value,
    sensors: &[SensorDescriptor],
) -> Vec<ZoneDescriptor> {
    let bitmap = |key: &str| json::get::<Vec<u8>>(stations, json_path![key]).unwrap_or_default();
    let disabled = bitmap("stn_dis");
    let specials = bitmap("stn_spe");
    let ignore_rain = bitmap("ignore_rain");
    let ignore_sn = [bitmap("ignore_sn1"), bitmap("ignore_sn2")];
    let sequential = json::get::<Vec<u8>>(stations, json_path!["stn_seq"]);
    let groups = json::get::<Vec<i64>>(stations, json_path!["stn_grp"]);
    let names = json::get::<Vec<String>>(stations, json_path!["snames"]);

    let station_count = match &names {
        Some(n) => n.len(),
        None => disabled.len() * STATIONS_PER_BOARD,
    };

    let slot_is_flow = |slot: u8| {
        sensors
            .iter()
            .any(|s| s.index == slot && s.sensor_type == SensorType::Flow)
    };

    let mut zones = Vec::new();
    for index in 0..station_count {
        if test_bit(&disabled, index) {
            continue;
        }

        let (interface_kind, interface_detail) = if test_bit(&specials, index) {
            resolve_special(special, index)
        } else {
            (Some(InterfaceKind::Local), None)
        };
        let interface_label = interface_label(index, interface_kind, interface_detail.as_ref());

        let group = match (&groups, &sequential) {
            (Some(g), _) => match g.get(index).copied() {
                Some(gid @ 0..=3) => (b'A' + gid as u8) as char,
                Some(255) => 'P',
                _ => '?',
            },
            (None, Some(seq)) if test_bit(seq, index) => 'A',
            (None, Some(_)) => 'P',
            (None, None) => '?',
        };

        let mut notes = BTreeSet::new();
        if test_bit(&ignore_rain, index) {
            notes.insert(ZoneNote::IgnoresRain);
        }
        for (slot, bitmap) in SENSOR_SLOTS.iter().zip(ignore_sn.iter()) {
            if !test_bit(bitmap, index) {
                continue;
            }
            let note = if slot_is_flow(*slot) {
                ZoneNote::NoFlowMeasuring
            } else if *slot == 1 {
                ZoneNote::IgnoresSensor1
            } else {
                ZoneNote::IgnoresSensor2
            };
            notes.insert(note);
        }

        let name = names
            .as_ref()
            .and_then(|n| n.get(index))
            .filter(|n| !n.trim().is_empty())
            .cloned()
            .unwrap_or_else(|| interface_label.clone());

        zones.push(ZoneDescriptor {
            index,
            name,
            group,
            interface_kind,
            interface_label,
            interface_detail,
            notes,
        });
    }
    zones
}

fn resolve_special(special: &Value, index: usize) -> (Option<InterfaceKind>, Option<RemoteTarget>) {
    let key = index.to_string();
    let Some(st) = json::get::<i64>(special, json_path![key.as_str(), "st"]) else {
        warn!(station = index, "special station has no detail record");
        return (None, None);
    };
    let Some(kind) = InterfaceKind::from_special_type(st) else {
        warn!(station = index, st, "unknown special station type");
        return (None, None);
    };
    if kind != InterfaceKind::RemoteIp {
        return (Some(kind), None);
    }
    let detail = json::get::<String>(special, json_path![key.as_str(), "sd"])
        .as_deref()
        .and_then(parse_remote_target);
    if detail.is_none() {
        warn!(station = index, "malformed remote station descriptor");
    }
    (Some(kind), detail)
}

/// Parse a remote-station descriptor: 4 address bytes, 2 port bytes
/// (big-endian) and the remote station id, all hex encoded.
pub fn parse_remote_target(sd: &str) -> Option<RemoteTarget> {
    let hex = sd.trim();
    if hex.len() < 14 || !hex.is_ascii() {
        return None;
    }
    let byte = |i: usize| u8::from_str_radix(&hex[i * 2..i * 2 + 2], 16).ok();
    Some(RemoteTarget {
        ip: Ipv4Addr::new(byte(0)?, byte(1)?, byte(2)?, byte(3)?),
        port: u16::from_be_bytes([byte(4)?, byte(5)?]),
        station: byte(6)?,
    })
}

fn interface_label(index: usize, kind: Option<InterfaceKind>, detail: Option<&RemoteTarget>) -> String {
    match kind {
        Some(InterfaceKind::Local) => format!("S{:02}", index + 1),
        Some(InterfaceKind::Rf) => "RF".to_string(),
        Some(InterfaceKind::RemoteIp) => match detail {
            Some(t) => format!("IP {}:{} #{}", t.ip, t.port, u16::from(t.station) + 1),
            None => "IP".to_string(),
        },
        Some(InterfaceKind::Gpio) => "GPIO".to_string(),
        Some(InterfaceKind::Http) => "HTTP".to_string(),
        Some(InterfaceKind::Https) => "HTTPS".to_string(),
        Some(InterfaceKind::RemoteOtc) => "OTC".to_string(),
        None => "?".to_string(),
    }
}

/// Program tuples: `[flag, days0, days1, [start x4], [duration per station],
/// name, [range_enabled, from, to]]`. The last element is absent on older
/// firmware.
pub fn derive_programs(programs: &Value) -> Vec<ProgramDescriptor> {
    let Some(entries) = json::lookup(programs, json_path!["pd"]).and_then(Value::as_array) else {
        return Vec::new();
    };

    entries
        .iter()
        .enumerate()
        .filter_map(|(index, entry)| {
            let Some(fields) = entry.as_array() else {
                warn!(program = index, "program record is not an array");
                return None;
            };
            Some(decode_program(index, fields))
        })
        .collect()
}

fn decode_program(index: usize, fields: &[Value]) -> ProgramDescriptor {
    let int = |i: usize| fields.get(i).and_then(<i64 as json::FromJson>::from_json);
    let flag = int(0).and_then(|f| u16::try_from(f).ok()).unwrap_or(0);
    let days0 = int(1).and_then(|d| u8::try_from(d).ok()).unwrap_or(0);
    let days1 = int(2).and_then(|d| u8::try_from(d).ok()).unwrap_or(0);
    let starts_raw: Vec<i64> = fields
        .get(3)
        .and_then(<Vec<i64> as json::FromJson>::from_json)
        .unwrap_or_default();
    let durations: Vec<i64> = fields
        .get(4)
        .and_then(<Vec<i64> as json::FromJson>::from_json)
        .unwrap_or_default();
    let name = fields
        .get(5)
        .and_then(Value::as_str)
        .map(str::to_owned)
        .unwrap_or_else(|| format!("Program {}", index + 1));

    let day_restriction = match bit_field(flag, 2, 0b11) {
        1 => DayRestriction::Odd,
        2 => DayRestriction::Even,
        _ => DayRestriction::None,
    };
    let schedule = match bit_field(flag, 4, 0b11) {
        0 => Schedule::Weekdays { mask: days0 },
        3 => Schedule::Interval {
            every_days: days1,
            remainder: days0,
        },
        code => Schedule::Other { code: code as u8 },
    };
    let start_at = |i: usize| starts_raw.get(i).copied().unwrap_or(-1);
    let starts = if bit_flag(flag, 6) {
        Starts::Fixed {
            times: (0..4).map(|i| StartTime::decode(start_at(i))).collect(),
        }
    } else {
        Starts::Repeating {
            first: StartTime::decode(start_at(0)),
            repeat_count: starts_raw.get(1).copied().unwrap_or(0),
            interval_min: starts_raw.get(2).copied().unwrap_or(0),
        }
    };
    let date_range = fields
        .get(6)
        .and_then(<Vec<u16> as json::FromJson>::from_json)
        .and_then(|r| match r.as_slice() {
            [1, from, to, ..] => Some(DateRange {
                from: MonthDay::decode(*from),
                to: MonthDay::decode(*to),
            }),
            _ => None,
        });

    ProgramDescriptor {
        index,
        name,
        enabled: bit_flag(flag, 0),
        uses_weather_adjustment: bit_flag(flag, 1),
        total_duration_sec: durations.iter().filter(|d| **d > 0).map(|d| *d as u64).sum(),
        day_restriction,
        schedule,
        starts,
        date_range,
    }
}

// ===========================================================================
// Tests
// ===========================================================================

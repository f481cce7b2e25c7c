//! Pure helpers for the controller's packed wire encodings, plus the
//! calibration values the status decoder learns along the way.

pub mod bits;
pub mod flow;
pub mod time;

use serde::{Deserialize, Serialize};

/// Values learned from the device that later fields depend on.
///
/// Both start at zero and only count once a status document has carried
/// them (`*_known`). They survive restarts through the store.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CalibrationState {
    pub timezone_offset_sec: i64,
    pub timezone_known: bool,
    /// Volume per flow pulse, as configured on the device.
    pub pulse_volume: f64,
    pub pulse_volume_known: bool,
}

impl CalibrationState {
    /// Store the offset for a freshly read timezone code.
    pub fn set_timezone_code(&mut self, raw_code: i64) {
        self.timezone_offset_sec = time::derive_timezone_offset_sec(raw_code);
        self.timezone_known = true;
    }

    pub fn set_flow_calibration(&mut self, low: u8, high: u8) {
        self.pulse_volume = flow::decode_calibration_factor(low, high);
        self.pulse_volume_known = true;
    }

    pub fn to_utc(&self, device_local: i64) -> i64 {
        time::to_utc(device_local, self.timezone_offset_sec)
    }

    /// Flow rate per minute, or `None` while no calibration has been seen.
    pub fn flow_rate(&self, pulse_count: i64, window_sec: Option<i64>) -> Option<f64> {
        if !self.pulse_volume_known {
            return None;
        }
        Some(flow::compute_flow_rate(pulse_count, window_sec, self.pulse_volume))
    }
}

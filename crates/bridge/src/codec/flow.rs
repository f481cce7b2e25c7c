//! Flow sensor pulse arithmetic.

/// Sampling window the firmware uses when it does not report one.
pub const DEFAULT_FLOW_WINDOW_SEC: i64 = 30;

/// Volume per pulse from the two option bytes `fpr0` (low) / `fpr1` (high),
/// stored by the device in hundredths.
pub fn decode_calibration_factor(low: u8, high: u8) -> f64 {
    ((u16::from(high) << 8) + u16::from(low)) as f64 / 100.0
}

pub fn pulses_to_volume(pulse_count: i64, pulse_volume: f64) -> f64 {
    pulse_count as f64 * pulse_volume
}

/// Volume per minute for `pulse_count` pulses seen over `window_sec`.
pub fn compute_flow_rate(pulse_count: i64, window_sec: Option<i64>, pulse_volume: f64) -> f64 {
    let window = match window_sec {
        Some(w) if w > 0 => w,
        _ => DEFAULT_FLOW_WINDOW_SEC,
    };
    pulses_to_volume(pulse_count, pulse_volume) / (window as f64 / 60.0)
}

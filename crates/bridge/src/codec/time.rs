//! Device-local timestamps to UTC.
//!
//! The controller reports wall-clock Unix seconds in its own timezone. The
//! zone is sent as a quarter-hour code centred on 48 (GMT+0).

/// Timezone code meaning GMT+0.
const TZ_CODE_UTC: i64 = 48;

/// Seconds per timezone code step (a quarter hour).
const TZ_STEP_SEC: i64 = 900;

/// Offset in seconds for a raw timezone code: `(code - 48) / 4 * 3600`.
pub fn derive_timezone_offset_sec(raw_code: i64) -> i64 {
    (raw_code - TZ_CODE_UTC) * TZ_STEP_SEC
}

/// Shift a device-local timestamp to UTC. Non-positive values are the
/// firmware's "unset" sentinel and pass through untouched.
pub fn to_utc(device_local: i64, offset_sec: i64) -> i64 {
    if device_local <= 0 {
        return device_local;
    }
    device_local - offset_sec
}

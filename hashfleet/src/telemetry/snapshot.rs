use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::device::{DeviceId, Mode};
use crate::types::{Difficulty, HashRate, HashUnit};

/// One normalized reading of a device's operating metrics.
///
/// Snapshots are immutable once recorded. A newer snapshot supersedes an
/// older one; nothing edits a snapshot in place. The `stale` flag is set
/// on the copy handed to readers, never on the stored original.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetrySnapshot {
    pub device_id: DeviceId,
    #[serde(with = "time::serde::rfc3339")]
    pub captured_at: OffsetDateTime,
    pub hashrate: Option<HashRate>,
    /// Unit the device reported in, kept for display.
    pub reported_unit: Option<HashUnit>,
    pub temperature_c: Option<f32>,
    pub power_w: Option<f32>,
    pub shares_accepted: u64,
    pub shares_rejected: u64,
    #[serde(default)]
    pub extras: Extras,
    #[serde(default)]
    pub stale: bool,
}

/// Family-specific fields that not every device reports.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Extras {
    pub frequency_mhz: Option<f32>,
    pub core_voltage_mv: Option<f32>,
    pub firmware: Option<String>,
    pub best_difficulty: Option<Difficulty>,
    pub wifi_rssi: Option<i32>,
    pub uptime_secs: Option<u64>,
    /// Pool the device reports it is connected to.
    pub pool_url: Option<String>,
    /// Power mode the device reports running, when it maps to a known one.
    pub mode: Option<Mode>,
}

impl TelemetrySnapshot {
    /// Empty snapshot for `device_id` captured at `captured_at`; adapters
    /// fill in what their protocol provides.
    pub fn new(device_id: DeviceId, captured_at: OffsetDateTime) -> Self {
        Self {
            device_id,
            captured_at,
            hashrate: None,
            reported_unit: None,
            temperature_c: None,
            power_w: None,
            shares_accepted: 0,
            shares_rejected: 0,
            extras: Extras::default(),
            stale: false,
        }
    }

    /// Age relative to `now`, zero if captured in the future.
    pub fn age(&self, now: OffsetDateTime) -> std::time::Duration {
        let age = now - self.captured_at;
        std::time::Duration::try_from(age).unwrap_or_default()
    }
}

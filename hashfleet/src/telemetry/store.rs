//! In-memory cache of the latest snapshot per device.
//!
//! Two writers feed the store: the poller, once per device per cycle, and
//! the UDP listener, whenever a broadcast arrives. Both go through the same
//! `RwLock`, so readers always see whole entries. The engines never read
//! the live map; they take a [`FleetView`] copy once the poll cycle closes.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use strum::Display;
use time::OffsetDateTime;

use super::TelemetrySnapshot;
use crate::adapter::AdapterError;
use crate::device::DeviceId;
use crate::types::{FailureStreak, StreakStatus};

/// Derived device health.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum DeviceStatus {
    /// Never heard from and not yet failed enough to be offline.
    Unknown,
    Online,
    /// Reachable as far as we know, but the newest snapshot is too old.
    Stale,
    /// Failed `offline_after` consecutive polls.
    Offline,
}

/// What readers get for one device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceTelemetry {
    pub status: DeviceStatus,
    pub snapshot: Option<TelemetrySnapshot>,
    pub consecutive_failures: u32,
    pub last_error: Option<String>,
}

impl DeviceTelemetry {
    pub fn is_online(&self) -> bool {
        matches!(self.status, DeviceStatus::Online | DeviceStatus::Stale)
    }
}

/// Consistent copy of the whole store at one instant.
pub type FleetView = BTreeMap<DeviceId, DeviceTelemetry>;

#[derive(Debug)]
struct Entry {
    latest: Option<Arc<TelemetrySnapshot>>,
    streak: FailureStreak,
    last_error: Option<String>,
}

#[derive(Debug)]
pub struct TelemetryStore {
    entries: RwLock<HashMap<DeviceId, Entry>>,
    offline_after: u32,
    stale_after: Duration,
}

impl TelemetryStore {
    /// `offline_after` consecutive failures mark a device offline;
    /// snapshots older than `stale_after` are flagged stale.
    pub fn new(offline_after: u32, stale_after: Duration) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            offline_after,
            stale_after,
        }
    }

    fn new_entry(&self) -> Entry {
        Entry {
            latest: None,
            streak: FailureStreak::new(self.offline_after),
            last_error: None,
        }
    }

    /// Store a polled snapshot and clear the device's failure streak.
    pub fn record_success(&self, snapshot: TelemetrySnapshot) -> StreakStatus {
        let mut entries = self.entries.write();
        let entry = entries
            .entry(snapshot.device_id.clone())
            .or_insert_with(|| self.new_entry());
        Self::supersede(entry, snapshot);
        entry.last_error = None;
        entry.streak.record(true)
    }

    /// Count a failed poll. Returns [`StreakStatus::Tripped`] exactly on
    /// the poll that takes the device offline.
    pub fn record_failure(&self, id: &DeviceId, error: &AdapterError) -> StreakStatus {
        let mut entries = self.entries.write();
        let entry = entries.entry(id.clone()).or_insert_with(|| self.new_entry());
        entry.last_error = Some(error.to_string());
        entry.streak.record(false)
    }

    /// Store a snapshot that arrived outside the poll cycle (UDP
    /// broadcast). Does not touch the failure streak; the poller owns that.
    pub fn record_passive(&self, snapshot: TelemetrySnapshot) {
        let mut entries = self.entries.write();
        let entry = entries
            .entry(snapshot.device_id.clone())
            .or_insert_with(|| self.new_entry());
        Self::supersede(entry, snapshot);
    }

    fn supersede(entry: &mut Entry, snapshot: TelemetrySnapshot) {
        let newer = entry
            .latest
            .as_ref()
            .is_none_or(|current| snapshot.captured_at >= current.captured_at);
        if newer {
            entry.latest = Some(Arc::new(snapshot));
        }
    }

    pub fn latest(&self, id: &DeviceId) -> Option<Arc<TelemetrySnapshot>> {
        self.entries.read().get(id).and_then(|e| e.latest.clone())
    }

    pub fn view(&self, id: &DeviceId, now: OffsetDateTime) -> DeviceTelemetry {
        let entries = self.entries.read();
        match entries.get(id) {
            Some(entry) => self.describe(entry, now),
            None => DeviceTelemetry {
                status: DeviceStatus::Unknown,
                snapshot: None,
                consecutive_failures: 0,
                last_error: None,
            },
        }
    }

    /// Copy every entry under one read lock.
    pub fn read_all(&self, now: OffsetDateTime) -> FleetView {
        self.entries
            .read()
            .iter()
            .map(|(id, entry)| (id.clone(), self.describe(entry, now)))
            .collect()
    }

    fn describe(&self, entry: &Entry, now: OffsetDateTime) -> DeviceTelemetry {
        let stale = entry
            .latest
            .as_ref()
            .is_some_and(|s| s.age(now) > self.stale_after);

        let status = if entry.streak.is_tripped() {
            DeviceStatus::Offline
        } else if entry.latest.is_none() {
            DeviceStatus::Unknown
        } else if stale {
            DeviceStatus::Stale
        } else {
            DeviceStatus::Online
        };

        let snapshot = entry.latest.as_ref().map(|s| {
            let mut copy = TelemetrySnapshot::clone(s);
            copy.stale = stale;
            copy
        });

        DeviceTelemetry {
            status,
            snapshot,
            consecutive_failures: entry.streak.count(),
            last_error: entry.last_error.clone(),
        }
    }
}

//! Periodic telemetry collection.
//!
//! One poll cycle fetches every enabled device concurrently, bounded by a
//! global semaphore. A device whose previous poll is still in flight is
//! skipped for this cycle, never queued. The cycle closes only when every
//! task has finished or timed out; the controller runs the engines after
//! that, against a consistent store.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::adapter::{AdapterError, AdapterResult, AdapterSet};
use crate::device::{Device, DeviceId};
use crate::events::{ControllerEvent, EventBus};
use crate::telemetry::{TelemetrySnapshot, TelemetryStore};
use crate::tracing::prelude::*;
use crate::types::StreakStatus;

/// What happened in one cycle.
#[derive(Debug, Default)]
pub struct CycleReport {
    pub polled: Vec<Arc<TelemetrySnapshot>>,
    /// Still busy from an earlier cycle.
    pub skipped: Vec<DeviceId>,
    pub failed: Vec<(DeviceId, AdapterError)>,
    /// Crossed the offline threshold on this cycle.
    pub went_offline: Vec<DeviceId>,
    /// First success after being offline.
    pub recovered: Vec<DeviceId>,
}

pub struct Poller {
    adapters: AdapterSet,
    store: Arc<TelemetryStore>,
    events: EventBus,
    permits: Arc<Semaphore>,
    in_flight: Mutex<HashMap<DeviceId, Arc<tokio::sync::Mutex<()>>>>,
    timeout: Duration,
}

impl Poller {
    pub fn new(
        adapters: AdapterSet,
        store: Arc<TelemetryStore>,
        events: EventBus,
        max_concurrent: usize,
        timeout: Duration,
    ) -> Self {
        Self {
            adapters,
            store,
            events,
            permits: Arc::new(Semaphore::new(max_concurrent.max(1))),
            in_flight: Mutex::new(HashMap::new()),
            timeout,
        }
    }

    fn device_lock(&self, id: &DeviceId) -> Arc<tokio::sync::Mutex<()>> {
        Arc::clone(self.in_flight.lock().entry(id.clone()).or_default())
    }

    /// Poll every enabled device once and wait for all of them.
    pub async fn poll_cycle(&self, devices: &[Device]) -> CycleReport {
        let mut report = CycleReport::default();
        let mut tasks = JoinSet::new();

        for device in devices.iter().filter(|d| d.enabled) {
            let Ok(guard) = self.device_lock(&device.id).try_lock_owned() else {
                debug!(device = %device.id, "Previous poll still running, skipping");
                report.skipped.push(device.id.clone());
                continue;
            };

            let adapter = match self.adapters.for_device(device) {
                Ok(adapter) => Arc::clone(adapter),
                Err(e) => {
                    self.record(device.id.clone(), Err(e), &mut report);
                    continue;
                }
            };

            let permits = Arc::clone(&self.permits);
            let device = device.clone();
            let timeout = self.timeout;
            tasks.spawn(async move {
                let _guard = guard;
                let Ok(_permit) = permits.acquire_owned().await else {
                    return (device.id, Err(AdapterError::Io("poller shut down".into())));
                };
                let result = tokio::time::timeout(timeout, adapter.fetch_telemetry(&device))
                    .await
                    .unwrap_or(Err(AdapterError::Timeout));
                (device.id, result)
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((id, result)) => self.record(id, result, &mut report),
                Err(e) => error!(error = %e, "Poll task failed"),
            }
        }

        report
    }

    fn record(
        &self,
        id: DeviceId,
        result: AdapterResult<TelemetrySnapshot>,
        report: &mut CycleReport,
    ) {
        match result {
            Ok(snapshot) => {
                let status = self.store.record_success(snapshot);
                if let Some(latest) = self.store.latest(&id) {
                    report.polled.push(latest);
                }
                if status == StreakStatus::Recovered {
                    info!(device = %id, "Device back online");
                    self.events
                        .emit(ControllerEvent::DeviceOnline { device: id.clone() });
                    report.recovered.push(id);
                }
            }
            Err(e) => {
                match self.store.record_failure(&id, &e) {
                    StreakStatus::Tripped => {
                        warn!(device = %id, error = %e, "Device offline");
                        let failures = self
                            .store
                            .view(&id, time::OffsetDateTime::now_utc())
                            .consecutive_failures;
                        self.events.emit(ControllerEvent::DeviceOffline {
                            device: id.clone(),
                            failures,
                            error: e.to_string(),
                        });
                        report.went_offline.push(id.clone());
                    }
                    StreakStatus::Counting(n) => {
                        debug!(device = %id, error = %e, failures = n, "Poll failed");
                    }
                    _ => trace!(device = %id, error = %e, "Poll failed, still offline"),
                }
                report.failed.push((id, e));
            }
        }
    }
}

impl std::fmt::Debug for Poller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Poller")
            .field("adapters", &self.adapters)
            .field("available_permits", &self.permits.available_permits())
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

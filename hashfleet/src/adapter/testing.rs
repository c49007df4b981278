//! Scriptable in-memory adapter for unit tests.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use time::OffsetDateTime;

use super::{AdapterError, AdapterResult, Delivery, DeviceAdapter};
use crate::device::{Device, DeviceFamily, DeviceId, Mode, Pool, PoolId};
use crate::telemetry::TelemetrySnapshot;
use crate::types::{HashRate, HashUnit};

#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    Fetch(DeviceId),
    SetMode(DeviceId, Mode),
    SwitchPool(DeviceId, PoolId),
    Restart(DeviceId),
    BroadcastPool(PoolId),
}

/// Records every call. Fetches succeed and writes are acknowledged unless
/// failures were queued with [`fail_fetches`](Self::fail_fetches) or
/// [`fail_writes`](Self::fail_writes).
#[derive(Debug)]
pub struct FakeAdapter {
    family: DeviceFamily,
    delivery: Delivery,
    fetch_delay: Duration,
    calls: Mutex<Vec<Call>>,
    fetch_failures: Mutex<HashMap<DeviceId, VecDeque<AdapterError>>>,
    write_failures: Mutex<VecDeque<AdapterError>>,
    temperatures: Mutex<HashMap<DeviceId, f32>>,
}

impl FakeAdapter {
    pub fn new(family: DeviceFamily) -> Self {
        Self {
            family,
            delivery: Delivery::Confirmed,
            fetch_delay: Duration::ZERO,
            calls: Mutex::new(Vec::new()),
            fetch_failures: Mutex::new(HashMap::new()),
            write_failures: Mutex::new(VecDeque::new()),
            temperatures: Mutex::new(HashMap::new()),
        }
    }

    /// Pool switches report `delivery` instead of `Confirmed`.
    pub fn with_delivery(mut self, delivery: Delivery) -> Self {
        self.delivery = delivery;
        self
    }

    pub fn with_fetch_delay(mut self, delay: Duration) -> Self {
        self.fetch_delay = delay;
        self
    }

    pub fn fail_fetches(&self, device: &DeviceId, errors: impl IntoIterator<Item = AdapterError>) {
        self.fetch_failures
            .lock()
            .entry(device.clone())
            .or_default()
            .extend(errors);
    }

    pub fn fail_writes(&self, errors: impl IntoIterator<Item = AdapterError>) {
        self.write_failures.lock().extend(errors);
    }

    pub fn set_temperature(&self, device: &DeviceId, celsius: f32) {
        self.temperatures.lock().insert(device.clone(), celsius);
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().clone()
    }

    /// Calls other than telemetry fetches.
    pub fn writes(&self) -> Vec<Call> {
        self.calls
            .lock()
            .iter()
            .filter(|c| !matches!(c, Call::Fetch(_)))
            .cloned()
            .collect()
    }

    fn write(&self, call: Call) -> AdapterResult<()> {
        self.calls.lock().push(call);
        match self.write_failures.lock().pop_front() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl DeviceAdapter for FakeAdapter {
    fn family(&self) -> DeviceFamily {
        self.family
    }

    async fn fetch_telemetry(&self, device: &Device) -> AdapterResult<TelemetrySnapshot> {
        self.calls.lock().push(Call::Fetch(device.id.clone()));
        if !self.fetch_delay.is_zero() {
            tokio::time::sleep(self.fetch_delay).await;
        }

        let failure = self
            .fetch_failures
            .lock()
            .get_mut(&device.id)
            .and_then(VecDeque::pop_front);
        if let Some(e) = failure {
            return Err(e);
        }

        let mut snapshot = TelemetrySnapshot::new(device.id.clone(), OffsetDateTime::now_utc());
        snapshot.hashrate = Some(HashRate::new(500.0, HashUnit::Giga));
        snapshot.reported_unit = Some(HashUnit::Giga);
        snapshot.temperature_c = Some(self.temperatures.lock().get(&device.id).copied().unwrap_or(55.0));
        snapshot.power_w = Some(15.0);
        Ok(snapshot)
    }

    async fn set_mode(&self, device: &Device, mode: Mode) -> AdapterResult<()> {
        self.write(Call::SetMode(device.id.clone(), mode))
    }

    async fn switch_pool(&self, device: &Device, pool: &Pool) -> AdapterResult<Delivery> {
        self.write(Call::SwitchPool(device.id.clone(), pool.id.clone()))?;
        Ok(self.delivery)
    }

    async fn restart(&self, device: &Device) -> AdapterResult<()> {
        self.write(Call::Restart(device.id.clone()))
    }

    async fn broadcast_pool(&self, pool: &Pool) -> AdapterResult<Delivery> {
        self.write(Call::BroadcastPool(pool.id.clone()))?;
        Ok(self.delivery)
    }
}

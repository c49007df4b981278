//! What the dispatcher last wrote to each device.
//!
//! ```text
//!   (none) ──write──► Sent ──telemetry reports it──► Confirmed
//!                      │                                │
//!                      └── resend window elapses        └── telemetry reports
//!                          (written again)                  something else
//!                                                           (forgotten)
//! ```
//!
//! Confirmed values suppress identical writes indefinitely. Sent values
//! only suppress them until the resend window closes, after which the
//! write is issued again.

use std::collections::HashMap;
use std::time::Duration;

use tokio::time::Instant;

use crate::adapter::Delivery;
use crate::device::{DeviceId, Mode, Pool, PoolId};
use crate::telemetry::TelemetrySnapshot;
use crate::tracing::prelude::*;

#[derive(Debug, Clone, PartialEq)]
pub struct Applied<T> {
    pub value: T,
    pub delivery: Delivery,
    pub at: Instant,
}

impl<T: PartialEq> Applied<T> {
    fn covers(&self, wanted: &T, now: Instant, resend_after: Duration) -> bool {
        if &self.value != wanted {
            return false;
        }
        match self.delivery {
            Delivery::Confirmed => true,
            Delivery::Sent => now.saturating_duration_since(self.at) < resend_after,
        }
    }
}

#[derive(Debug, Default)]
pub struct AppliedState {
    pools: HashMap<DeviceId, Applied<PoolId>>,
    modes: HashMap<DeviceId, Applied<Mode>>,
}

impl AppliedState {
    pub fn pool(&self, device: &DeviceId) -> Option<&Applied<PoolId>> {
        self.pools.get(device)
    }

    pub fn mode(&self, device: &DeviceId) -> Option<&Applied<Mode>> {
        self.modes.get(device)
    }

    /// True when writing `pool` would change nothing.
    pub fn has_pool(&self, device: &DeviceId, pool: &PoolId, now: Instant, resend_after: Duration) -> bool {
        self.pools
            .get(device)
            .is_some_and(|a| a.covers(pool, now, resend_after))
    }

    pub fn has_mode(&self, device: &DeviceId, mode: Mode, now: Instant, resend_after: Duration) -> bool {
        self.modes
            .get(device)
            .is_some_and(|a| a.covers(&mode, now, resend_after))
    }

    pub fn record_pool(&mut self, device: DeviceId, pool: PoolId, delivery: Delivery, now: Instant) {
        self.pools.insert(
            device,
            Applied {
                value: pool,
                delivery,
                at: now,
            },
        );
    }

    pub fn record_mode(&mut self, device: DeviceId, mode: Mode, now: Instant) {
        self.modes.insert(
            device,
            Applied {
                value: mode,
                delivery: Delivery::Confirmed,
                at: now,
            },
        );
    }

    /// Reconcile writes against what the device now reports.
    ///
    /// A `Sent` pool is confirmed once telemetry shows its URL. A pool the
    /// device no longer reports is forgotten so the next plan rewrites it.
    /// A reported mode is adopted as confirmed; a written mode the device
    /// still does not report after `settle` is forgotten.
    pub fn observe(&mut self, snapshot: &TelemetrySnapshot, pools: &[Pool], now: Instant, settle: Duration) {
        if let Some(reported) = snapshot.extras.mode {
            self.observe_mode(&snapshot.device_id, reported, now, settle);
        }
        self.observe_pool(snapshot, pools);
    }

    fn observe_mode(&mut self, device: &DeviceId, reported: Mode, now: Instant, settle: Duration) {
        let expected = match self.modes.get(device) {
            Some(applied) if applied.value == reported => return,
            Some(applied) if now.saturating_duration_since(applied.at) < settle => return,
            Some(applied) => applied.value,
            None => {
                trace!(device = %device, mode = %reported, "Mode adopted from telemetry");
                self.modes.insert(
                    device.clone(),
                    Applied {
                        value: reported,
                        delivery: Delivery::Confirmed,
                        at: now,
                    },
                );
                return;
            }
        };
        warn!(
            device = %device,
            expected = %expected,
            reported = %reported,
            "Device left its assigned mode"
        );
        self.modes.remove(device);
    }

    fn observe_pool(&mut self, snapshot: &TelemetrySnapshot, pools: &[Pool]) {
        let Some(reported) = snapshot.extras.pool_url.as_deref() else {
            return;
        };
        let Some(applied) = self.pools.get_mut(&snapshot.device_id) else {
            return;
        };
        let Some(pool) = pools.iter().find(|p| p.id == applied.value) else {
            return;
        };

        match (applied.delivery, same_endpoint(&pool.url, reported)) {
            (Delivery::Sent, true) => {
                debug!(device = %snapshot.device_id, pool = %pool.id, "Pool switch confirmed by telemetry");
                applied.delivery = Delivery::Confirmed;
            }
            (Delivery::Confirmed, false) => {
                warn!(
                    device = %snapshot.device_id,
                    expected = %pool.url,
                    reported,
                    "Device left its assigned pool"
                );
                self.pools.remove(&snapshot.device_id);
            }
            _ => {}
        }
    }

    /// Forget everything about `device`. Used when it comes back online,
    /// since it may have rebooted into its stored configuration.
    pub fn forget(&mut self, device: &DeviceId) {
        self.pools.remove(device);
        self.modes.remove(device);
    }
}

/// Compare stratum URLs by host and port, ignoring scheme and case.
pub fn same_endpoint(a: &str, b: &str) -> bool {
    fn normalize(url: &str) -> String {
        let url = url.trim();
        let rest = url.split_once("://").map_or(url, |(_, rest)| rest);
        rest.trim_end_matches('/').to_ascii_lowercase()
    }
    normalize(a) == normalize(b)
}

#[cfg(test)]
mod tests {
    use time::OffsetDateTime;

    use super::*;
    use crate::device::{AvalonMode, BitaxeMode, Coin};

    const RESEND: Duration = Duration::from_secs(120);

    fn pool(id: &str, url: &str) -> Pool {
        Pool {
            id: PoolId::new(id),
            name: id.to_owned(),
            url: url.to_owned(),
            user: "worker".to_owned(),
            password: "x".to_owned(),
            coin: Coin::ticker("BTC"),
        }
    }

    fn reporting(device: &DeviceId, url: &str) -> TelemetrySnapshot {
        let mut snapshot = TelemetrySnapshot::new(device.clone(), OffsetDateTime::UNIX_EPOCH);
        snapshot.extras.pool_url = Some(url.to_owned());
        snapshot
    }

    #[test]
    fn endpoints_compare_without_scheme() {
        assert!(same_endpoint("stratum+tcp://Pool.example:3333", "pool.example:3333/"));
        assert!(!same_endpoint("stratum+tcp://pool.example:3333", "stratum+tcp://pool.example:3334"));
    }

    #[tokio::test(start_paused = true)]
    async fn sent_pool_expires_after_resend_window() {
        let mut state = AppliedState::default();
        let dev = DeviceId::new("nm-1");
        let ck = PoolId::new("ck");

        state.record_pool(dev.clone(), ck.clone(), Delivery::Sent, Instant::now());
        assert!(state.has_pool(&dev, &ck, Instant::now(), RESEND));

        tokio::time::advance(RESEND).await;
        assert!(!state.has_pool(&dev, &ck, Instant::now(), RESEND));
    }

    #[tokio::test(start_paused = true)]
    async fn telemetry_confirms_sent_pool() {
        let mut state = AppliedState::default();
        let dev = DeviceId::new("nm-1");
        let pools = [pool("ck", "stratum+tcp://solo.ckpool.org:3333")];

        state.record_pool(dev.clone(), PoolId::new("ck"), Delivery::Sent, Instant::now());
        state.observe(&reporting(&dev, "solo.ckpool.org:3333"), &pools, Instant::now(), RESEND);
        assert_eq!(state.pool(&dev).unwrap().delivery, Delivery::Confirmed);

        tokio::time::advance(RESEND * 10).await;
        assert!(state.has_pool(&dev, &PoolId::new("ck"), Instant::now(), RESEND));
    }

    #[tokio::test(start_paused = true)]
    async fn drift_forgets_confirmed_pool() {
        let mut state = AppliedState::default();
        let dev = DeviceId::new("ax-1");
        let pools = [pool("ck", "stratum+tcp://solo.ckpool.org:3333")];

        state.record_pool(dev.clone(), PoolId::new("ck"), Delivery::Confirmed, Instant::now());
        state.observe(&reporting(&dev, "stratum+tcp://other.pool:4444"), &pools, Instant::now(), RESEND);
        assert!(state.pool(&dev).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn different_mode_is_not_covered() {
        let mut state = AppliedState::default();
        let dev = DeviceId::new("ax-1");
        state.record_mode(dev.clone(), Mode::Bitaxe(BitaxeMode::Eco), Instant::now());

        assert!(state.has_mode(&dev, Mode::Bitaxe(BitaxeMode::Eco), Instant::now(), RESEND));
        assert!(!state.has_mode(&dev, Mode::Bitaxe(BitaxeMode::Oc), Instant::now(), RESEND));

        state.forget(&dev);
        assert!(state.mode(&dev).is_none());
    }

    fn running(device: &DeviceId, mode: Mode) -> TelemetrySnapshot {
        let mut snapshot = TelemetrySnapshot::new(device.clone(), OffsetDateTime::UNIX_EPOCH);
        snapshot.extras.mode = Some(mode);
        snapshot
    }

    #[tokio::test(start_paused = true)]
    async fn reported_mode_is_adopted() {
        let mut state = AppliedState::default();
        let dev = DeviceId::new("av-1");
        let mid = Mode::Avalon(AvalonMode::Mid);

        state.observe(&running(&dev, mid), &[], Instant::now(), RESEND);
        assert!(state.has_mode(&dev, mid, Instant::now(), RESEND));
        assert!(!state.has_mode(&dev, Mode::Avalon(AvalonMode::High), Instant::now(), RESEND));
    }

    #[tokio::test(start_paused = true)]
    async fn mode_drift_is_forgotten_after_settling() {
        let mut state = AppliedState::default();
        let dev = DeviceId::new("ax-1");
        let eco = Mode::Bitaxe(BitaxeMode::Eco);
        let oc = Mode::Bitaxe(BitaxeMode::Oc);
        state.record_mode(dev.clone(), eco, Instant::now());

        state.observe(&running(&dev, oc), &[], Instant::now(), RESEND);
        assert!(state.has_mode(&dev, eco, Instant::now(), RESEND));

        tokio::time::advance(RESEND).await;
        state.observe(&running(&dev, oc), &[], Instant::now(), RESEND);
        assert!(state.mode(&dev).is_none());
    }
}

//! Controller settings and the fleet definition.
//!
//! [`ControllerConfig`] holds process tuning knobs with defaults that can
//! be overridden from `HASHFLEET_*` environment variables.
//! [`FleetConfig`] is the managed data (devices, pools, bands, rules); it
//! is loaded from JSON and validated as a whole before anything uses it.

use std::collections::HashSet;
use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::adapter::nmminer;
use crate::automation::{AutomationRule, Trigger};
use crate::device::{Coin, Device, DeviceId, Pool, PoolId};
use crate::dispatch::RetryPolicy;
use crate::error::Result;
use crate::strategy::{BandTable, ConfigError};

#[derive(Debug, Clone, PartialEq)]
pub struct ControllerConfig {
    pub poll_period: Duration,
    /// Global cap on polls in flight.
    pub max_concurrent_polls: usize,
    /// Budget for one `fetch_telemetry` call.
    pub poll_timeout: Duration,
    /// Consecutive failures before a device is offline.
    pub offline_after: u32,
    /// Snapshots older than this many poll periods are stale.
    pub stale_after_polls: u32,
    pub api_addr: SocketAddr,
    pub udp_telemetry_port: u16,
    /// Where family-wide UDP pool pushes go. `None` is the limited
    /// broadcast address; a subnet broadcast such as `192.168.1.255`
    /// keeps them on one segment.
    pub udp_broadcast_addr: Option<IpAddr>,
    pub retry: RetryPolicy,
    /// Budget for one device write attempt.
    pub write_timeout: Duration,
    /// How long an unacknowledged write suppresses an identical one.
    pub resend_after: Duration,
    /// Minimum spacing of restarts of the same device.
    pub restart_cooldown: Duration,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            poll_period: Duration::from_secs(30),
            max_concurrent_polls: 8,
            poll_timeout: Duration::from_secs(10),
            offline_after: 3,
            stale_after_polls: 3,
            api_addr: SocketAddr::from(([127, 0, 0, 1], 7790)),
            udp_telemetry_port: nmminer::TELEMETRY_PORT,
            udp_broadcast_addr: None,
            retry: RetryPolicy::default(),
            write_timeout: Duration::from_secs(10),
            resend_after: Duration::from_secs(5 * 60),
            restart_cooldown: Duration::from_secs(30 * 60),
        }
    }
}

impl ControllerConfig {
    pub fn stale_after(&self) -> Duration {
        self.poll_period * self.stale_after_polls.max(1)
    }

    /// Defaults overridden by `HASHFLEET_*` environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Like [`from_env`](Self::from_env) with an arbitrary variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();

        if let Some(secs) = parse::<u64>(&lookup, "HASHFLEET_POLL_SECS")? {
            config.poll_period = Duration::from_secs(secs.max(1));
        }
        if let Some(n) = parse::<usize>(&lookup, "HASHFLEET_MAX_CONCURRENT_POLLS")? {
            config.max_concurrent_polls = n.max(1);
        }
        if let Some(secs) = parse::<u64>(&lookup, "HASHFLEET_POLL_TIMEOUT_SECS")? {
            config.poll_timeout = Duration::from_secs(secs.max(1));
        }
        if let Some(n) = parse(&lookup, "HASHFLEET_OFFLINE_AFTER")? {
            config.offline_after = n;
        }
        if let Some(n) = parse(&lookup, "HASHFLEET_STALE_AFTER_POLLS")? {
            config.stale_after_polls = n;
        }
        if let Some(addr) = parse(&lookup, "HASHFLEET_API_ADDR")? {
            config.api_addr = addr;
        }
        if let Some(port) = parse(&lookup, "HASHFLEET_UDP_PORT")? {
            config.udp_telemetry_port = port;
        }
        if let Some(addr) = parse(&lookup, "HASHFLEET_UDP_BROADCAST")? {
            config.udp_broadcast_addr = Some(addr);
        }
        if let Some(n) = parse(&lookup, "HASHFLEET_RETRY_ATTEMPTS")? {
            config.retry.max_attempts = n;
        }
        if let Some(secs) = parse::<u64>(&lookup, "HASHFLEET_RESEND_SECS")? {
            config.resend_after = Duration::from_secs(secs);
        }

        Ok(config)
    }
}

fn parse<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| ConfigError::Invalid(format!("{key}={raw}: {e}")).into()),
    }
}

/// The managed fleet: everything the controller acts on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FleetConfig {
    #[serde(default)]
    pub devices: Vec<Device>,
    #[serde(default)]
    pub pools: Vec<Pool>,
    pub bands: BandTable,
    #[serde(default)]
    pub rules: Vec<AutomationRule>,
}

impl FleetConfig {
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self> {
        Self::from_json(&std::fs::read_to_string(path)?)
    }

    /// Cross-reference checks the individual types cannot make.
    ///
    /// The band table validates itself on construction; this checks ids
    /// are unique and that every pool a band or rule needs exists.
    pub fn validate(&self) -> std::result::Result<(), ConfigError> {
        unique(self.devices.iter().map(|d| d.id.as_str()), "device")?;
        unique(self.pools.iter().map(|p| p.id.to_string()), "pool")?;
        unique(self.rules.iter().map(|r| r.id.as_str()), "rule")?;

        for band in self.bands.iter() {
            if !band.coin.is_off() && self.pool_for_coin(&band.coin).is_none() {
                return Err(ConfigError::Invalid(format!(
                    "band {} mines {} but no pool serves it",
                    band.index, band.coin
                )));
            }
        }

        for rule in &self.rules {
            if let Some(pool) = rule.action.pool() {
                if self.pool(pool).is_none() {
                    return Err(ConfigError::Invalid(format!(
                        "rule {} switches to unknown pool {pool}",
                        rule.id
                    )));
                }
            }
            if let Trigger::TimeWindow(window) = &rule.trigger {
                if window.offset().is_none() {
                    return Err(ConfigError::Invalid(format!(
                        "rule {} has out-of-range UTC offset {} minutes",
                        rule.id, window.utc_offset_minutes
                    )));
                }
            }
        }

        Ok(())
    }

    pub fn device(&self, id: &DeviceId) -> Option<&Device> {
        self.devices.iter().find(|d| &d.id == id)
    }

    pub fn pool(&self, id: &PoolId) -> Option<&Pool> {
        self.pools.iter().find(|p| &p.id == id)
    }

    /// First configured pool for `coin`.
    pub fn pool_for_coin(&self, coin: &Coin) -> Option<&Pool> {
        self.pools.iter().find(|p| &p.coin == coin)
    }

    pub fn enabled_devices(&self) -> impl Iterator<Item = &Device> {
        self.devices.iter().filter(|d| d.enabled)
    }
}

fn unique<S: AsRef<str>>(ids: impl Iterator<Item = S>, what: &str) -> std::result::Result<(), ConfigError> {
    let mut seen = HashSet::new();
    for id in ids {
        if !seen.insert(id.as_ref().to_owned()) {
            return Err(ConfigError::Invalid(format!("duplicate {what} id {}", id.as_ref())));
        }
    }
    Ok(())
}

//! API data transfer objects.
//!
//! These types define the API contract shared between the server and
//! clients. Timestamps are RFC 3339 strings; hashrate is in GH/s.

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// Whole-fleet summary.
#[derive(Clone, Debug, Default, Deserialize, Serialize, ToSchema)]
pub struct FleetState {
    pub uptime_secs: u64,
    pub strategy: StrategyView,
    pub devices: Vec<DeviceState>,
    /// Summed over online devices.
    pub hashrate_ghs: f64,
    pub power_w: f64,
    pub last_cycle: Option<CycleState>,
}

/// One device with its latest telemetry.
#[derive(Clone, Debug, Default, Deserialize, Serialize, ToSchema)]
pub struct DeviceState {
    pub id: String,
    pub name: String,
    pub family: String,
    pub address: String,
    pub enabled: bool,
    /// `unknown`, `online`, `stale` or `offline`.
    pub status: String,
    pub consecutive_failures: u32,
    pub last_error: Option<String>,
    pub captured_at: Option<String>,
    pub hashrate_ghs: Option<f64>,
    pub temperature_c: Option<f32>,
    pub power_w: Option<f32>,
    pub shares_accepted: u64,
    pub shares_rejected: u64,
    pub pool_url: Option<String>,
    pub frequency_mhz: Option<f32>,
    pub firmware: Option<String>,
}

/// Active band and override.
#[derive(Clone, Debug, Default, Deserialize, Serialize, ToSchema)]
pub struct StrategyView {
    /// Band index as a string, or `disabled`.
    pub active: String,
    #[serde(rename = "override")]
    pub override_mode: String,
    pub last_transition: Option<String>,
    pub reason: Option<String>,
    pub bands: Vec<BandState>,
}

#[derive(Clone, Debug, Deserialize, Serialize, ToSchema)]
pub struct BandState {
    pub index: u32,
    /// Exclusive; null on the cheapest band.
    pub lower: Option<f64>,
    /// Inclusive; null on the most expensive band.
    pub upper: Option<f64>,
    pub coin: String,
    pub avalon_mode: Option<String>,
    pub bitaxe_mode: Option<String>,
    pub active: bool,
}

#[derive(Clone, Debug, Deserialize, Serialize, ToSchema)]
pub struct TransitionState {
    pub from: String,
    pub to: String,
    pub reason: String,
    pub at: String,
    pub price: Option<f64>,
}

/// One rule's result from the last cycle.
#[derive(Clone, Debug, Deserialize, Serialize, ToSchema)]
pub struct RuleState {
    pub id: String,
    pub name: String,
    pub priority: u32,
    pub enabled: bool,
    pub matched: bool,
    pub detail: Option<String>,
    pub actions: usize,
}

#[derive(Clone, Debug, Deserialize, Serialize, ToSchema)]
pub struct AuditState {
    pub at: String,
    pub device: Option<String>,
    pub action: String,
    pub origin: String,
    pub old: Option<String>,
    pub new: Option<String>,
    pub attempts: u32,
    /// `applied`, `sent`, `skipped: <reason>` or `failed: <reason>`.
    pub outcome: String,
}

#[derive(Clone, Debug, Deserialize, Serialize, ToSchema)]
pub struct CycleState {
    pub at: String,
    pub polled: usize,
    pub skipped: usize,
    pub failed: usize,
    pub price: Option<f64>,
    pub next_price: Option<f64>,
    pub actions: usize,
    pub failed_actions: usize,
}

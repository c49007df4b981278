//! Domain types to API DTOs.

use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

use crate::api_client::types::{
    AuditState, BandState, CycleState, DeviceState, FleetState, RuleState, StrategyView,
    TransitionState,
};
use crate::automation::RuleEvaluation;
use crate::controller::{ControllerView, CycleSummary};
use crate::device::Device;
use crate::dispatch::{AuditEntry, Outcome};
use crate::strategy::{ActiveBand, Band, BandTransition, StrategyState};
use crate::telemetry::DeviceTelemetry;
use crate::types::HashUnit;

fn rfc3339(at: OffsetDateTime) -> String {
    at.format(&Rfc3339).unwrap_or_else(|_| at.to_string())
}

fn active(band: ActiveBand) -> String {
    match band {
        ActiveBand::Band(i) => i.to_string(),
        ActiveBand::Disabled => "disabled".to_owned(),
    }
}

pub(super) fn device_state(device: &Device, telemetry: &DeviceTelemetry) -> DeviceState {
    let snapshot = telemetry.snapshot.as_ref();
    DeviceState {
        id: device.id.to_string(),
        name: device.label().to_owned(),
        family: device.family.to_string(),
        address: device.address.clone(),
        enabled: device.enabled,
        status: telemetry.status.to_string(),
        consecutive_failures: telemetry.consecutive_failures,
        last_error: telemetry.last_error.clone(),
        captured_at: snapshot.map(|s| rfc3339(s.captured_at)),
        hashrate_ghs: snapshot
            .and_then(|s| s.hashrate)
            .map(|h| h.value_in(HashUnit::Giga)),
        temperature_c: snapshot.and_then(|s| s.temperature_c),
        power_w: snapshot.and_then(|s| s.power_w),
        shares_accepted: snapshot.map_or(0, |s| s.shares_accepted),
        shares_rejected: snapshot.map_or(0, |s| s.shares_rejected),
        pool_url: snapshot.and_then(|s| s.extras.pool_url.clone()),
        frequency_mhz: snapshot.and_then(|s| s.extras.frequency_mhz),
        firmware: snapshot.and_then(|s| s.extras.firmware.clone()),
    }
}

fn band_state(band: &Band, current: ActiveBand) -> BandState {
    BandState {
        index: band.index,
        lower: band.lower,
        upper: band.upper,
        coin: band.coin.to_string(),
        avalon_mode: band.modes.avalon.map(|m| m.to_string()),
        bitaxe_mode: band.modes.bitaxe.map(|m| m.to_string()),
        active: current == ActiveBand::Band(band.index),
    }
}

pub(super) fn strategy_view(state: &StrategyState, bands: &[Band]) -> StrategyView {
    StrategyView {
        active: active(state.active),
        override_mode: state.override_mode.to_string(),
        last_transition: state.last_transition.map(rfc3339),
        reason: state.reason.map(|r| r.to_string()),
        bands: bands.iter().map(|b| band_state(b, state.active)).collect(),
    }
}

pub(super) fn fleet_state(view: &ControllerView) -> FleetState {
    let devices: Vec<DeviceState> = view
        .devices
        .iter()
        .map(|(device, telemetry)| device_state(device, telemetry))
        .collect();
    let online = view.devices.iter().filter(|(_, t)| t.is_online());

    FleetState {
        uptime_secs: view.uptime.as_secs(),
        strategy: strategy_view(&view.strategy, &view.bands),
        hashrate_ghs: online
            .clone()
            .filter_map(|(_, t)| t.snapshot.as_ref()?.hashrate)
            .map(|h| h.value_in(HashUnit::Giga))
            .sum(),
        power_w: online
            .filter_map(|(_, t)| t.snapshot.as_ref()?.power_w)
            .map(f64::from)
            .sum(),
        devices,
        last_cycle: view.last_cycle.as_ref().map(cycle_state),
    }
}

fn cycle_state(summary: &CycleSummary) -> CycleState {
    CycleState {
        at: rfc3339(summary.at),
        polled: summary.polled,
        skipped: summary.skipped,
        failed: summary.failed,
        price: summary.price,
        next_price: summary.next_price,
        actions: summary.actions,
        failed_actions: summary.failed_actions,
    }
}

impl From<&BandTransition> for TransitionState {
    fn from(t: &BandTransition) -> Self {
        Self {
            from: active(t.from),
            to: active(t.to),
            reason: t.reason.to_string(),
            at: rfc3339(t.at),
            price: t.price,
        }
    }
}

impl From<&RuleEvaluation> for RuleState {
    fn from(r: &RuleEvaluation) -> Self {
        Self {
            id: r.rule.to_string(),
            name: r.name.clone(),
            priority: r.priority,
            enabled: r.enabled,
            matched: r.matched,
            detail: r.detail.clone(),
            actions: r.actions,
        }
    }
}

impl From<&AuditEntry> for AuditState {
    fn from(e: &AuditEntry) -> Self {
        let outcome = match &e.outcome {
            Outcome::Applied => "applied".to_owned(),
            Outcome::Sent => "sent".to_owned(),
            Outcome::Skipped { reason } => format!("skipped: {reason}"),
            Outcome::Failed(failure) => format!("failed: {failure}"),
        };
        Self {
            at: rfc3339(e.at),
            device: e.device.as_ref().map(|d| d.to_string()),
            action: e.action.to_string(),
            origin: e.origin.to_string(),
            old: e.old.clone(),
            new: e.new.clone(),
            attempts: e.attempts,
            outcome,
        }
    }
}

use serde::{Deserialize, Serialize};
use strum::Display;
use time::{OffsetDateTime, Time, UtcOffset};

use super::RuleId;
use super::engine::RuleContext;
use crate::device::{Capabilities, Device, DeviceId, DeviceSelector, Mode, PoolId};
use crate::dispatch::{Action, AlertKind};
use crate::notify::Severity;
use crate::price::Price;
use crate::telemetry::{DeviceStatus, TelemetrySnapshot};
use crate::types::HashUnit;

time::serde::format_description!(hh_mm, Time, "[hour]:[minute]");

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AutomationRule {
    pub id: RuleId,
    #[serde(default)]
    pub name: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Lower numbers evaluate first and win conflicts.
    pub priority: u32,
    pub trigger: Trigger,
    pub action: RuleAction,
}

fn default_enabled() -> bool {
    true
}

/// A daily window `[start, end)` in a fixed UTC offset. `start > end`
/// wraps midnight; `start == end` is empty.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DailyWindow {
    #[serde(with = "hh_mm")]
    pub start: Time,
    #[serde(with = "hh_mm")]
    pub end: Time,
    #[serde(default)]
    pub utc_offset_minutes: i16,
}

impl DailyWindow {
    pub fn offset(&self) -> Option<UtcOffset> {
        UtcOffset::from_whole_seconds(i32::from(self.utc_offset_minutes) * 60).ok()
    }

    pub fn contains(&self, at: OffsetDateTime) -> bool {
        let local = at.to_offset(self.offset().unwrap_or(UtcOffset::UTC)).time();
        if self.start <= self.end {
            self.start <= local && local < self.end
        } else {
            local >= self.start || local < self.end
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum HealthMetric {
    /// Degrees Celsius.
    Temperature,
    /// GH/s.
    Hashrate,
    /// Watts.
    Power,
}

impl HealthMetric {
    pub fn read(self, snapshot: &TelemetrySnapshot) -> Option<f64> {
        match self {
            HealthMetric::Temperature => snapshot.temperature_c.map(f64::from),
            HealthMetric::Hashrate => snapshot.hashrate.map(|h| h.value_in(HashUnit::Giga)),
            HealthMetric::Power => snapshot.power_w.map(f64::from),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Trigger {
    PriceAbove {
        threshold: Price,
    },
    PriceBelow {
        threshold: Price,
    },
    TimeWindow(DailyWindow),
    /// Some selected device reads outside `[min, max]`.
    DeviceHealth {
        selector: DeviceSelector,
        metric: HealthMetric,
        #[serde(default)]
        min: Option<f64>,
        #[serde(default)]
        max: Option<f64>,
        /// Count offline devices as unhealthy.
        #[serde(default)]
        include_offline: bool,
    },
}

impl Trigger {
    /// `Some(detail)` when the trigger fires.
    pub fn fires(&self, ctx: &RuleContext<'_>) -> Option<String> {
        match self {
            Trigger::PriceAbove { threshold } => ctx
                .price
                .filter(|p| p > threshold)
                .map(|p| format!("price {p}p above {threshold}p")),
            Trigger::PriceBelow { threshold } => ctx
                .price
                .filter(|p| p < threshold)
                .map(|p| format!("price {p}p below {threshold}p")),
            Trigger::TimeWindow(window) => window
                .contains(ctx.now)
                .then(|| format!("inside {}-{}", window.start, window.end)),
            Trigger::DeviceHealth {
                selector,
                metric,
                min,
                max,
                include_offline,
            } => {
                let unhealthy: Vec<String> = ctx
                    .devices
                    .iter()
                    .filter(|d| d.enabled && selector.matches(d))
                    .filter_map(|d| {
                        let telemetry = ctx.fleet.get(&d.id)?;
                        if telemetry.status == DeviceStatus::Offline {
                            return include_offline.then(|| format!("{} offline", d.id));
                        }
                        let value = metric.read(telemetry.snapshot.as_ref()?)?;
                        if min.is_some_and(|m| value < m) {
                            Some(format!("{} {metric} {value:.1} < {}", d.id, min.unwrap_or_default()))
                        } else if max.is_some_and(|m| value > m) {
                            Some(format!("{} {metric} {value:.1} > {}", d.id, max.unwrap_or_default()))
                        } else {
                            None
                        }
                    })
                    .collect();
                (!unhealthy.is_empty()).then(|| unhealthy.join(", "))
            }
        }
    }
}

fn default_channel() -> String {
    "default".to_owned()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RuleAction {
    ApplyMode {
        selector: DeviceSelector,
        mode: Mode,
    },
    SwitchPool {
        selector: DeviceSelector,
        pool: PoolId,
    },
    Restart {
        selector: DeviceSelector,
    },
    SendAlert {
        #[serde(default = "default_alert_kind")]
        kind: AlertKind,
        severity: Severity,
        message: String,
        #[serde(default = "default_channel")]
        channel: String,
    },
    LogEvent {
        message: String,
    },
}

fn default_alert_kind() -> AlertKind {
    AlertKind::Generic
}

impl RuleAction {
    /// Concrete dispatcher actions. A selector naming one device targets it
    /// even when it lacks the capability, so the failure is audited; broad
    /// selectors quietly skip devices that cannot comply.
    pub fn expand(&self, devices: &[Device], detail: &str) -> Vec<Action> {
        match self {
            RuleAction::ApplyMode { selector, mode } => {
                targets(selector, devices, |d| {
                    d.family == mode.family() && d.supports(Capabilities::TUNING)
                })
                .map(|device| Action::SetMode {
                    device,
                    mode: *mode,
                })
                .collect()
            }
            RuleAction::SwitchPool { selector, pool } => {
                targets(selector, devices, |d| d.supports(Capabilities::POOL_SWITCH))
                    .map(|device| Action::SwitchPool {
                        device,
                        pool: pool.clone(),
                    })
                    .collect()
            }
            RuleAction::Restart { selector } => {
                targets(selector, devices, |d| d.supports(Capabilities::RESTART))
                    .map(|device| Action::Restart { device })
                    .collect()
            }
            RuleAction::SendAlert {
                kind,
                severity,
                message,
                channel,
            } => vec![Action::Alert {
                kind: *kind,
                severity: *severity,
                channel: channel.clone(),
                message: format!("{message} ({detail})"),
            }],
            RuleAction::LogEvent { message } => vec![Action::Log {
                message: format!("{message} ({detail})"),
            }],
        }
    }

    pub fn pool(&self) -> Option<&PoolId> {
        match self {
            RuleAction::SwitchPool { pool, .. } => Some(pool),
            _ => None,
        }
    }
}

fn targets<'a>(
    selector: &'a DeviceSelector,
    devices: &'a [Device],
    able: impl Fn(&Device) -> bool + 'a,
) -> impl Iterator<Item = DeviceId> + 'a {
    devices
        .iter()
        .filter(move |d| d.enabled && selector.matches(d))
        .filter(move |d| matches!(selector, DeviceSelector::Device(_)) || able(d))
        .map(|d| d.id.clone())
}

#[cfg(test)]
mod tests {
    use time::macros::{datetime, time};

    use super::*;
    use crate::device::{BitaxeMode, DeviceFamily};
    use crate::telemetry::{DeviceTelemetry, FleetView};

    fn window(start: Time, end: Time) -> DailyWindow {
        DailyWindow {
            start,
            end,
            utc_offset_minutes: 0,
        }
    }

    #[test]
    fn window_wraps_midnight() {
        let night = window(time!(22:00), time!(06:00));
        assert!(night.contains(datetime!(2025-01-10 23:30 UTC)));
        assert!(night.contains(datetime!(2025-01-11 05:59 UTC)));
        assert!(!night.contains(datetime!(2025-01-11 06:00 UTC)));
        assert!(!night.contains(datetime!(2025-01-11 12:00 UTC)));
    }

    #[test]
    fn window_respects_offset() {
        let evening = DailyWindow {
            utc_offset_minutes: 60,
            ..window(time!(18:00), time!(20:00))
        };
        // 17:30 UTC is 18:30 at +01:00.
        assert!(evening.contains(datetime!(2025-06-01 17:30 UTC)));
        assert!(!evening.contains(datetime!(2025-06-01 19:30 UTC)));
    }

    #[test]
    fn empty_window_never_fires() {
        let never = window(time!(08:00), time!(08:00));
        assert!(!never.contains(datetime!(2025-01-10 08:00 UTC)));
    }

    #[test]
    fn window_parses_from_hh_mm() {
        let trigger: Trigger =
            serde_json::from_str(r#"{"type": "time_window", "start": "22:00", "end": "06:30"}"#).unwrap();
        assert_eq!(trigger, Trigger::TimeWindow(window(time!(22:00), time!(06:30))));
    }

    fn fleet_with(device: &str, status: DeviceStatus, temperature: f32) -> FleetView {
        let mut snapshot = TelemetrySnapshot::new(DeviceId::new(device), datetime!(2025-01-10 12:00 UTC));
        snapshot.temperature_c = Some(temperature);
        FleetView::from([(
            DeviceId::new(device),
            DeviceTelemetry {
                status,
                snapshot: Some(snapshot),
                consecutive_failures: 0,
                last_error: None,
            },
        )])
    }

    fn hot(include_offline: bool) -> Trigger {
        Trigger::DeviceHealth {
            selector: DeviceSelector::All,
            metric: HealthMetric::Temperature,
            min: None,
            max: Some(70.0),
            include_offline,
        }
    }

    #[test]
    fn health_fires_above_max() {
        let devices = [Device::new("ax-1", DeviceFamily::Bitaxe, "10.0.0.2")];
        let fleet = fleet_with("ax-1", DeviceStatus::Online, 78.0);
        let ctx = RuleContext {
            now: datetime!(2025-01-10 12:00 UTC),
            price: None,
            fleet: &fleet,
            devices: &devices,
        };
        assert_eq!(hot(false).fires(&ctx).as_deref(), Some("ax-1 temperature 78.0 > 70"));
    }

    #[test]
    fn offline_counts_only_when_asked() {
        let devices = [Device::new("ax-1", DeviceFamily::Bitaxe, "10.0.0.2")];
        let fleet = fleet_with("ax-1", DeviceStatus::Offline, 40.0);
        let ctx = RuleContext {
            now: datetime!(2025-01-10 12:00 UTC),
            price: None,
            fleet: &fleet,
            devices: &devices,
        };
        assert_eq!(hot(false).fires(&ctx), None);
        assert_eq!(hot(true).fires(&ctx).as_deref(), Some("ax-1 offline"));
    }

    #[test]
    fn apply_mode_targets_matching_family_only() {
        let devices = [
            Device::new("ax-1", DeviceFamily::Bitaxe, "10.0.0.2"),
            Device::new("av-1", DeviceFamily::Avalon, "10.0.0.3"),
            Device::new("nm-1", DeviceFamily::NmMiner, "10.0.0.4"),
        ];
        let action = RuleAction::ApplyMode {
            selector: DeviceSelector::All,
            mode: Mode::Bitaxe(BitaxeMode::Eco),
        };
        assert_eq!(
            action.expand(&devices, ""),
            vec![Action::SetMode {
                device: DeviceId::new("ax-1"),
                mode: Mode::Bitaxe(BitaxeMode::Eco)
            }]
        );
    }

    #[test]
    fn named_device_is_targeted_without_capability() {
        let devices = [Device::new("nm-1", DeviceFamily::NmMiner, "10.0.0.4")];
        let action = RuleAction::Restart {
            selector: DeviceSelector::Device(DeviceId::new("nm-1")),
        };
        assert_eq!(action.expand(&devices, "").len(), 1);

        let action = RuleAction::Restart {
            selector: DeviceSelector::All,
        };
        assert!(action.expand(&devices, "").is_empty());
    }
}

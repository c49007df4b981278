//! The single choke point for side effects.
//!
//! Both engines express what they want as [`Action`]s tagged with an
//! [`Origin`]. The [`Dispatcher`] decides whether the action is needed at
//! all, carries it out with bounded retries and records an [`AuditEntry`]
//! for every attempt.

mod applied;
pub mod backoff;
mod dispatcher;
pub mod rate_limit;

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use strum::Display;
use thiserror::Error;
use time::OffsetDateTime;

use crate::adapter::{AdapterError, ErrorKind};
use crate::automation::RuleId;
use crate::device::{DeviceId, Mode, PoolId};
use crate::notify::Severity;
use crate::strategy::ActiveBand;

pub use applied::{Applied, AppliedState};
pub use backoff::{ExponentialBackoff, RetryPolicy};
pub use dispatcher::{Dispatcher, DispatcherConfig};
pub use rate_limit::AlertLimiter;

/// Alert categories; each has its own rate limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum AlertKind {
    Generic,
    Thermal,
    Hashrate,
    Offline,
    Price,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Action {
    SetMode {
        device: DeviceId,
        mode: Mode,
    },
    SwitchPool {
        device: DeviceId,
        pool: PoolId,
    },
    Restart {
        device: DeviceId,
    },
    Alert {
        kind: AlertKind,
        severity: Severity,
        channel: String,
        message: String,
    },
    Log {
        message: String,
    },
}

impl Action {
    pub fn kind(&self) -> ActionKind {
        match self {
            Action::SetMode { .. } => ActionKind::SetMode,
            Action::SwitchPool { .. } => ActionKind::SwitchPool,
            Action::Restart { .. } => ActionKind::Restart,
            Action::Alert { .. } => ActionKind::Alert,
            Action::Log { .. } => ActionKind::Log,
        }
    }

    pub fn device(&self) -> Option<&DeviceId> {
        match self {
            Action::SetMode { device, .. }
            | Action::SwitchPool { device, .. }
            | Action::Restart { device } => Some(device),
            Action::Alert { .. } | Action::Log { .. } => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ActionKind {
    SetMode,
    SwitchPool,
    Restart,
    Alert,
    Log,
}

/// Who asked for an action.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "origin", content = "id", rename_all = "snake_case")]
pub enum Origin {
    Band(ActiveBand),
    Rule(RuleId),
    System,
}

impl Origin {
    pub fn rule(&self) -> Option<&RuleId> {
        match self {
            Origin::Rule(id) => Some(id),
            _ => None,
        }
    }
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Origin::Band(band) => write!(f, "{band}"),
            Origin::Rule(id) => write!(f, "rule {id}"),
            Origin::System => f.write_str("system"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "error", rename_all = "snake_case")]
pub enum FailureKind {
    Adapter(ErrorKind),
    /// Device or pool not in the configuration.
    UnknownTarget,
    Notifier,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureKind::Adapter(kind) => write!(f, "{kind}"),
            FailureKind::UnknownTarget => f.write_str("unknown_target"),
            FailureKind::Notifier => f.write_str("notifier"),
        }
    }
}

/// An action that could not be carried out.
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
#[error("{kind}: {reason}")]
pub struct ActionFailure {
    pub kind: FailureKind,
    pub reason: String,
}

impl ActionFailure {
    pub fn unknown(what: impl fmt::Display) -> Self {
        Self {
            kind: FailureKind::UnknownTarget,
            reason: format!("unknown {what}"),
        }
    }
}

impl From<AdapterError> for ActionFailure {
    fn from(e: AdapterError) -> Self {
        Self {
            kind: FailureKind::Adapter(e.kind()),
            reason: e.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Outcome {
    /// The device acknowledged the change.
    Applied,
    /// Fire-and-forget write went out; confirmation pending.
    Sent,
    /// Nothing to do, or suppressed.
    Skipped { reason: String },
    Failed(ActionFailure),
}

impl Outcome {
    pub fn skipped(reason: impl Into<String>) -> Self {
        Outcome::Skipped {
            reason: reason.into(),
        }
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, Outcome::Failed(_))
    }
}

/// One line of the audit trail.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    #[serde(with = "time::serde::rfc3339")]
    pub at: OffsetDateTime,
    pub device: Option<DeviceId>,
    pub action: ActionKind,
    pub origin: Origin,
    pub old: Option<String>,
    pub new: Option<String>,
    pub attempts: u32,
    pub outcome: Outcome,
}

/// Keep only the last write of each kind per device, preserving order.
///
/// Band plans and rule actions for one cycle are concatenated in
/// application order; a later write to the same device and setting
/// replaces an earlier one instead of being applied on top of it.
pub fn coalesce(actions: Vec<(Action, Origin)>) -> Vec<(Action, Origin)> {
    let last: HashMap<(DeviceId, ActionKind), usize> = actions
        .iter()
        .enumerate()
        .filter_map(|(i, (action, _))| match action {
            Action::SetMode { device, .. } | Action::SwitchPool { device, .. } => {
                Some(((device.clone(), action.kind()), i))
            }
            _ => None,
        })
        .collect();

    actions
        .into_iter()
        .enumerate()
        .filter(|(i, (action, _))| match action {
            Action::SetMode { device, .. } | Action::SwitchPool { device, .. } => {
                last.get(&(device.clone(), action.kind())) == Some(i)
            }
            _ => true,
        })
        .map(|(_, entry)| entry)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::AvalonMode;

    fn set(device: &str, mode: AvalonMode, origin: Origin) -> (Action, Origin) {
        (
            Action::SetMode {
                device: DeviceId::new(device),
                mode: Mode::Avalon(mode),
            },
            origin,
        )
    }

    #[test]
    fn coalesce_keeps_last_write_per_device() {
        let band = Origin::Band(ActiveBand::Band(3));
        let rule = Origin::Rule(RuleId::new("cool"));
        let log = (
            Action::Log {
                message: "hello".into(),
            },
            rule.clone(),
        );

        let kept = coalesce(vec![
            set("av-1", AvalonMode::High, band.clone()),
            set("av-2", AvalonMode::High, band.clone()),
            log.clone(),
            set("av-1", AvalonMode::Low, rule.clone()),
        ]);

        assert_eq!(
            kept,
            vec![
                set("av-2", AvalonMode::High, band),
                log,
                set("av-1", AvalonMode::Low, rule),
            ]
        );
    }

    #[test]
    fn action_failure_from_adapter_error() {
        let failure = ActionFailure::from(AdapterError::Auth);
        assert_eq!(failure.kind, FailureKind::Adapter(ErrorKind::Auth));
        assert_eq!(failure.to_string(), "auth: authentication failed");
    }
}

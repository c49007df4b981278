//! Controller events for observers (API, logs, tests).

use serde::Serialize;
use tokio::sync::broadcast;

use crate::automation::RuleId;
use crate::device::DeviceId;
use crate::dispatch::{ActionFailure, ActionKind, AlertKind, Origin};
use crate::notify::Severity;
use crate::strategy::BandTransition;

const CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ControllerEvent {
    DeviceOffline {
        device: DeviceId,
        failures: u32,
        error: String,
    },
    DeviceOnline {
        device: DeviceId,
    },
    BandTransition(BandTransition),
    ActionFailed {
        device: Option<DeviceId>,
        action: ActionKind,
        origin: Origin,
        failure: ActionFailure,
    },
    AlertSent {
        kind: AlertKind,
        severity: Severity,
        rule: Option<RuleId>,
        message: String,
    },
    CycleCompleted {
        polled: usize,
        skipped: usize,
        failed: usize,
    },
}

/// Fan-out of [`ControllerEvent`]s. Slow subscribers lose the oldest
/// events; emitting never blocks.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<ControllerEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(CAPACITY);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ControllerEvent> {
        self.tx.subscribe()
    }

    pub fn emit(&self, event: ControllerEvent) {
        // No subscribers is fine.
        let _ = self.tx.send(event);
    }
}

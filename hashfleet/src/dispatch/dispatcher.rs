use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use strum::IntoEnumIterator;
use time::OffsetDateTime;
use tokio::time::Instant;

use super::applied::AppliedState;
use super::rate_limit::{AlertLimiter, Cooldowns, Verdict};
use super::{
    Action, ActionFailure, ActionKind, AlertKind, AuditEntry, FailureKind, Outcome, Origin,
    RetryPolicy,
};
use crate::adapter::{AdapterError, AdapterResult, AdapterSet, Delivery, DeviceAdapter};
use crate::config::{ControllerConfig, FleetConfig};
use crate::device::{Capabilities, Device, DeviceFamily, DeviceId, Mode, Pool, PoolId};
use crate::events::{ControllerEvent, EventBus};
use crate::notify::{Notifier, Severity};
use crate::persistence::Persistence;
use crate::telemetry::TelemetrySnapshot;
use crate::tracing::prelude::*;

/// Audit entries kept in memory for the API.
const RECENT_AUDIT: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DispatcherConfig {
    pub retry: RetryPolicy,
    pub write_timeout: Duration,
    pub resend_after: Duration,
    pub restart_cooldown: Duration,
    pub cooldowns: Cooldowns,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self::from(&ControllerConfig::default())
    }
}

impl From<&ControllerConfig> for DispatcherConfig {
    fn from(config: &ControllerConfig) -> Self {
        Self {
            retry: config.retry,
            write_timeout: config.write_timeout,
            resend_after: config.resend_after,
            restart_cooldown: config.restart_cooldown,
            cooldowns: Cooldowns::default(),
        }
    }
}

/// A device write, resolved against the fleet configuration.
#[derive(Debug, Clone, Copy)]
enum Write<'a> {
    Mode(Mode),
    Pool(&'a Pool),
    Restart,
}

impl Write<'_> {
    fn capability(&self) -> Capabilities {
        match self {
            Write::Mode(_) => Capabilities::TUNING,
            Write::Pool(_) => Capabilities::POOL_SWITCH,
            Write::Restart => Capabilities::RESTART,
        }
    }
}

/// Pool switches that cover every device of a family able to take a
/// broadcast, all to the same pool.
#[derive(Debug, Clone, PartialEq)]
struct BroadcastGroup {
    family: DeviceFamily,
    pool: PoolId,
    targets: Vec<(DeviceId, Origin)>,
}

/// Pull family-wide pool switches out of `actions`.
///
/// A family qualifies when it has at least two devices, all enabled and
/// able to switch pools, and every one of them is asked to switch to the
/// same pool in this batch.
fn broadcast_groups(
    fleet: &FleetConfig,
    mut actions: Vec<(Action, Origin)>,
) -> (Vec<BroadcastGroup>, Vec<(Action, Origin)>) {
    let mut groups = Vec::new();

    for family in DeviceFamily::iter() {
        if !family.capabilities().contains(Capabilities::POOL_BROADCAST) {
            continue;
        }
        let members: Vec<&Device> = fleet.devices.iter().filter(|d| d.family == family).collect();
        if members.len() < 2
            || !members
                .iter()
                .all(|d| d.enabled && d.supports(Capabilities::POOL_SWITCH))
        {
            continue;
        }

        let wanted: Vec<PoolId> = members
            .iter()
            .filter_map(|d| {
                actions.iter().find_map(|(action, _)| match action {
                    Action::SwitchPool { device, pool } if device == &d.id => Some(pool.clone()),
                    _ => None,
                })
            })
            .collect();
        let Some(pool) = wanted.first().cloned() else {
            continue;
        };
        if wanted.len() != members.len() || wanted.iter().any(|p| p != &pool) {
            continue;
        }

        let (taken, kept): (Vec<_>, Vec<_>) = actions.into_iter().partition(|(action, _)| {
            matches!(action, Action::SwitchPool { device, .. } if members.iter().any(|d| &d.id == device))
        });
        actions = kept;
        groups.push(BroadcastGroup {
            family,
            pool,
            targets: taken
                .into_iter()
                .filter_map(|(action, origin)| Some((action.device()?.clone(), origin)))
                .collect(),
        });
    }

    (groups, actions)
}

/// Applies [`Action`]s: skips what is already in place, retries transport
/// failures, rate-limits alerts and audits everything.
///
/// Called serially by the controller after each poll cycle; the internal
/// locks are only held between awaits.
pub struct Dispatcher {
    adapters: AdapterSet,
    notifier: Arc<dyn Notifier>,
    persistence: Arc<dyn Persistence>,
    events: EventBus,
    config: DispatcherConfig,
    applied: Mutex<AppliedState>,
    limiter: Mutex<AlertLimiter>,
    restarts: Mutex<HashMap<DeviceId, Instant>>,
    recent: Mutex<VecDeque<AuditEntry>>,
}

impl Dispatcher {
    pub fn new(
        adapters: AdapterSet,
        notifier: Arc<dyn Notifier>,
        persistence: Arc<dyn Persistence>,
        events: EventBus,
        config: DispatcherConfig,
    ) -> Self {
        Self {
            adapters,
            notifier,
            persistence,
            events,
            limiter: Mutex::new(AlertLimiter::new(config.cooldowns)),
            config,
            applied: Mutex::new(AppliedState::default()),
            restarts: Mutex::new(HashMap::new()),
            recent: Mutex::new(VecDeque::with_capacity(RECENT_AUDIT)),
        }
    }

    /// Apply actions in order. One failure never stops the rest.
    ///
    /// Pool switches that retarget a whole broadcast-capable family go out
    /// first as one family-wide write.
    pub async fn apply_all(
        &self,
        fleet: &FleetConfig,
        actions: Vec<(Action, Origin)>,
    ) -> Vec<Outcome> {
        let mut outcomes = Vec::with_capacity(actions.len());
        let (groups, actions) = broadcast_groups(fleet, actions);
        for group in groups {
            outcomes.extend(self.broadcast(fleet, group).await);
        }
        for (action, origin) in actions {
            outcomes.push(self.apply(fleet, action, origin).await);
        }
        outcomes
    }

    pub async fn apply(&self, fleet: &FleetConfig, action: Action, origin: Origin) -> Outcome {
        let kind = action.kind();
        let device = action.device().cloned();

        let unknown = |what: String, new: Option<String>| {
            (None::<String>, new, 0_u32, Outcome::Failed(ActionFailure::unknown(what)))
        };

        let (old, new, attempts, outcome) = match &action {
            Action::SetMode { device, mode } => match fleet.device(device) {
                Some(d) => self.write(d, Write::Mode(*mode)).await,
                None => unknown(format!("device {device}"), Some(mode.to_string())),
            },
            Action::SwitchPool { device, pool } => {
                match (fleet.device(device), fleet.pool(pool)) {
                    (Some(d), Some(p)) => self.write(d, Write::Pool(p)).await,
                    (None, _) => unknown(format!("device {device}"), Some(pool.to_string())),
                    (_, None) => unknown(format!("pool {pool}"), Some(pool.to_string())),
                }
            }
            Action::Restart { device } => match fleet.device(device) {
                Some(d) => self.write(d, Write::Restart).await,
                None => unknown(format!("device {device}"), None),
            },
            Action::Alert {
                kind,
                severity,
                channel,
                message,
            } => {
                let outcome = self
                    .alert(*kind, *severity, channel, message, origin.rule())
                    .await;
                let attempts = u32::from(!matches!(outcome, Outcome::Skipped { .. }));
                (None, Some(message.clone()), attempts, outcome)
            }
            Action::Log { message } => {
                info!(origin = %origin, "{message}");
                (None, Some(message.clone()), 1, Outcome::Applied)
            }
        };

        self.finish(AuditEntry {
            at: OffsetDateTime::now_utc(),
            device,
            action: kind,
            origin,
            old,
            new,
            attempts,
            outcome,
        })
        .await
    }

    /// Send one family-wide pool switch and account for it per device.
    /// Falls back to per-device writes when the family cannot broadcast.
    async fn broadcast(&self, fleet: &FleetConfig, group: BroadcastGroup) -> Vec<Outcome> {
        let result = match (fleet.pool(&group.pool), self.adapters.for_family(group.family)) {
            (Some(pool), Ok(adapter)) => {
                let adapter: &dyn DeviceAdapter = adapter.as_ref();
                let target = format!("all {}", group.family);
                Some(
                    self.with_retry(&target, move || async move { adapter.broadcast_pool(pool).await })
                        .await,
                )
            }
            _ => None,
        };

        let mut outcomes = Vec::with_capacity(group.targets.len());
        let (attempts, result) = match result {
            Some((_, Err(AdapterError::Unsupported(_)))) | None => {
                for (device, origin) in group.targets {
                    let action = Action::SwitchPool {
                        device,
                        pool: group.pool.clone(),
                    };
                    outcomes.push(self.apply(fleet, action, origin).await);
                }
                return outcomes;
            }
            Some(sent) => sent,
        };

        info!(
            family = %group.family,
            pool = %group.pool,
            devices = group.targets.len(),
            attempts,
            ok = result.is_ok(),
            "Pool broadcast"
        );
        let now = Instant::now();
        for (device, origin) in group.targets {
            let old = self.applied.lock().pool(&device).map(|a| a.value.to_string());
            let outcome = match &result {
                Ok(delivery) => {
                    self.applied
                        .lock()
                        .record_pool(device.clone(), group.pool.clone(), *delivery, now);
                    match delivery {
                        Delivery::Confirmed => Outcome::Applied,
                        Delivery::Sent => Outcome::Sent,
                    }
                }
                Err(e) => Outcome::Failed(e.clone().into()),
            };
            let entry = AuditEntry {
                at: OffsetDateTime::now_utc(),
                device: Some(device),
                action: ActionKind::SwitchPool,
                origin,
                old,
                new: Some(group.pool.to_string()),
                attempts,
                outcome,
            };
            outcomes.push(self.finish(entry).await);
        }
        outcomes
    }

    /// Log and publish a failure, then audit. Returns the outcome.
    async fn finish(&self, entry: AuditEntry) -> Outcome {
        if let Outcome::Failed(failure) = &entry.outcome {
            warn!(
                device = ?entry.device,
                action = %entry.action,
                origin = %entry.origin,
                attempts = entry.attempts,
                error = %failure,
                "Action failed"
            );
            self.events.emit(ControllerEvent::ActionFailed {
                device: entry.device.clone(),
                action: entry.action,
                origin: entry.origin.clone(),
                failure: failure.clone(),
            });
        }
        let outcome = entry.outcome.clone();
        self.audit(entry).await;
        outcome
    }

    /// True when `action` would be skipped as already in place.
    pub fn is_applied(&self, action: &Action) -> bool {
        let now = Instant::now();
        let applied = self.applied.lock();
        match action {
            Action::SetMode { device, mode } => {
                applied.has_mode(device, *mode, now, self.config.resend_after)
            }
            Action::SwitchPool { device, pool } => {
                applied.has_pool(device, pool, now, self.config.resend_after)
            }
            _ => false,
        }
    }

    /// Reconcile unacknowledged writes with fresh telemetry.
    pub fn observe(&self, snapshot: &TelemetrySnapshot, pools: &[Pool]) {
        self.applied
            .lock()
            .observe(snapshot, pools, Instant::now(), self.config.resend_after);
    }

    /// Forget what was written to `device`; the next plan rewrites it.
    pub fn forget(&self, device: &DeviceId) {
        self.applied.lock().forget(device);
    }

    /// Most recent audit entries, oldest first.
    pub fn recent_audit(&self) -> Vec<AuditEntry> {
        self.recent.lock().iter().cloned().collect()
    }

    async fn write(
        &self,
        device: &Device,
        write: Write<'_>,
    ) -> (Option<String>, Option<String>, u32, Outcome) {
        let now = Instant::now();
        let resend = self.config.resend_after;

        let (old, new, in_place) = {
            let applied = self.applied.lock();
            match write {
                Write::Mode(mode) => (
                    applied.mode(&device.id).map(|a| a.value.to_string()),
                    Some(mode.to_string()),
                    applied.has_mode(&device.id, mode, now, resend),
                ),
                Write::Pool(pool) => (
                    applied.pool(&device.id).map(|a| a.value.to_string()),
                    Some(pool.id.to_string()),
                    applied.has_pool(&device.id, &pool.id, now, resend),
                ),
                Write::Restart => (None, None, false),
            }
        };

        if !device.enabled {
            return (old, new, 0, Outcome::skipped("device disabled"));
        }
        if in_place {
            debug!(device = %device.id, new = ?new, "Already applied");
            return (old, new, 0, Outcome::skipped("already applied"));
        }

        let mismatched_mode = matches!(write, Write::Mode(mode) if mode.family() != device.family);
        if mismatched_mode || !device.supports(write.capability()) {
            let failure = ActionFailure::from(AdapterError::Unsupported(device.family));
            return (old, new, 0, Outcome::Failed(failure));
        }

        if let Write::Restart = write {
            let last = self.restarts.lock().get(&device.id).copied();
            if let Some(last) = last {
                if now.saturating_duration_since(last) < self.config.restart_cooldown {
                    return (old, new, 0, Outcome::skipped("restart cooldown"));
                }
            }
        }

        let adapter = match self.adapters.for_device(device) {
            Ok(adapter) => Arc::clone(adapter),
            Err(e) => return (old, new, 0, Outcome::Failed(e.into())),
        };

        let adapter: &dyn DeviceAdapter = adapter.as_ref();
        let (attempts, result) = self
            .with_retry(device.id.as_str(), move || async move {
                match write {
                    Write::Mode(mode) => adapter
                        .set_mode(device, mode)
                        .await
                        .map(|()| Delivery::Confirmed),
                    Write::Pool(pool) => adapter.switch_pool(device, pool).await,
                    Write::Restart => adapter.restart(device).await.map(|()| Delivery::Confirmed),
                }
            })
            .await;
        let outcome = match result {
            Ok(delivery) => {
                let now = Instant::now();
                match write {
                    Write::Mode(mode) => self.applied.lock().record_mode(device.id.clone(), mode, now),
                    Write::Pool(pool) => {
                        self.applied
                            .lock()
                            .record_pool(device.id.clone(), pool.id.clone(), delivery, now)
                    }
                    Write::Restart => {
                        self.restarts.lock().insert(device.id.clone(), now);
                    }
                }
                info!(device = %device.id, old = ?old, new = ?new, attempts, "Applied");
                match delivery {
                    Delivery::Confirmed => Outcome::Applied,
                    Delivery::Sent => Outcome::Sent,
                }
            }
            Err(e) => Outcome::Failed(e.into()),
        };

        (old, new, attempts, outcome)
    }

    /// Run `call` until it succeeds, fails semantically, or runs out of
    /// attempts. Returns the attempt count with the final result.
    async fn with_retry<F, Fut>(&self, target: &str, mut call: F) -> (u32, AdapterResult<Delivery>)
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = AdapterResult<Delivery>>,
    {
        let max_attempts = self.config.retry.attempts();
        let mut backoff = self.config.retry.backoff();
        let mut attempt = 0;

        loop {
            attempt += 1;
            let result = tokio::time::timeout(self.config.write_timeout, call())
                .await
                .unwrap_or(Err(AdapterError::Timeout));

            match result {
                Err(e) if e.is_transient() && attempt < max_attempts => {
                    let delay = backoff.next_delay();
                    debug!(
                        to = target,
                        attempt,
                        error = %e,
                        delay_ms = delay.as_millis() as u64,
                        "Write failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                result => return (attempt, result),
            }
        }
    }

    async fn alert(
        &self,
        kind: AlertKind,
        severity: Severity,
        channel: &str,
        message: &str,
        rule: Option<&crate::automation::RuleId>,
    ) -> Outcome {
        let verdict = {
            let now = Instant::now();
            let mut limiter = self.limiter.lock();
            limiter.prune(now);
            limiter.check(kind, rule, now)
        };
        if let Verdict::Limited { remaining } = verdict {
            debug!(kind = %kind, rule = ?rule, remaining_secs = remaining.as_secs(), "Alert rate limited");
            return Outcome::skipped(format!("rate limited for {}s", remaining.as_secs()));
        }

        match self.notifier.send(channel, severity, message).await {
            Ok(()) => {
                self.events.emit(ControllerEvent::AlertSent {
                    kind,
                    severity,
                    rule: rule.cloned(),
                    message: message.to_owned(),
                });
                Outcome::Applied
            }
            Err(e) => Outcome::Failed(ActionFailure {
                kind: FailureKind::Notifier,
                reason: format!("{e:#}"),
            }),
        }
    }

    async fn audit(&self, entry: AuditEntry) {
        if let Err(e) = self.persistence.save_audit(&entry).await {
            warn!(error = %e, "Failed to persist audit entry");
        }
        let mut recent = self.recent.lock();
        if recent.len() == RECENT_AUDIT {
            recent.pop_front();
        }
        recent.push_back(entry);
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("adapters", &self.adapters)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::testing::{Call, FakeAdapter};
    use crate::automation::RuleId;
    use crate::config::tests::fleet;
    use crate::device::{AvalonMode, BitaxeMode, DeviceFamily, PoolId};
    use crate::notify::testing::RecordingNotifier;
    use crate::persistence::MemoryPersistence;
    use crate::strategy::ActiveBand;

    struct Harness {
        dispatcher: Dispatcher,
        avalon: Arc<FakeAdapter>,
        bitaxe: Arc<FakeAdapter>,
        nmminer: Arc<FakeAdapter>,
        notifier: Arc<RecordingNotifier>,
        persistence: Arc<MemoryPersistence>,
        events: EventBus,
    }

    fn harness_with(notifier: RecordingNotifier) -> Harness {
        let avalon = Arc::new(FakeAdapter::new(DeviceFamily::Avalon));
        let bitaxe = Arc::new(FakeAdapter::new(DeviceFamily::Bitaxe));
        let nmminer = Arc::new(FakeAdapter::new(DeviceFamily::NmMiner).with_delivery(Delivery::Sent));
        let adapters = AdapterSet::new()
            .with(avalon.clone())
            .with(bitaxe.clone())
            .with(nmminer.clone());
        let notifier = Arc::new(notifier);
        let persistence = Arc::new(MemoryPersistence::new(fleet()));
        let events = EventBus::new();
        let dispatcher = Dispatcher::new(
            adapters,
            notifier.clone(),
            persistence.clone(),
            events.clone(),
            DispatcherConfig::default(),
        );
        Harness {
            dispatcher,
            avalon,
            bitaxe,
            nmminer,
            notifier,
            persistence,
            events,
        }
    }

    fn harness() -> Harness {
        harness_with(RecordingNotifier::default())
    }

    fn band() -> Origin {
        Origin::Band(ActiveBand::Band(3))
    }

    fn set_mode(device: &str, mode: Mode) -> Action {
        Action::SetMode {
            device: DeviceId::new(device),
            mode,
        }
    }

    fn switch_pool(device: &str, pool: &str) -> Action {
        Action::SwitchPool {
            device: DeviceId::new(device),
            pool: PoolId::new(pool),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn second_identical_write_makes_no_adapter_call() {
        let h = harness();
        let fleet = fleet();
        let mode = Mode::Avalon(AvalonMode::Mid);

        let first = h.dispatcher.apply(&fleet, set_mode("av-1", mode), band()).await;
        let second = h.dispatcher.apply(&fleet, set_mode("av-1", mode), band()).await;

        assert_eq!(first, Outcome::Applied);
        assert_eq!(second, Outcome::skipped("already applied"));
        assert_eq!(h.avalon.writes(), vec![Call::SetMode(DeviceId::new("av-1"), mode)]);
        assert!(h.dispatcher.is_applied(&set_mode("av-1", mode)));

        let audit = h.persistence.audit();
        assert_eq!(audit.len(), 2);
        assert_eq!(audit[1].old.as_deref(), Some("avalon/mid"));
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failures_are_retried() {
        let h = harness();
        h.bitaxe
            .fail_writes([AdapterError::Timeout, AdapterError::Io("reset".into())]);

        let outcome = h
            .dispatcher
            .apply(&fleet(), set_mode("ax-1", Mode::Bitaxe(BitaxeMode::Eco)), band())
            .await;

        assert_eq!(outcome, Outcome::Applied);
        assert_eq!(h.bitaxe.writes().len(), 3);
        assert_eq!(h.persistence.audit()[0].attempts, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_retries_fail_with_event() {
        let h = harness();
        let mut rx = h.events.subscribe();
        h.bitaxe.fail_writes([
            AdapterError::Timeout,
            AdapterError::Timeout,
            AdapterError::Timeout,
            AdapterError::Timeout,
        ]);

        let outcome = h
            .dispatcher
            .apply(&fleet(), set_mode("ax-1", Mode::Bitaxe(BitaxeMode::Eco)), band())
            .await;

        assert!(outcome.is_failure());
        assert_eq!(h.bitaxe.writes().len(), 3);
        assert!(matches!(
            rx.try_recv().unwrap(),
            ControllerEvent::ActionFailed { device: Some(_), .. }
        ));
        assert!(!h.dispatcher.is_applied(&set_mode("ax-1", Mode::Bitaxe(BitaxeMode::Eco))));
    }

    #[tokio::test(start_paused = true)]
    async fn semantic_failure_is_not_retried() {
        let h = harness();
        h.avalon.fail_writes([AdapterError::Auth]);

        let outcome = h
            .dispatcher
            .apply(&fleet(), switch_pool("av-1", "dgb"), band())
            .await;

        assert_eq!(
            outcome,
            Outcome::Failed(ActionFailure::from(AdapterError::Auth))
        );
        assert_eq!(h.avalon.writes().len(), 1);
        assert_eq!(h.persistence.audit()[0].attempts, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn capability_is_checked_before_the_adapter() {
        let h = harness();
        let outcome = h
            .dispatcher
            .apply(&fleet(), Action::Restart { device: DeviceId::new("nm-1") }, Origin::System)
            .await;

        assert_eq!(
            outcome,
            Outcome::Failed(ActionFailure::from(AdapterError::Unsupported(DeviceFamily::NmMiner)))
        );
        assert!(h.nmminer.calls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_pool_is_audited() {
        let h = harness();
        let outcome = h
            .dispatcher
            .apply(&fleet(), switch_pool("ax-1", "nowhere"), band())
            .await;

        assert!(matches!(
            outcome,
            Outcome::Failed(ActionFailure { kind: FailureKind::UnknownTarget, .. })
        ));
        assert_eq!(h.persistence.audit().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn sent_pool_is_resent_after_window_unless_confirmed() {
        let h = harness();
        let fleet = fleet();

        assert_eq!(
            h.dispatcher.apply(&fleet, switch_pool("nm-1", "btc"), band()).await,
            Outcome::Sent
        );
        assert_eq!(
            h.dispatcher.apply(&fleet, switch_pool("nm-1", "btc"), band()).await,
            Outcome::skipped("already applied")
        );

        tokio::time::advance(DispatcherConfig::default().resend_after).await;
        assert_eq!(
            h.dispatcher.apply(&fleet, switch_pool("nm-1", "btc"), band()).await,
            Outcome::Sent
        );
        assert_eq!(h.nmminer.writes().len(), 2);

        let mut snapshot = TelemetrySnapshot::new(DeviceId::new("nm-1"), OffsetDateTime::now_utc());
        snapshot.extras.pool_url = Some("btc.example:3333".to_owned());
        h.dispatcher.observe(&snapshot, &fleet.pools);

        tokio::time::advance(DispatcherConfig::default().resend_after * 4).await;
        assert!(h.dispatcher.is_applied(&switch_pool("nm-1", "btc")));
    }

    #[tokio::test(start_paused = true)]
    async fn alerts_are_rate_limited_per_rule() {
        let h = harness();
        let fleet = fleet();
        let alert = Action::Alert {
            kind: AlertKind::Thermal,
            severity: Severity::Warning,
            channel: "ops".to_owned(),
            message: "hot".to_owned(),
        };
        let origin = Origin::Rule(RuleId::new("hot"));

        let first = h.dispatcher.apply(&fleet, alert.clone(), origin.clone()).await;
        tokio::time::advance(Duration::from_secs(60)).await;
        let second = h.dispatcher.apply(&fleet, alert.clone(), origin.clone()).await;

        assert_eq!(first, Outcome::Applied);
        assert!(matches!(second, Outcome::Skipped { .. }));
        assert_eq!(h.notifier.sent.lock().len(), 1);

        tokio::time::advance(Duration::from_secs(15 * 60)).await;
        h.dispatcher.apply(&fleet, alert, origin).await;
        assert_eq!(h.notifier.sent.lock().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn notifier_failure_is_logged_not_retried() {
        let h = harness_with(RecordingNotifier {
            fail: true,
            ..RecordingNotifier::default()
        });
        let outcome = h
            .dispatcher
            .apply(
                &fleet(),
                Action::Alert {
                    kind: AlertKind::Generic,
                    severity: Severity::Info,
                    channel: "ops".to_owned(),
                    message: "hello".to_owned(),
                },
                Origin::System,
            )
            .await;

        assert!(matches!(
            outcome,
            Outcome::Failed(ActionFailure { kind: FailureKind::Notifier, .. })
        ));
        assert_eq!(h.persistence.audit()[0].attempts, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn restart_respects_cooldown() {
        let h = harness();
        let fleet = fleet();
        let restart = Action::Restart {
            device: DeviceId::new("ax-1"),
        };

        assert_eq!(h.dispatcher.apply(&fleet, restart.clone(), Origin::System).await, Outcome::Applied);
        assert_eq!(
            h.dispatcher.apply(&fleet, restart.clone(), Origin::System).await,
            Outcome::skipped("restart cooldown")
        );

        tokio::time::advance(DispatcherConfig::default().restart_cooldown).await;
        assert_eq!(h.dispatcher.apply(&fleet, restart, Origin::System).await, Outcome::Applied);
        assert_eq!(h.bitaxe.writes().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn forget_allows_rewrite() {
        let h = harness();
        let fleet = fleet();
        let mode = Mode::Bitaxe(BitaxeMode::Standard);

        h.dispatcher.apply(&fleet, set_mode("ax-1", mode), band()).await;
        h.dispatcher.forget(&DeviceId::new("ax-1"));
        h.dispatcher.apply(&fleet, set_mode("ax-1", mode), band()).await;

        assert_eq!(h.bitaxe.writes().len(), 2);
        assert_eq!(h.dispatcher.recent_audit().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn closed_alert_windows_are_pruned() {
        let h = harness();
        let fleet = fleet();
        let alert = |kind, message: &str| Action::Alert {
            kind,
            severity: Severity::Warning,
            channel: "ops".to_owned(),
            message: message.to_owned(),
        };

        h.dispatcher
            .apply(&fleet, alert(AlertKind::Thermal, "hot"), Origin::Rule(RuleId::new("hot")))
            .await;
        tokio::time::advance(Duration::from_secs(16 * 60)).await;
        h.dispatcher
            .apply(&fleet, alert(AlertKind::Generic, "cheap"), Origin::Rule(RuleId::new("cheap")))
            .await;

        assert_eq!(h.notifier.sent.lock().len(), 2);
        assert_eq!(h.dispatcher.limiter.lock().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn reported_mode_suppresses_the_write() {
        let h = harness();
        let fleet = fleet();
        let mode = Mode::Avalon(AvalonMode::Mid);

        let mut snapshot = TelemetrySnapshot::new(DeviceId::new("av-1"), OffsetDateTime::now_utc());
        snapshot.extras.mode = Some(mode);
        h.dispatcher.observe(&snapshot, &fleet.pools);

        assert!(h.dispatcher.is_applied(&set_mode("av-1", mode)));
        assert_eq!(
            h.dispatcher.apply(&fleet, set_mode("av-1", mode), band()).await,
            Outcome::skipped("already applied")
        );
        assert!(h.avalon.writes().is_empty());
    }

    fn two_nm_miners() -> FleetConfig {
        let mut fleet = fleet();
        fleet
            .devices
            .push(Device::new("nm-2", DeviceFamily::NmMiner, "10.0.0.5"));
        fleet
    }

    #[tokio::test(start_paused = true)]
    async fn whole_family_switch_is_one_broadcast() {
        let h = harness();
        let fleet = two_nm_miners();
        let actions = vec![
            (switch_pool("nm-1", "btc"), band()),
            (switch_pool("ax-1", "btc"), band()),
            (switch_pool("nm-2", "btc"), band()),
        ];

        let outcomes = h.dispatcher.apply_all(&fleet, actions).await;

        assert_eq!(outcomes, vec![Outcome::Sent, Outcome::Sent, Outcome::Applied]);
        assert_eq!(h.nmminer.writes(), vec![Call::BroadcastPool(PoolId::new("btc"))]);
        assert_eq!(h.bitaxe.writes().len(), 1);
        assert!(h.dispatcher.is_applied(&switch_pool("nm-1", "btc")));
        assert!(h.dispatcher.is_applied(&switch_pool("nm-2", "btc")));

        let audited: Vec<_> = h.persistence.audit().into_iter().filter_map(|e| e.device).collect();
        assert_eq!(
            audited,
            vec![DeviceId::new("nm-1"), DeviceId::new("nm-2"), DeviceId::new("ax-1")]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn partial_family_switch_stays_unicast() {
        let h = harness();
        let fleet = two_nm_miners();

        h.dispatcher
            .apply_all(&fleet, vec![(switch_pool("nm-2", "btc"), band())])
            .await;

        assert_eq!(
            h.nmminer.writes(),
            vec![Call::SwitchPool(DeviceId::new("nm-2"), PoolId::new("btc"))]
        );
    }

    #[test]
    fn split_pools_do_not_broadcast() {
        let fleet = two_nm_miners();
        let actions = vec![
            (switch_pool("nm-1", "btc"), band()),
            (switch_pool("nm-2", "bch"), band()),
        ];

        let (groups, rest) = broadcast_groups(&fleet, actions.clone());
        assert!(groups.is_empty());
        assert_eq!(rest, actions);

        let mut fleet = fleet;
        fleet.devices[3].enabled = false;
        let (groups, _) = broadcast_groups(&fleet, vec![
            (switch_pool("nm-1", "btc"), band()),
            (switch_pool("nm-2", "btc"), band()),
        ]);
        assert!(groups.is_empty());
    }
}

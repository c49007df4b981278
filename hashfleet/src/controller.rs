//! The controller: one explicitly constructed context that owns every
//! component and runs the cycle loop.
//!
//! A cycle is strictly sequential:
//!
//! ```text
//!   poll all devices ──► snapshot store ──► band engine ──┐
//!        (concurrent)      (one copy)                     ├─► coalesce ─► dispatcher
//!                                       ──► rule engine ──┘
//! ```
//!
//! Both engines see the same [`FleetView`] copy and the same price, so a
//! UDP packet arriving mid-evaluation cannot change what either decides.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use time::OffsetDateTime;
use tokio_util::sync::CancellationToken;

use crate::adapter::AdapterSet;
use crate::automation::{self, RuleContext, RuleEvaluation};
use crate::config::{ControllerConfig, FleetConfig};
use crate::device::Device;
use crate::dispatch::{Action, AuditEntry, Dispatcher, DispatcherConfig, Origin, coalesce};
use crate::error::Result;
use crate::events::{ControllerEvent, EventBus};
use crate::notify::Notifier;
use crate::persistence::Persistence;
use crate::poller::Poller;
use crate::price::{PriceSignal, PriceSlot};
use crate::strategy::{Band, BandTransition, Override, StrategyEngine, StrategyState};
use crate::telemetry::{DeviceTelemetry, FleetView, TelemetryStore};
use crate::tracing::prelude::*;

/// Summary of the last completed cycle.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CycleSummary {
    #[serde(with = "time::serde::rfc3339")]
    pub at: OffsetDateTime,
    pub polled: usize,
    pub skipped: usize,
    pub failed: usize,
    pub price: Option<f64>,
    pub next_price: Option<f64>,
    pub transition: Option<BandTransition>,
    pub actions: usize,
    pub failed_actions: usize,
}

/// Everything the status API exposes, read at one instant.
#[derive(Debug, Clone)]
pub struct ControllerView {
    pub uptime: Duration,
    pub devices: Vec<(Device, DeviceTelemetry)>,
    pub strategy: StrategyState,
    pub bands: Vec<Band>,
    pub last_cycle: Option<CycleSummary>,
}

pub struct Controller {
    config: ControllerConfig,
    fleet: RwLock<Arc<FleetConfig>>,
    store: Arc<TelemetryStore>,
    poller: Poller,
    strategy: Mutex<StrategyEngine>,
    dispatcher: Dispatcher,
    price: Arc<dyn PriceSignal>,
    persistence: Arc<dyn Persistence>,
    events: EventBus,
    rule_evaluations: RwLock<Vec<RuleEvaluation>>,
    last_cycle: RwLock<Option<CycleSummary>>,
    started: tokio::time::Instant,
}

impl Controller {
    /// Load the fleet and the last strategy state from `persistence` and
    /// wire up the components.
    pub async fn new(
        config: ControllerConfig,
        adapters: AdapterSet,
        store: Arc<TelemetryStore>,
        price: Arc<dyn PriceSignal>,
        persistence: Arc<dyn Persistence>,
        notifier: Arc<dyn Notifier>,
    ) -> Result<Self> {
        let fleet = persistence.load_fleet().await?;
        fleet.validate()?;
        let restored = persistence.load_strategy_state().await?;
        let strategy = StrategyEngine::new(fleet.bands.clone(), restored);
        info!(
            devices = fleet.devices.len(),
            rules = fleet.rules.len(),
            bands = fleet.bands.len(),
            active = %strategy.state().active,
            "Controller configured"
        );

        let events = EventBus::new();
        let poller = Poller::new(
            adapters.clone(),
            Arc::clone(&store),
            events.clone(),
            config.max_concurrent_polls,
            config.poll_timeout,
        );
        let dispatcher = Dispatcher::new(
            adapters,
            notifier,
            Arc::clone(&persistence),
            events.clone(),
            DispatcherConfig::from(&config),
        );

        Ok(Self {
            config,
            fleet: RwLock::new(Arc::new(fleet)),
            store,
            poller,
            strategy: Mutex::new(strategy),
            dispatcher,
            price,
            persistence,
            events,
            rule_evaluations: RwLock::new(Vec::new()),
            last_cycle: RwLock::new(None),
            started: tokio::time::Instant::now(),
        })
    }

    /// Run cycles every poll period until cancelled.
    pub async fn run(&self, cancellation: CancellationToken) {
        let mut interval = tokio::time::interval(self.config.poll_period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        info!(period_secs = self.config.poll_period.as_secs(), "Controller running");

        loop {
            tokio::select! {
                _ = cancellation.cancelled() => {
                    info!("Controller shutdown requested");
                    break;
                }
                _ = interval.tick() => {
                    self.cycle().await;
                }
            }
        }
    }

    /// One full cycle: poll, then evaluate, then dispatch.
    pub async fn cycle(&self) -> CycleSummary {
        let fleet = Arc::clone(&self.fleet.read());

        let report = self.poller.poll_cycle(&fleet.devices).await;
        for id in &report.recovered {
            self.dispatcher.forget(id);
        }
        for snapshot in &report.polled {
            self.dispatcher.observe(snapshot, &fleet.pools);
        }
        if let Err(e) = self.persistence.save_snapshots(&report.polled).await {
            warn!(error = %e, "Failed to persist snapshots");
        }

        let now = OffsetDateTime::now_utc();
        let view = self.store.read_all(now);
        let (current, next) = self.prices(now).await;

        let transition = {
            let mut strategy = self.strategy.lock();
            strategy.evaluate(now, current.as_ref(), next.as_ref())
        };
        if let Some(transition) = &transition {
            self.events
                .emit(ControllerEvent::BandTransition(transition.clone()));
            if let Err(e) = self.persistence.save_transition(transition).await {
                warn!(error = %e, "Failed to persist band transition");
            }
            self.save_state().await;
        }

        let mut actions = self.band_actions(&fleet, &view);
        let evaluation = automation::evaluate(
            &fleet.rules,
            &RuleContext {
                now,
                price: current.map(|s| s.price),
                fleet: &view,
                devices: &fleet.devices,
            },
        );
        let before = evaluation.actions.len();
        let rule_actions: Vec<_> = evaluation
            .actions
            .into_iter()
            .filter(|(action, _)| reachable(action, &view))
            .collect();
        if rule_actions.len() < before {
            debug!(
                dropped = before - rule_actions.len(),
                "Rule actions for unreachable devices dropped"
            );
        }
        actions.extend(rule_actions);
        *self.rule_evaluations.write() = evaluation.records;

        let actions = coalesce(actions);
        let action_count = actions.len();
        let outcomes = self.dispatcher.apply_all(&fleet, actions).await;

        let summary = CycleSummary {
            at: now,
            polled: report.polled.len(),
            skipped: report.skipped.len(),
            failed: report.failed.len(),
            price: current.map(|s| s.price),
            next_price: next.map(|s| s.price),
            transition,
            actions: action_count,
            failed_actions: outcomes.iter().filter(|o| o.is_failure()).count(),
        };
        self.events.emit(ControllerEvent::CycleCompleted {
            polled: summary.polled,
            skipped: summary.skipped,
            failed: summary.failed,
        });
        debug!(
            polled = summary.polled,
            failed = summary.failed,
            actions = summary.actions,
            "Cycle complete"
        );
        *self.last_cycle.write() = Some(summary.clone());
        summary
    }

    async fn prices(&self, now: OffsetDateTime) -> (Option<PriceSlot>, Option<PriceSlot>) {
        let current = match self.price.current_slot(now).await {
            Ok(slot) => slot,
            Err(e) => {
                warn!(error = %e, "Price feed failed");
                None
            }
        };
        let next = match self.price.next_slot(now).await {
            Ok(slot) => slot,
            Err(e) => {
                debug!(error = %e, "Next price slot unavailable");
                None
            }
        };
        (current, next)
    }

    /// The band plan for reachable devices, minus what is already in place.
    fn band_actions(&self, fleet: &FleetConfig, view: &FleetView) -> Vec<(Action, Origin)> {
        let strategy = self.strategy.lock();
        let origin = Origin::Band(strategy.state().active);
        strategy
            .plan(fleet)
            .into_iter()
            .filter(|action| reachable(action, view))
            .filter(|action| !self.dispatcher.is_applied(action))
            .map(|action| (action, origin.clone()))
            .collect()
    }

    async fn save_state(&self) {
        let state = self.strategy.lock().state().clone();
        if let Err(e) = self.persistence.save_strategy_state(&state).await {
            warn!(error = %e, "Failed to persist strategy state");
        }
    }

    pub async fn set_override(&self, override_mode: Override) {
        self.strategy.lock().set_override(override_mode);
        self.save_state().await;
    }

    /// Validate, store and adopt a new band table. An invalid table is
    /// rejected and the current one stays in force.
    pub async fn replace_bands(&self, bands: Vec<Band>) -> Result<()> {
        let table = self.persistence.save_bands(bands).await?;
        {
            let mut fleet = self.fleet.write();
            let mut updated = FleetConfig::clone(&fleet);
            updated.bands = table.clone();
            *fleet = Arc::new(updated);
        }
        self.strategy.lock().replace_bands(table);
        self.save_state().await;
        Ok(())
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn uptime(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn fleet(&self) -> Arc<FleetConfig> {
        Arc::clone(&self.fleet.read())
    }

    /// Every configured device with its current telemetry.
    pub fn devices(&self) -> Vec<(Device, DeviceTelemetry)> {
        let now = OffsetDateTime::now_utc();
        self.fleet
            .read()
            .devices
            .iter()
            .map(|d| (d.clone(), self.store.view(&d.id, now)))
            .collect()
    }

    pub fn view(&self) -> ControllerView {
        let (strategy, bands) = {
            let engine = self.strategy.lock();
            (engine.state().clone(), engine.bands().iter().cloned().collect())
        };
        ControllerView {
            uptime: self.uptime(),
            devices: self.devices(),
            strategy,
            bands,
            last_cycle: self.last_cycle(),
        }
    }

    pub fn strategy_state(&self) -> StrategyState {
        self.strategy.lock().state().clone()
    }

    pub fn transitions(&self) -> Vec<BandTransition> {
        self.strategy.lock().history().cloned().collect()
    }

    /// Rule records from the last cycle.
    pub fn rule_evaluations(&self) -> Vec<RuleEvaluation> {
        self.rule_evaluations.read().clone()
    }

    pub fn recent_audit(&self) -> Vec<AuditEntry> {
        self.dispatcher.recent_audit()
    }

    pub fn last_cycle(&self) -> Option<CycleSummary> {
        self.last_cycle.read().clone()
    }
}

/// Device actions are only worth sending to devices that answered
/// recently. Alerts and log entries always go through.
fn reachable(action: &Action, view: &FleetView) -> bool {
    action
        .device()
        .is_none_or(|id| view.get(id).is_some_and(DeviceTelemetry::is_online))
}

impl std::fmt::Debug for Controller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Controller")
            .field("config", &self.config)
            .field("poller", &self.poller)
            .field("dispatcher", &self.dispatcher)
            .finish_non_exhaustive()
    }
}

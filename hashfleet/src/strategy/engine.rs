use std::collections::VecDeque;

use time::OffsetDateTime;

use super::band::BandTable;
use super::state::{
    ActiveBand, BandTransition, Decision, Override, StrategyState, TransitionReason, decide,
};
use crate::config::FleetConfig;
use crate::device::Capabilities;
use crate::dispatch::Action;
use crate::price::PriceSlot;
use crate::tracing::prelude::*;

/// Transitions kept in memory.
const HISTORY: usize = 256;

/// Owns the strategy state and turns price slots into band changes and
/// band changes into per-device writes.
#[derive(Debug)]
pub struct StrategyEngine {
    bands: BandTable,
    state: StrategyState,
    history: VecDeque<BandTransition>,
}

impl StrategyEngine {
    /// Resume from `restored` when it still fits `bands`.
    pub fn new(bands: BandTable, restored: Option<StrategyState>) -> Self {
        let state = match restored {
            Some(state) if Self::fits(&bands, state.active) => state,
            Some(state) => {
                warn!(active = %state.active, "Stored band no longer configured, starting over");
                StrategyState {
                    override_mode: state.override_mode,
                    ..StrategyState::initial(&bands)
                }
            }
            None => StrategyState::initial(&bands),
        };
        Self {
            bands,
            state,
            history: VecDeque::new(),
        }
    }

    fn fits(bands: &BandTable, active: ActiveBand) -> bool {
        match active {
            ActiveBand::Band(i) => bands.get(i).is_some(),
            ActiveBand::Disabled => true,
        }
    }

    pub fn state(&self) -> &StrategyState {
        &self.state
    }

    pub fn bands(&self) -> &BandTable {
        &self.bands
    }

    /// Recorded transitions, oldest first.
    pub fn history(&self) -> impl Iterator<Item = &BandTransition> {
        self.history.iter()
    }

    /// Takes effect at the next [`evaluate`](Self::evaluate).
    pub fn set_override(&mut self, override_mode: Override) {
        if self.state.override_mode != override_mode {
            info!(from = %self.state.override_mode, to = %override_mode, "Override changed");
            self.state.override_mode = override_mode;
        }
    }

    /// Swap in a new (already validated) table. An active band that no
    /// longer exists falls back to the most expensive one.
    pub fn replace_bands(&mut self, bands: BandTable) {
        if !Self::fits(&bands, self.state.active) {
            warn!(active = %self.state.active, "Active band removed by new table");
            self.state.active = StrategyState::initial(&bands).active;
        }
        self.bands = bands;
    }

    /// Run one decision. Returns the transition if the band changed.
    pub fn evaluate(
        &mut self,
        now: OffsetDateTime,
        current: Option<&PriceSlot>,
        next: Option<&PriceSlot>,
    ) -> Option<BandTransition> {
        let price = current.map(|s| s.price);
        if price.is_none() && self.state.override_mode != Override::ForceDisabled {
            warn!(active = %self.state.active, "No current price, holding");
        }

        let decision = decide(
            self.state.active,
            self.state.override_mode,
            price,
            next.map(|s| s.price),
            &self.bands,
        );

        match decision {
            Decision::Hold(reason) => {
                debug!(active = %self.state.active, price, %reason, "Holding band");
                None
            }
            Decision::Transition { to, reason } => Some(self.transition(now, to, reason, price)),
        }
    }

    fn transition(
        &mut self,
        now: OffsetDateTime,
        to: ActiveBand,
        reason: TransitionReason,
        price: Option<f64>,
    ) -> BandTransition {
        let transition = BandTransition {
            from: self.state.active,
            to,
            reason,
            at: now,
            price,
        };
        info!(from = %transition.from, to = %to, %reason, price, "Band transition");

        self.state.active = to;
        self.state.last_transition = Some(now);
        self.state.reason = Some(reason);

        if self.history.len() == HISTORY {
            self.history.pop_front();
        }
        self.history.push_back(transition.clone());
        transition
    }

    /// Writes that bring every enabled device in line with the active band.
    ///
    /// Pools follow the band's coin (first configured pool for it); an
    /// `OFF` band leaves pools alone and only applies modes. `Disabled`
    /// plans nothing. Devices lacking a capability are left out rather
    /// than planned to fail.
    pub fn plan(&self, fleet: &FleetConfig) -> Vec<Action> {
        let ActiveBand::Band(index) = self.state.active else {
            return Vec::new();
        };
        let Some(band) = self.bands.get(index) else {
            return Vec::new();
        };

        let pool = if band.coin.is_off() {
            None
        } else {
            let pool = fleet.pool_for_coin(&band.coin);
            if pool.is_none() {
                warn!(band = index, coin = %band.coin, "No pool for band coin");
            }
            pool
        };

        let mut actions = Vec::new();
        for device in fleet.enabled_devices() {
            if let Some(pool) = pool {
                if device.supports(Capabilities::POOL_SWITCH) {
                    actions.push(Action::SwitchPool {
                        device: device.id.clone(),
                        pool: pool.id.clone(),
                    });
                }
            }
            if let Some(mode) = band.modes.for_family(device.family) {
                if device.supports(Capabilities::TUNING) {
                    actions.push(Action::SetMode {
                        device: device.id.clone(),
                        mode,
                    });
                }
            }
        }
        actions
    }
}

#[cfg(test)]
mod tests {
    use time::macros::datetime;

    use super::*;
    use crate::config::tests::fleet;
    use crate::device::{AvalonMode, BitaxeMode, DeviceId, Mode, PoolId};
    use crate::price::{PriceSignal, SlotTable};

    const START: OffsetDateTime = datetime!(2025-01-10 16:00 UTC);

    async fn run(engine: &mut StrategyEngine, table: &SlotTable, slots: usize) -> Vec<Option<ActiveBand>> {
        let mut seen = Vec::new();
        for i in 0..slots {
            let now = START + time::Duration::minutes(30 * i as i64 + 1);
            let current = table.current_slot(now).await.unwrap();
            let next = table.next_slot(now).await.unwrap();
            seen.push(engine.evaluate(now, current.as_ref(), next.as_ref()).map(|t| t.to));
        }
        seen
    }

    #[tokio::test]
    async fn drop_to_nine_pence_waits_for_confirmation() {
        let mut engine = StrategyEngine::new(fleet().bands, None);
        let table = SlotTable::from_prices(START, &[25.0, 25.0, 9.0, 9.0]);

        let seen = run(&mut engine, &table, 4).await;

        assert_eq!(seen, vec![None, None, Some(ActiveBand::Band(3)), None]);
        assert_eq!(engine.state().active, ActiveBand::Band(3));
        assert_eq!(engine.state().reason, Some(TransitionReason::PriceFellConfirmed));
        assert_eq!(engine.history().count(), 1);
    }

    #[tokio::test]
    async fn missing_price_holds_current_band() {
        let mut engine = StrategyEngine::new(fleet().bands, None);
        let table = SlotTable::from_prices(START, &[9.0, 9.0]);
        run(&mut engine, &table, 1).await;
        assert_eq!(engine.state().active, ActiveBand::Band(3));

        let late = START + time::Duration::hours(5);
        assert_eq!(engine.evaluate(late, None, None), None);
        assert_eq!(engine.state().active, ActiveBand::Band(3));
    }

    #[test]
    fn plan_for_dgb_standard() {
        let fleet = fleet();
        let mut engine = StrategyEngine::new(fleet.bands.clone(), None);
        engine.set_override(Override::ForceEnabled);
        let slot = PriceSlot {
            start: START,
            end: START + time::Duration::minutes(30),
            price: 9.0,
        };
        engine.evaluate(START, Some(&slot), None);

        let dgb = PoolId::new("dgb");
        assert_eq!(
            engine.plan(&fleet),
            vec![
                Action::SwitchPool { device: DeviceId::new("av-1"), pool: dgb.clone() },
                Action::SetMode { device: DeviceId::new("av-1"), mode: Mode::Avalon(AvalonMode::Mid) },
                Action::SwitchPool { device: DeviceId::new("ax-1"), pool: dgb.clone() },
                Action::SetMode { device: DeviceId::new("ax-1"), mode: Mode::Bitaxe(BitaxeMode::Standard) },
                Action::SwitchPool { device: DeviceId::new("nm-1"), pool: dgb },
            ]
        );
    }

    #[test]
    fn off_band_sets_modes_only() {
        let fleet = fleet();
        let engine = StrategyEngine::new(fleet.bands.clone(), None);
        assert_eq!(engine.state().active, ActiveBand::Band(1));

        let plan = engine.plan(&fleet);
        assert_eq!(plan.len(), 2);
        assert!(plan.iter().all(|a| matches!(a, Action::SetMode { .. })));
    }

    #[test]
    fn disabled_plans_nothing() {
        let fleet = fleet();
        let mut engine = StrategyEngine::new(fleet.bands.clone(), None);
        engine.set_override(Override::ForceDisabled);
        let transition = engine.evaluate(START, None, None).unwrap();

        assert_eq!(transition.to, ActiveBand::Disabled);
        assert!(engine.plan(&fleet).is_empty());
    }

    #[test]
    fn restored_state_outside_table_starts_over() {
        let restored = StrategyState {
            active: ActiveBand::Band(9),
            override_mode: Override::ForceEnabled,
            last_transition: None,
            reason: None,
        };
        let engine = StrategyEngine::new(fleet().bands, Some(restored));
        assert_eq!(engine.state().active, ActiveBand::Band(1));
        assert_eq!(engine.state().override_mode, Override::ForceEnabled);
    }
}

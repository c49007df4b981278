//! The band state machine and its transition function.
//!
//! # State Machine
//!
//! ```text
//!                 pricier band: immediate
//!        ┌────────────────────────────────────────┐
//!        │                                        │
//!   Band(i+k) ◄─────────────────────────────── Band(i)
//!        │     cheaper band: only when the        ▲
//!        │     next slot confirms it              │
//!        │                                        │
//!        └──── ForceDisabled ──► Disabled ─ Auto / ForceEnabled
//! ```
//!
//! [`decide`] is a pure function of the current state, the override and
//! the two prices. It never reads a clock, so replaying a price series
//! from the same starting state always yields the same transitions.

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use time::OffsetDateTime;

use super::band::BandTable;
use crate::price::Price;

/// What the fleet is doing right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "state", content = "band", rename_all = "snake_case")]
pub enum ActiveBand {
    Band(u32),
    Disabled,
}

impl std::fmt::Display for ActiveBand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ActiveBand::Band(i) => write!(f, "band {i}"),
            ActiveBand::Disabled => f.write_str("disabled"),
        }
    }
}

/// Manual override, orthogonal to the active band.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Display, EnumString, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Override {
    #[default]
    Auto,
    ForceEnabled,
    ForceDisabled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum TransitionReason {
    /// Price moved into a pricier band.
    PriceRose,
    /// Price moved into a cheaper band and the next slot agreed.
    PriceFellConfirmed,
    /// Leaving `Disabled` in automatic mode.
    Resumed,
    ForcedEnabled,
    ForcedDisabled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum HoldReason {
    /// Current price is already in the active band.
    SameBand,
    /// Cheaper band wanted, but the next slot is pricier.
    AwaitingConfirmation,
    /// Cheaper band wanted, but the next slot is unknown.
    NoLookahead,
    /// No current price at all.
    NoPrice,
    AlreadyDisabled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Hold(HoldReason),
    Transition {
        to: ActiveBand,
        reason: TransitionReason,
    },
}

/// Persisted strategy state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StrategyState {
    pub active: ActiveBand,
    #[serde(default, rename = "override")]
    pub override_mode: Override,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub last_transition: Option<OffsetDateTime>,
    #[serde(default)]
    pub reason: Option<TransitionReason>,
}

impl StrategyState {
    /// Start in the most expensive band; the first cheap price has to be
    /// confirmed like any other.
    pub fn initial(bands: &BandTable) -> Self {
        Self {
            active: ActiveBand::Band(bands.most_expensive().index),
            override_mode: Override::Auto,
            last_transition: None,
            reason: None,
        }
    }
}

/// One recorded change of [`ActiveBand`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BandTransition {
    pub from: ActiveBand,
    pub to: ActiveBand,
    pub reason: TransitionReason,
    #[serde(with = "time::serde::rfc3339")]
    pub at: OffsetDateTime,
    pub price: Option<Price>,
}

/// Compute the next state.
///
/// | override | condition | result |
/// |----------|-----------|--------|
/// | ForceDisabled | | `Disabled` |
/// | ForceEnabled | | band for `current` |
/// | Auto | no `current` | hold |
/// | Auto | from `Disabled` | band for `current` |
/// | Auto | pricier band | band for `current`, immediately |
/// | Auto | cheaper band, `next` band same or cheaper | band for `current` |
/// | Auto | cheaper band, `next` pricier or unknown | hold |
pub fn decide(
    state: ActiveBand,
    override_mode: Override,
    current: Option<Price>,
    next: Option<Price>,
    bands: &BandTable,
) -> Decision {
    if override_mode == Override::ForceDisabled {
        return match state {
            ActiveBand::Disabled => Decision::Hold(HoldReason::AlreadyDisabled),
            ActiveBand::Band(_) => Decision::Transition {
                to: ActiveBand::Disabled,
                reason: TransitionReason::ForcedDisabled,
            },
        };
    }

    let Some(desired) = current.and_then(|p| bands.band_for(p)).map(|b| b.index) else {
        return Decision::Hold(HoldReason::NoPrice);
    };

    let transition = |reason| Decision::Transition {
        to: ActiveBand::Band(desired),
        reason,
    };

    if override_mode == Override::ForceEnabled {
        return match state {
            ActiveBand::Band(i) if i == desired => Decision::Hold(HoldReason::SameBand),
            _ => transition(TransitionReason::ForcedEnabled),
        };
    }

    let active = match state {
        ActiveBand::Disabled => return transition(TransitionReason::Resumed),
        ActiveBand::Band(i) => i,
    };

    if desired == active {
        Decision::Hold(HoldReason::SameBand)
    } else if desired < active {
        transition(TransitionReason::PriceRose)
    } else {
        match next.and_then(|p| bands.band_for(p)) {
            None => Decision::Hold(HoldReason::NoLookahead),
            Some(lookahead) if lookahead.index >= desired => {
                transition(TransitionReason::PriceFellConfirmed)
            }
            Some(_) => Decision::Hold(HoldReason::AwaitingConfirmation),
        }
    }
}

//! Price-band strategy.
//!
//! The fleet runs in one band at a time. Each cycle the engine looks at
//! the current and next price slot, decides whether to move, and plans
//! the per-device writes that bring the fleet in line with the active
//! band. Moving to a pricier band is immediate; moving to a cheaper one
//! needs the next slot to agree.

mod band;
mod engine;
mod state;

pub use band::{Band, BandTable, ConfigError, Conflict};
pub use engine::StrategyEngine;
pub use state::{
    ActiveBand, BandTransition, Decision, HoldReason, Override, StrategyState, TransitionReason,
    decide,
};

//! Small value types shared across the crate.

mod difficulty;
mod failure_streak;
mod hashrate;

pub use difficulty::{Difficulty, ParseDifficultyError};
pub use failure_streak::{FailureStreak, StreakStatus};
pub use hashrate::{HashRate, HashUnit, ParseHashRateError};

//! Share difficulty as reported by device firmware.
//!
//! Devices report best-share difficulty either as a plain number or as an
//! SI-suffixed string (`"4.29G"`, `"118M"`). This type accepts both and
//! renders back to the compact suffixed form for display.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Mining share difficulty.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Difficulty(f64);

const SUFFIXES: [(char, f64); 6] = [
    ('E', 1e18),
    ('P', 1e15),
    ('T', 1e12),
    ('G', 1e9),
    ('M', 1e6),
    ('K', 1e3),
];

impl Difficulty {
    pub fn new(value: f64) -> Self {
        if value.is_finite() && value > 0.0 {
            Self(value)
        } else {
            Self(0.0)
        }
    }

    pub fn as_f64(self) -> f64 {
        self.0
    }

    /// Convert to u64, saturating at u64::MAX.
    pub fn as_u64(self) -> u64 {
        if self.0 >= u64::MAX as f64 {
            u64::MAX
        } else {
            self.0 as u64
        }
    }
}

impl From<u64> for Difficulty {
    fn from(diff: u64) -> Self {
        Self(diff as f64)
    }
}

impl PartialEq for Difficulty {
    fn eq(&self, other: &Self) -> bool {
        self.0 == other.0
    }
}

impl PartialOrd for Difficulty {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        self.0.partial_cmp(&other.0)
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("unparseable difficulty: {0:?}")]
pub struct ParseDifficultyError(String);

impl FromStr for Difficulty {
    type Err = ParseDifficultyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let err = || ParseDifficultyError(s.to_owned());

        let (number, multiplier) = match trimmed.chars().last() {
            Some(c) if c.is_ascii_alphabetic() => {
                let upper = c.to_ascii_uppercase();
                let (_, mult) = SUFFIXES
                    .iter()
                    .find(|(suffix, _)| *suffix == upper)
                    .ok_or_else(err)?;
                (&trimmed[..trimmed.len() - 1], *mult)
            }
            _ => (trimmed, 1.0),
        };

        let value: f64 = number.trim().parse().map_err(|_| err())?;
        Ok(Self::new(value * multiplier))
    }
}

impl fmt::Display for Difficulty {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let value = self.0;

        let (scaled, suffix) = SUFFIXES
            .iter()
            .find(|(_, mult)| value >= *mult)
            .map(|(suffix, mult)| (value / mult, Some(*suffix)))
            .unwrap_or((value, None));
        let suffix = suffix.map(String::from).unwrap_or_default();

        // Omit decimals for whole numbers
        if scaled >= 100.0 || scaled.fract() == 0.0 {
            write!(f, "{:.0}{}", scaled, suffix) // "112T" or "1"
        } else if scaled >= 10.0 {
            write!(f, "{:.1}{}", scaled, suffix) // "11.2T"
        } else {
            write!(f, "{:.2}{}", scaled, suffix) // "1.12T"
        }
    }
}

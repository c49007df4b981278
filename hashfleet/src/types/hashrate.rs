//! Hashrate with unit normalization.
//!
//! Devices report hashrate in whatever unit suits them: cgminer-style
//! firmware in MH/s, AxeOS in GH/s, NMMiner as a preformatted string such
//! as `"1.01MH/s"`. Everything is normalized to hashes per second on the
//! way in and scaled back to an SI unit for display.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use thiserror::Error;

/// SI hashrate units.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString, Serialize, Deserialize)]
pub enum HashUnit {
    #[strum(serialize = "H/s", ascii_case_insensitive)]
    Hashes,
    #[strum(serialize = "kH/s", ascii_case_insensitive)]
    Kilo,
    #[strum(serialize = "MH/s", ascii_case_insensitive)]
    Mega,
    #[strum(serialize = "GH/s", ascii_case_insensitive)]
    Giga,
    #[strum(serialize = "TH/s", ascii_case_insensitive)]
    Tera,
    #[strum(serialize = "PH/s", ascii_case_insensitive)]
    Peta,
}

impl HashUnit {
    /// Multiplier from this unit to H/s.
    pub fn factor(self) -> f64 {
        match self {
            HashUnit::Hashes => 1.0,
            HashUnit::Kilo => 1e3,
            HashUnit::Mega => 1e6,
            HashUnit::Giga => 1e9,
            HashUnit::Tera => 1e12,
            HashUnit::Peta => 1e15,
        }
    }

    /// Largest unit that keeps `hashes_per_sec` at or above 1.
    fn best_for(hashes_per_sec: f64) -> Self {
        [
            HashUnit::Peta,
            HashUnit::Tera,
            HashUnit::Giga,
            HashUnit::Mega,
            HashUnit::Kilo,
        ]
        .into_iter()
        .find(|u| hashes_per_sec >= u.factor())
        .unwrap_or(HashUnit::Hashes)
    }
}

/// Hashrate in hashes per second.
#[derive(Debug, Clone, Copy, Default, PartialEq, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HashRate(f64);

impl HashRate {
    pub fn from_hashes(hashes_per_sec: f64) -> Self {
        Self(hashes_per_sec.max(0.0))
    }

    pub fn new(value: f64, unit: HashUnit) -> Self {
        Self::from_hashes(value * unit.factor())
    }

    pub fn from_megahashes(mhs: f64) -> Self {
        Self::new(mhs, HashUnit::Mega)
    }

    pub fn from_gigahashes(ghs: f64) -> Self {
        Self::new(ghs, HashUnit::Giga)
    }

    pub fn from_terahashes(ths: f64) -> Self {
        Self::new(ths, HashUnit::Tera)
    }

    pub fn as_hashes(self) -> f64 {
        self.0
    }

    /// Value expressed in `unit`.
    pub fn value_in(self, unit: HashUnit) -> f64 {
        self.0 / unit.factor()
    }

    pub fn is_zero(self) -> bool {
        self.0 == 0.0
    }
}

impl fmt::Display for HashRate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let unit = HashUnit::best_for(self.0);
        write!(f, "{:.2} {}", self.value_in(unit), unit)
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("unparseable hashrate: {0:?}")]
pub struct ParseHashRateError(String);

impl HashRate {
    /// Parse `"<number>[ ]<unit>"`, e.g. `"1.01MH/s"` or `"523.4 GH/s"`,
    /// keeping the unit it was written in. A bare number is taken as H/s.
    pub fn parse_reported(s: &str) -> Result<(Self, HashUnit), ParseHashRateError> {
        let trimmed = s.trim();
        let split = trimmed
            .find(|c: char| !(c.is_ascii_digit() || c == '.' || c == '-'))
            .unwrap_or(trimmed.len());
        let (number, unit) = trimmed.split_at(split);

        let value: f64 = number
            .parse()
            .map_err(|_| ParseHashRateError(s.to_owned()))?;

        let unit = match unit.trim() {
            "" => HashUnit::Hashes,
            u => u
                .parse::<HashUnit>()
                .map_err(|_| ParseHashRateError(s.to_owned()))?,
        };

        Ok((Self::new(value, unit), unit))
    }
}

impl FromStr for HashRate {
    type Err = ParseHashRateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse_reported(s).map(|(rate, _)| rate)
    }
}

#[cfg(test)]
mod tests {
    use test_case::test_case;

    use super::*;

    #[test_case("1.01MH/s", 1.01e6 ; "nmminer compact")]
    #[test_case("523.4 GH/s", 523.4e9 ; "spaced giga")]
    #[test_case("12kh/s", 12e3 ; "lowercase kilo")]
    #[test_case("4.2TH/s", 4.2e12 ; "tera")]
    #[test_case("950", 950.0 ; "bare number")]
    fn parses_reported_strings(input: &str, expected: f64) {
        let rate: HashRate = input.parse().unwrap();
        assert!((rate.as_hashes() - expected).abs() < 1e-3 * expected.max(1.0));
    }

    #[test]
    fn reported_unit_is_kept() {
        let (rate, unit) = HashRate::parse_reported("1.01MH/s").unwrap();
        assert_eq!(unit, HashUnit::Mega);
        assert_eq!(rate, HashRate::new(1.01, HashUnit::Mega));
    }

    #[test]
    fn rejects_garbage() {
        assert!("fast".parse::<HashRate>().is_err());
        assert!("12 furlongs".parse::<HashRate>().is_err());
    }

    #[test]
    fn display_picks_unit() {
        assert_eq!(HashRate::from_gigahashes(1200.0).to_string(), "1.20 TH/s");
        assert_eq!(HashRate::from_megahashes(0.5).to_string(), "500.00 kH/s");
        assert_eq!(HashRate::default().to_string(), "0.00 H/s");
    }

    #[test]
    fn negative_clamps_to_zero() {
        assert!(HashRate::from_hashes(-5.0).is_zero());
    }
}

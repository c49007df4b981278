//! Price bands and the validated table that holds them.
//!
//! Band 1 is the most expensive. Each band owns the half-open range
//! `lower < price <= upper`, so a price sitting exactly on a boundary
//! falls into the cheaper of the two neighbours. Together the bands must
//! cover the whole price axis: band 1 has no upper bound, the last band
//! has no lower bound, and every shared boundary is exact.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::device::{Coin, FamilyModes};
use crate::price::Price;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Band {
    /// 1-based; 1 is the most expensive band.
    pub index: u32,
    /// Exclusive lower bound. `None` only on the cheapest band.
    #[serde(default)]
    pub lower: Option<Price>,
    /// Inclusive upper bound. `None` only on the most expensive band.
    #[serde(default)]
    pub upper: Option<Price>,
    pub coin: Coin,
    #[serde(default)]
    pub modes: FamilyModes,
}

impl Band {
    /// `lower < price <= upper`. A price on a boundary falls in the
    /// cheaper of the two bands.
    pub fn contains(&self, price: Price) -> bool {
        self.lower.is_none_or(|l| price > l) && self.upper.is_none_or(|u| price <= u)
    }
}

impl fmt::Display for Band {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "band {} (", self.index)?;
        match (self.lower, self.upper) {
            (Some(l), Some(u)) => write!(f, "{l}-{u}p")?,
            (Some(l), None) => write!(f, ">{l}p")?,
            (None, Some(u)) => write!(f, "<={u}p")?,
            (None, None) => write!(f, "any")?,
        }
        write!(f, " -> {})", self.coin)
    }
}

/// Why a band configuration was refused.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum Conflict {
    #[error("no bands configured")]
    Empty,

    #[error("band indices must run 1..={expected} without repeats, found {found}")]
    BadIndex { expected: u32, found: u32 },

    #[error("band {index} has lower bound {lower} above upper bound {upper}")]
    Inverted { index: u32, lower: Price, upper: Price },

    #[error("band {index} is cheaper than band {next} but priced above it")]
    Ordering { index: u32, next: u32 },

    #[error("bands {index} and {next} overlap")]
    Overlap { index: u32, next: u32 },

    #[error("gap between band {index} and band {next}")]
    Gap { index: u32, next: u32 },

    #[error("band {index} is unbounded but not at the end of the table")]
    UnboundedInterior { index: u32 },

    #[error("band {index} leaves prices uncovered at the end of the table")]
    OpenEnd { index: u32 },
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error("strategy conflict: {0}")]
    StrategyConflict(#[from] Conflict),

    #[error("{0}")]
    Invalid(String),
}

/// Bands ordered from most to least expensive, checked to partition the
/// price axis.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(transparent)]
pub struct BandTable {
    bands: Vec<Band>,
}

impl BandTable {
    pub fn new(mut bands: Vec<Band>) -> Result<Self, ConfigError> {
        if bands.is_empty() {
            return Err(Conflict::Empty.into());
        }
        bands.sort_by_key(|b| b.index);

        let count = bands.len() as u32;
        for (expected, band) in (1..).zip(&bands) {
            if band.index != expected {
                return Err(Conflict::BadIndex {
                    expected: count,
                    found: band.index,
                }
                .into());
            }
            if let (Some(lower), Some(upper)) = (band.lower, band.upper) {
                if lower >= upper {
                    return Err(Conflict::Inverted {
                        index: band.index,
                        lower,
                        upper,
                    }
                    .into());
                }
            }
        }

        let first = &bands[0];
        let last = &bands[bands.len() - 1];
        if first.upper.is_some() {
            return Err(Conflict::OpenEnd { index: first.index }.into());
        }
        if last.lower.is_some() {
            return Err(Conflict::OpenEnd { index: last.index }.into());
        }

        for pair in bands.windows(2) {
            let (pricier, cheaper) = (&pair[0], &pair[1]);
            let (Some(boundary), Some(cheaper_upper)) = (pricier.lower, cheaper.upper) else {
                let index = if pricier.lower.is_none() {
                    pricier.index
                } else {
                    cheaper.index
                };
                return Err(Conflict::UnboundedInterior { index }.into());
            };

            if let Some(pricier_upper) = pricier.upper {
                if pricier_upper <= cheaper_upper {
                    return Err(Conflict::Ordering {
                        index: pricier.index,
                        next: cheaper.index,
                    }
                    .into());
                }
            }

            if cheaper_upper > boundary {
                return Err(Conflict::Overlap {
                    index: pricier.index,
                    next: cheaper.index,
                }
                .into());
            }
            if cheaper_upper < boundary {
                return Err(Conflict::Gap {
                    index: pricier.index,
                    next: cheaper.index,
                }
                .into());
            }
        }

        Ok(Self { bands })
    }

    /// Band whose range contains `price`; the lowest index wins if a
    /// price could match more than one.
    pub fn band_for(&self, price: Price) -> Option<&Band> {
        self.bands.iter().find(|b| b.contains(price))
    }

    pub fn get(&self, index: u32) -> Option<&Band> {
        self.bands.iter().find(|b| b.index == index)
    }

    pub fn most_expensive(&self) -> &Band {
        &self.bands[0]
    }

    pub fn iter(&self) -> impl Iterator<Item = &Band> {
        self.bands.iter()
    }

    pub fn len(&self) -> usize {
        self.bands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bands.is_empty()
    }
}

impl<'de> Deserialize<'de> for BandTable {
    fn deserialize<D: serde::Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let bands = Vec::<Band>::deserialize(d)?;
        BandTable::new(bands).map_err(serde::de::Error::custom)
    }
}

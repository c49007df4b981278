//! Energy price signal.
//!
//! The band engine needs two numbers per cycle: the price of the slot we
//! are in and the price of the slot after it. Where they come from is
//! behind [`PriceSignal`].

pub mod agile;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use time::{Duration, OffsetDateTime};

pub use agile::AgileClient;

/// Price in pence per kWh.
pub type Price = f64;

/// Length of one tariff slot.
pub const SLOT: Duration = Duration::minutes(30);

/// A tariff window `[start, end)` and its price.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PriceSlot {
    #[serde(with = "time::serde::rfc3339")]
    pub start: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub end: OffsetDateTime,
    pub price: Price,
}

impl PriceSlot {
    pub fn contains(&self, at: OffsetDateTime) -> bool {
        self.start <= at && at < self.end
    }
}

#[async_trait]
pub trait PriceSignal: Send + Sync {
    async fn current_slot(&self, now: OffsetDateTime) -> anyhow::Result<Option<PriceSlot>>;

    async fn next_slot(&self, now: OffsetDateTime) -> anyhow::Result<Option<PriceSlot>>;
}

/// In-memory list of slots, sorted by start time.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SlotTable {
    slots: Vec<PriceSlot>,
}

impl SlotTable {
    pub fn new(mut slots: Vec<PriceSlot>) -> Self {
        slots.sort_by_key(|s| s.start);
        slots.dedup_by_key(|s| s.start);
        Self { slots }
    }

    /// Consecutive half-hour slots starting at `start`.
    pub fn from_prices(start: OffsetDateTime, prices: &[Price]) -> Self {
        let slots = prices
            .iter()
            .enumerate()
            .map(|(i, &price)| {
                let start = start + SLOT * i as i32;
                PriceSlot {
                    start,
                    end: start + SLOT,
                    price,
                }
            })
            .collect();
        Self { slots }
    }

    pub fn slot_at(&self, at: OffsetDateTime) -> Option<&PriceSlot> {
        let i = self.slots.partition_point(|s| s.start <= at);
        let slot = self.slots.get(i.checked_sub(1)?)?;
        slot.contains(at).then_some(slot)
    }

    /// The slot that begins where the current one ends.
    pub fn next_after(&self, at: OffsetDateTime) -> Option<&PriceSlot> {
        let current = self.slot_at(at)?;
        self.slot_at(current.end)
    }

    /// Latest slot end; nothing is known past this.
    pub fn horizon(&self) -> Option<OffsetDateTime> {
        self.slots.last().map(|s| s.end)
    }

    pub fn iter(&self) -> impl Iterator<Item = &PriceSlot> {
        self.slots.iter()
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

#[async_trait]
impl PriceSignal for SlotTable {
    async fn current_slot(&self, now: OffsetDateTime) -> anyhow::Result<Option<PriceSlot>> {
        Ok(self.slot_at(now).copied())
    }

    async fn next_slot(&self, now: OffsetDateTime) -> anyhow::Result<Option<PriceSlot>> {
        Ok(self.next_after(now).copied())
    }
}

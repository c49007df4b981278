//! Octopus Energy Agile half-hourly unit rates.
//!
//! The public products API publishes tomorrow's rates in the afternoon.
//! We fetch the whole published window and serve lookups from a cached
//! [`SlotTable`], refetching once the cache is older than the refresh
//! interval or no longer reaches past the next slot.

use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use parking_lot::Mutex;
use reqwest::Client;
use serde::Deserialize;
use time::OffsetDateTime;

use super::{PriceSignal, PriceSlot, SLOT, SlotTable};
use crate::tracing::prelude::*;

pub const DEFAULT_BASE_URL: &str = "https://api.octopus.energy";

const DEFAULT_REFRESH: Duration = Duration::from_secs(30 * 60);

#[derive(Debug, Deserialize)]
struct RatesPage {
    results: Vec<Rate>,
}

#[derive(Debug, Deserialize)]
struct Rate {
    value_inc_vat: f64,
    #[serde(with = "time::serde::rfc3339")]
    valid_from: OffsetDateTime,
    #[serde(default, with = "time::serde::rfc3339::option")]
    valid_to: Option<OffsetDateTime>,
}

#[derive(Debug)]
struct Cache {
    table: SlotTable,
    fetched_at: OffsetDateTime,
}

#[derive(Debug)]
pub struct AgileClient {
    client: Client,
    url: String,
    refresh: Duration,
    cache: Mutex<Option<Cache>>,
}

impl AgileClient {
    /// `product` like `AGILE-24-10-01`, `tariff` like
    /// `E-1R-AGILE-24-10-01-C` (the last letter is the region).
    pub fn new(base_url: &str, product: &str, tariff: &str) -> anyhow::Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .context("failed to build HTTP client")?;
        let url = format!(
            "{}/v1/products/{product}/electricity-tariffs/{tariff}/standard-unit-rates/",
            base_url.trim_end_matches('/')
        );
        Ok(Self {
            client,
            url,
            refresh: DEFAULT_REFRESH,
            cache: Mutex::new(None),
        })
    }

    pub fn with_refresh(mut self, refresh: Duration) -> Self {
        self.refresh = refresh;
        self
    }

    async fn fetch(&self) -> anyhow::Result<SlotTable> {
        debug!(url = %self.url, "Fetching Agile rates");
        let page: RatesPage = self
            .client
            .get(&self.url)
            .send()
            .await
            .context("rates request failed")?
            .error_for_status()
            .context("rates request rejected")?
            .json()
            .await
            .context("rates response malformed")?;

        let slots = page
            .results
            .into_iter()
            .map(|r| PriceSlot {
                start: r.valid_from,
                end: r.valid_to.unwrap_or(r.valid_from + SLOT),
                price: r.value_inc_vat,
            })
            .collect();
        Ok(SlotTable::new(slots))
    }

    fn is_fresh(&self, cache: &Cache, now: OffsetDateTime) -> bool {
        let age = now - cache.fetched_at;
        let reaches_next = cache.table.horizon().is_some_and(|h| h > now + SLOT);
        age < self.refresh && reaches_next
    }

    /// Cached table, refetched when stale. A failed refetch falls back to
    /// whatever is cached.
    async fn table(&self, now: OffsetDateTime) -> anyhow::Result<SlotTable> {
        {
            let cache = self.cache.lock();
            if let Some(cache) = cache.as_ref() {
                if self.is_fresh(cache, now) {
                    return Ok(cache.table.clone());
                }
            }
        }

        match self.fetch().await {
            Ok(table) => {
                info!(slots = table.len(), horizon = ?table.horizon(), "Agile rates refreshed");
                *self.cache.lock() = Some(Cache {
                    table: table.clone(),
                    fetched_at: now,
                });
                Ok(table)
            }
            Err(e) => match self.cache.lock().as_ref() {
                Some(cache) => {
                    warn!(error = %e, "Agile refresh failed, using cached rates");
                    Ok(cache.table.clone())
                }
                None => Err(e),
            },
        }
    }
}

#[async_trait]
impl PriceSignal for AgileClient {
    async fn current_slot(&self, now: OffsetDateTime) -> anyhow::Result<Option<PriceSlot>> {
        Ok(self.table(now).await?.slot_at(now).copied())
    }

    async fn next_slot(&self, now: OffsetDateTime) -> anyhow::Result<Option<PriceSlot>> {
        Ok(self.table(now).await?.next_after(now).copied())
    }
}

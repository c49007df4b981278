//! Storage collaborator.
//!
//! The controller reads its fleet definition and last strategy state
//! through [`Persistence`] and writes back snapshots, transitions and the
//! audit trail. Band tables are validated on the way in, so a table that
//! would make evaluation ambiguous is never stored.

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::config::FleetConfig;
use crate::dispatch::AuditEntry;
use crate::error::Result;
use crate::strategy::{Band, BandTable, BandTransition, StrategyState};
use crate::telemetry::TelemetrySnapshot;

#[async_trait]
pub trait Persistence: Send + Sync {
    async fn load_fleet(&self) -> Result<FleetConfig>;

    /// Validate and store a new band table.
    async fn save_bands(&self, bands: Vec<Band>) -> Result<BandTable>;

    async fn load_strategy_state(&self) -> Result<Option<StrategyState>>;

    async fn save_strategy_state(&self, state: &StrategyState) -> Result<()>;

    async fn save_transition(&self, transition: &BandTransition) -> Result<()>;

    async fn save_snapshots(&self, snapshots: &[Arc<TelemetrySnapshot>]) -> Result<()>;

    async fn save_audit(&self, entry: &AuditEntry) -> Result<()>;
}

/// Bounded history kept by [`MemoryPersistence`].
const HISTORY: usize = 1024;

#[derive(Debug)]
struct Stored {
    fleet: FleetConfig,
    state: Option<StrategyState>,
    transitions: VecDeque<BandTransition>,
    snapshots: VecDeque<Arc<TelemetrySnapshot>>,
    audit: VecDeque<AuditEntry>,
}

/// In-process storage. Histories are ring buffers of the most recent
/// entries.
#[derive(Debug)]
pub struct MemoryPersistence {
    inner: RwLock<Stored>,
}

impl MemoryPersistence {
    pub fn new(fleet: FleetConfig) -> Self {
        Self {
            inner: RwLock::new(Stored {
                fleet,
                state: None,
                transitions: VecDeque::new(),
                snapshots: VecDeque::new(),
                audit: VecDeque::new(),
            }),
        }
    }

    pub fn with_state(self, state: StrategyState) -> Self {
        self.inner.write().state = Some(state);
        self
    }

    pub fn transitions(&self) -> Vec<BandTransition> {
        self.inner.read().transitions.iter().cloned().collect()
    }

    pub fn audit(&self) -> Vec<AuditEntry> {
        self.inner.read().audit.iter().cloned().collect()
    }

    pub fn snapshot_count(&self) -> usize {
        self.inner.read().snapshots.len()
    }
}

fn push_bounded<T>(queue: &mut VecDeque<T>, item: T) {
    if queue.len() == HISTORY {
        queue.pop_front();
    }
    queue.push_back(item);
}

#[async_trait]
impl Persistence for MemoryPersistence {
    async fn load_fleet(&self) -> Result<FleetConfig> {
        Ok(self.inner.read().fleet.clone())
    }

    async fn save_bands(&self, bands: Vec<Band>) -> Result<BandTable> {
        let table = BandTable::new(bands)?;
        let mut inner = self.inner.write();
        let mut candidate = inner.fleet.clone();
        candidate.bands = table.clone();
        candidate.validate()?;
        inner.fleet = candidate;
        Ok(table)
    }

    async fn load_strategy_state(&self) -> Result<Option<StrategyState>> {
        Ok(self.inner.read().state.clone())
    }

    async fn save_strategy_state(&self, state: &StrategyState) -> Result<()> {
        self.inner.write().state = Some(state.clone());
        Ok(())
    }

    async fn save_transition(&self, transition: &BandTransition) -> Result<()> {
        push_bounded(&mut self.inner.write().transitions, transition.clone());
        Ok(())
    }

    async fn save_snapshots(&self, snapshots: &[Arc<TelemetrySnapshot>]) -> Result<()> {
        let mut inner = self.inner.write();
        for snapshot in snapshots {
            push_bounded(&mut inner.snapshots, Arc::clone(snapshot));
        }
        Ok(())
    }

    async fn save_audit(&self, entry: &AuditEntry) -> Result<()> {
        push_bounded(&mut self.inner.write().audit, entry.clone());
        Ok(())
    }
}

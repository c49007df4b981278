//! Protocol adapters, one per device family.
//!
//! Every family speaks a different management protocol. The adapters hide
//! that behind [`DeviceAdapter`]: telemetry comes back as a normalized
//! [`TelemetrySnapshot`], and control operations take family-neutral
//! arguments. Adapters never retry and never sleep; the dispatcher owns
//! retry policy and the poller owns the timeout budget.

pub mod avalon;
pub mod bitaxe;
pub mod nmminer;
#[cfg(test)]
pub(crate) mod testing;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use strum::Display;
use thiserror::Error;

use crate::device::{Capabilities, Device, DeviceFamily, Mode, Pool};
use crate::telemetry::TelemetrySnapshot;

pub use avalon::AvalonAdapter;
pub use bitaxe::BitaxeAdapter;
pub use nmminer::{NmMinerAdapter, PacketCache, UdpListener};

/// Failures an adapter can report.
///
/// Transport errors (`Timeout`, `Protocol`, `Io`, `NoData`) count toward
/// the offline threshold and may be retried. The rest are semantic: the
/// device answered and said no, so retrying cannot help.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AdapterError {
    #[error("timed out")]
    Timeout,

    #[error("malformed response: {0}")]
    Protocol(String),

    #[error("I/O error: {0}")]
    Io(String),

    #[error("no telemetry received")]
    NoData,

    #[error("operation not supported by {0}")]
    Unsupported(DeviceFamily),

    #[error("authentication failed")]
    Auth,

    #[error("device rejected command: {0}")]
    Rejected(String),
}

impl AdapterError {
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            AdapterError::Timeout
                | AdapterError::Protocol(_)
                | AdapterError::Io(_)
                | AdapterError::NoData
        )
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            AdapterError::Timeout => ErrorKind::Timeout,
            AdapterError::Protocol(_) => ErrorKind::Protocol,
            AdapterError::Io(_) => ErrorKind::Io,
            AdapterError::NoData => ErrorKind::NoData,
            AdapterError::Unsupported(_) => ErrorKind::Unsupported,
            AdapterError::Auth => ErrorKind::Auth,
            AdapterError::Rejected(_) => ErrorKind::Rejected,
        }
    }
}

impl From<std::io::Error> for AdapterError {
    fn from(e: std::io::Error) -> Self {
        match e.kind() {
            std::io::ErrorKind::TimedOut => AdapterError::Timeout,
            _ => AdapterError::Io(e.to_string()),
        }
    }
}

impl From<serde_json::Error> for AdapterError {
    fn from(e: serde_json::Error) -> Self {
        AdapterError::Protocol(e.to_string())
    }
}

/// Payload-free discriminant of [`AdapterError`], for audit records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ErrorKind {
    Timeout,
    Protocol,
    Io,
    NoData,
    Unsupported,
    Auth,
    Rejected,
}

pub type AdapterResult<T> = std::result::Result<T, AdapterError>;

/// How far a write is known to have landed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Delivery {
    /// The device acknowledged the change.
    Confirmed,
    /// Sent without acknowledgement. Confirmed later by telemetry, if at all.
    Sent,
}

#[async_trait]
pub trait DeviceAdapter: Send + Sync {
    fn family(&self) -> DeviceFamily;

    fn capabilities(&self) -> Capabilities {
        self.family().capabilities()
    }

    async fn fetch_telemetry(&self, device: &Device) -> AdapterResult<TelemetrySnapshot>;

    async fn set_mode(&self, device: &Device, mode: Mode) -> AdapterResult<()> {
        let _ = mode;
        Err(AdapterError::Unsupported(device.family))
    }

    async fn switch_pool(&self, device: &Device, pool: &Pool) -> AdapterResult<Delivery> {
        let _ = pool;
        Err(AdapterError::Unsupported(device.family))
    }

    async fn restart(&self, device: &Device) -> AdapterResult<()> {
        Err(AdapterError::Unsupported(device.family))
    }

    /// Point every device of this family at `pool` in one operation.
    async fn broadcast_pool(&self, pool: &Pool) -> AdapterResult<Delivery> {
        let _ = pool;
        Err(AdapterError::Unsupported(self.family()))
    }
}

/// Routes each device to the adapter for its family.
#[derive(Clone, Default)]
pub struct AdapterSet {
    adapters: HashMap<DeviceFamily, Arc<dyn DeviceAdapter>>,
}

impl AdapterSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `adapter` for its family, replacing any earlier one.
    pub fn with(mut self, adapter: Arc<dyn DeviceAdapter>) -> Self {
        self.adapters.insert(adapter.family(), adapter);
        self
    }

    pub fn for_device(&self, device: &Device) -> AdapterResult<&Arc<dyn DeviceAdapter>> {
        self.for_family(device.family)
    }

    pub fn for_family(&self, family: DeviceFamily) -> AdapterResult<&Arc<dyn DeviceAdapter>> {
        self.adapters
            .get(&family)
            .ok_or(AdapterError::Unsupported(family))
    }
}

impl std::fmt::Debug for AdapterSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdapterSet")
            .field("families", &self.adapters.keys().collect::<Vec<_>>())
            .finish()
    }
}

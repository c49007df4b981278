//! Normalized telemetry and the store that holds the latest of it.

mod snapshot;
pub mod store;

pub use snapshot::{Extras, TelemetrySnapshot};
pub use store::{DeviceStatus, DeviceTelemetry, FleetView, TelemetryStore};

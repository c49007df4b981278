//! Fleet controller for home mining devices.
//!
//! hashfleet polls a heterogeneous fleet of small miners over their native
//! management protocols, keeps the latest telemetry in memory, and drives
//! two control loops on top of it: a price-band strategy that moves the
//! fleet between coins and power modes as energy prices change, and a
//! trigger/action automation engine. Every side effect on a device goes
//! through a single dispatcher.

pub mod adapter;
pub mod api;
pub mod api_client;
pub mod automation;
pub mod config;
pub mod controller;
pub mod device;
pub mod dispatch;
pub mod error;
pub mod events;
pub mod notify;
pub mod persistence;
pub mod poller;
pub mod price;
pub mod strategy;
pub mod telemetry;
pub mod tracing;
pub mod types;

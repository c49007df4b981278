//! Read-only HTTP status API.

mod convert;
pub mod server;
mod v0;

pub use server::{SharedState, router, serve};

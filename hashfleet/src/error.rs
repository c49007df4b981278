//! Crate-level error type.
//!
//! Component errors ([`AdapterError`], [`ConfigError`]) stay specific to the
//! component; this type is what crosses module boundaries and what the
//! controller and collaborators return.

use thiserror::Error;

use crate::adapter::AdapterError;
use crate::strategy::ConfigError;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("adapter error: {0}")]
    Adapter(#[from] AdapterError),

    #[error("configuration rejected: {0}")]
    Config(#[from] ConfigError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

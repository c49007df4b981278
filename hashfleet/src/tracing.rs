//! Logging setup and the crate-wide tracing prelude.
//!
//! Modules import `crate::tracing::prelude::*` rather than the `tracing`
//! macros directly, so the logging backend can change in one place.

use tracing_subscriber::{EnvFilter, fmt, prelude::*};

pub mod prelude {
    pub use tracing::{debug, error, info, trace, warn};
}

/// Default filter when `RUST_LOG` is unset.
const DEFAULT_FILTER: &str = "info";

/// Install the global subscriber.
///
/// When started by systemd (`JOURNAL_STREAM` is set) logs go to the
/// journal with structured fields intact. Otherwise they go to stdout.
/// Falls back to stdout if the journald socket cannot be opened.
pub fn init_journald_or_stdout() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    if std::env::var_os("JOURNAL_STREAM").is_some() {
        match tracing_journald::layer() {
            Ok(journald) => {
                tracing_subscriber::registry()
                    .with(filter)
                    .with(journald)
                    .init();
                return;
            }
            Err(e) => {
                eprintln!("journald unavailable, logging to stdout: {e}");
            }
        }
    }

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false))
        .init();
}

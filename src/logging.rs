//! Logging init: tracing subscriber with an env filter.
//!
//! The mobile hosts forward stderr to logcat / os_log, so a plain fmt layer on
//! stderr is all the core installs. `RUST_LOG` overrides the default filter.

use crate::error::{OfflineError, Result};
use tracing_subscriber::EnvFilter;

const DEFAULT_FILTER: &str = "info,offline_core=debug";

/// Install the global subscriber. Fails if one is already installed.
pub fn init() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_ansi(false)
        .try_init()
        .map_err(|e| OfflineError::configuration(format!("logging already initialized: {}", e)))?;

    tracing::debug!("offline-core logging initialized");
    Ok(())
}

/// Install the subscriber if none is present yet; used by hosts that may call
/// into the core more than once per process.
pub fn init_once() {
    let _ = init();
}

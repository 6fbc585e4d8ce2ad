//! Logging setup
//!
//! The ledger never installs a global subscriber. Callers build a
//! [`Dispatch`] and hand it to [`crate::LedgerService::new`].

use crate::config::LoggingConfig;
use crate::{LedgerError, Result};
use tracing::Dispatch;
use tracing_subscriber::EnvFilter;

/// Build a fmt dispatcher from logging configuration
pub fn build_dispatch(config: &LoggingConfig) -> Result<Dispatch> {
    let filter = EnvFilter::try_new(&config.level)
        .map_err(|e| LedgerError::Config(format!("Invalid log filter {:?}: {}", config.level, e)))?;

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_file(true)
        .with_line_number(true)
        .with_thread_ids(true)
        .with_target(false);

    let dispatch = if config.json {
        Dispatch::new(builder.json().finish())
    } else {
        Dispatch::new(builder.finish())
    };

    Ok(dispatch)
}

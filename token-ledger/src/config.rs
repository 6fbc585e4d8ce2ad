//! Configuration for the token ledger

use crate::{LedgerError, Result};
use config::{Environment, File};
use serde::{Deserialize, Serialize};
use std::env;

/// Ledger configuration
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct Config {
    /// PostgreSQL connection settings
    pub database: DatabaseConfig,
    /// Log output settings
    pub logging: LoggingConfig,
}

/// PostgreSQL pool configuration
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct DatabaseConfig {
    /// Connection URL
    pub url: String,
    /// Pool upper bound
    pub max_connections: u32,
    /// Connections kept open while idle
    pub min_connections: u32,
    /// Seconds to wait for a free connection
    pub acquire_timeout_secs: u64,
    /// Run embedded migrations when connecting
    pub run_migrations: bool,
}

/// Logging configuration
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct LoggingConfig {
    /// `EnvFilter` directive, e.g. `info` or `token_ledger=debug`
    pub level: String,
    /// Emit JSON lines instead of human-readable output
    pub json: bool,
}

impl Config {
    /// Load from defaults, an optional config file and the environment
    pub fn from_env() -> Result<Self> {
        dotenv::dotenv().ok();

        let environment = env::var("ENVIRONMENT").unwrap_or_else(|_| "development".to_string());

        let mut builder = config::Config::builder()
            .set_default("database.url", "")?
            .set_default("database.max_connections", 10)?
            .set_default("database.min_connections", 2)?
            .set_default("database.acquire_timeout_secs", 5)?
            .set_default("database.run_migrations", false)?
            .set_default("logging.level", "info")?
            .set_default("logging.json", false)?;

        if let Ok(config_file) = env::var("CONFIG_FILE") {
            builder = builder.add_source(File::with_name(&config_file).required(false));
        } else {
            builder = builder.add_source(
                File::with_name(&format!("config/{}", environment)).required(false),
            );
        }

        builder = builder.add_source(Environment::with_prefix("TOKEN_LEDGER").separator("__"));

        if let Ok(db_url) = env::var("DATABASE_URL") {
            builder = builder.set_override("database.url", db_url)?;
        }

        if let Ok(level) = env::var("RUST_LOG") {
            builder = builder.set_override("logging.level", level)?;
        }

        let config: Config = builder.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Reject settings the pool cannot work with
    pub fn validate(&self) -> Result<()> {
        if self.database.url.is_empty() {
            return Err(LedgerError::Config("Database URL is required".to_string()));
        }

        if self.database.max_connections == 0 {
            return Err(LedgerError::Config(
                "max_connections must be at least 1".to_string(),
            ));
        }

        if self.database.min_connections > self.database.max_connections {
            return Err(LedgerError::Config(format!(
                "min_connections ({}) exceeds max_connections ({})",
                self.database.min_connections, self.database.max_connections
            )));
        }

        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database: DatabaseConfig {
                url: String::new(),
                max_connections: 10,
                min_connections: 2,
                acquire_timeout_secs: 5,
                run_migrations: false,
            },
            logging: LoggingConfig {
                level: "info".to_string(),
                json: false,
            },
        }
    }
}

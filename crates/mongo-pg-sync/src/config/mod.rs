//! Configuration loading and validation.

mod types;
mod validation;

pub use types::*;

use crate::error::{Result, SyncError};
use std::path::Path;

impl Config {
    /// Load configuration from a YAML file, applying environment overrides.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let mut config: Config = serde_yaml::from_str(&content)?;
        config.apply_env_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: Config = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        validation::validate(self)
    }

    /// Override connection settings from the environment.
    ///
    /// `lookup` is `std::env::var` in production; tests pass a closure over a map.
    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(uri) = lookup("MONGO_URI") {
            self.source.uri = uri;
        }
        if let Some(db) = lookup("MONGO_DATABASE") {
            self.source.database = db;
        }
        if let Some(host) = lookup("PG_HOST") {
            self.target.host = host;
        }
        if let Some(port) = lookup("PG_PORT") {
            self.target.port = port
                .parse()
                .map_err(|_| SyncError::Config(format!("PG_PORT is not a valid port: '{}'", port)))?;
        }
        if let Some(db) = lookup("PG_DATABASE") {
            self.target.database = db;
        }
        if let Some(user) = lookup("PG_USER") {
            self.target.user = user;
        }
        if let Some(password) = lookup("PG_PASSWORD") {
            self.target.password = password;
        }
        if let Some(mode) = lookup("PG_SSLMODE") {
            self.target.ssl_mode = mode;
        }
        Ok(())
    }

    /// Copy with credentials masked, for printing.
    pub fn redacted(&self) -> Self {
        let mut config = self.clone();
        config.source.uri = REDACTED.to_string();
        if !config.target.password.is_empty() {
            config.target.password = REDACTED.to_string();
        }
        config
    }
}

const REDACTED: &str = "[REDACTED]";

impl TargetConfig {
    /// Build a tokio-postgres config for the warehouse.
    pub fn pg_config(&self) -> tokio_postgres::Config {
        let mut pg_config = tokio_postgres::Config::new();
        pg_config
            .host(&self.host)
            .port(self.port)
            .dbname(&self.database)
            .user(&self.user)
            .password(&self.password)
            .application_name("mongo-pg-sync");
        pg_config
    }
}

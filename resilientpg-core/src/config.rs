//! Construction-time configuration and validation.

use std::time::Duration;

use crate::error::{Error, Result};

/// Fields required by every client, single-connection or pooled.
#[derive(Debug, Clone)]
pub struct ConnectConfig {
    pub host: String,
    pub port: u16,
    pub database: String,
    pub user: String,
    pub password: String,
}

impl ConnectConfig {
    /// Validates that every required field (host, port, database, user,
    /// password) is present; missing any of these is an initialization
    /// error.
    pub fn validate(&self) -> Result<()> {
        if self.host.trim().is_empty() {
            return Err(Error::Validation("host is required".into()));
        }
        if self.port == 0 {
            return Err(Error::Validation("port is required".into()));
        }
        if self.database.trim().is_empty() {
            return Err(Error::Validation("database is required".into()));
        }
        if self.user.trim().is_empty() {
            return Err(Error::Validation("user is required".into()));
        }
        if self.password.is_empty() {
            return Err(Error::Validation("password is required".into()));
        }
        Ok(())
    }

    pub fn to_tokio_postgres_config(&self) -> tokio_postgres::Config {
        let mut config = tokio_postgres::Config::new();
        config
            .host(&self.host)
            .port(self.port)
            .dbname(&self.database)
            .user(&self.user)
            .password(&self.password);
        config
    }
}

/// Pool-only sizing, with defaults applied at [`PoolConfig::validate`] time
/// rather than left to the caller.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub min: u32,
    pub max: u32,
    pub connect_timeout: Option<Duration>,
    pub idle_timeout: Option<Duration>,
    pub max_lifetime: Option<Duration>,
}

impl PoolConfig {
    pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
    pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(60);
    pub const DEFAULT_MAX_LIFETIME: Duration = Duration::from_secs(600);

    /// Validates `min ≤ max`, `max ≥ 2`, `min ≥ 0` and fills in the unset
    /// timeouts with their defaults, returning the normalized copy.
    pub fn validate(&self) -> Result<PoolConfig> {
        if self.max < 2 {
            return Err(Error::Validation("pool max must be >= 2".into()));
        }
        if self.min > self.max {
            return Err(Error::Validation("pool min must be <= max".into()));
        }

        Ok(PoolConfig {
            min: self.min,
            max: self.max,
            connect_timeout: Some(self.connect_timeout.unwrap_or(Self::DEFAULT_CONNECT_TIMEOUT)),
            idle_timeout: Some(self.idle_timeout.unwrap_or(Self::DEFAULT_IDLE_TIMEOUT)),
            max_lifetime: Some(self.max_lifetime.unwrap_or(Self::DEFAULT_MAX_LIFETIME)),
        })
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min: 0,
            max: 4,
            connect_timeout: None,
            idle_timeout: None,
            max_lifetime: None,
        }
    }
}

/// `maxAttempts`, shared by QueryExecutor and TxExecutor.
#[derive(Debug, Clone, Copy)]
pub struct ExecutorConfig {
    pub max_attempts: u32,
}

impl ExecutorConfig {
    /// Floors `max_attempts` at 1; `execute` always runs at least once.
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
        }
    }
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self::new(3)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_connect() -> ConnectConfig {
        ConnectConfig {
            host: "localhost".into(),
            port: 5432,
            database: "d".into(),
            user: "u".into(),
            password: "p".into(),
        }
    }

    #[test]
    fn missing_host_is_a_validation_error() {
        let mut cfg = valid_connect();
        cfg.host = String::new();
        assert!(matches!(cfg.validate(), Err(Error::Validation(_))));
    }

    #[test]
    fn complete_config_validates() {
        assert!(valid_connect().validate().is_ok());
    }

    #[test]
    fn pool_rejects_max_under_two() {
        let cfg = PoolConfig {
            max: 1,
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn pool_rejects_min_over_max() {
        let cfg = PoolConfig {
            min: 5,
            max: 4,
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn pool_fills_in_default_timeouts() {
        let cfg = PoolConfig::default().validate().unwrap();
        assert_eq!(cfg.connect_timeout, Some(PoolConfig::DEFAULT_CONNECT_TIMEOUT));
        assert_eq!(cfg.idle_timeout, Some(PoolConfig::DEFAULT_IDLE_TIMEOUT));
        assert_eq!(cfg.max_lifetime, Some(PoolConfig::DEFAULT_MAX_LIFETIME));
    }

    #[test]
    fn executor_config_floors_at_one() {
        assert_eq!(ExecutorConfig::new(0).max_attempts, 1);
    }
}

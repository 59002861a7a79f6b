//! Facade-level configuration: connection parameters and TLS mode.

use std::env;

use resilientpg_core::config::ConnectConfig;
use resilientpg_core::error::{Error, Result};

/// TLS mode for the underlying connection. Only `None` is wired up today;
/// the variant exists so a rustls-based connector can be plugged in later
/// without breaking callers.
#[derive(Debug, Clone, Default)]
pub enum TlsMode {
    #[default]
    None,
}

/// Everything needed to open a connection or pool: the required connection
/// fields plus the TLS mode.
#[derive(Debug, Clone)]
pub struct ResilientPgConfig {
    pub connect: ConnectConfig,
    pub tls: TlsMode,
}

impl ResilientPgConfig {
    pub fn new(connect: ConnectConfig) -> Self {
        Self {
            connect,
            tls: TlsMode::None,
        }
    }

    /// Reads `PGHOST`/`PGPORT`/`PGDATABASE`/`PGUSER`/`PGPASSWORD`, falling
    /// back to `RESILIENTPG_HOST` etc. for any unset `PG*` variable, the
    /// same two-tier convention `libpq`-based clients follow.
    pub fn from_env() -> Result<Self> {
        let host = env_var("PGHOST", "RESILIENTPG_HOST")?;
        let port = env_var("PGPORT", "RESILIENTPG_PORT")?
            .parse::<u16>()
            .map_err(|_| Error::Validation("PGPORT/RESILIENTPG_PORT must be a valid port number".into()))?;
        let database = env_var("PGDATABASE", "RESILIENTPG_DATABASE")?;
        let user = env_var("PGUSER", "RESILIENTPG_USER")?;
        let password = env_var("PGPASSWORD", "RESILIENTPG_PASSWORD")?;

        let connect = ConnectConfig {
            host,
            port,
            database,
            user,
            password,
        };
        connect.validate()?;

        Ok(Self::new(connect))
    }
}

fn env_var(primary: &str, fallback: &str) -> Result<String> {
    env::var(primary).or_else(|_| env::var(fallback)).map_err(|_| {
        Error::Validation(format!("missing environment variable {primary} (or {fallback})"))
    })
}

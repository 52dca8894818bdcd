use std::time::Duration;

use clap::Parser;

use crate::resolver::DSN_SEPARATOR;
use crate::{ResolverError, Result};

#[derive(Parser, Debug, Clone)]
#[command(name = "dbresolver")]
#[command(about = "dbresolver - primary/replica database router\nOpens the configured databases and reports their health", long_about = None)]
pub struct Config {
    // Data sources
    #[arg(long, env = "DBRESOLVER_DSN", help = "Semicolon-separated data source names, primary first. Overrides the component settings below")]
    pub dsn: Option<String>,

    #[arg(long, default_value = "postgres", env = "DBRESOLVER_DRIVER", help = "Driver name: postgres or sqlite")]
    pub driver: String,

    // Primary (read-write) PostgreSQL settings
    #[arg(long, default_value = "localhost", env = "POSTGRES_RW_HOST")]
    pub host: String,

    #[arg(long, default_value = "5432", env = "POSTGRES_RW_PORT")]
    pub port: u16,

    #[arg(long, default_value = "postgres", env = "POSTGRES_RW_USER")]
    pub user: String,

    #[arg(long, default_value = "", env = "POSTGRES_RW_PASSWORD", hide_env_values = true)]
    pub password: String,

    #[arg(long, default_value = "postgres", env = "POSTGRES_RW_DB")]
    pub dbname: String,

    // Replica (read-only) PostgreSQL settings; unset fields fall back to the primary's
    #[arg(long, env = "POSTGRES_RO_HOST", help = "Replica host. Without it the primary serves reads too")]
    pub replica_host: Option<String>,

    #[arg(long, env = "POSTGRES_RO_PORT")]
    pub replica_port: Option<u16>,

    #[arg(long, env = "POSTGRES_RO_USER")]
    pub replica_user: Option<String>,

    #[arg(long, env = "POSTGRES_RO_PASSWORD", hide_env_values = true)]
    pub replica_password: Option<String>,

    #[arg(long, env = "POSTGRES_RO_DB")]
    pub replica_dbname: Option<String>,

    // Pool configuration
    #[arg(long, default_value = "2", env = "DB_INITIALIZATION_CONNECT_TIMEOUT", help = "Connect timeout in seconds")]
    pub connect_timeout: u64,

    #[arg(long, default_value = "100", env = "DB_MAX_OPEN_CONNECTION", help = "Maximum open connections per database, 0 for unlimited")]
    pub max_open_conns: usize,

    #[arg(long, default_value = "10", env = "DB_MAX_IDLE_CONNECTION", help = "Maximum idle connections per database")]
    pub max_idle_conns: usize,

    #[arg(long, default_value = "300", env = "DB_MAX_CONN_LIFE_TIME", help = "Maximum connection lifetime in seconds, 0 to reuse forever")]
    pub conn_max_lifetime: u64,

    #[arg(long, default_value = "10", env = "DBRESOLVER_PING_TIMEOUT", help = "Health check ping timeout in seconds")]
    pub ping_timeout: u64,

    #[arg(long, default_value = "info", env = "DBRESOLVER_LOG_LEVEL")]
    pub log_level: String,
}

/// Connection settings for one PostgreSQL server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PostgresSettings {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub dbname: String,
    pub connect_timeout: u64,
}

impl PostgresSettings {
    pub fn connection_string_with_timeout(&self) -> String {
        format!(
            "host={} port={} user={} password={} dbname={} connect_timeout={}",
            quote(&self.host),
            self.port,
            quote(&self.user),
            quote(&self.password),
            quote(&self.dbname),
            self.connect_timeout
        )
    }
}

/// Quotes a key/value connection string value when it is empty or contains spaces,
/// quotes or backslashes.
fn quote(value: &str) -> String {
    if !value.is_empty() && !value.contains(|c: char| c.is_whitespace() || c == '\'' || c == '\\') {
        return value.to_string();
    }
    let mut quoted = String::with_capacity(value.len() + 2);
    quoted.push('\'');
    for c in value.chars() {
        if c == '\'' || c == '\\' {
            quoted.push('\\');
        }
        quoted.push(c);
    }
    quoted.push('\'');
    quoted
}

impl Config {
    /// Load configuration from command line and environment variables
    pub fn load() -> Self {
        Config::parse()
    }

    pub fn primary(&self) -> PostgresSettings {
        PostgresSettings {
            host: self.host.clone(),
            port: self.port,
            user: self.user.clone(),
            password: self.password.clone(),
            dbname: self.dbname.clone(),
            connect_timeout: self.connect_timeout,
        }
    }

    pub fn replica(&self) -> Option<PostgresSettings> {
        let host = self.replica_host.clone()?;
        Some(PostgresSettings {
            host,
            port: self.replica_port.unwrap_or(self.port),
            user: self.replica_user.clone().unwrap_or_else(|| self.user.clone()),
            password: self
                .replica_password
                .clone()
                .unwrap_or_else(|| self.password.clone()),
            dbname: self.replica_dbname.clone().unwrap_or_else(|| self.dbname.clone()),
            connect_timeout: self.connect_timeout,
        })
    }

    /// The `primary;replica` list handed to [`LogicalDb::open`](crate::LogicalDb::open).
    ///
    /// An explicit `--dsn` wins. Otherwise the list is built from the PostgreSQL component
    /// settings, which only makes sense for the postgres driver.
    pub fn data_source_names(&self) -> Result<String> {
        if let Some(dsn) = self.dsn.as_deref().filter(|dsn| !dsn.trim().is_empty()) {
            return Ok(dsn.to_string());
        }
        if self.driver != "postgres" {
            return Err(ResolverError::Config(format!(
                "driver \"{}\" needs an explicit --dsn",
                self.driver
            )));
        }

        let mut dsns = self.primary().connection_string_with_timeout();
        if let Some(replica) = self.replica() {
            dsns.push(DSN_SEPARATOR);
            dsns.push_str(&replica.connection_string_with_timeout());
        }
        Ok(dsns)
    }

    pub fn connect_timeout_duration(&self) -> Duration {
        Duration::from_secs(self.connect_timeout)
    }

    pub fn conn_max_lifetime_duration(&self) -> Duration {
        Duration::from_secs(self.conn_max_lifetime)
    }

    pub fn ping_timeout_duration(&self) -> Duration {
        Duration::from_secs(self.ping_timeout)
    }
}

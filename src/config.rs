use std::env;
use std::net::SocketAddr;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{0} environment variable is not set")]
    MissingVar(&'static str),

    #[error("invalid listen address {addr:?}: {source}")]
    BadListenAddr {
        addr: String,
        source: std::net::AddrParseError,
    },
}

/// Process configuration, read once at startup. A missing required value is
/// fatal; there is no runtime reload.
#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub prometheus_url: String,
    pub listen_addr: SocketAddr,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let database_url = require_var("NEPHTHYS_DATABASE_URL")?;
        let prometheus_url = require_var("PROMETHEUS_URL")?;

        let host = env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string());
        let port = env::var("PORT").unwrap_or_else(|_| "8000".to_string());
        let addr = format!("{host}:{port}");
        let listen_addr = addr
            .parse()
            .map_err(|source| ConfigError::BadListenAddr { addr, source })?;

        Ok(Self {
            database_url,
            prometheus_url,
            listen_addr,
        })
    }
}

fn require_var(key: &'static str) -> Result<String, ConfigError> {
    match env::var(key) {
        Ok(value) if !value.is_empty() => Ok(value),
        _ => Err(ConfigError::MissingVar(key)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_database_url_is_fatal() {
        temp_env::with_vars(
            [
                ("NEPHTHYS_DATABASE_URL", None::<&str>),
                ("PROMETHEUS_URL", Some("http://prometheus:9090")),
            ],
            || {
                let err = Config::from_env().unwrap_err();
                assert!(matches!(err, ConfigError::MissingVar("NEPHTHYS_DATABASE_URL")));
            },
        );
    }

    #[test]
    fn defaults_and_overrides_for_listener() {
        temp_env::with_vars(
            [
                ("NEPHTHYS_DATABASE_URL", Some("postgres://localhost/nephthys")),
                ("PROMETHEUS_URL", Some("http://prometheus:9090")),
                ("HOST", None::<&str>),
                ("PORT", None::<&str>),
            ],
            || {
                let cfg = Config::from_env().unwrap();
                assert_eq!(cfg.listen_addr.to_string(), "0.0.0.0:8000");
            },
        );

        temp_env::with_vars(
            [
                ("NEPHTHYS_DATABASE_URL", Some("postgres://localhost/nephthys")),
                ("PROMETHEUS_URL", Some("http://prometheus:9090")),
                ("HOST", Some("127.0.0.1")),
                ("PORT", Some("9100")),
            ],
            || {
                let cfg = Config::from_env().unwrap();
                assert_eq!(cfg.listen_addr.to_string(), "127.0.0.1:9100");
            },
        );
    }

    #[test]
    fn empty_value_counts_as_missing() {
        temp_env::with_vars(
            [
                ("NEPHTHYS_DATABASE_URL", Some("postgres://localhost/nephthys")),
                ("PROMETHEUS_URL", Some("")),
            ],
            || {
                let err = Config::from_env().unwrap_err();
                assert!(matches!(err, ConfigError::MissingVar("PROMETHEUS_URL")));
            },
        );
    }
}

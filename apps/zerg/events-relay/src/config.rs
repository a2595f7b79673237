//! Configuration for the events relay service

use cloudevents_nats::{Error, ProtocolConfig};
use std::env;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Config {
    /// NATS binding settings
    pub protocol: ProtocolConfig,

    /// Name used for the tracer and as the heartbeat event source
    pub service_name: String,

    /// Interval between heartbeat events; disabled when unset or zero
    pub heartbeat_interval: Option<Duration>,

    /// JSON logs instead of pretty output
    pub is_production: bool,
}

impl Config {
    pub fn from_env() -> Result<Self, Error> {
        let heartbeat_interval = match env::var("HEARTBEAT_INTERVAL_SECS") {
            Ok(value) => {
                let secs: u64 = value.parse().map_err(|_| {
                    Error::config(format!(
                        "failed to parse HEARTBEAT_INTERVAL_SECS: {value:?}"
                    ))
                })?;
                (secs > 0).then(|| Duration::from_secs(secs))
            }
            Err(_) => None,
        };

        Ok(Self {
            protocol: ProtocolConfig::from_env()?,
            service_name: env::var("SERVICE_NAME").unwrap_or_else(|_| "events-relay".to_string()),
            heartbeat_interval,
            is_production: is_production(),
        })
    }
}

/// `APP_ENV=production` (case-insensitive) selects production mode.
pub fn is_production() -> bool {
    env::var("APP_ENV")
        .map(|e| e.eq_ignore_ascii_case("production"))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        temp_env::with_vars(
            [
                ("NATS_SUBJECT", Some("orders")),
                ("SERVICE_NAME", None),
                ("HEARTBEAT_INTERVAL_SECS", None),
                ("APP_ENV", None),
            ],
            || {
                let config = Config::from_env().unwrap();
                assert_eq!(config.service_name, "events-relay");
                assert!(config.heartbeat_interval.is_none());
                assert!(!config.is_production);
                assert_eq!(config.protocol.subject, "orders");
            },
        );
    }

    #[test]
    fn test_heartbeat_and_production() {
        temp_env::with_vars(
            [
                ("NATS_SUBJECT", Some("orders")),
                ("HEARTBEAT_INTERVAL_SECS", Some("30")),
                ("APP_ENV", Some("Production")),
            ],
            || {
                let config = Config::from_env().unwrap();
                assert_eq!(config.heartbeat_interval, Some(Duration::from_secs(30)));
                assert!(config.is_production);
            },
        );
    }

    #[test]
    fn test_zero_heartbeat_disables_it() {
        temp_env::with_vars(
            [
                ("NATS_SUBJECT", Some("orders")),
                ("HEARTBEAT_INTERVAL_SECS", Some("0")),
            ],
            || {
                assert!(Config::from_env().unwrap().heartbeat_interval.is_none());
            },
        );
    }

    #[test]
    fn test_invalid_heartbeat() {
        temp_env::with_vars(
            [
                ("NATS_SUBJECT", Some("orders")),
                ("HEARTBEAT_INTERVAL_SECS", Some("soon")),
            ],
            || {
                let err = Config::from_env().unwrap_err();
                assert!(err.to_string().contains("HEARTBEAT_INTERVAL_SECS"));
            },
        );
    }
}

//! Layer configuration.
//!
//! Everything here has a default, and every field can be overridden from the
//! environment.

use crate::capture::MAX_BODY;
use crate::error::ConfigError;
use std::str::FromStr;
use tracing::warn;

/// Default `meta.environment` tag.
pub const DEFAULT_ENVIRONMENT: &str = "production";

/// Default `meta.destination` host.
pub const DEFAULT_SERVER_HOST: &str = "localhost";

/// Runtime configuration for [`MetloLayer`](crate::layer::MetloLayer).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetloConfig {
    /// Reported as `meta.destination`
    pub server_host: String,

    /// Reported as `meta.destinationPort`
    pub server_port: u16,

    /// Reported as `meta.environment`
    pub environment: String,

    /// Response body bytes retained per trace.
    pub max_body: usize,

    /// Upper bound on detached dispatch tasks in flight.
    ///
    /// `None` leaves dispatch unbounded. When the bound is reached new traces
    /// are dropped rather than queued.
    pub max_in_flight_dispatches: Option<usize>,
}

impl Default for MetloConfig {
    fn default() -> Self {
        Self {
            server_host: DEFAULT_SERVER_HOST.to_string(),
            server_port: 0,
            environment: DEFAULT_ENVIRONMENT.to_string(),
            max_body: MAX_BODY,
            max_in_flight_dispatches: None,
        }
    }
}

impl MetloConfig {
    /// Create a configuration reporting `server_host:server_port` as the
    /// destination, with every other field at its default.
    pub fn new(server_host: impl Into<String>, server_port: u16) -> Self {
        Self {
            server_host: server_host.into(),
            server_port,
            ..Self::default()
        }
    }

    /// Load configuration from environment variables with defaults.
    ///
    /// # Environment Variables
    ///
    /// - `METLO_SERVER_HOST` (default: localhost)
    /// - `METLO_SERVER_PORT` (default: 0)
    /// - `METLO_ENVIRONMENT` (default: production)
    /// - `METLO_MAX_BODY` (default: 10240)
    /// - `METLO_MAX_IN_FLIGHT` (default: unbounded; 0 also means unbounded)
    ///
    /// Values that fail to parse are logged and replaced by the default.
    pub fn from_env() -> Self {
        let default = Self::default();

        Self {
            server_host: std::env::var("METLO_SERVER_HOST").unwrap_or(default.server_host),
            server_port: parse_or_default("METLO_SERVER_PORT", default.server_port),
            environment: std::env::var("METLO_ENVIRONMENT").unwrap_or(default.environment),
            max_body: parse_or_default("METLO_MAX_BODY", default.max_body),
            max_in_flight_dispatches: in_flight(parse_or_default("METLO_MAX_IN_FLIGHT", 0)),
        }
    }

    /// Like [`from_env`](Self::from_env), but rejects unparsable values.
    pub fn try_from_env() -> Result<Self, ConfigError> {
        let default = Self::default();

        Ok(Self {
            server_host: std::env::var("METLO_SERVER_HOST").unwrap_or(default.server_host),
            server_port: parse_var("METLO_SERVER_PORT")?.unwrap_or(default.server_port),
            environment: std::env::var("METLO_ENVIRONMENT").unwrap_or(default.environment),
            max_body: parse_var("METLO_MAX_BODY")?.unwrap_or(default.max_body),
            max_in_flight_dispatches: in_flight(parse_var("METLO_MAX_IN_FLIGHT")?.unwrap_or(0)),
        })
    }
}

fn in_flight(limit: usize) -> Option<usize> {
    (limit > 0).then_some(limit)
}

fn parse_var<T>(var: &'static str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(var) {
        Ok(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|e: T::Err| ConfigError::InvalidValue {
                var,
                value,
                reason: e.to_string(),
            }),
        Err(_) => Ok(None),
    }
}

fn parse_or_default<T>(var: &'static str, default: T) -> T
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match parse_var(var) {
        Ok(value) => value.unwrap_or(default),
        Err(e) => {
            warn!(error = %e, "Ignoring invalid configuration value");
            default
        }
    }
}

//! Error types for the instrumentation layer.
//!
//! None of these ever reach the client. Trace extraction errors are logged and
//! replaced with defaults; configuration errors surface only from
//! [`MetloConfig::try_from_env`](crate::config::MetloConfig::try_from_env).

use thiserror::Error;

/// Degraded extraction while assembling a trace.
#[derive(Error, Debug)]
pub enum TraceError {
    /// The connection's remote address was not recorded on the request.
    #[error("no remote address available for request")]
    MissingRemoteAddr,

    /// The remote address is not in `host:port` form.
    #[error("invalid remote address {addr:?}: {reason}")]
    InvalidRemoteAddr {
        /// Address as seen on the request
        addr: String,
        /// What was wrong with it
        reason: &'static str,
    },

    /// The port part of the remote address is not a valid port number.
    #[error("invalid port in remote address {addr:?}")]
    InvalidPort {
        /// Address as seen on the request
        addr: String,
        #[source]
        source: std::num::ParseIntError,
    },
}

/// Invalid configuration value.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// An environment variable holds a value that does not parse.
    #[error("invalid value {value:?} for {var}: {reason}")]
    InvalidValue {
        /// Variable name
        var: &'static str,
        /// Raw value
        value: String,
        /// Parser message
        reason: String,
    },
}

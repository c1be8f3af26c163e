//! Error types for the configuration model and the API client.

use thiserror::Error;

/// Errors raised while interpreting a configuration value.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// The network tag is not one of tcp/tcp4/tcp6/udp/udp4/udp6.
    #[error("unknown network '{0}'")]
    UnknownNetwork(String),

    /// The balance tag is not RR or LC.
    #[error("unknown balance policy '{0}'")]
    UnknownBalance(String),
}

/// Errors raised by [`ApiClient`](crate::ApiClient) calls.
#[derive(Debug, Error)]
pub enum ClientError {
    /// Transport-level failure talking to the proxy.
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// The proxy answered with an error status and an `{"error": …}` body.
    #[error("proxy returned {status}: {message}")]
    Api { status: u16, message: String },
}

//! Error types for configuration validation and registry operations.

use std::fmt;

use capstan_client::{ConfigError, Family};
use thiserror::Error;

/// Errors raised while validating, starting, or mutating a single service.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("service name must not be empty")]
    EmptyName,

    #[error("backend name must not be empty")]
    EmptyBackendName,

    /// Unknown network or balance tag.
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("invalid address '{0}': expected host:port")]
    InvalidAddress(String),

    #[error("no usable address for '{0}'")]
    Unresolvable(String),

    #[error("{network} address {address} already bound by service '{service}'")]
    AddressInUse {
        network: String,
        address: String,
        service: String,
    },

    #[error("duplicate service name '{0}'")]
    DuplicateService(String),

    #[error("backend '{backend}' is {backend_family} but its service is {service_family}")]
    NetworkMismatch {
        backend: String,
        backend_family: Family,
        service_family: Family,
    },

    #[error("duplicate backend name '{0}'")]
    DuplicateBackend(String),

    #[error("failed to bind {address}: {source}")]
    Bind {
        address: String,
        #[source]
        source: std::io::Error,
    },

    #[error("service '{0}' not found")]
    NotFound(String),

    #[error("backend '{0}' not found")]
    BackendNotFound(String),
}

/// Aggregated per-service failures from a bulk configuration update.
/// Services that applied cleanly stay applied; this carries the rest.
#[derive(Debug)]
pub struct RegistryError {
    pub errors: Vec<(String, ServiceError)>,
}

impl fmt::Display for RegistryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "config errors: ")?;
        for (i, (name, err)) in self.errors.iter().enumerate() {
            if i > 0 {
                write!(f, "; ")?;
            }
            write!(f, "{name}: {err}")?;
        }
        Ok(())
    }
}

impl std::error::Error for RegistryError {}

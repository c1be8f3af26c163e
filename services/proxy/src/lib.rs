//! Capstan proxy
//!
//! A live-reconfigurable layer-4 (TCP/UDP) reverse proxy and load
//! balancer. Each named service owns one listener and balances new
//! connections across a dynamic pool of backends (weighted round robin or
//! least connections) with passive TCP health checking. The running
//! configuration is mutated through an HTTP/JSON control plane without
//! restarting the process and without touching in-flight connections,
//! except those whose listener is being replaced.

pub mod api;
pub mod error;
pub mod persistence;
pub mod proxy;

pub use api::{create_router, AppState};
pub use error::{RegistryError, ServiceError};
pub use persistence::StateFiles;
pub use proxy::{Backend, Registry, Service};

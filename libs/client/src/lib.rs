//! Configuration model and control-plane client for the capstan proxy.
//!
//! The daemon, its tests, and external tooling all speak the same JSON
//! shapes defined here: [`Config`], [`ServiceConfig`], and
//! [`BackendConfig`] for configuration, [`ServiceStat`] and
//! [`BackendStat`] for live counters. [`ApiClient`] wraps the HTTP
//! control plane.

mod api;
mod config;
mod error;
mod stats;

pub use api::ApiClient;
pub use config::{
    BalancePolicy, BackendConfig, Config, Family, Network, ServiceConfig, DEFAULT_BALANCE,
    DEFAULT_CHECK_INTERVAL_MS, DEFAULT_FALL, DEFAULT_NETWORK, DEFAULT_RISE, DEFAULT_WEIGHT,
};
pub use error::{ClientError, ConfigError};
pub use stats::{BackendStat, ServiceStat, StatsResponse};

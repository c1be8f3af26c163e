//! The JSON configuration model shared by the daemon, the API client, and
//! anything that posts configs at a running proxy.
//!
//! All durations are milliseconds. A zero (or absent) field means "unset":
//! timeouts stay disabled, tunables pick up their defaults during
//! normalisation. Two configs are compared only after normalisation so that
//! an explicit `"balance": "RR"` and an omitted balance never read as a
//! change.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Default interval between health probes, in milliseconds.
pub const DEFAULT_CHECK_INTERVAL_MS: u64 = 2000;
/// Default consecutive-success threshold before a down backend is marked up.
pub const DEFAULT_RISE: u32 = 2;
/// Default consecutive-failure threshold before an up backend is marked down.
pub const DEFAULT_FALL: u32 = 2;
/// Default backend weight for round-robin balancing.
pub const DEFAULT_WEIGHT: u32 = 1;
/// Default balancing policy tag.
pub const DEFAULT_BALANCE: &str = "RR";
/// Default network tag.
pub const DEFAULT_NETWORK: &str = "tcp";

/// Network family a service or backend speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Network {
    Tcp,
    Tcp4,
    Tcp6,
    Udp,
    Udp4,
    Udp6,
}

/// The protocol side of a [`Network`], used to check that a backend is
/// compatible with its service (tcp matches tcp/tcp4/tcp6, udp likewise).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Family {
    Tcp,
    Udp,
}

impl Network {
    pub fn family(self) -> Family {
        match self {
            Network::Tcp | Network::Tcp4 | Network::Tcp6 => Family::Tcp,
            Network::Udp | Network::Udp4 | Network::Udp6 => Family::Udp,
        }
    }

    pub fn is_udp(self) -> bool {
        self.family() == Family::Udp
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Network::Tcp => "tcp",
            Network::Tcp4 => "tcp4",
            Network::Tcp6 => "tcp6",
            Network::Udp => "udp",
            Network::Udp4 => "udp4",
            Network::Udp6 => "udp6",
        }
    }
}

impl FromStr for Network {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "tcp" => Ok(Network::Tcp),
            "tcp4" => Ok(Network::Tcp4),
            "tcp6" => Ok(Network::Tcp6),
            "udp" => Ok(Network::Udp),
            "udp4" => Ok(Network::Udp4),
            "udp6" => Ok(Network::Udp6),
            other => Err(ConfigError::UnknownNetwork(other.to_string())),
        }
    }
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Display for Family {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Family::Tcp => f.write_str("tcp"),
            Family::Udp => f.write_str("udp"),
        }
    }
}

/// Balancing policy for picking a backend per new connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BalancePolicy {
    RoundRobin,
    LeastConn,
}

impl FromStr for BalancePolicy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "RR" => Ok(BalancePolicy::RoundRobin),
            "LC" => Ok(BalancePolicy::LeastConn),
            other => Err(ConfigError::UnknownBalance(other.to_string())),
        }
    }
}

impl fmt::Display for BalancePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BalancePolicy::RoundRobin => f.write_str("RR"),
            BalancePolicy::LeastConn => f.write_str("LC"),
        }
    }
}

/// Global configuration for all services. Top-level fields supply defaults
/// for services that leave the corresponding field unset.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    #[serde(skip_serializing_if = "String::is_empty")]
    pub balance: String,
    #[serde(skip_serializing_if = "is_zero_u64")]
    pub check_interval: u64,
    #[serde(skip_serializing_if = "is_zero_u32")]
    pub fall: u32,
    #[serde(skip_serializing_if = "is_zero_u32")]
    pub rise: u32,
    #[serde(skip_serializing_if = "is_zero_u64")]
    pub client_timeout: u64,
    #[serde(skip_serializing_if = "is_zero_u64")]
    pub server_timeout: u64,
    #[serde(skip_serializing_if = "is_zero_u64")]
    pub connect_timeout: u64,
    pub services: Vec<ServiceConfig>,
}

impl Config {
    /// Merge the top-level defaults into a service config. Fields the
    /// service sets explicitly win.
    pub fn service_with_defaults(&self, svc: &ServiceConfig) -> ServiceConfig {
        let mut merged = svc.clone();
        if merged.balance.is_empty() {
            merged.balance = self.balance.clone();
        }
        if merged.check_interval == 0 {
            merged.check_interval = self.check_interval;
        }
        if merged.fall == 0 {
            merged.fall = self.fall;
        }
        if merged.rise == 0 {
            merged.rise = self.rise;
        }
        if merged.client_timeout == 0 {
            merged.client_timeout = self.client_timeout;
        }
        if merged.server_timeout == 0 {
            merged.server_timeout = self.server_timeout;
        }
        if merged.connect_timeout == 0 {
            merged.connect_timeout = self.connect_timeout;
        }
        merged
    }
}

/// Configuration for one service: a single listening address and the
/// backends proxied behind it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    pub name: String,
    pub address: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub network: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub balance: String,
    #[serde(skip_serializing_if = "is_zero_u64")]
    pub check_interval: u64,
    #[serde(skip_serializing_if = "is_zero_u32")]
    pub fall: u32,
    #[serde(skip_serializing_if = "is_zero_u32")]
    pub rise: u32,
    #[serde(skip_serializing_if = "is_zero_u64")]
    pub client_timeout: u64,
    #[serde(skip_serializing_if = "is_zero_u64")]
    pub server_timeout: u64,
    #[serde(skip_serializing_if = "is_zero_u64")]
    pub connect_timeout: u64,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub backends: Vec<BackendConfig>,
}

impl ServiceConfig {
    /// Fill every defaulted field so two configs can be compared, and two
    /// normalised snapshots round-trip byte-identically. Backends inherit
    /// the service network when they leave theirs unset.
    pub fn normalized(&self) -> ServiceConfig {
        let mut cfg = self.clone();
        if cfg.network.is_empty() {
            cfg.network = DEFAULT_NETWORK.to_string();
        }
        if cfg.balance.is_empty() {
            cfg.balance = DEFAULT_BALANCE.to_string();
        }
        if cfg.check_interval == 0 {
            cfg.check_interval = DEFAULT_CHECK_INTERVAL_MS;
        }
        if cfg.fall == 0 {
            cfg.fall = DEFAULT_FALL;
        }
        if cfg.rise == 0 {
            cfg.rise = DEFAULT_RISE;
        }
        for backend in &mut cfg.backends {
            if backend.weight == 0 {
                backend.weight = DEFAULT_WEIGHT;
            }
            if backend.network.is_empty() {
                backend.network = cfg.network.clone();
            }
        }
        cfg
    }

    /// Compare service-level settings, ignoring the backend lists. Defaults
    /// are normalised on both sides first so an omitted field never reads
    /// as a change.
    pub fn equal_ignoring_backends(&self, other: &ServiceConfig) -> bool {
        let mut a = self.normalized();
        let mut b = other.normalized();
        a.backends.clear();
        b.backends.clear();
        a == b
    }

    /// Full equality including backends, after normalisation. Backend
    /// order matters: it is the round-robin rotation order.
    pub fn deep_equal(&self, other: &ServiceConfig) -> bool {
        self.normalized() == other.normalized()
    }
}

/// Configuration for a single backend within a service.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    pub name: String,
    pub address: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub check_address: String,
    #[serde(skip_serializing_if = "is_zero_u32")]
    pub weight: u32,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub network: String,
}

fn is_zero_u64(v: &u64) -> bool {
    *v == 0
}

fn is_zero_u32(v: &u32) -> bool {
    *v == 0
}

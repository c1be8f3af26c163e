//! Wire types for the stats endpoints.

use serde::{Deserialize, Serialize};

/// Live counters and configuration for one backend.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BackendStat {
    pub name: String,
    pub address: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub check_address: String,
    pub network: String,
    pub weight: u32,
    pub up: bool,
    pub active: u64,
    pub conns: u64,
    pub sent: u64,
    pub received: u64,
    pub errors: u64,
}

/// Live counters and configuration for one service. Byte and error counts
/// aggregate the service's backends plus the service's own accept-path
/// errors.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServiceStat {
    pub name: String,
    pub address: String,
    pub network: String,
    pub balance: String,
    pub check_interval: u64,
    pub fall: u32,
    pub rise: u32,
    pub client_timeout: u64,
    pub server_timeout: u64,
    pub connect_timeout: u64,
    pub sent: u64,
    pub received: u64,
    pub errors: u64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub backends: Vec<BackendStat>,
}

/// Response body for the root stats endpoint.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StatsResponse {
    pub services: Vec<ServiceStat>,
}

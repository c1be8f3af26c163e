//! HTTP client for driving a running proxy's control plane.

use std::time::Duration;

use serde::Deserialize;

use crate::config::{BackendConfig, Config, ServiceConfig};
use crate::error::ClientError;
use crate::stats::{BackendStat, ServiceStat, StatsResponse};

#[derive(Debug, Deserialize)]
struct ErrorBody {
    error: String,
}

/// Client for the proxy's HTTP control plane.
pub struct ApiClient {
    http: reqwest::Client,
    base_url: String,
}

impl ApiClient {
    /// Create a client for a control plane at `addr` (`host:port`).
    pub fn new(addr: &str) -> Self {
        Self {
            http: reqwest::Client::builder()
                .timeout(Duration::from_secs(2))
                .build()
                .unwrap_or_default(),
            base_url: format!("http://{addr}"),
        }
    }

    /// Fetch the running configuration, safe to re-POST.
    pub async fn get_config(&self) -> Result<Config, ClientError> {
        let resp = self
            .http
            .get(format!("{}/_config", self.base_url))
            .send()
            .await?;
        Self::decode(resp).await
    }

    /// Fetch live stats for every service and backend.
    pub async fn get_stats(&self) -> Result<StatsResponse, ClientError> {
        let resp = self.http.get(format!("{}/", self.base_url)).send().await?;
        Self::decode(resp).await
    }

    /// Fetch live stats for one service.
    pub async fn service_stats(&self, service: &str) -> Result<ServiceStat, ClientError> {
        let resp = self
            .http
            .get(format!("{}/{service}", self.base_url))
            .send()
            .await?;
        Self::decode(resp).await
    }

    /// Fetch live stats for one backend.
    pub async fn backend_stats(
        &self,
        service: &str,
        backend: &str,
    ) -> Result<BackendStat, ClientError> {
        let resp = self
            .http
            .get(format!("{}/{service}/{backend}", self.base_url))
            .send()
            .await?;
        Self::decode(resp).await
    }

    /// Create or replace a service. With `backends_only` only the backend
    /// list is diffed and the listener is left untouched.
    pub async fn update_service(
        &self,
        name: &str,
        cfg: &ServiceConfig,
        backends_only: bool,
    ) -> Result<ServiceStat, ClientError> {
        let mut url = format!("{}/{name}", self.base_url);
        if backends_only {
            url.push_str("?backends_only=1");
        }
        let resp = self.http.put(url).json(cfg).send().await?;
        Self::decode(resp).await
    }

    /// Stop and remove a service.
    pub async fn remove_service(&self, name: &str) -> Result<StatsResponse, ClientError> {
        let resp = self
            .http
            .delete(format!("{}/{name}", self.base_url))
            .send()
            .await?;
        Self::decode(resp).await
    }

    /// Create or replace a single backend without bouncing the listener.
    pub async fn update_backend(
        &self,
        service: &str,
        name: &str,
        cfg: &BackendConfig,
    ) -> Result<BackendStat, ClientError> {
        let resp = self
            .http
            .put(format!("{}/{service}/{name}", self.base_url))
            .json(cfg)
            .send()
            .await?;
        Self::decode(resp).await
    }

    /// Remove a single backend from a service.
    pub async fn remove_backend(
        &self,
        service: &str,
        name: &str,
    ) -> Result<ServiceStat, ClientError> {
        let resp = self
            .http
            .delete(format!("{}/{service}/{name}", self.base_url))
            .send()
            .await?;
        Self::decode(resp).await
    }

    async fn decode<T: serde::de::DeserializeOwned>(
        resp: reqwest::Response,
    ) -> Result<T, ClientError> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp.json().await?);
        }
        let message = match resp.json::<ErrorBody>().await {
            Ok(body) => body.error,
            Err(_) => status
                .canonical_reason()
                .unwrap_or("unknown error")
                .to_string(),
        };
        Err(ClientError::Api {
            status: status.as_u16(),
            message,
        })
    }
}

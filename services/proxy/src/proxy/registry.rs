//! The registry: process-wide owner of all services.
//!
//! Configuration mutations are serialised by a single async lock, so two
//! concurrent updates never interleave their service start/stop side
//! effects. A bulk update diffs the posted config against the running set
//! by name: new services start, missing services stop, and existing ones
//! either have only their backends diffed (when the service-level settings
//! are unchanged, or the caller asked for a backends-only apply) or are
//! replaced outright, bouncing the listener. Partial success is allowed;
//! per-service failures are collected and returned together.

use std::collections::{HashMap, HashSet};
use std::str::FromStr;
use std::sync::Arc;

use capstan_client::{BackendConfig, BalancePolicy, Config, Family, Network, ServiceConfig, ServiceStat};
use tokio::sync::Mutex;
use tracing::{info, warn};

use super::backend::Backend;
use super::service::Service;
use crate::error::{RegistryError, ServiceError};

/// Process-wide owner of all services.
pub struct Registry {
    services: Mutex<HashMap<String, Arc<Service>>>,
}

impl Registry {
    pub fn new() -> Self {
        Self {
            services: Mutex::new(HashMap::new()),
        }
    }

    /// Apply a full configuration: start services new to the config, stop
    /// services missing from it, and update the rest. Top-level fields of
    /// `cfg` supply defaults for its services. Errors are collected per
    /// service; services that applied cleanly stay applied.
    ///
    /// The batch is resolved against its target state before anything
    /// mutates: an incoming address conflicts only with another entry of
    /// the batch (first entry wins), never with the current address of a
    /// service this same call is about to move. Services whose settings
    /// changed are all stopped before any replacement starts, so a single
    /// update can swap listen addresses between services.
    pub async fn update_config(&self, cfg: &Config) -> Result<(), RegistryError> {
        let mut services = self.services.lock().await;
        let mut errors = Vec::new();

        let incoming: HashSet<&str> = cfg.services.iter().map(|s| s.name.as_str()).collect();
        let removed: Vec<String> = services
            .keys()
            .filter(|name| !incoming.contains(name.as_str()))
            .cloned()
            .collect();
        for name in removed {
            if let Some(service) = services.remove(&name) {
                service.stop().await;
                info!(service = %name, "Service removed");
            }
        }

        let batch: Vec<ServiceConfig> = cfg
            .services
            .iter()
            .map(|svc| cfg.service_with_defaults(svc).normalized())
            .collect();

        let mut accepted: Vec<ServiceConfig> = Vec::with_capacity(batch.len());
        for svc_cfg in batch {
            match validate_batch_entry(&accepted, &svc_cfg) {
                Ok(()) => accepted.push(svc_cfg),
                Err(e) => {
                    warn!(service = %svc_cfg.name, error = %e, "Service config rejected");
                    errors.push((svc_cfg.name.clone(), e));
                }
            }
        }

        // Unchanged services take the backends-only path in place; the
        // rest are stopped first, freeing their addresses for the batch.
        let mut to_start = Vec::new();
        for svc_cfg in accepted {
            match services.get(&svc_cfg.name).cloned() {
                Some(existing) if existing.config_matches(&svc_cfg) => {
                    existing.set_backends(&svc_cfg.backends).await;
                }
                Some(existing) => {
                    info!(service = %svc_cfg.name, "Replacing service");
                    existing.stop().await;
                    services.remove(&svc_cfg.name);
                    to_start.push(svc_cfg);
                }
                None => to_start.push(svc_cfg),
            }
        }

        for svc_cfg in to_start {
            match Self::start_service(&svc_cfg).await {
                Ok(service) => {
                    services.insert(svc_cfg.name.clone(), service);
                }
                Err(e) => {
                    warn!(service = %svc_cfg.name, error = %e, "Service config rejected");
                    errors.push((svc_cfg.name.clone(), e));
                }
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(RegistryError { errors })
        }
    }

    /// Create or replace a single service. With `backends_only` (or when
    /// the service-level settings are unchanged) only the backend list is
    /// diffed and the listener stays up.
    pub async fn update_service(
        &self,
        cfg: ServiceConfig,
        backends_only: bool,
    ) -> Result<Arc<Service>, ServiceError> {
        let mut services = self.services.lock().await;
        Self::apply_service(&mut services, cfg.normalized(), backends_only).await
    }

    /// Stop and remove a service. Returns it, or `None` if absent.
    pub async fn remove_service(&self, name: &str) -> Option<Arc<Service>> {
        let mut services = self.services.lock().await;
        let service = services.remove(name)?;
        service.stop().await;
        info!(service = %name, "Service removed");
        Some(service)
    }

    /// Create or replace one backend of a service without bouncing its
    /// listener.
    pub async fn update_backend(
        &self,
        service: &str,
        cfg: BackendConfig,
    ) -> Result<Arc<Backend>, ServiceError> {
        let services = self.services.lock().await;
        let svc = services
            .get(service)
            .ok_or_else(|| ServiceError::NotFound(service.to_string()))?;

        let (network, _) = svc.listen_key();
        let mut cfg = cfg;
        if cfg.weight == 0 {
            cfg.weight = capstan_client::DEFAULT_WEIGHT;
        }
        if cfg.network.is_empty() {
            cfg.network = network.to_string();
        }
        validate_backend(&cfg, Network::from_str(network)?.family())?;

        Ok(svc.upsert_backend(cfg).await)
    }

    /// Remove one backend from a service. Returns the service for stats
    /// readback.
    pub async fn remove_backend(
        &self,
        service: &str,
        backend: &str,
    ) -> Result<Arc<Service>, ServiceError> {
        let services = self.services.lock().await;
        let svc = services
            .get(service)
            .ok_or_else(|| ServiceError::NotFound(service.to_string()))?;
        svc.remove_backend(backend)
            .await
            .ok_or_else(|| ServiceError::BackendNotFound(backend.to_string()))?;
        Ok(Arc::clone(svc))
    }

    pub async fn get_service(&self, name: &str) -> Option<Arc<Service>> {
        self.services.lock().await.get(name).cloned()
    }

    /// A configuration value that round-trips: feeding it back to
    /// [`update_config`](Self::update_config) is a no-op.
    pub async fn snapshot_config(&self) -> Config {
        let services = self.service_list().await;
        let mut list = Vec::with_capacity(services.len());
        for service in services {
            list.push(service.config_snapshot().await);
        }
        list.sort_by(|a, b| a.name.cmp(&b.name));
        Config {
            services: list,
            ..Default::default()
        }
    }

    /// Live stats for all services; safe concurrent with traffic.
    pub async fn snapshot_stats(&self) -> Vec<ServiceStat> {
        let services = self.service_list().await;
        let mut stats = Vec::with_capacity(services.len());
        for service in services {
            stats.push(service.stats().await);
        }
        stats.sort_by(|a, b| a.name.cmp(&b.name));
        stats
    }

    /// Stop every service. Used at process shutdown.
    pub async fn stop_all(&self) {
        let mut services = self.services.lock().await;
        for (_, service) in services.drain() {
            service.stop().await;
        }
    }

    async fn service_list(&self) -> Vec<Arc<Service>> {
        self.services.lock().await.values().cloned().collect()
    }

    async fn apply_service(
        services: &mut HashMap<String, Arc<Service>>,
        cfg: ServiceConfig,
        backends_only: bool,
    ) -> Result<Arc<Service>, ServiceError> {
        validate_service(services, &cfg)?;

        match services.get(&cfg.name).cloned() {
            Some(existing) if backends_only || existing.config_matches(&cfg) => {
                existing.set_backends(&cfg.backends).await;
                Ok(existing)
            }
            Some(existing) => {
                info!(service = %cfg.name, "Replacing service");
                existing.stop().await;
                services.remove(&cfg.name);
                let service = Self::start_service(&cfg).await?;
                services.insert(cfg.name.clone(), Arc::clone(&service));
                Ok(service)
            }
            None => {
                let service = Self::start_service(&cfg).await?;
                services.insert(cfg.name.clone(), Arc::clone(&service));
                Ok(service)
            }
        }
    }

    async fn start_service(cfg: &ServiceConfig) -> Result<Arc<Service>, ServiceError> {
        let service = Service::new(cfg)?;
        service.start().await?;
        Ok(service)
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

/// Validation for a single-service update: the settings themselves, plus
/// the listen address against every other running service (they all keep
/// their addresses when only one service changes).
fn validate_service(
    services: &HashMap<String, Arc<Service>>,
    cfg: &ServiceConfig,
) -> Result<(), ServiceError> {
    validate_service_settings(cfg)?;

    for (name, other) in services {
        if name == &cfg.name {
            continue;
        }
        let (other_network, other_address) = other.listen_key();
        if other_network == cfg.network && other_address == cfg.address {
            return Err(ServiceError::AddressInUse {
                network: cfg.network.clone(),
                address: cfg.address.clone(),
                service: name.clone(),
            });
        }
    }

    Ok(())
}

/// Validation for one entry of a bulk update: the settings themselves,
/// plus name and listen-address uniqueness against the entries already
/// accepted from the same batch. Running services are not consulted —
/// every one of them is being updated or removed by the same call, so
/// only the batch's target state can conflict.
fn validate_batch_entry(
    accepted: &[ServiceConfig],
    cfg: &ServiceConfig,
) -> Result<(), ServiceError> {
    validate_service_settings(cfg)?;

    for other in accepted {
        if other.name == cfg.name {
            return Err(ServiceError::DuplicateService(cfg.name.clone()));
        }
        if other.network == cfg.network && other.address == cfg.address {
            return Err(ServiceError::AddressInUse {
                network: cfg.network.clone(),
                address: cfg.address.clone(),
                service: other.name.clone(),
            });
        }
    }

    Ok(())
}

fn validate_service_settings(cfg: &ServiceConfig) -> Result<(), ServiceError> {
    if cfg.name.is_empty() {
        return Err(ServiceError::EmptyName);
    }

    let network = Network::from_str(&cfg.network)?;
    BalancePolicy::from_str(&cfg.balance)?;

    if !is_host_port(&cfg.address) {
        return Err(ServiceError::InvalidAddress(cfg.address.clone()));
    }

    let mut seen = HashSet::new();
    for backend in &cfg.backends {
        if !seen.insert(backend.name.as_str()) {
            return Err(ServiceError::DuplicateBackend(backend.name.clone()));
        }
        validate_backend(backend, network.family())?;
    }

    Ok(())
}

fn validate_backend(cfg: &BackendConfig, service_family: Family) -> Result<(), ServiceError> {
    if cfg.name.is_empty() {
        return Err(ServiceError::EmptyBackendName);
    }
    if !is_host_port(&cfg.address) {
        return Err(ServiceError::InvalidAddress(cfg.address.clone()));
    }
    if !cfg.check_address.is_empty() && !is_host_port(&cfg.check_address) {
        return Err(ServiceError::InvalidAddress(cfg.check_address.clone()));
    }

    let backend_family = Network::from_str(&cfg.network)?.family();
    if backend_family != service_family {
        return Err(ServiceError::NetworkMismatch {
            backend: cfg.name.clone(),
            backend_family,
            service_family,
        });
    }
    Ok(())
}

fn is_host_port(address: &str) -> bool {
    match address.rsplit_once(':') {
        Some((_, port)) => port.parse::<u16>().is_ok(),
        None => false,
    }
}

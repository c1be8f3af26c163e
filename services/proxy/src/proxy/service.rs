//! Services: one listener, one accept loop, a set of backends.
//!
//! A service owns exactly one TCP or UDP listener plus the task running its
//! accept (or datagram) loop. New connections ask the balancing policy for
//! an ordered candidate list and fail over to the next candidate on dial
//! errors. Stopping a service closes the listener and the backend health
//! checks; connections already being proxied are left to finish on their
//! own timeouts.

use std::io;
use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use capstan_client::{BackendConfig, BalancePolicy, Family, Network, ServiceConfig, ServiceStat};
use tokio::net::{lookup_host, TcpListener, TcpStream, UdpSocket};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::backend::{Backend, BackendSettings};
use super::balance::{self, RoundRobinState};
use super::shovel;
use crate::error::ServiceError;

const MAX_DATAGRAM_SIZE: usize = 65536;

struct Inner {
    backends: Vec<Arc<Backend>>,
    rr: RoundRobinState,
}

/// A named listener balancing connections across a set of backends.
pub struct Service {
    /// Normalised service-level config, backends stripped. The live
    /// backend list is the source of truth for snapshots.
    cfg: ServiceConfig,
    network: Network,
    policy: BalancePolicy,
    client_timeout: Duration,
    server_timeout: Duration,
    backend_settings: BackendSettings,
    sent: AtomicU64,
    rcvd: AtomicU64,
    errors: AtomicU64,
    inner: Mutex<Inner>,
    shutdown: watch::Sender<bool>,
    accept_task: Mutex<Option<JoinHandle<()>>>,
    local_addr: OnceLock<SocketAddr>,
}

impl Service {
    /// Build a service from a normalised config. Backends are created but
    /// nothing runs until [`start`](Self::start).
    pub fn new(cfg: &ServiceConfig) -> Result<Arc<Self>, ServiceError> {
        let network = Network::from_str(&cfg.network)?;
        let policy = BalancePolicy::from_str(&cfg.balance)?;

        let backend_settings = BackendSettings {
            check_interval: Duration::from_millis(cfg.check_interval),
            rise: cfg.rise,
            fall: cfg.fall,
            connect_timeout: Duration::from_millis(cfg.connect_timeout),
        };

        let backends = cfg
            .backends
            .iter()
            .map(|b| Backend::new(b.clone(), backend_settings.clone()))
            .collect();

        let mut service_cfg = cfg.clone();
        service_cfg.backends.clear();

        let (shutdown, _) = watch::channel(false);
        Ok(Arc::new(Self {
            cfg: service_cfg,
            network,
            policy,
            client_timeout: Duration::from_millis(cfg.client_timeout),
            server_timeout: Duration::from_millis(cfg.server_timeout),
            backend_settings,
            sent: AtomicU64::new(0),
            rcvd: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            inner: Mutex::new(Inner {
                backends,
                rr: RoundRobinState::default(),
            }),
            shutdown,
            accept_task: Mutex::new(None),
            local_addr: OnceLock::new(),
        }))
    }

    pub fn name(&self) -> &str {
        &self.cfg.name
    }

    /// The `(network, address)` pair this service binds, for uniqueness
    /// checks.
    pub fn listen_key(&self) -> (&str, &str) {
        (&self.cfg.network, &self.cfg.address)
    }

    /// The bound socket address, once started.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr.get().copied()
    }

    /// Whether `other` matches this service's settings, ignoring backends.
    pub fn config_matches(&self, other: &ServiceConfig) -> bool {
        self.cfg.equal_ignoring_backends(other)
    }

    /// Bind the listener and launch the accept loop and backend health
    /// checks. A bind failure leaves nothing running.
    pub async fn start(self: &Arc<Self>) -> Result<(), ServiceError> {
        let shutdown_rx = self.shutdown.subscribe();

        let handle = match self.network.family() {
            Family::Tcp => {
                let bind_addr = self.resolve_bind_addr().await?;
                let listener = TcpListener::bind(bind_addr).await.map_err(|e| {
                    ServiceError::Bind {
                        address: self.cfg.address.clone(),
                        source: e,
                    }
                })?;
                if let Ok(addr) = listener.local_addr() {
                    let _ = self.local_addr.set(addr);
                }
                let service = Arc::clone(self);
                tokio::spawn(service.accept_loop(listener, shutdown_rx))
            }
            Family::Udp => {
                let bind_addr = self.resolve_bind_addr().await?;
                let socket = UdpSocket::bind(bind_addr).await.map_err(|e| {
                    ServiceError::Bind {
                        address: self.cfg.address.clone(),
                        source: e,
                    }
                })?;
                if let Ok(addr) = socket.local_addr() {
                    let _ = self.local_addr.set(addr);
                }
                let service = Arc::clone(self);
                tokio::spawn(service.datagram_loop(socket, shutdown_rx))
            }
        };

        {
            let inner = self.inner.lock().await;
            for backend in &inner.backends {
                backend.start().await;
            }
        }

        *self.accept_task.lock().await = Some(handle);

        info!(
            service = %self.cfg.name,
            network = %self.cfg.network,
            address = %self.cfg.address,
            balance = %self.cfg.balance,
            "Service started"
        );
        Ok(())
    }

    /// Close the listener, stop the backends, and wait for the accept loop
    /// to quiesce. In-flight proxied connections are not interrupted.
    pub async fn stop(&self) {
        let _ = self.shutdown.send(true);

        let backends = { self.inner.lock().await.backends.clone() };
        for backend in &backends {
            backend.stop().await;
        }

        let handle = self.accept_task.lock().await.take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }

        info!(service = %self.cfg.name, "Service stopped");
    }

    /// Replace the backend set with `configs` (normalised), diffing by
    /// name. Unchanged backends keep their counters and health state;
    /// changed ones are replaced in place, with connections through the old
    /// instance left to finish on their own. The round-robin state resets
    /// whenever the list changes.
    pub async fn set_backends(&self, configs: &[BackendConfig]) {
        let mut stopped = Vec::new();
        {
            let mut inner = self.inner.lock().await;

            let mut next = Vec::with_capacity(configs.len());
            for cfg in configs {
                let existing = inner
                    .backends
                    .iter()
                    .find(|b| b.name() == cfg.name && b.config() == cfg);
                match existing {
                    Some(backend) => next.push(Arc::clone(backend)),
                    None => {
                        let backend = Backend::new(cfg.clone(), self.backend_settings.clone());
                        backend.start().await;
                        info!(
                            service = %self.cfg.name,
                            backend = %cfg.name,
                            address = %cfg.address,
                            "Backend added"
                        );
                        next.push(backend);
                    }
                }
            }

            for old in &inner.backends {
                if !next.iter().any(|b| Arc::ptr_eq(b, old)) {
                    stopped.push(Arc::clone(old));
                }
            }

            let unchanged = inner.backends.len() == next.len()
                && inner
                    .backends
                    .iter()
                    .zip(&next)
                    .all(|(a, b)| Arc::ptr_eq(a, b));
            if !unchanged {
                inner.rr.reset();
            }
            inner.backends = next;
        }

        for old in stopped {
            info!(service = %self.cfg.name, backend = %old.name(), "Backend removed");
            old.stop().await;
        }
    }

    /// Create or replace one backend without touching the rest of the
    /// list.
    pub async fn upsert_backend(&self, cfg: BackendConfig) -> Arc<Backend> {
        let mut stopped = None;
        let backend = {
            let mut inner = self.inner.lock().await;

            if let Some(existing) = inner.backends.iter().find(|b| b.config() == &cfg) {
                return Arc::clone(existing);
            }

            let backend = Backend::new(cfg.clone(), self.backend_settings.clone());
            backend.start().await;

            match inner.backends.iter().position(|b| b.name() == cfg.name) {
                Some(idx) => {
                    stopped = Some(Arc::clone(&inner.backends[idx]));
                    inner.backends[idx] = Arc::clone(&backend);
                }
                None => inner.backends.push(Arc::clone(&backend)),
            }
            inner.rr.reset();
            backend
        };

        if let Some(old) = stopped {
            old.stop().await;
        }
        info!(
            service = %self.cfg.name,
            backend = %backend.name(),
            address = %backend.address(),
            "Backend updated"
        );
        backend
    }

    /// Remove a backend by name, stopping its health checks. Returns the
    /// removed backend, or `None` if it was not present.
    pub async fn remove_backend(&self, name: &str) -> Option<Arc<Backend>> {
        let removed = {
            let mut inner = self.inner.lock().await;
            let idx = inner.backends.iter().position(|b| b.name() == name)?;
            let removed = inner.backends.remove(idx);
            inner.rr.reset();
            removed
        };
        removed.stop().await;
        info!(service = %self.cfg.name, backend = %name, "Backend removed");
        Some(removed)
    }

    pub async fn get_backend(&self, name: &str) -> Option<Arc<Backend>> {
        self.inner
            .lock()
            .await
            .backends
            .iter()
            .find(|b| b.name() == name)
            .cloned()
    }

    /// Snapshot the live counters, aggregating the backends plus the
    /// service's own accept-path errors and UDP byte counts.
    pub async fn stats(&self) -> ServiceStat {
        let backends = { self.inner.lock().await.backends.clone() };

        let mut stat = ServiceStat {
            name: self.cfg.name.clone(),
            address: self.cfg.address.clone(),
            network: self.cfg.network.clone(),
            balance: self.cfg.balance.clone(),
            check_interval: self.cfg.check_interval,
            fall: self.cfg.fall,
            rise: self.cfg.rise,
            client_timeout: self.cfg.client_timeout,
            server_timeout: self.cfg.server_timeout,
            connect_timeout: self.cfg.connect_timeout,
            sent: self.sent.load(Ordering::Relaxed),
            received: self.rcvd.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            backends: Vec::with_capacity(backends.len()),
        };

        for backend in backends {
            let bs = backend.stats();
            stat.sent += bs.sent;
            stat.received += bs.received;
            stat.errors += bs.errors;
            stat.backends.push(bs);
        }
        stat
    }

    /// Snapshot the configuration, suitable for re-applying.
    pub async fn config_snapshot(&self) -> ServiceConfig {
        let mut cfg = self.cfg.clone();
        cfg.backends = self
            .inner
            .lock()
            .await
            .backends
            .iter()
            .map(|b| b.config().clone())
            .collect();
        cfg
    }

    async fn resolve_bind_addr(&self) -> Result<SocketAddr, ServiceError> {
        let addrs = lookup_host(&self.cfg.address)
            .await
            .map_err(|_| ServiceError::InvalidAddress(self.cfg.address.clone()))?;

        addrs
            .into_iter()
            .find(|addr| match self.network {
                Network::Tcp4 | Network::Udp4 => addr.is_ipv4(),
                Network::Tcp6 | Network::Udp6 => addr.is_ipv6(),
                Network::Tcp | Network::Udp => true,
            })
            .ok_or_else(|| ServiceError::Unresolvable(self.cfg.address.clone()))
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener, mut shutdown: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                result = listener.accept() => match result {
                    Ok((conn, peer)) => {
                        let service = Arc::clone(&self);
                        tokio::spawn(async move {
                            service.handle_connection(conn, peer).await;
                        });
                    }
                    Err(e) if is_transient(&e) => {
                        debug!(service = %self.cfg.name, error = %e, "Transient accept error");
                    }
                    Err(e) => {
                        error!(service = %self.cfg.name, error = %e, "Accept failed, closing listener");
                        break;
                    }
                }
            }
        }
        debug!(service = %self.cfg.name, "Accept loop exited");
    }

    async fn handle_connection(self: Arc<Self>, client: TcpStream, peer: SocketAddr) {
        let rotation = {
            let mut inner = self.inner.lock().await;
            let Inner { backends, rr } = &mut *inner;
            balance::rotation(self.policy, backends, rr)
        };

        if rotation.is_empty() {
            self.errors.fetch_add(1, Ordering::Relaxed);
            warn!(service = %self.cfg.name, peer = %peer, "No backends available");
            return;
        }

        let mut client = Some(client);
        for backend in rotation {
            match backend.dial().await {
                Ok(upstream) => {
                    debug!(
                        service = %self.cfg.name,
                        backend = %backend.name(),
                        peer = %peer,
                        "Proxying connection"
                    );
                    if let Some(client) = client.take() {
                        let guard = backend.begin_connection();
                        shovel::spawn(
                            client,
                            upstream,
                            backend,
                            self.client_timeout,
                            self.server_timeout,
                            guard,
                        );
                    }
                    return;
                }
                Err(e) => {
                    backend.record_error();
                    warn!(
                        service = %self.cfg.name,
                        backend = %backend.name(),
                        error = %e,
                        "Dial failed, trying next backend"
                    );
                }
            }
        }

        self.errors.fetch_add(1, Ordering::Relaxed);
        warn!(service = %self.cfg.name, peer = %peer, "All backends failed");
    }

    /// UDP path: forward each datagram to the next backend picked by a
    /// simplified weighted round robin. The return path is not proxied.
    async fn datagram_loop(self: Arc<Self>, socket: UdpSocket, mut shutdown: watch::Receiver<bool>) {
        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                result = socket.recv_from(&mut buf) => {
                    let (n, _peer) = match result {
                        Ok(received) => received,
                        Err(e) if is_transient(&e) => {
                            debug!(service = %self.cfg.name, error = %e, "Transient receive error");
                            continue;
                        }
                        Err(e) => {
                            error!(service = %self.cfg.name, error = %e, "Receive failed, closing socket");
                            break;
                        }
                    };
                    self.rcvd.fetch_add(n as u64, Ordering::Relaxed);

                    let backend = {
                        let mut inner = self.inner.lock().await;
                        let Inner { backends, rr } = &mut *inner;
                        balance::rotation(BalancePolicy::RoundRobin, backends, rr)
                            .into_iter()
                            .next()
                    };

                    let Some(backend) = backend else {
                        self.errors.fetch_add(1, Ordering::Relaxed);
                        debug!(service = %self.cfg.name, "No backend for datagram");
                        continue;
                    };

                    match socket.send_to(&buf[..n], backend.address()).await {
                        Ok(sent) => backend.add_sent(sent as u64),
                        Err(e) => {
                            backend.record_error();
                            warn!(
                                service = %self.cfg.name,
                                backend = %backend.name(),
                                error = %e,
                                "Datagram send failed"
                            );
                        }
                    }
                }
            }
        }
        debug!(service = %self.cfg.name, "Datagram loop exited");
    }
}

fn is_transient(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionRefused
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
    )
}

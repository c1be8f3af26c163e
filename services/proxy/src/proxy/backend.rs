//! Backend endpoints and their health-check loop.
//!
//! A backend holds the dial address, live counters, and the up/down verdict
//! used by the balancing policies. Health checks are a plain TCP connect
//! against the configured check address: `fall` consecutive failures mark
//! the backend down, `rise` consecutive successes bring it back. Backends
//! without a check address are always considered up.

use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use capstan_client::{BackendConfig, BackendStat};
use tokio::net::TcpStream;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Per-service tunables a backend inherits at creation time.
#[derive(Debug, Clone)]
pub struct BackendSettings {
    /// Interval between health probes. Zero disables checking.
    pub check_interval: Duration,
    /// Consecutive successes before a down backend is marked up.
    pub rise: u32,
    /// Consecutive failures before an up backend is marked down.
    pub fall: u32,
    /// Deadline for dialing the backend or its check address. Zero disables
    /// the deadline.
    pub connect_timeout: Duration,
}

/// A single upstream endpoint owned by a service.
pub struct Backend {
    cfg: BackendConfig,
    settings: BackendSettings,
    up: AtomicBool,
    sent: AtomicU64,
    rcvd: AtomicU64,
    errors: AtomicU64,
    conns: AtomicU64,
    active: AtomicU64,
    shutdown: watch::Sender<bool>,
    check_task: Mutex<Option<JoinHandle<()>>>,
}

impl Backend {
    /// Create a backend from a normalised config. Call
    /// [`start`](Self::start) to launch its health-check loop.
    pub fn new(cfg: BackendConfig, settings: BackendSettings) -> Arc<Self> {
        let (shutdown, _) = watch::channel(false);
        Arc::new(Self {
            cfg,
            settings,
            up: AtomicBool::new(true),
            sent: AtomicU64::new(0),
            rcvd: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            conns: AtomicU64::new(0),
            active: AtomicU64::new(0),
            shutdown,
            check_task: Mutex::new(None),
        })
    }

    pub fn name(&self) -> &str {
        &self.cfg.name
    }

    pub fn address(&self) -> &str {
        &self.cfg.address
    }

    pub fn weight(&self) -> u32 {
        self.cfg.weight
    }

    pub fn config(&self) -> &BackendConfig {
        &self.cfg
    }

    pub fn is_up(&self) -> bool {
        self.up.load(Ordering::Relaxed)
    }

    pub fn active_count(&self) -> u64 {
        self.active.load(Ordering::Relaxed)
    }

    pub fn total_conns(&self) -> u64 {
        self.conns.load(Ordering::Relaxed)
    }

    pub fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_sent(&self, bytes: u64) {
        self.sent.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn add_rcvd(&self, bytes: u64) {
        self.rcvd.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Launch the health-check loop, if checking is configured. The backend
    /// starts out up either way.
    pub async fn start(self: &Arc<Self>) {
        self.up.store(true, Ordering::Relaxed);

        if self.settings.check_interval.is_zero() || self.cfg.check_address.is_empty() {
            return;
        }

        let backend = Arc::clone(self);
        let mut shutdown_rx = self.shutdown.subscribe();
        let handle = tokio::spawn(async move {
            let mut successes = 0u32;
            let mut failures = 0u32;
            let mut ticker = tokio::time::interval(backend.settings.check_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => break,
                    _ = ticker.tick() => {
                        backend.run_check(&mut successes, &mut failures).await;
                    }
                }
            }
        });

        *self.check_task.lock().await = Some(handle);
    }

    /// Signal the health-check loop to exit and wait for it. Idempotent.
    /// Connections already proxied through this backend are not touched.
    pub async fn stop(&self) {
        let _ = self.shutdown.send(true);
        let handle = self.check_task.lock().await.take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    /// Open a connection to the dial address under the connect deadline.
    pub async fn dial(&self) -> io::Result<TcpStream> {
        dial_with_timeout(&self.cfg.address, self.settings.connect_timeout).await
    }

    /// Count a new proxied connection. The returned guard decrements
    /// `active` when the connection's last shovel exits.
    pub fn begin_connection(self: &Arc<Self>) -> ConnectionGuard {
        self.conns.fetch_add(1, Ordering::Relaxed);
        self.active.fetch_add(1, Ordering::Relaxed);
        ConnectionGuard {
            backend: Arc::clone(self),
        }
    }

    /// Snapshot the counters and the up/down verdict.
    pub fn stats(&self) -> BackendStat {
        BackendStat {
            name: self.cfg.name.clone(),
            address: self.cfg.address.clone(),
            check_address: self.cfg.check_address.clone(),
            network: self.cfg.network.clone(),
            weight: self.cfg.weight,
            up: self.is_up(),
            active: self.active.load(Ordering::Relaxed),
            conns: self.conns.load(Ordering::Relaxed),
            sent: self.sent.load(Ordering::Relaxed),
            received: self.rcvd.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
        }
    }

    #[cfg(test)]
    pub(crate) fn set_up_for_test(&self, up: bool) {
        self.up.store(up, Ordering::Relaxed);
    }

    async fn run_check(&self, successes: &mut u32, failures: &mut u32) {
        match dial_with_timeout(&self.cfg.check_address, self.settings.connect_timeout).await {
            Ok(_) => {
                *failures = 0;
                *successes = (*successes + 1).min(self.settings.rise);
                if !self.is_up() && *successes == self.settings.rise {
                    self.up.store(true, Ordering::Relaxed);
                    info!(
                        backend = %self.cfg.name,
                        check_address = %self.cfg.check_address,
                        "Backend up"
                    );
                }
            }
            Err(e) => {
                *successes = 0;
                *failures = (*failures + 1).min(self.settings.fall);
                if self.is_up() && *failures == self.settings.fall {
                    self.up.store(false, Ordering::Relaxed);
                    warn!(
                        backend = %self.cfg.name,
                        check_address = %self.cfg.check_address,
                        error = %e,
                        "Backend down"
                    );
                }
            }
        }
    }
}

/// RAII guard for a backend's `active` connection count.
pub struct ConnectionGuard {
    backend: Arc<Backend>,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.backend.active.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Dial `addr`, bounding the attempt by `timeout` unless it is zero.
pub(crate) async fn dial_with_timeout(addr: &str, timeout: Duration) -> io::Result<TcpStream> {
    if timeout.is_zero() {
        return TcpStream::connect(addr).await;
    }
    match tokio::time::timeout(timeout, TcpStream::connect(addr)).await {
        Ok(result) => result,
        Err(_) => Err(io::Error::new(io::ErrorKind::TimedOut, "connect timeout")),
    }
}

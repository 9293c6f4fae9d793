// src/proxy/backend.rs
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use url::Url;
use uuid::Uuid;

use crate::config::HealthCheckConfig;
use crate::metrics::MetricsCollector;

/// Number of consecutive failed health checks before a backend flips
/// unhealthy. AWS-ELB-style default.
const UNHEALTHY_THRESHOLD: usize = 2;
/// Number of consecutive successful health checks before a backend flips
/// healthy again.
const HEALTHY_THRESHOLD: usize = 10;

#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("invalid backend url {0:?}: {1}")]
    InvalidUrl(String, #[source] url::ParseError),
}

/// A single upstream endpoint plus its liveness state and health-check
/// loop. The health loop is the sole writer of `is_alive`; every other
/// reader only ever loads it.
pub struct Backend {
    pub id: Uuid,
    pub addr: String,
    pub url: Url,

    is_alive: AtomicBool,
    consecutive_failures: AtomicUsize,
    consecutive_successes: AtomicUsize,
    open_connections: AtomicUsize,
    last_error: Mutex<Option<String>>,
    metrics: Mutex<Option<Arc<MetricsCollector>>>,

    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    health_handle: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Backend")
            .field("id", &self.id)
            .field("addr", &self.addr)
            .field("is_alive", &self.is_alive())
            .finish()
    }
}

impl Backend {
    pub fn new(addr: &str) -> Result<Self, BackendError> {
        let url = Url::parse(addr).map_err(|e| BackendError::InvalidUrl(addr.to_string(), e))?;
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Ok(Self {
            id: Uuid::new_v4(),
            addr: addr.to_string(),
            url,
            is_alive: AtomicBool::new(true),
            consecutive_failures: AtomicUsize::new(0),
            consecutive_successes: AtomicUsize::new(0),
            open_connections: AtomicUsize::new(0),
            last_error: Mutex::new(None),
            metrics: Mutex::new(None),
            shutdown_tx,
            shutdown_rx,
            health_handle: Mutex::new(None),
        })
    }

    pub fn is_alive(&self) -> bool {
        self.is_alive.load(Ordering::Acquire)
    }

    pub fn open_connections(&self) -> usize {
        self.open_connections.load(Ordering::Relaxed)
    }

    /// Increments the in-flight-request counter. Must be paired with
    /// exactly one `decrement_connections` call.
    pub fn increment_connections(&self) {
        self.open_connections.fetch_add(1, Ordering::SeqCst);
    }

    pub fn decrement_connections(&self) {
        let previous = self.open_connections.fetch_sub(1, Ordering::SeqCst);
        debug_assert!(previous > 0, "connection counter underflow for backend {}", self.id);
    }

    /// Attaches the collector this backend reports its health flips to.
    /// Set once, from `main.rs`'s pool construction, before the health
    /// loop starts.
    pub fn set_metrics(&self, metrics: Arc<MetricsCollector>) {
        *self.metrics.lock().unwrap() = Some(metrics);
    }

    /// Applies AWS-ELB-style hysteresis to a single health-check outcome
    /// and flips `is_alive` when a threshold is crossed. Both counters
    /// reset on flip.
    fn record_outcome(&self, healthy: bool) {
        let was_alive = self.is_alive();
        if healthy {
            self.consecutive_failures.store(0, Ordering::Relaxed);
            let successes = self.consecutive_successes.fetch_add(1, Ordering::Relaxed) + 1;
            if successes >= HEALTHY_THRESHOLD && !was_alive {
                self.is_alive.store(true, Ordering::Release);
                info!(backend = %self.id, addr = %self.addr, "backend is now healthy");
                self.report_health(true);
            }
        } else {
            self.consecutive_successes.store(0, Ordering::Relaxed);
            let failures = self.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
            if failures >= UNHEALTHY_THRESHOLD && was_alive {
                self.is_alive.store(false, Ordering::Release);
                warn!(backend = %self.id, addr = %self.addr, "backend is now unhealthy");
                self.report_health(false);
            }
        }
    }

    fn report_health(&self, healthy: bool) {
        if let Some(metrics) = self.metrics.lock().unwrap().as_ref() {
            metrics.update_backend_health(&self.addr, healthy);
        }
    }

    fn record_terminal_error(&self, err: String) {
        warn!(backend = %self.id, error = %err, "health check terminated");
        *self.last_error.lock().unwrap() = Some(err);
    }

    pub fn last_health_check_error(&self) -> Option<String> {
        self.last_error.lock().unwrap().clone()
    }

    /// Idempotent: a second call while a loop is already running is a
    /// no-op.
    pub fn start_health_check(self: &std::sync::Arc<Self>, config: HealthCheckConfig) {
        let mut handle = self.health_handle.lock().unwrap();
        if handle.is_some() {
            return;
        }
        let backend = self.clone();
        let shutdown_rx = self.shutdown_rx.clone();
        *handle = Some(tokio::spawn(async move {
            crate::health::checker::run(backend, config, shutdown_rx).await;
        }));
    }

    /// Signals the health loop to stop. Observable by the loop within one
    /// tick.
    pub fn stop_health_check(&self) {
        let _ = self.shutdown_tx.send(true);
    }
}


/// Entry point used by `crate::health::checker` to feed a dial outcome
/// back into the backend's hysteresis state machine.
pub(crate) fn apply_health_outcome(backend: &Backend, healthy: bool) {
    backend.record_outcome(healthy);
}

pub(crate) fn apply_terminal_error(backend: &Backend, err: String) {
    backend.record_terminal_error(err);
}

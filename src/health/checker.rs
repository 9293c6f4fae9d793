// src/health/checker.rs
use std::net::ToSocketAddrs;
use std::sync::Arc;

use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::time::{interval, timeout};
use tracing::debug;

use crate::config::HealthCheckConfig;
use crate::proxy::backend::{apply_health_outcome, apply_terminal_error, Backend};

/// Runs the per-backend health-check loop: on each tick, dial the
/// backend's host:port over TCP with a bounded timeout and feed the
/// outcome into the backend's hysteresis state machine.
///
/// A raw TCP dial needs no cooperating handler on the backend side and is
/// cheaper than an HTTP round trip. Stops within one tick of `shutdown`
/// observing `true`.
pub async fn run(backend: Arc<Backend>, config: HealthCheckConfig, mut shutdown: watch::Receiver<bool>) {
    let mut tick = interval(config.interval());

    loop {
        tokio::select! {
            _ = tick.tick() => {
                match dial(&backend, config.dial_timeout()).await {
                    Ok(alive) => apply_health_outcome(&backend, alive),
                    Err(err) => {
                        // Non-I/O terminal error: stop the loop without
                        // flipping liveness.
                        apply_terminal_error(&backend, err);
                        return;
                    }
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    debug!(backend = %backend.id, "health check loop stopping");
                    return;
                }
            }
        }
    }
}

/// Attempts a single TCP dial. `Ok(true)`/`Ok(false)` are the usual
/// alive/unreachable outcomes — a failed dial counts as one failure and
/// is never propagated out of the loop. `Err` is reserved for non-I/O
/// failures, which terminate the loop.
async fn dial(backend: &Backend, dial_timeout: std::time::Duration) -> Result<bool, String> {
    let host = backend
        .url
        .host_str()
        .ok_or_else(|| format!("backend url has no host: {}", backend.addr))?;
    let port = backend
        .url
        .port_or_known_default()
        .ok_or_else(|| format!("backend url has no resolvable port: {}", backend.addr))?;

    let addr = format!("{host}:{port}");
    let socket_addr = match addr.to_socket_addrs() {
        Ok(mut addrs) => addrs.next(),
        // A resolver hiccup is treated as a connect failure, not
        // terminal — DNS can be transiently unavailable.
        Err(_) => None,
    };
    let Some(socket_addr) = socket_addr else {
        return Ok(false);
    };

    match timeout(dial_timeout, TcpStream::connect(socket_addr)).await {
        Ok(Ok(_stream)) => Ok(true),
        Ok(Err(_)) => Ok(false),
        Err(_elapsed) => Ok(false),
    }
}

// ────────────────────────────────
// src/proxy/proxy.rs
// Dispatcher: the per-request reverse-proxy pipeline.
// ────────────────────────────────

use std::sync::Arc;
use std::time::Instant;

use hyper::client::HttpConnector;
use hyper::header::SET_COOKIE;
use hyper::{Body, Client, Request, Response, Uri};

use crate::config::Config;
use crate::load_balancer::{SelectionError, SelectionPolicy};
use crate::metrics::MetricsCollector;

use super::affinity::{AffinityLookup, SessionAffinity};
use super::backend::Backend;
use super::pool::BackendPool;

#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    #[error("no backends configured")]
    EmptyPool,

    #[error("no backend is currently alive")]
    AllDown,

    #[error("upstream request failed: {0}")]
    Upstream(#[from] hyper::Error),

    #[error("could not build upstream request: {0}")]
    BadUpstreamRequest(#[from] http::Error),

    #[error("backend url {0:?} has no valid authority")]
    InvalidBackendUrl(String),
}

impl From<SelectionError> for ProxyError {
    fn from(err: SelectionError) -> Self {
        match err {
            SelectionError::EmptyPool => ProxyError::EmptyPool,
            SelectionError::AllDown => ProxyError::AllDown,
        }
    }
}

impl From<ProxyError> for Response<Body> {
    fn from(err: ProxyError) -> Self {
        let status = match err {
            ProxyError::EmptyPool | ProxyError::AllDown => 503,
            ProxyError::Upstream(_)
            | ProxyError::BadUpstreamRequest(_)
            | ProxyError::InvalidBackendUrl(_) => 502,
        };
        Response::builder()
            .status(status)
            .body(Body::from(err.to_string()))
            .expect("static status/body always builds a response")
    }
}

/// Decrements a backend's in-flight counter when dropped, so the counter
/// is released on every exit path out of `dispatch` — including the early
/// return on a transport error, which the counter increment at selection
/// time would otherwise leak past.
struct ConnectionGuard {
    backend: Arc<Backend>,
    metrics: Arc<MetricsCollector>,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.backend.decrement_connections();
        self.metrics
            .update_backend_connections(&self.backend.addr, self.backend.open_connections() as i64);
    }
}

/// The full reverse-proxy pipeline: resolve session affinity, select a
/// backend, rewrite the request URL onto it, forward, and stamp the
/// response with a fresh session cookie when applicable.
pub struct Dispatcher {
    pool: BackendPool,
    policy: Box<dyn SelectionPolicy>,
    affinity: SessionAffinity,
    client: Client<HttpConnector>,
    override_backend_path: bool,
    metrics: Arc<MetricsCollector>,
}

impl Dispatcher {
    pub fn new(
        pool: BackendPool,
        policy: Box<dyn SelectionPolicy>,
        affinity: SessionAffinity,
        config: &Config,
        metrics: Arc<MetricsCollector>,
    ) -> Self {
        Self {
            pool,
            policy,
            affinity,
            client: Client::new(),
            override_backend_path: config.override_backend_path,
            metrics,
        }
    }

    pub async fn dispatch(&self, req: Request<Body>) -> Result<Response<Body>, ProxyError> {
        let backend = match self.affinity.resolve(req.headers(), &self.pool) {
            AffinityLookup::Bound(backend) => backend,
            AffinityLookup::Disabled | AffinityLookup::Fallthrough => self.policy.next(&self.pool)?,
        };

        backend.increment_connections();
        self.metrics
            .update_backend_connections(&backend.addr, backend.open_connections() as i64);
        let _guard = ConnectionGuard {
            backend: backend.clone(),
            metrics: self.metrics.clone(),
        };

        let method = req.method().as_str().to_string();
        let upstream_req = self.rewrite(req, &backend)?;

        let started = Instant::now();
        let result = self.client.request(upstream_req).await;
        let elapsed = started.elapsed();

        let mut response = result.map_err(|err| {
            tracing::error!(backend = %backend.id, addr = %backend.addr, error = %err, "proxy error");
            self.metrics.record_backend_request(&backend.addr, false, elapsed);
            ProxyError::Upstream(err)
        })?;

        self.metrics.record_backend_request(&backend.addr, true, elapsed);
        self.metrics
            .record_request(&method, response.status().as_u16(), &backend.addr, elapsed);

        // Sliding expiry: every request routed through a live backend while
        // affinity is enabled refreshes the session window, regardless of
        // whether the cookie was already present.
        if self.affinity.enabled() {
            let cookie = self.affinity.set_cookie_header(backend.id);
            response.headers_mut().append(SET_COOKIE, cookie);
        }

        Ok(response)
    }

    /// Rewrites scheme/host/path/query onto the selected backend. The
    /// backend URL's path takes over the client path when
    /// `override_backend_path` is set.
    fn rewrite(&self, mut req: Request<Body>, backend: &Backend) -> Result<Request<Body>, ProxyError> {
        let backend_uri: Uri = backend
            .url
            .as_str()
            .parse()
            .map_err(|_| ProxyError::InvalidBackendUrl(backend.url.to_string()))?;

        let authority = backend_uri
            .authority()
            .cloned()
            .ok_or_else(|| ProxyError::InvalidBackendUrl(backend.url.to_string()))?;

        let path_and_query = if self.override_backend_path {
            backend_uri
                .path_and_query()
                .map(|pq| pq.as_str().to_string())
                .unwrap_or_else(|| "/".to_string())
        } else {
            req.uri()
                .path_and_query()
                .map(|pq| pq.as_str().to_string())
                .unwrap_or_else(|| "/".to_string())
        };

        let new_uri = Uri::builder()
            .scheme(backend_uri.scheme_str().unwrap_or("http"))
            .authority(authority)
            .path_and_query(path_and_query)
            .build()?;

        *req.uri_mut() = new_uri;
        Ok(req)
    }
}

// src/main.rs
use anyhow::{Context, Result};
use hyper::{Body, Request, Response, Server, StatusCode};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info};

mod config;
mod server;
mod proxy;
mod load_balancer;
mod health;
mod metrics;

use crate::{
    config::Config,
    load_balancer::build_policy,
    metrics::{MetricsCollector, MetricsRegistry},
    proxy::{Backend, BackendPool, Dispatcher, SessionAffinity},
    server::{handler::RequestHandler, ServerBuilder},
};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("reverse_proxy_lb=debug".parse()?)
                .add_directive("hyper=info".parse()?),
        )
        .init();

    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "config.yaml".to_string());

    info!("Loading configuration from: {}", config_path);
    let config = config::load_config(&config_path).await?;

    let metrics_registry = MetricsRegistry::new()?;
    let metrics = metrics_registry.collector();

    let pool = build_pool(&config, &metrics)?;
    let policy = build_policy(config.algorithm);
    let affinity = SessionAffinity::new(config.session_persistence.clone());
    let dispatcher = Arc::new(Dispatcher::new(pool, policy, affinity, &config, metrics.clone()));

    if config.metrics.enabled {
        let metrics_addr: SocketAddr = ([0, 0, 0, 0], config.metrics.port).into();
        start_metrics_server(metrics_addr, metrics_registry, config.metrics.path.clone()).await?;
    }

    let handler = RequestHandler::new(dispatcher);

    info!("Starting load balancer on {}", config.listen_addr);
    ServerBuilder::new(config.listen_addr)
        .with_handler(handler)
        .serve(shutdown_signal())
        .await?;

    Ok(())
}

/// Constructs every configured backend, registers it in the pool, and
/// starts its health-check loop. Backend construction failure (an
/// unparseable URL) is fatal at startup, matching `Config::validate`'s
/// earlier pass over the same list.
fn build_pool(config: &Config, metrics: &Arc<MetricsCollector>) -> Result<BackendPool> {
    let mut backends = Vec::with_capacity(config.backend_urls.len());
    for addr in &config.backend_urls {
        let backend = Arc::new(
            Backend::new(addr).with_context(|| format!("invalid backend url {addr:?}"))?,
        );
        backend.set_metrics(metrics.clone());
        backend.start_health_check(config.health_check.clone());
        metrics.update_backend_health(&backend.addr, backend.is_alive());
        backends.push(backend);
    }
    metrics.update_backend_counts(backends.iter().filter(|b| b.is_alive()).count(), backends.len());
    Ok(BackendPool::new(backends))
}

async fn start_metrics_server(
    addr: SocketAddr,
    registry: MetricsRegistry,
    path: String,
) -> Result<()> {
    let registry = Arc::new(registry);
    let metrics_path = Arc::new(path);
    let service_path = metrics_path.clone();

    let make_service = hyper::service::make_service_fn(move |_| {
        let registry = registry.clone();
        let path = service_path.clone();

        async move {
            Ok::<_, Infallible>(hyper::service::service_fn(move |req: Request<Body>| {
                let registry = registry.clone();
                let path = path.clone();

                async move {
                    if req.uri().path() == path.as_str() {
                        let metrics = registry.gather();
                        Ok::<_, Infallible>(
                            Response::builder()
                                .status(StatusCode::OK)
                                .header("Content-Type", "text/plain; version=0.0.4")
                                .body(Body::from(metrics))
                                .unwrap(),
                        )
                    } else {
                        Ok::<_, Infallible>(
                            Response::builder()
                                .status(StatusCode::NOT_FOUND)
                                .body(Body::from("Not Found"))
                                .unwrap(),
                        )
                    }
                }
            }))
        }
    });

    let server = Server::bind(&addr).serve(make_service);

    info!(
        "Metrics server listening on http://{}{}",
        addr,
        metrics_path.as_str()
    );

    tokio::spawn(async move {
        if let Err(e) = server.await {
            error!("Metrics server error: {}", e);
        }
    });

    Ok(())
}

// Graceful shutdown handler
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received");
}

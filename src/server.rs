//! Health and Metrics Server
//!
//! Serves `/healthz`, `/livez`, `/readyz` and `/metrics` on one address.
//! Readiness flips once the controller has completed a full resync.

use crate::error::{Error, Result};
use crate::metrics::ProvisionerMetrics;
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Request, Response, Server, StatusCode};
use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{error, info};

/// State shared between the controller and the HTTP endpoints
pub struct ServerState {
    pub metrics: ProvisionerMetrics,
    ready: AtomicBool,
}

impl ServerState {
    pub fn new(metrics: ProvisionerMetrics) -> Arc<Self> {
        Arc::new(Self {
            metrics,
            ready: AtomicBool::new(false),
        })
    }

    pub fn mark_ready(&self) {
        self.ready.store(true, Ordering::Relaxed);
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Relaxed)
    }
}

fn respond(status: StatusCode, body: impl Into<Body>) -> Response<Body> {
    let mut response = Response::new(body.into());
    *response.status_mut() = status;
    response
}

/// Answer a single request
pub fn route(path: &str, state: &ServerState) -> Response<Body> {
    match path {
        "/healthz" | "/livez" => respond(StatusCode::OK, "ok"),
        "/readyz" if state.is_ready() => respond(StatusCode::OK, "ok"),
        "/readyz" => respond(StatusCode::SERVICE_UNAVAILABLE, "not ready"),
        "/metrics" => match state.metrics.encode() {
            Ok(buffer) => {
                let mut response = respond(StatusCode::OK, buffer);
                response
                    .headers_mut()
                    .insert(CONTENT_TYPE, HeaderValue::from_static(prometheus::TEXT_FORMAT));
                response
            }
            Err(e) => {
                error!("Failed to encode metrics: {}", e);
                respond(StatusCode::INTERNAL_SERVER_ERROR, "metrics unavailable")
            }
        },
        _ => respond(StatusCode::NOT_FOUND, "not found"),
    }
}

/// Serve until `shutdown` resolves
pub async fn run_server(
    addr: SocketAddr,
    state: Arc<ServerState>,
    shutdown: impl Future<Output = ()>,
) -> Result<()> {
    let make_svc = make_service_fn(move |_conn| {
        let state = state.clone();
        async move {
            Ok::<_, Infallible>(service_fn(move |req: Request<Body>| {
                let response = route(req.uri().path(), &state);
                async move { Ok::<_, Infallible>(response) }
            }))
        }
    });

    let server = Server::try_bind(&addr)
        .map_err(|e| Error::Internal(format!("Failed to bind server on {}: {}", addr, e)))?;

    info!("Health and metrics server listening on {}", addr);
    server
        .serve(make_svc)
        .with_graceful_shutdown(shutdown)
        .await
        .map_err(|e| Error::Internal(format!("Server error: {}", e)))?;

    info!("Health and metrics server stopped");
    Ok(())
}

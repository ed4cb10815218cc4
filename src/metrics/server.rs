// src/metrics/server.rs
// Admin endpoint: prometheus text and a JSON dump of per-path byte totals.
use anyhow::Result;
use hyper::{Body, Request, Response, Server, StatusCode};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{error, info};

use super::MetricsRegistry;
use crate::config::MetricsConfig;
use crate::stats::StatsAggregator;

struct AdminState {
    registry: MetricsRegistry,
    stats: Arc<StatsAggregator>,
    metrics_path: String,
    stats_path: String,
}

pub async fn start_metrics_server(
    addr: SocketAddr,
    registry: MetricsRegistry,
    stats: Arc<StatsAggregator>,
    config: &MetricsConfig,
) -> Result<()> {
    let state = Arc::new(AdminState {
        registry,
        stats,
        metrics_path: config.path.clone(),
        stats_path: config.stats_path.clone(),
    });

    let make_service = hyper::service::make_service_fn(move |_| {
        let state = state.clone();
        async move {
            Ok::<_, Infallible>(hyper::service::service_fn(move |req: Request<Body>| {
                let state = state.clone();
                async move { Ok::<_, Infallible>(route(&state, &req)) }
            }))
        }
    });

    let server = Server::try_bind(&addr)?.serve(make_service);

    info!(
        "Metrics server listening on http://{}{}",
        addr, config.path
    );

    tokio::spawn(async move {
        if let Err(e) = server.await {
            error!("Metrics server error: {}", e);
        }
    });

    Ok(())
}

fn route(state: &AdminState, req: &Request<Body>) -> Response<Body> {
    let path = req.uri().path();
    let result = if path == state.metrics_path {
        state
            .registry
            .gather()
            .map(|body| respond(StatusCode::OK, "text/plain; version=0.0.4", body))
    } else if path == state.stats_path {
        serde_json::to_vec(&state.stats.snapshot())
            .map(|body| respond(StatusCode::OK, "application/json", body))
            .map_err(Into::into)
    } else {
        Ok(respond(StatusCode::NOT_FOUND, "text/plain", "Not Found"))
    };

    result.unwrap_or_else(|e| {
        error!("Failed to render {}: {}", path, e);
        respond(
            StatusCode::INTERNAL_SERVER_ERROR,
            "text/plain",
            "Internal Server Error",
        )
    })
}

fn respond(status: StatusCode, content_type: &'static str, body: impl Into<Body>) -> Response<Body> {
    let mut response = Response::new(body.into());
    *response.status_mut() = status;
    response.headers_mut().insert(
        hyper::header::CONTENT_TYPE,
        hyper::header::HeaderValue::from_static(content_type),
    );
    response
}

// Copyright 2023-, Edge & Node, GraphOps, and Semiotic Labs.
// SPDX-License-Identifier: Apache-2.0

use std::{net::SocketAddr, sync::LazyLock};

use axum::{routing::get, serve, Router};
use prometheus::{
    register_counter_vec, register_histogram_vec, CounterVec, HistogramVec, TextEncoder,
};
use reqwest::StatusCode;
use tokio::net::TcpListener;

/// Time taken to answer a proxied request
///
/// Labels: "subgraph", "outcome"
pub static REQUEST_DURATION: LazyLock<HistogramVec> = LazyLock::new(|| {
    register_histogram_vec!(
        "subgraph_proxy_request_duration_seconds",
        "Time taken to answer a proxied request",
        &["subgraph", "outcome"]
    )
    .unwrap()
});

/// Labels: "subgraph", "kind"
pub static REQUESTS_FAILED: LazyLock<CounterVec> = LazyLock::new(|| {
    register_counter_vec!(
        "subgraph_proxy_requests_failed",
        "Proxied requests that could not be answered",
        &["subgraph", "kind"]
    )
    .unwrap()
});

/// Labels: "subgraph", "endpoint"
pub static ENDPOINT_SERVED: LazyLock<CounterVec> = LazyLock::new(|| {
    register_counter_vec!(
        "subgraph_proxy_endpoint_served",
        "Proxied requests answered by each endpoint",
        &["subgraph", "endpoint"]
    )
    .unwrap()
});

pub fn serve_metrics(host_and_port: SocketAddr) {
    tracing::info!(address = %host_and_port, "Serving prometheus metrics");

    tokio::spawn(async move {
        let router = Router::new().route(
            "/metrics",
            get(|| async {
                let metric_families = prometheus::gather();
                let encoder = TextEncoder::new();

                match encoder.encode_to_string(&metric_families) {
                    Ok(s) => (StatusCode::OK, s),
                    Err(e) => {
                        tracing::error!("Error encoding metrics: {}", e);
                        (
                            StatusCode::INTERNAL_SERVER_ERROR,
                            format!("Error encoding metrics: {}", e),
                        )
                    }
                }
            }),
        );

        let listener = match TcpListener::bind(host_and_port).await {
            Ok(listener) => listener,
            Err(e) => {
                tracing::error!(address = %host_and_port, "Failed to bind to metrics port: {e}");
                return;
            }
        };
        if let Err(e) = serve(listener, router.into_make_service()).await {
            tracing::error!("Failed to serve metrics: {e}");
        }
    });
}

// Copyright 2023-, Edge & Node, GraphOps, and Semiotic Labs.
// SPDX-License-Identifier: Apache-2.0

use std::{sync::Arc, time::Duration};

use axum::{
    extract::MatchedPath,
    http::Request,
    routing::{get, post},
    Router,
};
use subgraph_proxy::SubgraphProxy;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::info_span;

use crate::routes::{health, request_handler};

#[derive(bon::Builder)]
pub struct ServiceRouter {
    proxy: Arc<SubgraphProxy>,
}

impl ServiceRouter {
    pub fn create_router(self) -> Router {
        // add tracing to all routes
        let tracing_layer = TraceLayer::new_for_http()
            .make_span_with(|req: &Request<_>| {
                let method = req.method();
                let uri = req.uri();
                let matched_path = req
                    .extensions()
                    .get::<MatchedPath>()
                    .map(MatchedPath::as_str);

                info_span!(
                    "http_request",
                    %method,
                    %uri,
                    matched_path,
                )
            })
            // we disable failures here because we doing our own error logging
            .on_failure(
                |_error: tower_http::classify::ServerErrorsFailureClass,
                 _latency: Duration,
                 _span: &tracing::Span| {},
            );

        Router::new()
            .route("/health", get(health))
            .route("/{subgraph}", post(request_handler))
            .with_state(self.proxy)
            .layer(CorsLayer::permissive())
            .layer(tracing_layer)
    }
}

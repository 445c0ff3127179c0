// Copyright 2023-, Edge & Node, GraphOps, and Semiotic Labs.
// SPDX-License-Identifier: Apache-2.0

use std::{sync::Arc, time::Instant};

use axum::{
    extract::{Path, State},
    response::IntoResponse,
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use subgraph_proxy::{ProxyResponse, SubgraphProxy};
use tracing::trace;

use crate::{
    error::SubgraphProxyServiceError,
    metrics::{ENDPOINT_SERVED, REQUESTS_FAILED, REQUEST_DURATION},
};

#[derive(Debug, Deserialize, Serialize)]
pub struct QueryBody {
    pub query: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variables: Option<Value>,
}

pub async fn request_handler(
    Path(subgraph): Path<String>,
    State(proxy): State<Arc<SubgraphProxy>>,
    req: String,
) -> Result<impl IntoResponse, SubgraphProxyServiceError> {
    trace!("Handling request for subgraph `{subgraph}`");

    let request: QueryBody =
        serde_json::from_str(&req).map_err(SubgraphProxyServiceError::InvalidRequest)?;

    let start = Instant::now();
    let result = proxy
        .handle_proxy_request(&subgraph, &request.query, request.variables.as_ref())
        .await;
    let outcome = if result.is_ok() { "success" } else { "failure" };
    REQUEST_DURATION
        .with_label_values(&[subgraph.as_str(), outcome])
        .observe(start.elapsed().as_secs_f64());

    let ProxyResponse { body, meta } = result
        .inspect_err(|e| {
            REQUESTS_FAILED
                .with_label_values(&[subgraph.as_str(), e.kind()])
                .inc()
        })
        .map_err(SubgraphProxyServiceError::Proxy)?;

    ENDPOINT_SERVED
        .with_label_values(&[subgraph.as_str(), &meta.endpoint.to_string()])
        .inc();

    let headers = [
        ("x-version", meta.version),
        ("x-deployment", meta.deployment.to_string()),
        ("x-chain", meta.chain),
        ("x-indexed-block", meta.indexed_block.to_string()),
    ];
    Ok((headers, Json(json!({ "data": body }))))
}

// Copyright 2023-, Edge & Node, GraphOps, and Semiotic Labs.
// SPDX-License-Identifier: Apache-2.0

use axum::{
    response::{IntoResponse, Response},
    Json,
};
use reqwest::StatusCode;
use serde::Serialize;
use subgraph_proxy::ProxyError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SubgraphProxyServiceError {
    #[error("Invalid request body: {0}")]
    InvalidRequest(serde_json::Error),
    #[error(transparent)]
    Proxy(#[from] ProxyError),
}

impl IntoResponse for SubgraphProxyServiceError {
    fn into_response(self) -> Response {
        use SubgraphProxyServiceError::*;

        #[derive(Serialize)]
        struct ErrorResponse {
            message: String,
        }

        let (status, message) = match &self {
            InvalidRequest(_) | Proxy(ProxyError::InvalidRequest(_)) => {
                (StatusCode::BAD_REQUEST, self.to_string())
            }
            Proxy(ProxyError::CapacityExceeded) => (StatusCode::TOO_MANY_REQUESTS, self.to_string()),
            Proxy(ProxyError::BackendUnavailable(_) | ProxyError::NotYetIndexed) => {
                (StatusCode::INTERNAL_SERVER_ERROR, self.to_string())
            }
            Proxy(ProxyError::ChainHead(e)) => {
                tracing::error!(error = %e, "Failed to fetch the chain head");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal Server Error.".to_string(),
                )
            }
        };
        (status, Json(ErrorResponse { message })).into_response()
    }
}

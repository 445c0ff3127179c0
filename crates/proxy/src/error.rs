// Copyright 2023-, Edge & Node, GraphOps, and Semiotic Labs.
// SPDX-License-Identifier: Apache-2.0

use subgraph_proxy_monitor::ChainHeadError;
use thiserror::Error;

/// Why a proxied request could not be answered.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// The request itself is at fault, retrying it will not help
    #[error("{0}")]
    InvalidRequest(String),
    #[error(
        "The server is currently experiencing high traffic and cannot process your request. \
        Please try again later."
    )]
    CapacityExceeded,
    #[error("{0}")]
    BackendUnavailable(String),
    #[error("Subgraph has not yet indexed up to the latest block.")]
    NotYetIndexed,
    #[error(transparent)]
    ChainHead(#[from] ChainHeadError),
}

impl ProxyError {
    pub(crate) fn unknown_subgraph(subgraph: &str) -> Self {
        Self::InvalidRequest(format!(
            "Subgraph name '{subgraph}' is not configured for use in this gateway."
        ))
    }

    pub(crate) fn offline() -> Self {
        Self::BackendUnavailable(
            "Subgraph is unable to process this request and may be offline.".to_string(),
        )
    }

    pub(crate) fn stale_only() -> Self {
        Self::BackendUnavailable("Subgraph is unable to serve the latest version.".to_string())
    }

    /// Short label for metrics and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidRequest(_) => "invalid_request",
            Self::CapacityExceeded => "capacity_exceeded",
            Self::BackendUnavailable(_) => "backend_unavailable",
            Self::NotYetIndexed => "not_yet_indexed",
            Self::ChainHead(_) => "chain_head",
        }
    }
}

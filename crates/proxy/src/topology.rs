// Copyright 2023-, Edge & Node, GraphOps, and Semiotic Labs.
// SPDX-License-Identifier: Apache-2.0

use std::collections::BTreeSet;

use subgraph_proxy_config::{Config, EndpointConfig, ProviderKind};
use url::Url;

/// Static mapping between endpoints and the subgraphs they serve.
///
/// Endpoints are identified by their position in the configuration.
#[derive(Debug, Clone)]
pub struct Topology {
    endpoints: Vec<EndpointConfig>,
    enabled: BTreeSet<String>,
}

impl Topology {
    pub fn new(endpoints: Vec<EndpointConfig>, enabled: impl IntoIterator<Item = String>) -> Self {
        Self {
            endpoints,
            enabled: enabled.into_iter().collect(),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(
            config.endpoints.clone(),
            config.subgraphs.enabled.iter().cloned(),
        )
    }

    pub fn endpoint(&self, index: usize) -> Option<&EndpointConfig> {
        self.endpoints.get(index)
    }

    pub fn endpoints(&self) -> impl Iterator<Item = (usize, &EndpointConfig)> {
        self.endpoints.iter().enumerate()
    }

    pub fn provider(&self, index: usize) -> Option<ProviderKind> {
        self.endpoint(index).map(|endpoint| endpoint.provider)
    }

    /// Utilization above which the endpoint should be relieved by its peers.
    pub fn utilization_preference(&self, index: usize) -> f64 {
        self.endpoint(index)
            .map_or(0.0, |endpoint| endpoint.utilization_preference)
    }

    pub fn is_enabled(&self, subgraph: &str) -> bool {
        self.enabled.contains(subgraph)
    }

    pub fn enabled_subgraphs(&self) -> impl Iterator<Item = &str> {
        self.enabled.iter().map(String::as_str)
    }

    /// Endpoints serving `subgraph`, in index order.
    pub fn endpoints_for_subgraph(&self, subgraph: &str) -> Vec<usize> {
        self.endpoints
            .iter()
            .enumerate()
            .filter(|(_, endpoint)| endpoint.serves(subgraph))
            .map(|(index, _)| index)
            .collect()
    }

    /// Enabled subgraphs served by the endpoint at `index`.
    pub fn subgraphs_for_endpoint(&self, index: usize) -> Vec<&str> {
        self.endpoint(index)
            .map(|endpoint| {
                endpoint
                    .served_subgraphs()
                    .filter(|subgraph| self.is_enabled(subgraph))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn query_url(&self, index: usize, subgraph: &str) -> Option<Url> {
        self.endpoint(index)?.query_url(subgraph)
    }

    pub fn status_url(&self, index: usize, subgraph: &str) -> Option<Url> {
        self.endpoint(index)?.status_url(subgraph)
    }
}

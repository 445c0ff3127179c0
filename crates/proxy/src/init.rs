// Copyright 2023-, Edge & Node, GraphOps, and Semiotic Labs.
// SPDX-License-Identifier: Apache-2.0

use futures::future::join_all;
use subgraph_proxy_query::{SubgraphMetadata, METADATA_SELECTION};

use crate::proxy::SubgraphProxy;

impl SubgraphProxy {
    /// Learns the deployment, version and block of every served pair before
    /// the first request arrives.
    pub async fn init_all_states(&self) {
        let topology = self.state().topology();
        let pairs = topology.enabled_subgraphs().flat_map(|subgraph| {
            topology
                .endpoints_for_subgraph(subgraph)
                .into_iter()
                .map(move |endpoint| (endpoint, subgraph))
        });
        join_all(pairs.map(|(endpoint, subgraph)| self.init_state(endpoint, subgraph))).await;
    }

    /// Re-learns the state of every subgraph served by one endpoint.
    pub async fn init_endpoint_states(&self, endpoint: usize) {
        let subgraphs = self.state().topology().subgraphs_for_endpoint(endpoint);
        join_all(
            subgraphs
                .into_iter()
                .map(|subgraph| self.init_state(endpoint, subgraph)),
        )
        .await;
    }

    async fn init_state(&self, endpoint: usize, subgraph: &str) {
        let query = format!("{{ {METADATA_SELECTION} }}");
        let result = self
            .limiters()
            .execute(
                endpoint,
                subgraph,
                self.backend().query(endpoint, subgraph, &query, None),
            )
            .await;

        let metadata = match result {
            Ok(Ok(data)) => SubgraphMetadata::from_response(&data).map_err(|e| e.to_string()),
            Ok(Err(e)) => Err(e.to_string()),
            Err(e) => Err(e.to_string()),
        };
        let updated = match metadata {
            Ok(metadata) => self
                .state()
                .update_states_with_result(endpoint, subgraph, &metadata)
                .await
                .map_err(|e| e.to_string()),
            Err(e) => Err(e),
        };

        match updated {
            Ok(()) => {
                self.state().mark_selected(endpoint, subgraph);
                tracing::info!(subgraph, endpoint, "Initialized endpoint state");
            }
            Err(error) => {
                tracing::warn!(subgraph, endpoint, error = %error, "Failed to initialize endpoint state");
                self.state().set_has_errors(endpoint, subgraph, true);
            }
        }
    }
}

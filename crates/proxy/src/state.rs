// Copyright 2023-, Edge & Node, GraphOps, and Semiotic Labs.
// SPDX-License-Identifier: Apache-2.0

use std::{
    cmp::Ordering,
    collections::HashMap,
    sync::{Arc, Mutex, PoisonError, RwLock},
    time::Duration,
};

use subgraph_proxy_monitor::{ChainHeadError, ChainHeadTracker};
use subgraph_proxy_query::SubgraphMetadata;
use thegraph_core::DeploymentId;
use tokio::time::Instant;

use crate::{semver::compare_versions, topology::Topology};

/// How long an error, sync or version problem keeps an endpoint troublesome.
pub const TROUBLE_WINDOW: Duration = Duration::from_secs(60);

/// An endpoint is in sync while its block is less than this far behind the
/// chain head.
const IN_SYNC_BLOCKS: u64 = 50;

/// What is known about one subgraph on one endpoint.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EndpointSubgraphState {
    pub deployment: Option<DeploymentId>,
    pub version: Option<String>,
    pub chain: Option<String>,
    /// Highest block observed. Only decreases on a new deployment or an error.
    pub block: u64,
    pub has_errors: bool,
    /// Set from status probes only
    pub has_fatal_errors: bool,
    pub selected_at: Option<Instant>,
    pub result_at: Option<Instant>,
    pub error_at: Option<Instant>,
    pub out_of_sync_at: Option<Instant>,
    pub stale_version_at: Option<Instant>,
}

/// Process-wide, advisory record of every (endpoint, subgraph) pair.
///
/// Concurrent requests update entries without coordination. Every field is
/// written atomically, but a record read while another request writes may mix
/// old and new fields.
pub struct EndpointStateStore {
    topology: Arc<Topology>,
    chain_heads: Arc<ChainHeadTracker>,
    states: RwLock<HashMap<(usize, String), EndpointSubgraphState>>,
    error_checks: Mutex<HashMap<String, Instant>>,
}

impl EndpointStateStore {
    pub fn new(topology: Arc<Topology>, chain_heads: Arc<ChainHeadTracker>) -> Self {
        Self {
            topology,
            chain_heads,
            states: RwLock::default(),
            error_checks: Mutex::default(),
        }
    }

    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    /// Snapshot of the pair, default if nothing was recorded yet.
    pub fn get(&self, endpoint: usize, subgraph: &str) -> EndpointSubgraphState {
        self.states
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&(endpoint, subgraph.to_string()))
            .cloned()
            .unwrap_or_default()
    }

    fn read<T>(
        &self,
        endpoint: usize,
        subgraph: &str,
        f: impl FnOnce(&EndpointSubgraphState) -> T,
    ) -> Option<T> {
        self.states
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&(endpoint, subgraph.to_string()))
            .map(f)
    }

    fn update<T>(
        &self,
        endpoint: usize,
        subgraph: &str,
        f: impl FnOnce(&mut EndpointSubgraphState) -> T,
    ) -> T {
        let mut states = self.states.write().unwrap_or_else(PoisonError::into_inner);
        f(states.entry((endpoint, subgraph.to_string())).or_default())
    }

    pub fn block(&self, endpoint: usize, subgraph: &str) -> u64 {
        self.read(endpoint, subgraph, |s| s.block).unwrap_or(0)
    }

    pub fn chain(&self, endpoint: usize, subgraph: &str) -> Option<String> {
        self.read(endpoint, subgraph, |s| s.chain.clone()).flatten()
    }

    pub fn deployment(&self, endpoint: usize, subgraph: &str) -> Option<DeploymentId> {
        self.read(endpoint, subgraph, |s| s.deployment).flatten()
    }

    pub fn version(&self, endpoint: usize, subgraph: &str) -> Option<String> {
        self.read(endpoint, subgraph, |s| s.version.clone()).flatten()
    }

    pub fn has_errors(&self, endpoint: usize, subgraph: &str) -> bool {
        self.read(endpoint, subgraph, |s| s.has_errors)
            .unwrap_or(false)
    }

    pub fn has_fatal_errors(&self, endpoint: usize, subgraph: &str) -> bool {
        self.read(endpoint, subgraph, |s| s.has_fatal_errors)
            .unwrap_or(false)
    }

    pub fn selected_at(&self, endpoint: usize, subgraph: &str) -> Option<Instant> {
        self.read(endpoint, subgraph, |s| s.selected_at).flatten()
    }

    /// A new deployment starts over from block 0.
    pub fn set_deployment(&self, endpoint: usize, subgraph: &str, deployment: DeploymentId) {
        self.update(endpoint, subgraph, |s| {
            if s.deployment != Some(deployment) {
                s.block = 0;
            }
            s.deployment = Some(deployment);
        });
    }

    pub fn set_chain(&self, endpoint: usize, subgraph: &str, chain: &str) {
        self.update(endpoint, subgraph, |s| s.chain = Some(chain.to_string()));
    }

    /// Raises the known block and stamps `out_of_sync_at` if the endpoint is
    /// behind the chain afterwards. Smaller blocks are ignored.
    pub async fn set_block(
        &self,
        endpoint: usize,
        subgraph: &str,
        block: u64,
    ) -> Result<(), ChainHeadError> {
        self.update(endpoint, subgraph, |s| s.block = s.block.max(block));
        if !self.is_in_sync(endpoint, subgraph).await? {
            self.update(endpoint, subgraph, |s| {
                s.out_of_sync_at = Some(Instant::now())
            });
        }
        Ok(())
    }

    /// Records the version and stamps `stale_version_at` if it is behind the
    /// latest active version of the subgraph.
    pub async fn set_version(
        &self,
        endpoint: usize,
        subgraph: &str,
        version: &str,
    ) -> Result<(), ChainHeadError> {
        self.update(endpoint, subgraph, |s| s.version = Some(version.to_string()));
        if self.is_stale_version(endpoint, subgraph).await? {
            self.update(endpoint, subgraph, |s| {
                s.stale_version_at = Some(Instant::now())
            });
        }
        Ok(())
    }

    /// An erroring endpoint forgets its block until it answers again.
    pub fn set_has_errors(&self, endpoint: usize, subgraph: &str, has_errors: bool) {
        self.update(endpoint, subgraph, |s| {
            if has_errors {
                s.block = 0;
                s.error_at = Some(Instant::now());
            }
            s.has_errors = has_errors;
        });
    }

    pub fn set_has_fatal_errors(&self, endpoint: usize, subgraph: &str, has_fatal_errors: bool) {
        self.update(endpoint, subgraph, |s| s.has_fatal_errors = has_fatal_errors);
        self.set_has_errors(endpoint, subgraph, has_fatal_errors);
    }

    pub fn mark_selected(&self, endpoint: usize, subgraph: &str) {
        self.update(endpoint, subgraph, |s| s.selected_at = Some(Instant::now()));
    }

    /// Records everything learned from a successful response.
    pub async fn update_states_with_result(
        &self,
        endpoint: usize,
        subgraph: &str,
        metadata: &SubgraphMetadata,
    ) -> Result<(), ChainHeadError> {
        self.update(endpoint, subgraph, |s| s.result_at = Some(Instant::now()));
        self.set_deployment(endpoint, subgraph, metadata.deployment());
        self.set_chain(endpoint, subgraph, metadata.chain());
        self.set_block(endpoint, subgraph, metadata.block()).await?;
        self.set_version(endpoint, subgraph, metadata.version())
            .await?;
        self.set_has_errors(endpoint, subgraph, false);
        Ok(())
    }

    pub async fn chain_head(&self, chain: &str) -> Result<u64, ChainHeadError> {
        self.chain_heads.chain_head(chain).await
    }

    pub fn latest_subgraph_error_check(&self, subgraph: &str) -> Option<Instant> {
        self.error_checks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(subgraph)
            .copied()
    }

    pub fn mark_subgraph_error_check(&self, subgraph: &str) {
        self.error_checks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(subgraph.to_string(), Instant::now());
    }

    /// Highest block any endpoint reported for the subgraph.
    pub fn latest_block(&self, subgraph: &str) -> u64 {
        self.topology
            .endpoints_for_subgraph(subgraph)
            .into_iter()
            .map(|endpoint| self.block(endpoint, subgraph))
            .max()
            .unwrap_or(0)
    }

    /// Newest version reported by any endpoint.
    pub fn latest_version(&self, subgraph: &str) -> Option<String> {
        self.topology
            .endpoints_for_subgraph(subgraph)
            .into_iter()
            .filter_map(|endpoint| self.version(endpoint, subgraph))
            .max_by(|a, b| compare_versions(Some(a), Some(b)))
    }

    /// Newest version among endpoints that are in sync and free of errors.
    pub async fn latest_active_version(
        &self,
        subgraph: &str,
    ) -> Result<Option<String>, ChainHeadError> {
        let mut latest: Option<String> = None;
        for endpoint in self.topology.endpoints_for_subgraph(subgraph) {
            if self.has_errors(endpoint, subgraph) || !self.is_in_sync(endpoint, subgraph).await? {
                continue;
            }
            let version = self.version(endpoint, subgraph);
            if compare_versions(version.as_deref(), latest.as_deref()) == Ordering::Greater {
                latest = version;
            }
        }
        Ok(latest)
    }

    /// True if the endpoint's block is within 50 blocks of its chain head.
    ///
    /// An endpoint whose chain is unknown, or has no configured RPC, is never
    /// in sync.
    pub async fn is_in_sync(&self, endpoint: usize, subgraph: &str) -> Result<bool, ChainHeadError> {
        let Some(chain) = self.chain(endpoint, subgraph) else {
            return Ok(false);
        };
        let head = match self.chain_heads.chain_head(&chain).await {
            Ok(head) => head,
            Err(ChainHeadError::UnknownChain(_)) => return Ok(false),
            Err(e) => return Err(e),
        };
        Ok(self.block(endpoint, subgraph) + IN_SYNC_BLOCKS > head)
    }

    pub async fn is_stale_version(
        &self,
        endpoint: usize,
        subgraph: &str,
    ) -> Result<bool, ChainHeadError> {
        let latest_active = self.latest_active_version(subgraph).await?;
        let version = self.version(endpoint, subgraph);
        Ok(compare_versions(version.as_deref(), latest_active.as_deref()) == Ordering::Less)
    }

    pub fn all_have_errors(&self, subgraph: &str) -> bool {
        self.topology
            .endpoints_for_subgraph(subgraph)
            .into_iter()
            .all(|endpoint| self.has_errors(endpoint, subgraph))
    }

    pub fn is_recently_having_error(&self, endpoint: usize, subgraph: &str) -> bool {
        let state = self.get(endpoint, subgraph);
        state.has_errors && is_recent(state.error_at)
    }

    pub async fn is_recently_out_of_sync(
        &self,
        endpoint: usize,
        subgraph: &str,
    ) -> Result<bool, ChainHeadError> {
        Ok(!self.is_in_sync(endpoint, subgraph).await?
            && is_recent(self.get(endpoint, subgraph).out_of_sync_at))
    }

    pub async fn is_recently_stale_version(
        &self,
        endpoint: usize,
        subgraph: &str,
    ) -> Result<bool, ChainHeadError> {
        Ok(self.is_stale_version(endpoint, subgraph).await?
            && is_recent(self.get(endpoint, subgraph).stale_version_at))
    }
}

fn is_recent(at: Option<Instant>) -> bool {
    at.is_some_and(|at| at.elapsed() < TROUBLE_WINDOW)
}

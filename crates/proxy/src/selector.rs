// Copyright 2023-, Edge & Node, GraphOps, and Semiotic Labs.
// SPDX-License-Identifier: Apache-2.0

use std::{cmp::Ordering, time::Duration};

use subgraph_proxy_monitor::ChainHeadError;
use tokio::time::Instant;

use crate::{history::AttemptHistory, limiter::Capacity, state::EndpointStateStore};

/// Results this close together are comparable by block, and an endpoint
/// selected less than this long ago is not idle.
const RECENT_RESULT: Duration = Duration::from_millis(2000);

/// Chooses the endpoint for the next attempt of a request.
///
/// Candidates are the endpoints serving the subgraph that have capacity and
/// no issue in the request's history. Endpoints with recent trouble are
/// avoided unless nothing else is left. The rest are ranked by retry locality,
/// then freshness, then load, and the first healthy endpoint that has been
/// idle for a while is preferred over the top ranked one.
pub struct EndpointSelector<'a> {
    state: &'a EndpointStateStore,
    capacity: &'a dyn Capacity,
}

#[derive(Debug)]
struct Candidate {
    index: usize,
    block: u64,
    result_at: Option<Instant>,
    utilization: f64,
    preference: f64,
}

impl Candidate {
    fn is_overutilized(&self) -> bool {
        self.utilization >= 1.0
    }
}

impl<'a> EndpointSelector<'a> {
    pub fn new(state: &'a EndpointStateStore, capacity: &'a dyn Capacity) -> Self {
        Self { state, capacity }
    }

    /// Returns the endpoint to try next, or `None` if every endpoint is
    /// excluded or out of capacity. The returned endpoint is stamped as
    /// selected.
    ///
    /// `requested_block` is the highest block the query explicitly asks for.
    /// Without one, retrying the previous endpoint needs it to have reached the
    /// latest block known for the subgraph.
    pub async fn choose(
        &self,
        subgraph: &str,
        history: &AttemptHistory,
        requested_block: Option<u64>,
    ) -> Result<Option<usize>, ChainHeadError> {
        let chosen = self.rank(subgraph, history, requested_block).await?;
        if let Some(endpoint) = chosen {
            self.state.mark_selected(endpoint, subgraph);
        }
        Ok(chosen)
    }

    async fn rank(
        &self,
        subgraph: &str,
        history: &AttemptHistory,
        requested_block: Option<u64>,
    ) -> Result<Option<usize>, ChainHeadError> {
        let mut options: Vec<usize> = self
            .state
            .topology()
            .endpoints_for_subgraph(subgraph)
            .into_iter()
            .filter(|&endpoint| {
                !history.has_issue(endpoint) && !self.capacity.is_depleted(endpoint, subgraph)
            })
            .collect();

        match options.as_slice() {
            [] => return Ok(None),
            [only] => return Ok(Some(*only)),
            _ => {}
        }

        let mut untroubled = Vec::with_capacity(options.len());
        for &endpoint in &options {
            if !self.is_troublesome(endpoint, subgraph).await? {
                untroubled.push(endpoint);
            }
        }
        if !untroubled.is_empty() {
            options = untroubled;
        }

        if options.len() > 1 {
            let minimal_block =
                requested_block.unwrap_or_else(|| self.state.latest_block(subgraph));
            let mut candidates: Vec<Candidate> = options
                .iter()
                .map(|&endpoint| self.candidate(endpoint, subgraph))
                .collect();
            sort_stable_by(&mut candidates, |a, b| {
                compare(a, b, history.last(), minimal_block)
            });
            options = candidates.into_iter().map(|c| c.index).collect();
        }

        for &endpoint in &options {
            if self.is_idle_and_healthy(endpoint, subgraph).await? {
                return Ok(Some(endpoint));
            }
        }
        Ok(options.first().copied())
    }

    fn candidate(&self, endpoint: usize, subgraph: &str) -> Candidate {
        let state = self.state.get(endpoint, subgraph);
        Candidate {
            index: endpoint,
            block: state.block,
            result_at: state.result_at,
            utilization: self.capacity.utilization(endpoint, subgraph),
            preference: self.state.topology().utilization_preference(endpoint),
        }
    }

    /// Recently erroring, out of sync or serving a stale version.
    async fn is_troublesome(&self, endpoint: usize, subgraph: &str) -> Result<bool, ChainHeadError> {
        Ok(self.state.is_recently_having_error(endpoint, subgraph)
            || self.state.is_recently_out_of_sync(endpoint, subgraph).await?
            || self
                .state
                .is_recently_stale_version(endpoint, subgraph)
                .await?)
    }

    async fn is_idle_and_healthy(
        &self,
        endpoint: usize,
        subgraph: &str,
    ) -> Result<bool, ChainHeadError> {
        let state = self.state.get(endpoint, subgraph);
        let idle = state
            .selected_at
            .map_or(true, |at| at.elapsed() > RECENT_RESULT);
        if !idle || state.has_fatal_errors || self.state.is_recently_having_error(endpoint, subgraph)
        {
            return Ok(false);
        }
        Ok(!self.state.is_stale_version(endpoint, subgraph).await?
            && self.state.is_in_sync(endpoint, subgraph).await?)
    }
}

/// `Less` ranks `a` before `b`.
fn compare(a: &Candidate, b: &Candidate, last: Option<usize>, minimal_block: u64) -> Ordering {
    let can_retry = |c: &Candidate| c.block >= minimal_block && !c.is_overutilized();

    // Stay on the endpoint already being interrogated while it is viable
    if last == Some(a.index) {
        if can_retry(a) {
            return Ordering::Less;
        } else if !b.is_overutilized() {
            return Ordering::Greater;
        }
    } else if last == Some(b.index) {
        if can_retry(b) {
            return Ordering::Greater;
        } else if !a.is_overutilized() {
            return Ordering::Less;
        }
    }

    if let (Some(result_a), Some(result_b)) = (a.result_at, b.result_at) {
        let apart = result_a
            .saturating_duration_since(result_b)
            .max(result_b.saturating_duration_since(result_a));
        if apart < RECENT_RESULT {
            if a.block > b.block && !a.is_overutilized() {
                return Ordering::Less;
            } else if b.block > a.block && !b.is_overutilized() {
                return Ordering::Greater;
            }
        }
    }

    if a.utilization < a.preference && b.utilization < b.preference {
        return a.index.cmp(&b.index);
    }
    a.utilization
        .total_cmp(&b.utilization)
        .then(a.index.cmp(&b.index))
}

/// Insertion sort. Unlike `slice::sort_by` it tolerates a comparator that is
/// not a total order, which the ranking rules above are not.
fn sort_stable_by<T>(items: &mut [T], mut compare: impl FnMut(&T, &T) -> Ordering) {
    for i in 1..items.len() {
        let mut j = i;
        while j > 0 && compare(&items[j - 1], &items[j]) == Ordering::Greater {
            items.swap(j - 1, j);
            j -= 1;
        }
    }
}

// Copyright 2023-, Edge & Node, GraphOps, and Semiotic Labs.
// SPDX-License-Identifier: Apache-2.0

use std::{fmt::Write as _, sync::Arc, time::Duration};

use serde_json::Value;
use subgraph_proxy_monitor::ChainHeadError;
use subgraph_proxy_query::{
    add_metadata_to_query, max_requested_block, query_features, remove_unrequested_metadata,
    required_indexed_block, RequiredBlock, SubgraphMetadata,
};
use thegraph_core::DeploymentId;
use tokio::time::Instant;

use crate::{
    backend::{BackendError, SubgraphBackend},
    classify::{classifier_for, BlockRangeError},
    error::ProxyError,
    history::AttemptHistory,
    limiter::{Capacity, RateLimiters},
    notifier::{Notifier, Priority},
    selector::EndpointSelector,
    state::EndpointStateStore,
    status::{StatusChecker, StatusError},
};

/// A failing subgraph is probed for fatal errors at most this often.
const ERROR_CHECK_INTERVAL: Duration = Duration::from_secs(60);

/// Requests for blocks this far past the chain head may still be answered by
/// the time they are retried.
const FUTURE_BLOCK_TOLERANCE: u64 = 5;

#[derive(Debug, Clone, PartialEq)]
pub struct ResponseMeta {
    pub version: String,
    pub deployment: DeploymentId,
    pub chain: String,
    pub indexed_block: u64,
    pub endpoint: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProxyResponse {
    /// The `data` of the response, without metadata the query did not ask for
    pub body: Value,
    pub meta: ResponseMeta,
}

struct Accepted {
    endpoint: usize,
    data: Value,
    metadata: SubgraphMetadata,
}

/// Outcome of a single attempt.
enum Step {
    Continue,
    Accept(Accepted),
    Abort(ProxyError),
}

/// Why the attempt loop ended without an answer.
enum Exit {
    NoneAvailable,
    AttemptsExhausted,
}

/// Serves subgraph queries from whichever endpoint gives the most consistent
/// answer.
///
/// Endpoints are tried one at a time. A response is only accepted if it comes
/// from an endpoint that is in sync with its chain, runs the latest version of
/// the subgraph, and is not older than a response already served for the
/// subgraph.
pub struct SubgraphProxy {
    state: Arc<EndpointStateStore>,
    limiters: Arc<RateLimiters>,
    backend: Arc<dyn SubgraphBackend>,
    notifier: Arc<dyn Notifier>,
    status: StatusChecker,
    allow_unsyncd: bool,
    max_attempts: usize,
    retry_delay: Duration,
}

#[bon::bon]
impl SubgraphProxy {
    #[builder]
    pub fn new(
        state: Arc<EndpointStateStore>,
        limiters: Arc<RateLimiters>,
        backend: Arc<dyn SubgraphBackend>,
        notifier: Arc<dyn Notifier>,
        #[builder(default)] allow_unsyncd: bool,
        #[builder(default = 10)] max_attempts: usize,
        #[builder(default = Duration::from_millis(500))] retry_delay: Duration,
    ) -> Self {
        let status = StatusChecker::new(
            state.clone(),
            limiters.clone(),
            backend.clone(),
            notifier.clone(),
        );
        Self {
            state,
            limiters,
            backend,
            notifier,
            status,
            allow_unsyncd,
            max_attempts,
            retry_delay,
        }
    }
}

impl SubgraphProxy {
    pub fn state(&self) -> &EndpointStateStore {
        &self.state
    }

    pub fn status(&self) -> &StatusChecker {
        &self.status
    }

    pub(crate) fn limiters(&self) -> &RateLimiters {
        &self.limiters
    }

    pub(crate) fn backend(&self) -> &dyn SubgraphBackend {
        self.backend.as_ref()
    }

    pub async fn handle_proxy_request(
        &self,
        subgraph: &str,
        query: &str,
        variables: Option<&Value>,
    ) -> Result<ProxyResponse, ProxyError> {
        let topology = self.state.topology();
        if !topology.is_enabled(subgraph) || topology.endpoints_for_subgraph(subgraph).is_empty() {
            return Err(ProxyError::unknown_subgraph(subgraph));
        }

        let start = Instant::now();
        let start_load = self.load(subgraph);
        let mut history = AttemptHistory::new();
        let result = self
            .reliable_result(subgraph, query, variables, &mut history)
            .await;

        let elapsed_ms = start.elapsed().as_millis() as u64;
        let features = query_features(query);
        let end_load = self.load(subgraph);
        match &result {
            Ok(accepted) => tracing::info!(
                subgraph,
                endpoint = accepted.endpoint,
                elapsed_ms,
                steps = %history.steps(),
                issues = %history.issues(),
                features = %features,
                start_load = %start_load,
                end_load = %end_load,
                "[success]"
            ),
            Err(e) => tracing::warn!(
                subgraph,
                elapsed_ms,
                steps = %history.steps(),
                issues = %history.issues(),
                features = %features,
                start_load = %start_load,
                end_load = %end_load,
                error = %e,
                "<failure>"
            ),
        }

        let Accepted {
            endpoint,
            data,
            metadata,
        } = result?;
        Ok(ProxyResponse {
            body: remove_unrequested_metadata(data, query),
            meta: ResponseMeta {
                version: metadata.version().to_string(),
                deployment: metadata.deployment(),
                chain: metadata.chain().to_string(),
                indexed_block: metadata.block(),
                endpoint,
            },
        })
    }

    async fn reliable_result(
        &self,
        subgraph: &str,
        query: &str,
        variables: Option<&Value>,
        history: &mut AttemptHistory,
    ) -> Result<Accepted, ProxyError> {
        let required = required_indexed_block(query, variables);
        let requested_block = max_requested_block(query);
        let query = add_metadata_to_query(query);
        let selector = EndpointSelector::new(&self.state, self.limiters.as_ref());
        let mut errors = Vec::new();

        let exit = loop {
            if history.len() >= self.max_attempts {
                break Exit::AttemptsExhausted;
            }
            let Some(endpoint) = selector.choose(subgraph, history, requested_block).await? else {
                break Exit::NoneAvailable;
            };
            let step = self
                .attempt(endpoint, subgraph, &query, variables, required, history, &mut errors)
                .await?;
            match step {
                Step::Continue => continue,
                Step::Accept(accepted) => return Ok(accepted),
                Step::Abort(e) => return Err(e),
            }
        };

        Err(self.failure_reason(subgraph, &errors, history, exit).await)
    }

    #[allow(clippy::too_many_arguments)]
    async fn attempt(
        &self,
        endpoint: usize,
        subgraph: &str,
        query: &str,
        variables: Option<&Value>,
        required: RequiredBlock,
        history: &mut AttemptHistory,
        errors: &mut Vec<String>,
    ) -> Result<Step, ChainHeadError> {
        let call = self.backend.query(endpoint, subgraph, query, variables);
        let response = match self.limiters.execute(endpoint, subgraph, call).await {
            Ok(response) => response,
            Err(_) => return Ok(Step::Abort(self.capacity_exceeded(subgraph, history))),
        };
        let data = match response {
            Ok(data) => data,
            Err(e) => return self.handle_error(endpoint, subgraph, e, history, errors).await,
        };
        let metadata = match SubgraphMetadata::from_response(&data) {
            Ok(metadata) => metadata,
            Err(e) => {
                history.failed(endpoint);
                errors.push(format!("Invalid subgraph metadata in response: {e}"));
                return Ok(Step::Continue);
            }
        };

        self.state
            .update_states_with_result(endpoint, subgraph, &metadata)
            .await?;
        for failed in history.failed_endpoints() {
            self.state.set_has_errors(failed, subgraph, true);
        }

        let block = metadata.block();
        if required.is_above(block)
            && !self.allow_unsyncd
            && !self.state.is_in_sync(endpoint, subgraph).await?
        {
            history.unsyncd(endpoint);
            return Ok(Step::Continue);
        }
        // An old version is not stale once the newer one fails or falls behind
        if self.state.is_stale_version(endpoint, subgraph).await? {
            history.stale(endpoint);
            return Ok(Step::Continue);
        }
        // Never answer with data older than what was already served
        if block < self.state.latest_block(subgraph) {
            history.wobbled(endpoint);
            self.delay_if_all_tried(subgraph, history).await;
            return Ok(Step::Continue);
        }

        history.accepted(endpoint);
        Ok(Step::Accept(Accepted {
            endpoint,
            data,
            metadata,
        }))
    }

    async fn handle_error(
        &self,
        endpoint: usize,
        subgraph: &str,
        error: BackendError,
        history: &mut AttemptHistory,
        errors: &mut Vec<String>,
    ) -> Result<Step, ChainHeadError> {
        let message = error.to_string();
        let block_range_error = self
            .state
            .topology()
            .provider(endpoint)
            .and_then(|provider| classifier_for(provider).classify(&message));

        match block_range_error {
            Some(BlockRangeError::BeforeEarliest {
                earliest,
                requested,
            }) => {
                history.failed(endpoint);
                Ok(Step::Abort(ProxyError::InvalidRequest(format!(
                    "The requested block {requested} is smaller than the earliest accessible \
                    block for {subgraph}: {earliest}."
                ))))
            }
            Some(BlockRangeError::NotYetIndexed {
                indexed_up_to,
                requested,
            }) => {
                if let Some(chain) = self.state.chain(endpoint, subgraph) {
                    let head = match self.state.chain_head(&chain).await {
                        Ok(head) => Some(head),
                        Err(ChainHeadError::UnknownChain(_)) => None,
                        Err(e) => return Err(e),
                    };
                    if head.is_some_and(|head| requested > head + FUTURE_BLOCK_TOLERANCE) {
                        history.failed(endpoint);
                        return Ok(Step::Abort(ProxyError::InvalidRequest(format!(
                            "The requested block {requested} is invalid for chain {chain}."
                        ))));
                    }
                }

                history.behind_but_retryable(endpoint);
                if let Some(block) = indexed_up_to {
                    self.state.set_block(endpoint, subgraph, block).await?;
                }
                self.delay_if_all_tried(subgraph, history).await;
                Ok(Step::Continue)
            }
            None => {
                tracing::debug!(subgraph, endpoint, error = %message, "Endpoint failed");
                history.failed(endpoint);
                errors.push(message);
                Ok(Step::Continue)
            }
        }
    }

    /// Pauses before retrying once every endpoint still eligible for the
    /// request has been tried.
    async fn delay_if_all_tried(&self, subgraph: &str, history: &AttemptHistory) {
        let all_tried = self
            .state
            .topology()
            .endpoints_for_subgraph(subgraph)
            .into_iter()
            .filter(|&endpoint| {
                !history.has_issue(endpoint) && !self.limiters.is_depleted(endpoint, subgraph)
            })
            .all(|endpoint| history.was_attempted(endpoint));
        if all_tried {
            tokio::time::sleep(self.retry_delay).await;
        }
    }

    fn capacity_exceeded(&self, subgraph: &str, history: &AttemptHistory) -> ProxyError {
        let message = if history.issue_count() == 0 {
            format!(
                "Rate limit exceeded on all endpoints for {subgraph}. \
                No endpoints attempted to service this request."
            )
        } else {
            format!(
                "Rate limit exceeded on endpoint(s) for {subgraph}. \
                At least one endpoint tried and failed this request."
            )
        };
        self.notifier.notify(&message, Priority::Normal);
        ProxyError::CapacityExceeded
    }

    async fn failure_reason(
        &self,
        subgraph: &str,
        errors: &[String],
        history: &AttemptHistory,
        exit: Exit,
    ) -> ProxyError {
        let roster = self.state.topology().endpoints_for_subgraph(subgraph).len();
        if history.issue_count() < roster {
            // Some endpoint never got to fail, so it was out of capacity or
            // kept answering with data too old to serve
            return match exit {
                Exit::NoneAvailable => self.capacity_exceeded(subgraph, history),
                Exit::AttemptsExhausted => ProxyError::NotYetIndexed,
            };
        }

        let failed = history.failed_endpoints();
        if !failed.is_empty() {
            return self.failed_everywhere(subgraph, errors, &failed).await;
        }
        if !history.unsyncd_endpoints().is_empty() {
            self.notifier.notify(
                &format!("{subgraph} has fallen behind. No endpoint has indexed up to the latest block."),
                Priority::Normal,
            );
            return ProxyError::NotYetIndexed;
        }
        ProxyError::stale_only()
    }

    /// Tells a broken backend apart from a bad query by probing an endpoint
    /// for fatal indexing errors.
    async fn failed_everywhere(&self, subgraph: &str, errors: &[String], failed: &[usize]) -> ProxyError {
        let bad_request = || {
            errors
                .first()
                .map_or_else(ProxyError::offline, |e| ProxyError::InvalidRequest(e.clone()))
        };

        let recently_checked = self
            .state
            .latest_subgraph_error_check(subgraph)
            .is_some_and(|at| at.elapsed() < ERROR_CHECK_INTERVAL);
        if recently_checked {
            return if self.state.all_have_errors(subgraph) {
                ProxyError::offline()
            } else {
                bad_request()
            };
        }

        let selector = EndpointSelector::new(&self.state, self.limiters.as_ref());
        let endpoint = match selector.choose(subgraph, &AttemptHistory::new(), None).await {
            Ok(endpoint) => endpoint,
            Err(e) => return e.into(),
        };
        self.state.mark_subgraph_error_check(subgraph);

        let probe = match endpoint {
            Some(endpoint) => Some((endpoint, self.status.check_fatal_error(endpoint, subgraph).await)),
            None => None,
        };
        match probe {
            // The endpoint is healthy, so the query is at fault
            Some((_, Ok(None))) => return bad_request(),
            Some((_, Err(StatusError::RateLimited(_)))) => return ProxyError::CapacityExceeded,
            Some((endpoint, Err(e))) => {
                tracing::warn!(subgraph, endpoint, error = %e, "Failed to retrieve status");
            }
            Some((_, Ok(Some(_)))) | None => {}
        }

        let already_down = self.state.all_have_errors(subgraph);
        for &endpoint in failed {
            self.state.set_has_errors(endpoint, subgraph, true);
        }
        if !already_down && self.state.all_have_errors(subgraph) {
            self.notifier.notify(
                &format!("All endpoints failed for {subgraph}. The subgraph may be offline."),
                Priority::Normal,
            );
        }
        ProxyError::offline()
    }

    /// Utilization of every endpoint serving the subgraph, e.g. `e-0: 33%, e-1: 0%`.
    fn load(&self, subgraph: &str) -> String {
        let mut load = String::new();
        for endpoint in self.state.topology().endpoints_for_subgraph(subgraph) {
            if !load.is_empty() {
                load.push_str(", ");
            }
            let utilization = self.limiters.utilization(endpoint, subgraph);
            let _ = write!(load, "e-{endpoint}: {:.0}%", utilization * 100.0);
        }
        load
    }
}

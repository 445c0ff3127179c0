// Copyright 2023-, Edge & Node, GraphOps, and Semiotic Labs.
// SPDX-License-Identifier: Apache-2.0

use std::{
    collections::{HashMap, HashSet, VecDeque},
    sync::{Arc, Mutex},
    time::Duration,
};

use async_trait::async_trait;
use serde_json::Value;
use subgraph_proxy_monitor::{ChainHeadError, ChainHeadSource, ChainHeadTracker};
use test_assets::{endpoint_config, BEAN, CHAIN_HEAD};
use thegraph_core::DeploymentId;

use crate::{
    backend::{BackendError, SubgraphBackend},
    limiter::{Capacity, RateLimiters},
    notifier::{Notifier, Priority},
    proxy::SubgraphProxy,
    state::EndpointStateStore,
    topology::Topology,
};

/// Chain heads set by the test. Starts with `ethereum` at [`CHAIN_HEAD`].
pub struct TestChainHeads {
    heads: Mutex<HashMap<String, Option<u64>>>,
}

impl Default for TestChainHeads {
    fn default() -> Self {
        Self {
            heads: Mutex::new(HashMap::from([("ethereum".to_string(), Some(CHAIN_HEAD))])),
        }
    }
}

impl TestChainHeads {
    pub fn set(&self, chain: &str, head: u64) {
        self.heads
            .lock()
            .unwrap()
            .insert(chain.to_string(), Some(head));
    }

    /// The chain's RPC starts returning garbage.
    pub fn fail(&self, chain: &str) {
        self.heads.lock().unwrap().insert(chain.to_string(), None);
    }
}

#[async_trait]
impl ChainHeadSource for TestChainHeads {
    async fn block_number(&self, chain: &str) -> Result<u64, ChainHeadError> {
        match self.heads.lock().unwrap().get(chain) {
            Some(Some(head)) => Ok(*head),
            Some(None) => Err(ChainHeadError::InvalidBlockNumber {
                chain: chain.to_string(),
                value: "0xzz".to_string(),
            }),
            None => Err(ChainHeadError::UnknownChain(chain.to_string())),
        }
    }
}

fn topology(endpoints: usize, burst_capacity: u32) -> Arc<Topology> {
    let endpoints = (0..endpoints)
        .map(|i| {
            endpoint_config()
                .url(format!("https://e{i}.example.com/<sg-id>/api"))
                .burst_capacity(burst_capacity)
                .call()
        })
        .collect();
    Arc::new(Topology::new(endpoints, [BEAN.to_string()]))
}

fn state(topology: Arc<Topology>) -> (Arc<EndpointStateStore>, Arc<TestChainHeads>) {
    let chain_heads = Arc::new(TestChainHeads::default());
    // Heads are refetched on every lookup at a new instant
    let tracker = Arc::new(ChainHeadTracker::new(chain_heads.clone(), Duration::ZERO));
    (Arc::new(EndpointStateStore::new(topology, tracker)), chain_heads)
}

/// State for `endpoints` Alchemy endpoints that all serve [`BEAN`].
pub fn store(endpoints: usize) -> (Arc<EndpointStateStore>, Arc<TestChainHeads>) {
    state(topology(endpoints, 10))
}

/// Capacity that is fixed by the test.
#[derive(Default)]
pub struct TestCapacity {
    depleted: HashSet<usize>,
    utilization: HashMap<usize, f64>,
}

impl TestCapacity {
    pub fn depleted(mut self, endpoint: usize) -> Self {
        self.depleted.insert(endpoint);
        self
    }

    pub fn utilization(mut self, endpoint: usize, utilization: f64) -> Self {
        self.utilization.insert(endpoint, utilization);
        self
    }
}

impl Capacity for TestCapacity {
    fn is_depleted(&self, endpoint: usize, _: &str) -> bool {
        self.depleted.contains(&endpoint)
    }

    fn utilization(&self, endpoint: usize, _: &str) -> f64 {
        self.utilization.get(&endpoint).copied().unwrap_or(0.0)
    }
}

/// Backend answering with scripted responses per endpoint.
///
/// Responses are served in order and the last one is repeated.
#[derive(Default)]
pub struct MockBackend {
    responses: Mutex<HashMap<usize, VecDeque<Result<Value, String>>>>,
    fatal_errors: Mutex<HashMap<usize, String>>,
    failing_status: Mutex<HashSet<usize>>,
    calls: Mutex<Vec<usize>>,
    status_checks: Mutex<Vec<usize>>,
}

impl MockBackend {
    pub fn respond(&self, endpoint: usize, response: Result<Value, String>) {
        self.responses
            .lock()
            .unwrap()
            .entry(endpoint)
            .or_default()
            .push_back(response);
    }

    pub fn set_fatal_error(&self, endpoint: usize, message: Option<&str>) {
        let mut fatal_errors = self.fatal_errors.lock().unwrap();
        match message {
            Some(message) => fatal_errors.insert(endpoint, message.to_string()),
            None => fatal_errors.remove(&endpoint),
        };
    }

    pub fn fail_status(&self, endpoint: usize) {
        self.failing_status.lock().unwrap().insert(endpoint);
    }

    /// Endpoints queried, in order.
    pub fn calls(&self) -> Vec<usize> {
        self.calls.lock().unwrap().clone()
    }

    /// Endpoints whose status was probed, in order.
    pub fn status_checks(&self) -> Vec<usize> {
        self.status_checks.lock().unwrap().clone()
    }
}

#[async_trait]
impl SubgraphBackend for MockBackend {
    async fn query(
        &self,
        endpoint: usize,
        _: &str,
        _: &str,
        _: Option<&Value>,
    ) -> Result<Value, BackendError> {
        self.calls.lock().unwrap().push(endpoint);
        let mut responses = self.responses.lock().unwrap();
        let queue = responses.entry(endpoint).or_default();
        let response = if queue.len() > 1 {
            queue.pop_front()
        } else {
            queue.front().cloned()
        };
        match response {
            Some(Ok(data)) => Ok(data),
            Some(Err(message)) => Err(BackendError::GraphQL(message)),
            None => Err(BackendError::GraphQL(format!("No response for e-{endpoint}"))),
        }
    }

    async fn fatal_error(
        &self,
        endpoint: usize,
        subgraph: &str,
        _: Option<DeploymentId>,
    ) -> Result<Option<String>, BackendError> {
        self.status_checks.lock().unwrap().push(endpoint);
        if self.failing_status.lock().unwrap().contains(&endpoint) {
            return Err(BackendError::StatusUnknown {
                endpoint,
                subgraph: subgraph.to_string(),
                reason: "status endpoint timed out".to_string(),
            });
        }
        Ok(self.fatal_errors.lock().unwrap().get(&endpoint).cloned())
    }
}

#[derive(Default)]
pub struct RecordingNotifier {
    messages: Mutex<Vec<(String, Priority)>>,
}

impl RecordingNotifier {
    pub fn messages(&self) -> Vec<(String, Priority)> {
        self.messages.lock().unwrap().clone()
    }
}

impl Notifier for RecordingNotifier {
    fn notify(&self, message: &str, priority: Priority) {
        self.messages
            .lock()
            .unwrap()
            .push((message.to_string(), priority));
    }
}

pub struct TestProxy {
    pub proxy: SubgraphProxy,
    pub state: Arc<EndpointStateStore>,
    pub limiters: Arc<RateLimiters>,
    pub backend: Arc<MockBackend>,
    pub notifier: Arc<RecordingNotifier>,
    pub chain_heads: Arc<TestChainHeads>,
}

impl TestProxy {
    /// Takes every slot of the endpoint's limiter.
    pub async fn drain(&self, endpoint: usize) {
        let limiter = self.limiters.get(endpoint, BEAN).unwrap();
        while !limiter.is_depleted() {
            limiter.execute(async {}).await.unwrap();
        }
    }
}

/// Proxy for [`BEAN`] over mocked endpoints.
#[bon::builder]
pub fn test_proxy(
    #[builder(default = 2)] endpoints: usize,
    #[builder(default = 10)] burst_capacity: u32,
    #[builder(default)] allow_unsyncd: bool,
) -> TestProxy {
    let topology = topology(endpoints, burst_capacity);
    let limiters = Arc::new(RateLimiters::new(&topology));
    let (state, chain_heads) = state(topology);
    let backend = Arc::new(MockBackend::default());
    let notifier = Arc::new(RecordingNotifier::default());

    let proxy = SubgraphProxy::builder()
        .state(state.clone())
        .limiters(limiters.clone())
        .backend(backend.clone())
        .notifier(notifier.clone())
        .allow_unsyncd(allow_unsyncd)
        .build();

    TestProxy {
        proxy,
        state,
        limiters,
        backend,
        notifier,
        chain_heads,
    }
}

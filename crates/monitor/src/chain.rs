// Copyright 2023-, Edge & Node, GraphOps, and Semiotic Labs.
// SPDX-License-Identifier: Apache-2.0

use std::{
    collections::{BTreeMap, HashMap},
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use async_trait::async_trait;
use jsonrpsee::{
    core::{client::ClientT, ClientError},
    http_client::{HttpClient, HttpClientBuilder},
    rpc_params,
};
use thiserror::Error;
use tokio::time::Instant;
use url::Url;

#[derive(Debug, Error)]
pub enum ChainHeadError {
    #[error("No RPC endpoint configured for chain `{0}`")]
    UnknownChain(String),
    #[error("Failed to fetch the block number of chain `{chain}`: {source}")]
    Rpc {
        chain: String,
        #[source]
        source: ClientError,
    },
    #[error("Chain `{chain}` returned an invalid block number `{value}`")]
    InvalidBlockNumber { chain: String, value: String },
}

/// Source of the current height of a blockchain.
#[async_trait]
pub trait ChainHeadSource: Send + Sync {
    async fn block_number(&self, chain: &str) -> Result<u64, ChainHeadError>;
}

/// Fetches chain heads with `eth_blockNumber` from one JSON-RPC node per chain.
pub struct JsonRpcChainHeads {
    clients: HashMap<String, HttpClient>,
}

impl JsonRpcChainHeads {
    pub fn new(chains: &BTreeMap<String, Url>, timeout: Duration) -> Result<Self, ClientError> {
        let clients = chains
            .iter()
            .map(|(chain, url)| {
                let client = HttpClientBuilder::default()
                    .request_timeout(timeout)
                    .build(url.as_str())?;
                Ok((chain.clone(), client))
            })
            .collect::<Result<_, ClientError>>()?;
        Ok(Self { clients })
    }
}

#[async_trait]
impl ChainHeadSource for JsonRpcChainHeads {
    async fn block_number(&self, chain: &str) -> Result<u64, ChainHeadError> {
        let client = self
            .clients
            .get(chain)
            .ok_or_else(|| ChainHeadError::UnknownChain(chain.to_string()))?;
        let value: String = client
            .request("eth_blockNumber", rpc_params![])
            .await
            .map_err(|source| ChainHeadError::Rpc {
                chain: chain.to_string(),
                source,
            })?;
        parse_quantity(&value).ok_or_else(|| ChainHeadError::InvalidBlockNumber {
            chain: chain.to_string(),
            value,
        })
    }
}

fn parse_quantity(value: &str) -> Option<u64> {
    let digits = value.strip_prefix("0x")?;
    u64::from_str_radix(digits, 16).ok()
}

struct CachedHead {
    block: u64,
    fetched_at: Instant,
}

/// Caches the latest block of each chain for `ttl`.
///
/// Concurrent callers that find the same entry expired may each fetch it.
/// Fetch failures are returned to the caller and nothing is cached.
pub struct ChainHeadTracker {
    source: Arc<dyn ChainHeadSource>,
    ttl: Duration,
    heads: Mutex<HashMap<String, CachedHead>>,
}

impl ChainHeadTracker {
    pub fn new(source: Arc<dyn ChainHeadSource>, ttl: Duration) -> Self {
        Self {
            source,
            ttl,
            heads: Mutex::new(HashMap::new()),
        }
    }

    pub async fn chain_head(&self, chain: &str) -> Result<u64, ChainHeadError> {
        if let Some(block) = self.cached(chain) {
            return Ok(block);
        }

        let block = self.source.block_number(chain).await?;
        tracing::trace!(chain, block, "Refreshed chain head");
        self.heads
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(
                chain.to_string(),
                CachedHead {
                    block,
                    fetched_at: Instant::now(),
                },
            );
        Ok(block)
    }

    fn cached(&self, chain: &str) -> Option<u64> {
        let heads = self.heads.lock().unwrap_or_else(PoisonError::into_inner);
        heads
            .get(chain)
            .filter(|head| head.fetched_at.elapsed() <= self.ttl)
            .map(|head| head.block)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU64, Ordering};

    use serde_json::json;
    use wiremock::{
        matchers::{body_partial_json, method},
        Mock, MockServer, Request, ResponseTemplate,
    };

    use super::*;

    /// Returns an increasing block number on each fetch.
    struct CountingSource {
        next: AtomicU64,
    }

    #[async_trait]
    impl ChainHeadSource for CountingSource {
        async fn block_number(&self, chain: &str) -> Result<u64, ChainHeadError> {
            match chain {
                "ethereum" => Ok(self.next.fetch_add(1, Ordering::SeqCst)),
                _ => Err(ChainHeadError::UnknownChain(chain.to_string())),
            }
        }
    }

    fn tracker(ttl: Duration) -> ChainHeadTracker {
        ChainHeadTracker::new(
            Arc::new(CountingSource {
                next: AtomicU64::new(100),
            }),
            ttl,
        )
    }

    #[tokio::test(start_paused = true)]
    async fn caches_until_ttl_expires() {
        let tracker = tracker(Duration::from_secs(5));

        assert_eq!(tracker.chain_head("ethereum").await.unwrap(), 100);
        tokio::time::advance(Duration::from_secs(4)).await;
        assert_eq!(tracker.chain_head("ethereum").await.unwrap(), 100);

        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(tracker.chain_head("ethereum").await.unwrap(), 101);
    }

    #[tokio::test]
    async fn propagates_source_errors() {
        let tracker = tracker(Duration::from_secs(5));

        let err = tracker.chain_head("arbitrum").await.unwrap_err();
        assert!(matches!(err, ChainHeadError::UnknownChain(chain) if chain == "arbitrum"));
    }

    #[test]
    fn parses_hex_quantities() {
        assert_eq!(parse_quantity("0x13a0e1d"), Some(20581917));
        assert_eq!(parse_quantity("0x0"), Some(0));
        assert_eq!(parse_quantity("13a0e1d"), None);
        assert_eq!(parse_quantity("0xzz"), None);
    }

    #[test_log::test(tokio::test)]
    async fn fetches_block_number_over_json_rpc() {
        let mock_server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(body_partial_json(json!({ "method": "eth_blockNumber" })))
            .respond_with(|request: &Request| {
                let body: serde_json::Value = request.body_json().unwrap();
                ResponseTemplate::new(200).set_body_json(json!({
                    "jsonrpc": "2.0",
                    "id": body["id"],
                    "result": "0x13a0e1d"
                }))
            })
            .mount(&mock_server)
            .await;

        let chains = BTreeMap::from([(
            "ethereum".to_string(),
            Url::parse(&mock_server.uri()).unwrap(),
        )]);
        let source = JsonRpcChainHeads::new(&chains, Duration::from_secs(5)).unwrap();

        assert_eq!(source.block_number("ethereum").await.unwrap(), 20581917);
        assert!(matches!(
            source.block_number("base").await,
            Err(ChainHeadError::UnknownChain(_))
        ));
    }
}

// Copyright 2023-, Edge & Node, GraphOps, and Semiotic Labs.
// SPDX-License-Identifier: Apache-2.0

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use axum::{
    body::to_bytes,
    http::{HeaderMap, Method, Request, StatusCode},
    Router,
};
use serde_json::{json, Value};
use subgraph_proxy::{
    EndpointStateStore, HttpBackend, LogNotifier, RateLimiters, SubgraphProxy, Topology,
};
use subgraph_proxy_monitor::{ChainHeadError, ChainHeadSource, ChainHeadTracker};
use subgraph_proxy_service::{service::ServiceRouter, QueryBody};
use test_assets::{bean_response, endpoint_config, BEAN, BEAN_DEPLOYMENT, CHAIN_HEAD};
use tower::ServiceExt;
use wiremock::{
    matchers::{body_string_contains, method, path},
    Mock, MockServer, ResponseTemplate,
};

struct EthereumHead;

#[async_trait]
impl ChainHeadSource for EthereumHead {
    async fn block_number(&self, chain: &str) -> Result<u64, ChainHeadError> {
        match chain {
            "ethereum" => Ok(CHAIN_HEAD),
            _ => Err(ChainHeadError::UnknownChain(chain.to_string())),
        }
    }
}

/// A proxy for [`BEAN`] served by a single endpoint on `server`.
fn proxy(server: &MockServer, capacity: u32) -> Arc<SubgraphProxy> {
    let endpoint = endpoint_config()
        .url(format!("{}/<sg-id>/api", server.uri()))
        .requests_per_interval(capacity)
        .burst_capacity(capacity)
        .call();
    let topology = Arc::new(Topology::new(vec![endpoint], [BEAN.to_string()]));
    let chain_heads = Arc::new(ChainHeadTracker::new(
        Arc::new(EthereumHead),
        Duration::from_secs(5),
    ));

    Arc::new(
        SubgraphProxy::builder()
            .state(Arc::new(EndpointStateStore::new(
                topology.clone(),
                chain_heads,
            )))
            .limiters(Arc::new(RateLimiters::new(&topology)))
            .backend(Arc::new(HttpBackend::new(reqwest::Client::new(), topology)))
            .notifier(Arc::new(LogNotifier))
            .build(),
    )
}

fn router(proxy: Arc<SubgraphProxy>) -> Router {
    ServiceRouter::builder().proxy(proxy).build().create_router()
}

async fn mount_bean_response(server: &MockServer) {
    Mock::given(method("POST"))
        .and(path("/bean/api"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({
                "data": bean_response(CHAIN_HEAD, "2.3.1")
            })),
        )
        .mount(server)
        .await;
}

async fn send(app: Router, uri: &str, body: String) -> (StatusCode, HeaderMap, Value) {
    let request = Request::builder()
        .method(Method::POST)
        .uri(uri)
        .header("content-type", "application/json")
        .body(body)
        .unwrap();
    let res = app.oneshot(request).await.unwrap();
    let status = res.status();
    let headers = res.headers().clone();
    let bytes = to_bytes(res.into_body(), usize::MAX).await.unwrap();
    (status, headers, serde_json::from_slice(&bytes).unwrap())
}

fn query(query: &str) -> String {
    serde_json::to_string(&QueryBody {
        query: query.to_string(),
        variables: None,
    })
    .unwrap()
}

#[test_log::test(tokio::test)]
async fn serves_query_with_metadata_headers() {
    let server = MockServer::start().await;
    mount_bean_response(&server).await;
    let app = router(proxy(&server, 10));

    let (status, headers, body) = send(app, "/bean", query("{ beanCrosses { id } }")).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(
        body,
        json!({ "data": { "beanCrosses": [{ "id": "0x01-bean" }] } })
    );
    assert_eq!(headers["x-version"], "2.3.1");
    assert_eq!(headers["x-deployment"], BEAN_DEPLOYMENT.to_string().as_str());
    assert_eq!(headers["x-chain"], "ethereum");
    assert_eq!(headers["x-indexed-block"], CHAIN_HEAD.to_string().as_str());
}

#[test_log::test(tokio::test)]
async fn rejects_unknown_subgraph() {
    let server = MockServer::start().await;
    let app = router(proxy(&server, 10));

    let (status, _, body) = send(app, "/basin", query("{ wells { id } }")).await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(
        body["message"],
        "Subgraph name 'basin' is not configured for use in this gateway."
    );
    assert!(server.received_requests().await.unwrap().is_empty());
}

#[test_log::test(tokio::test)]
async fn rejects_malformed_body() {
    let server = MockServer::start().await;
    let app = router(proxy(&server, 10));

    let (status, _, body) = send(app, "/bean", "{ beanCrosses { id } }".to_string()).await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["message"]
        .as_str()
        .unwrap()
        .starts_with("Invalid request body"));
}

#[test_log::test(tokio::test)]
async fn rejects_blocks_past_the_chain_head() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/bean/api"))
        .and(body_string_contains("beanCrosses"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "errors": [{
                "message": format!(
                    "Failed to decode `block.number` value: `subgraph {BEAN_DEPLOYMENT} has only \
                    indexed up to block number {CHAIN_HEAD} and data for block number 20590000 \
                    is therefore not yet available`"
                )
            }]
        })))
        .with_priority(1)
        .mount(&server)
        .await;
    mount_bean_response(&server).await;

    let proxy = proxy(&server, 10);
    // Learns the chain of the endpoint
    proxy.init_all_states().await;

    let (status, _, body) = send(
        router(proxy),
        "/bean",
        query("{ beanCrosses(block: { number: 20590000 }) { id } }"),
    )
    .await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(
        body["message"],
        "The requested block 20590000 is invalid for chain ethereum."
    );
}

#[test_log::test(tokio::test)]
async fn answers_too_many_requests_without_capacity() {
    let server = MockServer::start().await;
    mount_bean_response(&server).await;
    let app = router(proxy(&server, 1));

    let (status, _, _) = send(app.clone(), "/bean", query("{ beanCrosses { id } }")).await;
    assert_eq!(status, StatusCode::OK);

    let (status, _, body) = send(app, "/bean", query("{ beanCrosses { id } }")).await;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(
        body["message"],
        "The server is currently experiencing high traffic and cannot process your request. \
        Please try again later."
    );
}

#[test_log::test(tokio::test)]
async fn reports_health() {
    let server = MockServer::start().await;
    let app = router(proxy(&server, 10));

    let request = Request::builder()
        .method(Method::GET)
        .uri("/health")
        .body(String::new())
        .unwrap();
    let res = app.oneshot(request).await.unwrap();

    assert_eq!(res.status(), StatusCode::OK);
    let bytes = to_bytes(res.into_body(), usize::MAX).await.unwrap();
    let body: Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(body, json!({ "healthy": true }));
}

// Copyright 2023-, Edge & Node, GraphOps, and Semiotic Labs.
// SPDX-License-Identifier: Apache-2.0

use std::sync::Arc;

use async_trait::async_trait;
use reqwest::{header, StatusCode};
use serde::Serialize;
use serde_json::Value;
use subgraph_proxy_config::ProviderKind;
use subgraph_proxy_monitor::{alchemy_fatal_error, graph_fatal_error};
use thegraph_core::DeploymentId;
use thiserror::Error;

use crate::topology::Topology;

const USER_AGENT: &str = concat!("subgraph-proxy/", env!("CARGO_PKG_VERSION"));

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("Endpoint e-{endpoint} does not serve subgraph `{subgraph}`")]
    NotServed { endpoint: usize, subgraph: String },
    #[error(transparent)]
    Request(#[from] reqwest::Error),
    #[error("Endpoint responded with status {0}")]
    Status(StatusCode),
    /// Messages of every error the provider returned, joined
    #[error("{0}")]
    GraphQL(String),
    #[error("Response contained no data")]
    MissingData,
    #[error("Status of subgraph `{subgraph}` on e-{endpoint} is unknown: {reason}")]
    StatusUnknown {
        endpoint: usize,
        subgraph: String,
        reason: String,
    },
}

/// Calls to the subgraph providers behind the proxy.
#[async_trait]
pub trait SubgraphBackend: Send + Sync {
    /// Runs `query` and returns the `data` of the response.
    async fn query(
        &self,
        endpoint: usize,
        subgraph: &str,
        query: &str,
        variables: Option<&Value>,
    ) -> Result<Value, BackendError>;

    /// Asks the provider for the fatal indexing error of the subgraph, if any.
    async fn fatal_error(
        &self,
        endpoint: usize,
        subgraph: &str,
        deployment: Option<DeploymentId>,
    ) -> Result<Option<String>, BackendError>;
}

#[derive(Serialize)]
struct QueryBody<'a> {
    query: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    variables: Option<&'a Value>,
}

pub struct HttpBackend {
    client: reqwest::Client,
    topology: Arc<Topology>,
}

impl HttpBackend {
    pub fn new(client: reqwest::Client, topology: Arc<Topology>) -> Self {
        Self { client, topology }
    }
}

#[async_trait]
impl SubgraphBackend for HttpBackend {
    async fn query(
        &self,
        endpoint: usize,
        subgraph: &str,
        query: &str,
        variables: Option<&Value>,
    ) -> Result<Value, BackendError> {
        let url = self
            .topology
            .query_url(endpoint, subgraph)
            .ok_or_else(|| BackendError::NotServed {
                endpoint,
                subgraph: subgraph.to_string(),
            })?;

        let response = self
            .client
            .post(url)
            .header(header::USER_AGENT, USER_AGENT)
            .json(&QueryBody { query, variables })
            .send()
            .await?;
        let status = response.status();
        let body: graphql_client::Response<Value> = match response.json().await {
            Ok(body) => body,
            Err(_) if !status.is_success() => return Err(BackendError::Status(status)),
            Err(e) => return Err(e.into()),
        };

        // Errors alongside partial data still fail the attempt
        if let Some(errors) = body.errors.filter(|errors| !errors.is_empty()) {
            let messages: Vec<_> = errors.into_iter().map(|e| e.message).collect();
            return Err(BackendError::GraphQL(messages.join("; ")));
        }
        if !status.is_success() {
            return Err(BackendError::Status(status));
        }
        body.data.ok_or(BackendError::MissingData)
    }

    async fn fatal_error(
        &self,
        endpoint: usize,
        subgraph: &str,
        deployment: Option<DeploymentId>,
    ) -> Result<Option<String>, BackendError> {
        let unknown = |reason: &str| BackendError::StatusUnknown {
            endpoint,
            subgraph: subgraph.to_string(),
            reason: reason.to_string(),
        };
        let provider = self
            .topology
            .provider(endpoint)
            .ok_or_else(|| unknown("no such endpoint"))?;
        let status_url = self
            .topology
            .status_url(endpoint, subgraph)
            .ok_or_else(|| unknown("no status URL"))?;

        let result = match provider {
            ProviderKind::Alchemy => alchemy_fatal_error(&self.client, status_url).await,
            ProviderKind::Graph => {
                let deployment = deployment.ok_or_else(|| unknown("the deployment is unknown"))?;
                graph_fatal_error(&self.client, status_url, deployment).await
            }
        };
        result.map_err(|e| unknown(&format!("{e:#}")))
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use subgraph_proxy_config::ProviderKind;
    use test_assets::{endpoint_config, BEAN, BEAN_DEPLOYMENT};
    use wiremock::{
        matchers::{body_partial_json, method, path},
        Mock, MockServer, ResponseTemplate,
    };

    use super::*;

    async fn backend(provider: ProviderKind) -> (HttpBackend, MockServer) {
        let server = MockServer::start().await;
        let endpoint = endpoint_config()
            .provider(provider)
            .url(format!("{}/<sg-id>/api", server.uri()))
            .status_url(format!("{}/index-node/graphql", server.uri()).parse().unwrap())
            .call();
        let topology = Arc::new(Topology::new(vec![endpoint], [BEAN.to_string()]));
        (HttpBackend::new(reqwest::Client::new(), topology), server)
    }

    #[tokio::test]
    async fn returns_data_of_successful_query() {
        let (backend, server) = backend(ProviderKind::Alchemy).await;
        Mock::given(method("POST"))
            .and(path("/bean/api"))
            .and(body_partial_json(json!({ "variables": { "first": 1 } })))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({ "data": { "beanCrosses": [] } })),
            )
            .mount(&server)
            .await;

        let data = backend
            .query(0, BEAN, "{ beanCrosses { id } }", Some(&json!({ "first": 1 })))
            .await
            .unwrap();
        assert_eq!(data, json!({ "beanCrosses": [] }));
    }

    #[tokio::test]
    async fn errors_fail_even_with_partial_data() {
        let (backend, server) = backend(ProviderKind::Alchemy).await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": { "beanCrosses": null },
                "errors": [{ "message": "first" }, { "message": "second" }],
            })))
            .mount(&server)
            .await;

        let error = backend
            .query(0, BEAN, "{ beanCrosses { id } }", None)
            .await
            .unwrap_err();
        assert_eq!(error.to_string(), "first; second");
    }

    #[tokio::test]
    async fn reports_http_status() {
        let (backend, server) = backend(ProviderKind::Alchemy).await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(502).set_body_string("Bad Gateway"))
            .mount(&server)
            .await;

        assert!(matches!(
            backend.query(0, BEAN, "{ beanCrosses { id } }", None).await,
            Err(BackendError::Status(StatusCode::BAD_GATEWAY))
        ));
        assert!(matches!(
            backend.query(0, "basin", "{ wells { id } }", None).await,
            Err(BackendError::NotServed { endpoint: 0, .. })
        ));
    }

    #[tokio::test]
    async fn graph_status_needs_deployment() {
        let (backend, server) = backend(ProviderKind::Graph).await;
        Mock::given(method("POST"))
            .and(path("/index-node/graphql"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": {
                    "indexingStatuses": [{
                        "health": "failed",
                        "fatalError": { "message": "Mapping aborted", "block": null, "handler": null }
                    }]
                }
            })))
            .mount(&server)
            .await;

        assert!(matches!(
            backend.fatal_error(0, BEAN, None).await,
            Err(BackendError::StatusUnknown { .. })
        ));
        assert_eq!(
            backend
                .fatal_error(0, BEAN, Some(BEAN_DEPLOYMENT))
                .await
                .unwrap()
                .as_deref(),
            Some("Mapping aborted")
        );
    }

    #[tokio::test]
    async fn alchemy_status_lives_next_to_query_url() {
        let (backend, server) = backend(ProviderKind::Alchemy).await;
        Mock::given(method("POST"))
            .and(path("/bean/status"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": {
                    "indexingStatusForCurrentVersion": { "health": "healthy", "fatalError": null }
                }
            })))
            .mount(&server)
            .await;

        assert_eq!(backend.fatal_error(0, BEAN, None).await.unwrap(), None);
    }
}

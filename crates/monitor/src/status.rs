// Copyright 2023-, Edge & Node, GraphOps, and Semiotic Labs.
// SPDX-License-Identifier: Apache-2.0

//! Fatal indexing error lookups, one per provider kind.

use anyhow::anyhow;
use reqwest::{header, Url};
use serde::Deserialize;
use serde_json::json;
use thegraph_core::DeploymentId;

const USER_AGENT: &str = concat!("subgraph-proxy/", env!("CARGO_PKG_VERSION"));

const INDEXING_STATUS_QUERY: &str = r#"query SubgraphIndexingStatusFatalError($deploymentIds: [String!]!) {
  indexingStatuses(subgraphs: $deploymentIds) {
    health
    fatalError {
      message
      block {
        number
        hash
      }
      handler
    }
  }
}"#;

#[derive(Debug, Deserialize)]
struct FatalError {
    message: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct IndexingStatus {
    fatal_error: Option<FatalError>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AlchemyStatusData {
    indexing_status_for_current_version: IndexingStatus,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GraphStatusData {
    indexing_statuses: Vec<IndexingStatus>,
}

/// Returns the fatal error message Alchemy reports for the current version of
/// the subgraph at `status_url`, if any.
pub async fn alchemy_fatal_error(
    client: &reqwest::Client,
    status_url: Url,
) -> anyhow::Result<Option<String>> {
    let response = client
        .post(status_url.clone())
        .header(header::USER_AGENT, USER_AGENT)
        .send()
        .await?
        .error_for_status()?;
    let status: graphql_client::Response<AlchemyStatusData> = response.json().await?;

    let data = status
        .data
        .ok_or_else(|| anyhow!("No status returned from `{status_url}`"))?;
    Ok(data
        .indexing_status_for_current_version
        .fatal_error
        .map(|e| e.message))
}

/// Returns the fatal error message an index-node reports for `deployment`, if any.
pub async fn graph_fatal_error(
    client: &reqwest::Client,
    status_url: Url,
    deployment: DeploymentId,
) -> anyhow::Result<Option<String>> {
    let response = client
        .post(status_url)
        .header(header::USER_AGENT, USER_AGENT)
        .json(&json!({
            "operationName": "SubgraphIndexingStatusFatalError",
            "query": INDEXING_STATUS_QUERY,
            "variables": { "deploymentIds": [deployment.to_string()] },
        }))
        .send()
        .await?
        .error_for_status()?;
    let status: graphql_client::Response<GraphStatusData> = response.json().await?;

    let data = status
        .data
        .ok_or_else(|| anyhow!("Failed to query status of deployment `{deployment}`"))?;
    let status = data
        .indexing_statuses
        .into_iter()
        .next()
        .ok_or_else(|| anyhow!("Deployment `{deployment}` not found"))?;
    Ok(status.fatal_error.map(|e| e.message))
}

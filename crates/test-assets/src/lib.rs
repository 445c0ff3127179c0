// Copyright 2023-, Edge & Node, GraphOps, and Semiotic Labs.
// SPDX-License-Identifier: Apache-2.0

use std::{collections::BTreeMap, time::Duration};

use serde_json::{json, Value};
use subgraph_proxy_config::{
    EndpointConfig, ProviderKind, RateLimitConfig, RateLimitScope,
};
use subgraph_proxy_query::SubgraphMetadata;
use thegraph_core::{deployment_id, DeploymentId};
use url::Url;

/// Assert something is true while sleeping and retrying
///
/// This macro creates a loop that keeps retrying the expression
/// by default every 50 milliseconds, for as long as it holds.
/// In case the expression is still true after the timeout period
/// (default to 1 second), this macro panics
#[macro_export]
macro_rules! assert_while_retry {
    ($assertion:expr) => {
        $crate::assert_while_retry!(
            $assertion,
            "Assertion was not true while retrying every 50 milliseconds up to 1 second.",
            std::time::Duration::from_secs(1),
            std::time::Duration::from_millis(50)
        );
    };
    ($assertion:expr, $msg:expr, $timeout:expr, $sleep:expr) => {
        if tokio::time::timeout($timeout, async {
            loop {
                if $assertion {
                    tokio::time::sleep($sleep).await;
                } else {
                    break;
                }
            }
        })
        .await
        .is_err()
        {
            panic!($msg);
        }
    };
}

pub const BEAN: &str = "bean";
pub const BEANSTALK: &str = "beanstalk";
pub const BASIN: &str = "basin";

pub const BEAN_DEPLOYMENT: DeploymentId =
    deployment_id!("QmXXZrhjqb4ygSWVgkPYBWJ7AzY4nKEUqiN5jnDopWBSCD");
pub const BEAN_NEW_DEPLOYMENT: DeploymentId =
    deployment_id!("Qmb5Ysp5oCUXhLA8NmxmYKDAX2nCMnh7Vvb5uffb9n5vss");

/// Head of the `ethereum` chain in tests.
pub const CHAIN_HEAD: u64 = 20582045;

/// `data` of a `bean` query response carrying the injected metadata.
pub fn bean_response(block: u64, version: &str) -> Value {
    json!({
        "_meta": {
            "block": { "number": block },
            "deployment": BEAN_DEPLOYMENT.to_string(),
        },
        "version": {
            "subgraphName": BEAN,
            "versionNumber": version,
            "chain": "ethereum",
        },
        "beanCrosses": [{ "id": "0x01-bean" }],
    })
}

pub fn bean_metadata(block: u64, version: &str) -> SubgraphMetadata {
    SubgraphMetadata::from_response(&bean_response(block, version))
        .expect("bean response carries metadata")
}

/// An endpoint serving `subgraphs` under their own names as ids.
#[bon::builder]
pub fn endpoint_config(
    #[builder(into)] url: String,
    #[builder(default = ProviderKind::Alchemy)] provider: ProviderKind,
    status_url: Option<Url>,
    #[builder(default = 10)] requests_per_interval: u32,
    #[builder(default = Duration::from_millis(1000))] interval: Duration,
    #[builder(default = 10)] burst_capacity: u32,
    #[builder(default)] rate_limit_scope: RateLimitScope,
    #[builder(default = 0.8)] utilization_preference: f64,
    #[builder(default = vec![BEAN])] subgraphs: Vec<&str>,
) -> EndpointConfig {
    EndpointConfig {
        url,
        provider,
        status_url,
        rate_limit: RateLimitConfig {
            requests_per_interval,
            interval_ms: interval,
            burst_capacity,
        },
        rate_limit_scope,
        utilization_preference,
        subgraph_ids: subgraphs
            .into_iter()
            .map(|subgraph| (subgraph.to_string(), subgraph.to_string()))
            .collect::<BTreeMap<_, _>>(),
    }
}

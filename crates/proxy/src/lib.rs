// Copyright 2023-, Edge & Node, GraphOps, and Semiotic Labs.
// SPDX-License-Identifier: Apache-2.0

//! Consistency-aware routing of subgraph queries across redundant endpoints.

mod backend;
mod classify;
mod error;
mod history;
mod init;
mod limiter;
mod notifier;
mod proxy;
mod selector;
mod semver;
mod state;
mod status;
#[cfg(test)]
mod test;
mod topology;

pub use backend::{BackendError, HttpBackend, SubgraphBackend};
pub use classify::{classifier_for, BlockRangeError, ErrorClassifier};
pub use error::ProxyError;
pub use history::{AttemptHistory, Decision, Issue};
pub use limiter::{Capacity, RateLimited, RateLimiter, RateLimiters};
pub use notifier::{LogNotifier, Notifier, Priority, WebhookNotifier};
pub use proxy::{ProxyResponse, ResponseMeta, SubgraphProxy};
pub use selector::EndpointSelector;
pub use semver::compare_versions;
pub use state::{EndpointStateStore, EndpointSubgraphState};
pub use status::{StatusChecker, StatusError};
pub use topology::Topology;

// Copyright 2023-, Edge & Node, GraphOps, and Semiotic Labs.
// SPDX-License-Identifier: Apache-2.0

//! Recognizes block range errors in the error text of each provider kind.

use std::sync::LazyLock;

use regex::Regex;
use subgraph_proxy_config::ProviderKind;

static NOT_YET_INDEXED: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"indexed up to block number (\d+) and data for block number (\d+) is therefore")
        .expect("Invalid regex pattern")
});

static BEFORE_EARLIEST: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"only has data starting at block number (\d+) and data for block number (\d+) is therefore",
    )
    .expect("Invalid regex pattern")
});

static GATEWAY_MISSING_BLOCK: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"missing block: (\d+)(?:, latest: (\d+))?").expect("Invalid regex pattern")
});

/// A backend refused a query because of the block it asked for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockRangeError {
    /// The block is past what the backend has indexed
    NotYetIndexed {
        indexed_up_to: Option<u64>,
        requested: u64,
    },
    /// The block precedes the start of the deployment
    BeforeEarliest { earliest: u64, requested: u64 },
}

pub trait ErrorClassifier: Send + Sync {
    fn classify(&self, message: &str) -> Option<BlockRangeError>;
}

/// Error text produced by graph-node, as relayed by Alchemy.
pub struct GraphNodeClassifier;

/// Error text produced by The Graph gateway, which relays graph-node errors
/// but also reports blocks its indexers lack on its own.
pub struct GatewayClassifier;

impl ErrorClassifier for GraphNodeClassifier {
    fn classify(&self, message: &str) -> Option<BlockRangeError> {
        if let Some(caps) = NOT_YET_INDEXED.captures(message) {
            return Some(BlockRangeError::NotYetIndexed {
                indexed_up_to: caps[1].parse().ok(),
                requested: caps[2].parse().ok()?,
            });
        }
        let caps = BEFORE_EARLIEST.captures(message)?;
        Some(BlockRangeError::BeforeEarliest {
            earliest: caps[1].parse().ok()?,
            requested: caps[2].parse().ok()?,
        })
    }
}

impl ErrorClassifier for GatewayClassifier {
    fn classify(&self, message: &str) -> Option<BlockRangeError> {
        if let Some(relayed) = GraphNodeClassifier.classify(message) {
            return Some(relayed);
        }
        let caps = GATEWAY_MISSING_BLOCK.captures(message)?;
        Some(BlockRangeError::NotYetIndexed {
            indexed_up_to: caps.get(2).and_then(|m| m.as_str().parse().ok()),
            requested: caps[1].parse().ok()?,
        })
    }
}

pub fn classifier_for(provider: ProviderKind) -> &'static dyn ErrorClassifier {
    match provider {
        ProviderKind::Alchemy => &GraphNodeClassifier,
        ProviderKind::Graph => &GatewayClassifier,
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    fn recognizes_graph_node_errors(
        #[values(ProviderKind::Alchemy, ProviderKind::Graph)] provider: ProviderKind,
    ) {
        let classifier = classifier_for(provider);

        assert_eq!(
            classifier.classify(
                "Failed to decode `block.number` value: `subgraph QmXXZrhjqb4ygSWVgkPYBWJ7AzY4nKEUqiN5jnDopWBSCD \
                has only indexed up to block number 20580123 and data for block number 22333232 is therefore \
                not yet available`"
            ),
            Some(BlockRangeError::NotYetIndexed {
                indexed_up_to: Some(20580123),
                requested: 22333232
            })
        );
        assert_eq!(
            classifier.classify(
                "subgraph QmXXZrhjqb4ygSWVgkPYBWJ7AzY4nKEUqiN5jnDopWBSCD only has data starting at block \
                number 500 and data for block number 20582045 is therefore not yet available"
            ),
            Some(BlockRangeError::BeforeEarliest {
                earliest: 500,
                requested: 20582045
            })
        );
        assert_eq!(
            classifier.classify("Type `Query` has no field `beanCross`"),
            None
        );
    }

    #[test]
    fn gateway_reports_missing_blocks() {
        assert_eq!(
            GatewayClassifier.classify(
                "bad indexers: {0xedca8740873152ff30a2696add66d1ab41882beb: Unavailable(missing block: 22333232, latest: 20580123)}"
            ),
            Some(BlockRangeError::NotYetIndexed {
                indexed_up_to: Some(20580123),
                requested: 22333232
            })
        );
        assert_eq!(
            GatewayClassifier.classify("Unavailable(missing block: 22333232)"),
            Some(BlockRangeError::NotYetIndexed {
                indexed_up_to: None,
                requested: 22333232
            })
        );
        assert_eq!(
            GraphNodeClassifier.classify("Unavailable(missing block: 22333232)"),
            None
        );
    }
}

// Copyright 2023-, Edge & Node, GraphOps, and Semiotic Labs.
// SPDX-License-Identifier: Apache-2.0

use std::sync::LazyLock;

use regex::Regex;
use serde::Deserialize;
use serde_json::Value as JsonValue;
use thegraph_core::DeploymentId;

/// Selection injected into every proxied query so the response reports which
/// deployment, version and block it was served from.
pub const METADATA_SELECTION: &str = r#"_meta { block { number } deployment } version(id: "subgraph") { subgraphName versionNumber chain }"#;

static META_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"_meta\s*\{").expect("Invalid regex pattern"));

static VERSION_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"version\s*\(\s*id\s*:\s*"subgraph"\s*\)\s*\{"#).expect("Invalid regex pattern")
});

/// Metadata parsed from a response to a query carrying [`METADATA_SELECTION`].
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SubgraphMetadata {
    #[serde(rename = "_meta")]
    pub meta: Meta,
    pub version: VersionInfo,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Meta {
    pub block: BlockNumber,
    pub deployment: DeploymentId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct BlockNumber {
    pub number: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VersionInfo {
    #[serde(default)]
    pub subgraph_name: Option<String>,
    pub version_number: String,
    pub chain: String,
}

impl SubgraphMetadata {
    pub fn from_response(data: &JsonValue) -> Result<Self, serde_json::Error> {
        Self::deserialize(data)
    }

    pub fn block(&self) -> u64 {
        self.meta.block.number
    }

    pub fn deployment(&self) -> DeploymentId {
        self.meta.deployment
    }

    pub fn version(&self) -> &str {
        &self.version.version_number
    }

    pub fn chain(&self) -> &str {
        &self.version.chain
    }
}

/// Inserts [`METADATA_SELECTION`] into the first top-level selection set.
///
/// Braces inside the variable definitions (default values), string literals
/// and comments are skipped.
pub fn add_metadata_to_query(query: &str) -> String {
    let mut paren_depth = 0usize;
    let mut in_string = false;
    let mut in_comment = false;
    let mut escaped = false;
    for (index, c) in query.char_indices() {
        if in_comment {
            in_comment = c != '\n';
            continue;
        }
        if in_string {
            match c {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            '#' => in_comment = true,
            '(' => paren_depth += 1,
            ')' => paren_depth = paren_depth.saturating_sub(1),
            '{' if paren_depth == 0 => {
                let (head, tail) = query.split_at(index + 1);
                return format!("{head}\n{METADATA_SELECTION}\n{tail}");
            }
            _ => {}
        }
    }
    query.to_string()
}

/// Returns true if the query explicitly selects `_meta`.
pub fn includes_meta(query: &str) -> bool {
    META_REGEX.is_match(query)
}

/// Returns true if the query explicitly selects `version(id: "subgraph")`.
pub fn includes_version(query: &str) -> bool {
    VERSION_REGEX.is_match(query)
}

/// Removes the injected metadata from `data` unless `original_query` asked for it.
pub fn remove_unrequested_metadata(mut data: JsonValue, original_query: &str) -> JsonValue {
    if let Some(fields) = data.as_object_mut() {
        if !includes_meta(original_query) {
            fields.remove("_meta");
        }
        if !includes_version(original_query) {
            fields.remove("version");
        }
    }
    data
}

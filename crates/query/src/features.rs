// Copyright 2023-, Edge & Node, GraphOps, and Semiotic Labs.
// SPDX-License-Identifier: Apache-2.0

use std::sync::LazyLock;

use regex::Regex;

static FEATURES: LazyLock<[(&'static str, Regex); 4]> = LazyLock::new(|| {
    [
        ("blk", r"\bblock\s*:"),
        ("whr", r"\bwhere\s*:"),
        ("srt", r"\borderBy\s*:"),
        ("skp", r"\bskip\s*:"),
    ]
    .map(|(tag, pattern)| (tag, Regex::new(pattern).expect("Invalid regex pattern")))
});

/// Short tags for the query arguments that most affect backend cost, used in
/// request logs. E.g. `blk,skp` for a paginated historical query.
pub fn query_features(query: &str) -> String {
    FEATURES
        .iter()
        .filter(|(_, regex)| regex.is_match(query))
        .map(|(tag, _)| *tag)
        .collect::<Vec<_>>()
        .join(",")
}

#[cfg(test)]
mod tests {
    use super::query_features;

    #[test]
    fn tags_query_arguments() {
        assert_eq!(
            query_features(
                r#"{ well(id: "0x3e1133aC082716DDC3114bbEFEeD8B1731eA9cb1" block: {number: 24622961}) { id } }"#
            ),
            "blk"
        );
        assert_eq!(
            query_features(
                "{ wells(where: {field: value} orderBy: field orderDirection: asc) { id } }"
            ),
            "whr,srt"
        );
        assert_eq!(
            query_features("{ wells(skip: 50 block: {number: 24622961}) { id } }"),
            "blk,skp"
        );
        assert_eq!(query_features("{ wells { id } }"), "");
    }
}

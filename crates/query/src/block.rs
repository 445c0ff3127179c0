// Copyright 2023-, Edge & Node, GraphOps, and Semiotic Labs.
// SPDX-License-Identifier: Apache-2.0

use std::{
    collections::{HashMap, HashSet},
    fmt,
    sync::LazyLock,
};

use graphql_parser::query as q;
use regex::Regex;
use serde_json::Value as JsonValue;

/// Maximum nesting depth followed through inline fragments and fragment spreads.
const MAX_SELECTION_DEPTH: usize = 10;

/// `__schema` and `__type` fields. `__typename` is deliberately not matched.
static INTROSPECTION_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"__(?:schema|type)\b").expect("Invalid regex pattern"));

static BLOCK_NUMBER_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"block\s*:\s*\{\s*number\s*:\s*(\d+)\s*\}").expect("Invalid regex pattern")
});

/// The oldest indexed block an endpoint must have reached to answer a query.
///
/// Variants are ordered, so the requirement of a whole query is the maximum
/// over its root fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum RequiredBlock {
    /// Answerable by an endpoint that has indexed at least this block
    Number(u64),
    /// Needs the freshest data available
    Latest,
}

impl RequiredBlock {
    /// Answerable regardless of indexing progress
    pub const ANY: Self = Self::Number(0);

    /// Returns true if a response indexed up to `block` is older than required.
    pub fn is_above(&self, block: u64) -> bool {
        match self {
            Self::Number(number) => block < *number,
            Self::Latest => true,
        }
    }
}

impl fmt::Display for RequiredBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Number(number) => write!(f, "{number}"),
            Self::Latest => f.write_str("latest"),
        }
    }
}

struct SelectionTooDeep;

/// Computes the block every root field of `query` needs to have been indexed.
///
/// Introspection queries need nothing. `_meta` needs nothing. A field with a
/// `block: { number: N }` argument needs `N`, where `N` may be a literal or a
/// variable resolved from `variables`. Any other field needs the latest block.
/// Queries that fail to parse are treated as needing the latest block.
pub fn required_indexed_block(query: &str, variables: Option<&JsonValue>) -> RequiredBlock {
    if INTROSPECTION_REGEX.is_match(query) {
        return RequiredBlock::ANY;
    }

    let Ok(document) = q::parse_query::<String>(query) else {
        return RequiredBlock::Latest;
    };

    let fragments: HashMap<&str, &q::FragmentDefinition<String>> = document
        .definitions
        .iter()
        .filter_map(|def| match def {
            q::Definition::Fragment(f) => Some((f.name.as_str(), f)),
            _ => None,
        })
        .collect();

    let mut required: Option<RequiredBlock> = None;
    for def in &document.definitions {
        let selection_set = match def {
            q::Definition::Operation(q::OperationDefinition::Query(query)) => &query.selection_set,
            q::Definition::Operation(q::OperationDefinition::SelectionSet(ss)) => ss,
            _ => continue,
        };

        let mut fields = Vec::new();
        let mut visited = HashSet::new();
        if collect_root_fields(selection_set, &fragments, &mut visited, 0, &mut fields).is_err() {
            return RequiredBlock::Latest;
        }

        for field in fields {
            let field_required = field_requirement(field, variables);
            required = Some(required.map_or(field_required, |r| r.max(field_required)));
        }
    }

    required.unwrap_or(RequiredBlock::Latest)
}

/// The highest `block: { number: N }` literal anywhere in the query text.
pub fn max_requested_block(query: &str) -> Option<u64> {
    BLOCK_NUMBER_REGEX
        .captures_iter(query)
        .filter_map(|caps| caps[1].parse().ok())
        .max()
}

/// Root fields of a selection set, looking through inline fragments and
/// fragment spreads. Each named fragment is expanded once.
fn collect_root_fields<'d, 'q>(
    selection_set: &'d q::SelectionSet<'q, String>,
    fragments: &HashMap<&'d str, &'d q::FragmentDefinition<'q, String>>,
    visited_fragments: &mut HashSet<&'d str>,
    depth: usize,
    fields: &mut Vec<&'d q::Field<'q, String>>,
) -> Result<(), SelectionTooDeep> {
    if depth > MAX_SELECTION_DEPTH {
        return Err(SelectionTooDeep);
    }

    for item in &selection_set.items {
        match item {
            q::Selection::Field(field) => fields.push(field),
            q::Selection::InlineFragment(inline) => {
                collect_root_fields(
                    &inline.selection_set,
                    fragments,
                    visited_fragments,
                    depth + 1,
                    fields,
                )?;
            }
            q::Selection::FragmentSpread(spread) => {
                let name = spread.fragment_name.as_str();
                if !visited_fragments.insert(name) {
                    continue;
                }
                if let Some(fragment) = fragments.get(name) {
                    collect_root_fields(
                        &fragment.selection_set,
                        fragments,
                        visited_fragments,
                        depth + 1,
                        fields,
                    )?;
                }
            }
        }
    }

    Ok(())
}

fn field_requirement(field: &q::Field<'_, String>, variables: Option<&JsonValue>) -> RequiredBlock {
    if field.name == "_meta" {
        return RequiredBlock::ANY;
    }

    field
        .arguments
        .iter()
        .find(|(name, _)| name == "block")
        .and_then(|(_, value)| block_number(value, variables))
        .map_or(RequiredBlock::Latest, RequiredBlock::Number)
}

fn block_number(value: &q::Value<'_, String>, variables: Option<&JsonValue>) -> Option<u64> {
    match value {
        q::Value::Object(fields) => match fields.get("number")? {
            q::Value::Int(number) => number.as_i64().and_then(|n| u64::try_from(n).ok()),
            q::Value::Variable(name) => variables?.get(name)?.as_u64(),
            _ => None,
        },
        q::Value::Variable(name) => variables?.get(name)?.get("number")?.as_u64(),
        _ => None,
    }
}

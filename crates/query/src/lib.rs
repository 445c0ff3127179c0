// Copyright 2023-, Edge & Node, GraphOps, and Semiotic Labs.
// SPDX-License-Identifier: Apache-2.0

//! Helpers operating on the raw GraphQL text of proxied queries.

mod block;
mod features;
mod metadata;

pub use block::{max_requested_block, required_indexed_block, RequiredBlock};
pub use features::query_features;
pub use metadata::{
    add_metadata_to_query, includes_meta, includes_version, remove_unrequested_metadata,
    SubgraphMetadata, METADATA_SELECTION,
};

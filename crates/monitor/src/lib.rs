// Copyright 2023-, Edge & Node, GraphOps, and Semiotic Labs.
// SPDX-License-Identifier: Apache-2.0

mod chain;
mod status;

pub use chain::{ChainHeadError, ChainHeadSource, ChainHeadTracker, JsonRpcChainHeads};
pub use status::{alchemy_fatal_error, graph_fatal_error};

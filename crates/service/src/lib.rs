// Copyright 2023-, Edge & Node, GraphOps, and Semiotic Labs.
// SPDX-License-Identifier: Apache-2.0

mod cli;
mod error;
mod metrics;
mod routes;
pub mod service;

pub use routes::QueryBody;

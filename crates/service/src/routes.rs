// Copyright 2023-, Edge & Node, GraphOps, and Semiotic Labs.
// SPDX-License-Identifier: Apache-2.0

mod health;
mod request_handler;

pub use health::health;
pub use request_handler::{request_handler, QueryBody};

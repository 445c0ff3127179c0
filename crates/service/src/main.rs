// Copyright 2023-, Edge & Node, GraphOps, and Semiotic Labs.
// SPDX-License-Identifier: Apache-2.0

use std::process::ExitCode;

use subgraph_proxy_service::service::run;

#[tokio::main]
async fn main() -> ExitCode {
    if let Err(e) = run().await {
        tracing::error!("Subgraph proxy error: {e}");
        return ExitCode::from(1);
    }

    ExitCode::SUCCESS
}

// Copyright 2023-, Edge & Node, GraphOps, and Semiotic Labs.
// SPDX-License-Identifier: Apache-2.0

use std::{net::SocketAddr, sync::Arc};

use axum::{extract::Request, serve, ServiceExt};
use subgraph_proxy::{
    EndpointStateStore, HttpBackend, LogNotifier, Notifier, RateLimiters, SubgraphProxy,
    Topology, WebhookNotifier,
};
use subgraph_proxy_config::NotificationsConfig;
use subgraph_proxy_monitor::{ChainHeadTracker, JsonRpcChainHeads};
use tokio::{net::TcpListener, signal};
use tower_http::normalize_path::NormalizePath;

use crate::{cli::get_config, metrics::serve_metrics};

mod router;

pub use router::ServiceRouter;

/// Run the subgraph proxy
pub async fn run() -> anyhow::Result<()> {
    // Parse command line and environment arguments
    let config = get_config()?;

    let http_client = reqwest::Client::builder()
        .tcp_nodelay(true)
        .timeout(config.service.request_timeout_secs)
        .build()?;

    let topology = Arc::new(Topology::from_config(&config));
    let chain_heads = JsonRpcChainHeads::new(&config.chains, config.service.request_timeout_secs)?;
    let chain_heads = Arc::new(ChainHeadTracker::new(
        Arc::new(chain_heads),
        config.proxy.chain_head_ttl_ms,
    ));

    let proxy = Arc::new(
        SubgraphProxy::builder()
            .state(Arc::new(EndpointStateStore::new(
                topology.clone(),
                chain_heads,
            )))
            .limiters(Arc::new(RateLimiters::new(&topology)))
            .backend(Arc::new(HttpBackend::new(http_client.clone(), topology)))
            .notifier(notifier(http_client, config.notifications))
            .allow_unsyncd(config.service.allow_unsyncd)
            .max_attempts(config.proxy.max_attempts)
            .retry_delay(config.proxy.retry_delay_ms)
            .build(),
    );

    proxy.init_all_states().await;
    // One sweep so fatal errors are known before the first request
    proxy
        .status()
        .check_all(config.service.status_check_max_utilization)
        .await;

    serve_metrics(config.metrics.get_socket_addr());

    let host_and_port = config.service.host_and_port;
    tracing::info!(
        address = %host_and_port,
        "Serving requests",
    );
    let listener = TcpListener::bind(&host_and_port).await?;

    let app = ServiceRouter::builder().proxy(proxy).build().create_router();
    let router = NormalizePath::trim_trailing_slash(app);
    let service = ServiceExt::<Request>::into_make_service_with_connect_info::<SocketAddr>(router);
    Ok(serve(listener, service)
        .with_graceful_shutdown(shutdown_handler())
        .await?)
}

fn notifier(http_client: reqwest::Client, config: NotificationsConfig) -> Arc<dyn Notifier> {
    if config.webhook_urls.is_empty() {
        tracing::info!("No notification webhooks configured, notifications are only logged");
        Arc::new(LogNotifier)
    } else {
        Arc::new(WebhookNotifier::new(http_client, config))
    }
}

/// Graceful shutdown handler
async fn shutdown_handler() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {e}");
            std::future::pending::<()>().await;
        }
    };

    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut terminate) => {
                terminate.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install signal handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Signal received, starting graceful shutdown");
}

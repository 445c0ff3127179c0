// Copyright 2023-, Edge & Node, GraphOps, and Semiotic Labs.
// SPDX-License-Identifier: Apache-2.0

use std::sync::{Mutex, PoisonError};

use serde::Serialize;
use subgraph_proxy_config::NotificationsConfig;
use tokio::time::Instant;
use url::Url;

const USERNAME: &str = "Subgraph Proxy";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Priority {
    /// Dropped when another message went out recently
    Normal,
    High,
}

/// Operator alerts. Delivery is fire-and-forget.
pub trait Notifier: Send + Sync {
    fn notify(&self, message: &str, priority: Priority);
}

/// Only writes notifications to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, message: &str, priority: Priority) {
        tracing::warn!(?priority, "{message}");
    }
}

#[derive(Debug, Serialize)]
struct WebhookMessage<'a> {
    username: &'a str,
    content: String,
}

/// Posts notifications to chat webhooks.
pub struct WebhookNotifier {
    client: reqwest::Client,
    config: NotificationsConfig,
    last_sent: Mutex<Option<Instant>>,
}

impl WebhookNotifier {
    pub fn new(client: reqwest::Client, config: NotificationsConfig) -> Self {
        Self {
            client,
            config,
            last_sent: Mutex::new(None),
        }
    }

    fn content(&self, message: &str) -> String {
        let prefix = &self.config.message_prefix;
        let environment = &self.config.environment;
        if prefix.is_empty() {
            format!("[{environment}] - {message}")
        } else {
            format!("{prefix}\n[{environment}] - {message}")
        }
    }

    /// Claims the send slot unless a non-priority message comes too soon.
    fn admit(&self, priority: Priority) -> bool {
        let mut last_sent = self.last_sent.lock().unwrap_or_else(PoisonError::into_inner);
        let throttled = priority == Priority::Normal
            && last_sent.is_some_and(|at| at.elapsed() < self.config.min_interval_secs);
        if !throttled {
            *last_sent = Some(Instant::now());
        }
        !throttled
    }

    fn post(&self, url: Url, content: String) {
        let client = self.client.clone();
        tokio::spawn(async move {
            let body = WebhookMessage {
                username: USERNAME,
                content,
            };
            let result = client
                .post(url.clone())
                .json(&body)
                .send()
                .await
                .and_then(reqwest::Response::error_for_status);
            if let Err(e) = result {
                tracing::error!(%url, error = %e, "Failed to deliver notification");
            }
        });
    }
}

impl Notifier for WebhookNotifier {
    fn notify(&self, message: &str, priority: Priority) {
        if !self.admit(priority) {
            tracing::debug!(message, "Too many notifications sent recently, suppressing");
            return;
        }

        tracing::info!(?priority, "Notification: {message}");
        for url in &self.config.webhook_urls {
            self.post(url.clone(), self.content(message));
        }
    }
}

// Copyright 2023-, Edge & Node, GraphOps, and Semiotic Labs.
// SPDX-License-Identifier: Apache-2.0

use std::sync::Arc;

use thiserror::Error;

use crate::{
    backend::{BackendError, SubgraphBackend},
    limiter::{Capacity, RateLimited, RateLimiters},
    notifier::{Notifier, Priority},
    state::EndpointStateStore,
};

#[derive(Debug, Error)]
pub enum StatusError {
    #[error(transparent)]
    RateLimited(#[from] RateLimited),
    #[error(transparent)]
    Probe(#[from] BackendError),
}

/// Out-of-band fatal error checks against the providers' status APIs.
pub struct StatusChecker {
    state: Arc<EndpointStateStore>,
    limiters: Arc<RateLimiters>,
    backend: Arc<dyn SubgraphBackend>,
    notifier: Arc<dyn Notifier>,
}

impl StatusChecker {
    pub fn new(
        state: Arc<EndpointStateStore>,
        limiters: Arc<RateLimiters>,
        backend: Arc<dyn SubgraphBackend>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            state,
            limiters,
            backend,
            notifier,
        }
    }

    /// Returns the fatal error the provider reports for the subgraph, if any,
    /// and records its onset or recovery.
    pub async fn check_fatal_error(
        &self,
        endpoint: usize,
        subgraph: &str,
    ) -> Result<Option<String>, StatusError> {
        let deployment = self.state.deployment(endpoint, subgraph);
        let fatal_error = self
            .limiters
            .execute(
                endpoint,
                subgraph,
                self.backend.fatal_error(endpoint, subgraph, deployment),
            )
            .await??;

        let had_fatal_errors = self.state.has_fatal_errors(endpoint, subgraph);
        match &fatal_error {
            Some(message) if !had_fatal_errors => {
                self.notifier.notify(
                    &format!("A fatal error was encountered for {subgraph} e-{endpoint}: {message}"),
                    Priority::High,
                );
                self.state.set_has_fatal_errors(endpoint, subgraph, true);
            }
            None if had_fatal_errors => {
                self.notifier.notify(
                    &format!("{subgraph} e-{endpoint} has recovered."),
                    Priority::High,
                );
                self.state.set_has_fatal_errors(endpoint, subgraph, false);
            }
            _ => {}
        }
        Ok(fatal_error)
    }

    /// Checks every served pair whose endpoint is at or below
    /// `max_utilization`. Busy endpoints are checked by failing requests.
    pub async fn check_all(&self, max_utilization: f64) {
        let topology = self.state.topology();
        for subgraph in topology.enabled_subgraphs() {
            for endpoint in topology.endpoints_for_subgraph(subgraph) {
                if self.limiters.utilization(endpoint, subgraph) > max_utilization {
                    continue;
                }
                if let Err(e) = self.check_fatal_error(endpoint, subgraph).await {
                    tracing::warn!(
                        subgraph,
                        endpoint,
                        error = %e,
                        "Failed to retrieve status"
                    );
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use test_assets::{BEAN, CHAIN_HEAD};

    use super::*;
    use crate::test::{store, MockBackend, RecordingNotifier};

    fn checker(
        store: Arc<EndpointStateStore>,
        backend: Arc<MockBackend>,
        notifier: Arc<RecordingNotifier>,
    ) -> StatusChecker {
        let limiters = Arc::new(RateLimiters::new(store.topology()));
        StatusChecker::new(store, limiters, backend, notifier)
    }

    #[tokio::test(start_paused = true)]
    async fn notifies_on_onset_and_recovery_only() {
        let (store, _) = store(2);
        let backend = Arc::new(MockBackend::default());
        let notifier = Arc::new(RecordingNotifier::default());
        let checker = checker(store.clone(), backend.clone(), notifier.clone());
        store.set_block(1, BEAN, CHAIN_HEAD).await.unwrap();

        backend.set_fatal_error(1, Some("Mapping aborted"));
        assert_eq!(
            checker.check_fatal_error(1, BEAN).await.unwrap().as_deref(),
            Some("Mapping aborted")
        );
        assert!(store.has_fatal_errors(1, BEAN));
        assert_eq!(store.block(1, BEAN), 0);

        // Still failing, nothing new to report
        checker.check_fatal_error(1, BEAN).await.unwrap();

        backend.set_fatal_error(1, None);
        assert_eq!(checker.check_fatal_error(1, BEAN).await.unwrap(), None);
        assert!(!store.has_fatal_errors(1, BEAN));
        assert!(!store.has_errors(1, BEAN));

        assert_eq!(
            notifier.messages(),
            vec![
                (
                    "A fatal error was encountered for bean e-1: Mapping aborted".to_string(),
                    Priority::High
                ),
                ("bean e-1 has recovered.".to_string(), Priority::High),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn probe_failure_leaves_state_alone() {
        let (store, _) = store(1);
        let backend = Arc::new(MockBackend::default());
        let notifier = Arc::new(RecordingNotifier::default());
        let checker = checker(store.clone(), backend.clone(), notifier.clone());

        backend.fail_status(0);
        assert!(matches!(
            checker.check_fatal_error(0, BEAN).await,
            Err(StatusError::Probe(_))
        ));
        assert!(!store.has_errors(0, BEAN));
        assert!(notifier.messages().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_skips_busy_endpoints() {
        let (store, _) = store(2);
        let backend = Arc::new(MockBackend::default());
        let notifier = Arc::new(RecordingNotifier::default());
        let checker = checker(store.clone(), backend.clone(), notifier.clone());
        backend.set_fatal_error(0, Some("boom"));
        backend.set_fatal_error(1, Some("boom"));
        backend.fail_status(1);

        checker.check_all(0.2).await;
        assert!(store.has_fatal_errors(0, BEAN));
        assert!(!store.has_fatal_errors(1, BEAN));
        assert_eq!(backend.status_checks(), vec![0, 1]);

        // Each endpoint now has one of its ten slots in use
        checker.check_all(0.05).await;
        assert_eq!(backend.status_checks(), vec![0, 1]);
    }
}

// Copyright 2023-, Edge & Node, GraphOps, and Semiotic Labs.
// SPDX-License-Identifier: Apache-2.0

use std::{
    collections::HashMap,
    future::Future,
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use subgraph_proxy_config::{RateLimitConfig, RateLimitScope};
use thiserror::Error;
use tokio::time::Instant;

use crate::topology::Topology;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("Exceeded rate limit for e-{endpoint}-{subgraph}.")]
pub struct RateLimited {
    pub endpoint: usize,
    pub subgraph: String,
}

/// Admission state the endpoint selector needs from the rate limiters.
pub trait Capacity: Send + Sync {
    /// True when no request could be admitted right now
    fn is_depleted(&self, endpoint: usize, subgraph: &str) -> bool;

    /// Recently admitted requests relative to the per-interval allowance.
    /// Exceeds 1.0 under sustained load.
    fn utilization(&self, endpoint: usize, subgraph: &str) -> f64;
}

#[derive(Debug)]
struct Reservoir {
    available: u32,
    last_refill: Instant,
}

/// Token bucket with a minimum spacing between dispatched calls.
///
/// The reservoir starts full at `burst_capacity` and gains
/// `requests_per_interval` slots at the end of every interval, never exceeding
/// the burst capacity. A call takes its slot when admitted and is then
/// scheduled no sooner than `min_time` after the previously scheduled call, so
/// a burst drains the reservoir at once while dispatches are spread out.
#[derive(Debug)]
pub struct RateLimiter {
    requests_per_interval: u32,
    interval: Duration,
    burst_capacity: u32,
    min_time: Duration,
    reservoir: Mutex<Reservoir>,
    next_dispatch: Mutex<Instant>,
}

impl RateLimiter {
    pub fn new(config: &RateLimitConfig) -> Self {
        let requests_per_interval = config.requests_per_interval.max(1);
        let interval = config.interval_ms.max(Duration::from_millis(1));
        let min_time_ms = interval
            .as_millis()
            .div_ceil(u128::from(requests_per_interval));
        let now = Instant::now();
        Self {
            requests_per_interval,
            interval,
            burst_capacity: config.burst_capacity,
            min_time: Duration::from_millis(u64::try_from(min_time_ms).unwrap_or(u64::MAX)),
            reservoir: Mutex::new(Reservoir {
                available: config.burst_capacity,
                last_refill: now,
            }),
            next_dispatch: Mutex::new(now),
        }
    }

    /// Minimum time between two dispatched calls.
    pub fn min_time(&self) -> Duration {
        self.min_time
    }

    /// Slots currently available.
    pub fn reservoir(&self) -> u32 {
        let mut reservoir = self.lock_reservoir();
        self.refill(&mut reservoir);
        reservoir.available
    }

    pub fn is_depleted(&self) -> bool {
        self.reservoir() == 0
    }

    pub fn utilization(&self) -> f64 {
        let active = self.burst_capacity.saturating_sub(self.reservoir());
        f64::from(active) / f64::from(self.requests_per_interval)
    }

    /// Runs `work` once a slot is available.
    ///
    /// Fails immediately, without queuing, if the reservoir is empty.
    pub async fn execute<F>(&self, work: F) -> Result<F::Output, Depleted>
    where
        F: Future,
    {
        if self.is_depleted() {
            return Err(Depleted);
        }
        self.acquire().await;
        Ok(work.await)
    }

    async fn acquire(&self) {
        // Only reached by callers that raced for the last slot
        while let Err(wait) = self.try_take() {
            tokio::time::sleep(wait).await;
        }

        let dispatch_at = {
            let mut next_dispatch = self
                .next_dispatch
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            let dispatch_at = (*next_dispatch).max(Instant::now());
            *next_dispatch = dispatch_at + self.min_time;
            dispatch_at
        };
        tokio::time::sleep_until(dispatch_at).await;
    }

    fn try_take(&self) -> Result<(), Duration> {
        let mut reservoir = self.lock_reservoir();
        self.refill(&mut reservoir);
        if reservoir.available > 0 {
            reservoir.available -= 1;
            Ok(())
        } else {
            Err((reservoir.last_refill + self.interval).saturating_duration_since(Instant::now()))
        }
    }

    fn refill(&self, reservoir: &mut Reservoir) {
        let now = Instant::now();
        let elapsed = now.saturating_duration_since(reservoir.last_refill);
        let intervals = elapsed.as_nanos() / self.interval.as_nanos();
        if intervals == 0 {
            return;
        }
        let gained = intervals.saturating_mul(u128::from(self.requests_per_interval));
        let available = u128::from(reservoir.available).saturating_add(gained);
        reservoir.available = u32::try_from(available)
            .unwrap_or(u32::MAX)
            .min(self.burst_capacity);
        let remainder = elapsed.as_nanos() % self.interval.as_nanos();
        reservoir.last_refill = now - Duration::from_nanos(remainder as u64);
    }

    fn lock_reservoir(&self) -> std::sync::MutexGuard<'_, Reservoir> {
        self.reservoir.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// The reservoir of a [`RateLimiter`] is empty.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Depleted;

/// Rate limiters for every (endpoint, subgraph) pair of a [`Topology`].
///
/// Pairs of an endpoint with [`RateLimitScope::Shared`] point at a single
/// limiter, so traffic on one subgraph consumes capacity of the others.
#[derive(Debug, Default)]
pub struct RateLimiters {
    limiters: HashMap<(usize, String), Arc<RateLimiter>>,
}

impl RateLimiters {
    pub fn new(topology: &Topology) -> Self {
        let mut limiters = HashMap::new();
        for (index, endpoint) in topology.endpoints() {
            let shared = Arc::new(RateLimiter::new(&endpoint.rate_limit));
            for subgraph in endpoint.served_subgraphs() {
                let limiter = match endpoint.rate_limit_scope {
                    RateLimitScope::Shared => shared.clone(),
                    RateLimitScope::PerSubgraph => {
                        Arc::new(RateLimiter::new(&endpoint.rate_limit))
                    }
                };
                limiters.insert((index, subgraph.to_string()), limiter);
            }
        }
        Self { limiters }
    }

    pub fn get(&self, endpoint: usize, subgraph: &str) -> Option<&Arc<RateLimiter>> {
        self.limiters.get(&(endpoint, subgraph.to_string()))
    }

    /// Runs `work` through the limiter of the pair.
    pub async fn execute<F>(
        &self,
        endpoint: usize,
        subgraph: &str,
        work: F,
    ) -> Result<F::Output, RateLimited>
    where
        F: Future,
    {
        let rate_limited = || RateLimited {
            endpoint,
            subgraph: subgraph.to_string(),
        };
        let limiter = self.get(endpoint, subgraph).ok_or_else(rate_limited)?;
        limiter.execute(work).await.map_err(|Depleted| rate_limited())
    }
}

impl Capacity for RateLimiters {
    fn is_depleted(&self, endpoint: usize, subgraph: &str) -> bool {
        self.get(endpoint, subgraph)
            .map_or(true, |limiter| limiter.is_depleted())
    }

    fn utilization(&self, endpoint: usize, subgraph: &str) -> f64 {
        self.get(endpoint, subgraph)
            .map_or(0.0, |limiter| limiter.utilization())
    }
}

// Copyright 2023-, Edge & Node, GraphOps, and Semiotic Labs.
// SPDX-License-Identifier: Apache-2.0

use std::fmt;

/// Outcome of one attempt at serving a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Accepted,
    Failed,
    Unsyncd,
    Stale,
    /// The endpoint had not indexed the requested block yet but may soon
    BehindButRetryable,
    /// The response was older than one already seen for the subgraph
    Wobbled,
}

/// Why an endpoint is excluded from the rest of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Issue {
    Failed,
    Unsyncd,
    Stale,
}

impl Decision {
    fn tag(self) -> char {
        match self {
            Self::Accepted => 'a',
            Self::Failed => 'e',
            Self::Unsyncd => 'u',
            Self::Stale => 's',
            Self::BehindButRetryable => 'b',
            Self::Wobbled => 'w',
        }
    }
}

impl Issue {
    fn tag(self) -> char {
        match self {
            Self::Failed => 'f',
            Self::Unsyncd => 'u',
            Self::Stale => 's',
        }
    }
}

/// Request-scoped ledger of attempts and of the endpoints they disqualified.
///
/// A stale version is only stale relative to another endpoint still serving a
/// newer one, so recording a failure or an out of sync response clears every
/// stale entry and makes those endpoints eligible again.
#[derive(Debug, Default, Clone)]
pub struct AttemptHistory {
    attempts: Vec<(usize, Decision)>,
    issues: Vec<(usize, Issue)>,
}

impl AttemptHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn accepted(&mut self, endpoint: usize) {
        self.attempts.push((endpoint, Decision::Accepted));
    }

    pub fn failed(&mut self, endpoint: usize) {
        self.attempts.push((endpoint, Decision::Failed));
        self.issues.retain(|(_, issue)| *issue != Issue::Stale);
        self.issues.push((endpoint, Issue::Failed));
    }

    pub fn unsyncd(&mut self, endpoint: usize) {
        self.attempts.push((endpoint, Decision::Unsyncd));
        self.issues.retain(|(_, issue)| *issue != Issue::Stale);
        self.issues.push((endpoint, Issue::Unsyncd));
    }

    pub fn stale(&mut self, endpoint: usize) {
        self.attempts.push((endpoint, Decision::Stale));
        self.issues.push((endpoint, Issue::Stale));
    }

    pub fn behind_but_retryable(&mut self, endpoint: usize) {
        self.attempts.push((endpoint, Decision::BehindButRetryable));
    }

    pub fn wobbled(&mut self, endpoint: usize) {
        self.attempts.push((endpoint, Decision::Wobbled));
    }

    pub fn len(&self) -> usize {
        self.attempts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.attempts.is_empty()
    }

    /// Endpoint of the latest attempt.
    pub fn last(&self) -> Option<usize> {
        self.attempts.last().map(|(endpoint, _)| *endpoint)
    }

    pub fn was_attempted(&self, endpoint: usize) -> bool {
        self.attempts.iter().any(|(e, _)| *e == endpoint)
    }

    pub fn has_issue(&self, endpoint: usize) -> bool {
        self.issues.iter().any(|(e, _)| *e == endpoint)
    }

    pub fn issue_count(&self) -> usize {
        self.issues.len()
    }

    pub fn failed_endpoints(&self) -> Vec<usize> {
        self.with_issue(Issue::Failed)
    }

    pub fn unsyncd_endpoints(&self) -> Vec<usize> {
        self.with_issue(Issue::Unsyncd)
    }

    pub fn stale_endpoints(&self) -> Vec<usize> {
        self.with_issue(Issue::Stale)
    }

    fn with_issue(&self, kind: Issue) -> Vec<usize> {
        self.issues
            .iter()
            .filter(|(_, issue)| *issue == kind)
            .map(|(endpoint, _)| *endpoint)
            .collect()
    }

    /// Attempts in order, e.g. `0e,1w,1a`.
    pub fn steps(&self) -> impl fmt::Display + '_ {
        Tagged(self.attempts.iter().map(|(e, d)| (*e, d.tag())))
    }

    /// Current issues, e.g. `0f`.
    pub fn issues(&self) -> impl fmt::Display + '_ {
        Tagged(self.issues.iter().map(|(e, i)| (*e, i.tag())))
    }
}

struct Tagged<I>(I);

impl<I> fmt::Display for Tagged<I>
where
    I: Iterator<Item = (usize, char)> + Clone,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, (endpoint, tag)) in self.0.clone().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            write!(f, "{endpoint}{tag}")?;
        }
        Ok(())
    }
}

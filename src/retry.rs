// Copyright (c) 2025 TexasFortress.AI
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! A single `RetryPolicy` value replacing the decorator-chain retry pattern
//! of the reference implementation (`inbox/util/concurrency.py::retry_with_logging`).
//!
//! Every long-running task (folder sync tick, account monitor loop, delete
//! handler pass) runs its body through `RetryPolicy::run`, which classifies
//! the returned error, backs off with jitter, and only logs after a run of
//! consecutive transient failures (matching the source's "log only after
//! >= 20 consecutive occurrences" behavior).

use std::future::Future;
use std::time::Duration;

use log::{error, warn};
use rand::Rng;

/// Outcome a caller returns from the retried closure, telling the policy
/// whether to retry, stop retrying and propagate, or stop cleanly.
pub enum Outcome<T, E> {
    /// The operation completed; stop looping.
    Done(T),
    /// The operation failed with a retryable error.
    Retry(E),
    /// The operation failed with a non-retryable error; propagate immediately.
    Fatal(E),
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Base backoff before retrying a transient failure.
    pub backoff: Duration,
    /// Random jitter window added to `backoff`, matching the source's
    /// `backoff_delay + int(random.uniform(1, 10))`.
    pub jitter: Duration,
    /// Number of consecutive transient failures to swallow silently before
    /// logging (source: `occurrences[0] < 20`).
    pub log_after: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            backoff: Duration::from_secs(30),
            jitter: Duration::from_secs(9),
            log_after: 20,
        }
    }
}

impl RetryPolicy {
    /// Runs `body` in a loop until it returns `Outcome::Done` or
    /// `Outcome::Fatal`. `label` is used only for logging.
    pub async fn run<T, E, F, Fut>(&self, label: &str, mut body: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Outcome<T, E>>,
        E: std::fmt::Display,
    {
        let mut occurrences: u32 = 0;
        loop {
            match body().await {
                Outcome::Done(value) => return Ok(value),
                Outcome::Fatal(err) => return Err(err),
                Outcome::Retry(err) => {
                    occurrences += 1;
                    if occurrences >= self.log_after {
                        error!(
                            "{label}: {occurrences} consecutive failures, last error: {err}"
                        );
                    } else {
                        warn!("{label}: transient failure ({occurrences}): {err}");
                    }
                    let jitter_secs = {
                        let mut rng = rand::thread_rng();
                        rng.gen_range(0..=self.jitter.as_secs().max(1))
                    };
                    tokio::time::sleep(self.backoff + Duration::from_secs(jitter_secs)).await;
                }
            }
        }
    }
}

/// `jitter(base)` from the source: returns `base` perturbed by +/-10%,
/// used for poll-interval and IDLE-duration randomization to avoid thundering
/// herds across many concurrently-ticking folder engines.
pub fn jitter(base: Duration) -> Duration {
    let base_secs = base.as_secs_f64();
    let spread = base_secs * 0.1;
    let mut rng = rand::thread_rng();
    let delta = rng.gen_range(-spread..=spread);
    Duration::from_secs_f64((base_secs + delta).max(0.0))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn run_returns_done_immediately() {
        let policy = RetryPolicy::default();
        let result: Result<i32, &str> = policy
            .run("test", || async { Outcome::Done(42) })
            .await;
        assert_eq!(result.unwrap(), 42);
    }

    #[tokio::test]
    async fn run_propagates_fatal_without_retry() {
        let policy = RetryPolicy::default();
        let result: Result<i32, &str> = policy
            .run("test", || async { Outcome::Fatal("boom") })
            .await;
        assert_eq!(result.unwrap_err(), "boom");
    }

    #[test]
    fn jitter_stays_within_ten_percent() {
        let base = Duration::from_secs(100);
        for _ in 0..50 {
            let j = jitter(base);
            assert!(j.as_secs_f64() >= 89.0 && j.as_secs_f64() <= 111.0);
        }
    }
}

//! Waiting primitives.
//!
//! There are two distinct shapes: [`bounded`] for every machine-driven
//! condition, and [`HumanGate`] for the single place where a person has to act
//! (one-time-code entry, manual credential entry). A human gate never times out
//! and cannot be built from a bounded wait.

use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, info};

use super::page::{DriverError, DriverResult, PortalPage};

#[derive(Debug, Error)]
pub enum WaitError {
    #[error("timed out after {after:?} waiting for {label}")]
    Elapsed { label: String, after: Duration },

    #[error(transparent)]
    Driver(#[from] DriverError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitPolicy {
    pub timeout: Duration,
    pub interval: Duration,
}

impl WaitPolicy {
    pub const fn new(timeout: Duration, interval: Duration) -> Self {
        Self { timeout, interval }
    }
}

/// Polls `probe` until it yields `Some`, or fails once `policy.timeout` elapses.
///
/// Driver errors raised by the probe abort the wait immediately.
pub async fn bounded<T, F, Fut>(label: &str, policy: WaitPolicy, mut probe: F) -> Result<T, WaitError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = DriverResult<Option<T>>>,
{
    let polling = async {
        loop {
            if let Some(value) = probe().await? {
                return Ok::<T, DriverError>(value);
            }
            tokio::time::sleep(policy.interval).await;
        }
    };

    match tokio::time::timeout(policy.timeout, polling).await {
        Ok(result) => result.map_err(WaitError::from),
        Err(_) => {
            debug!(label, timeout_ms = policy.timeout.as_millis(), "bounded wait elapsed");
            Err(WaitError::Elapsed {
                label: label.to_string(),
                after: policy.timeout,
            })
        }
    }
}

pub async fn wait_for_element(
    page: &dyn PortalPage,
    selector: &str,
    policy: WaitPolicy,
) -> Result<(), WaitError> {
    bounded(selector, policy, move || async move {
        Ok(page.is_element_present(selector).await?.then_some(()))
    })
    .await
}

/// Clicks `selector` and waits for `result_selector` to show up.
pub async fn click_and_wait_for_element(
    page: &dyn PortalPage,
    selector: &str,
    result_selector: &str,
    policy: WaitPolicy,
) -> Result<(), WaitError> {
    page.click(selector).await?;
    wait_for_element(page, result_selector, policy).await
}

// ── Human gate ──────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct Suspended {
    since: Option<Instant>,
    total: Duration,
}

/// Time spent suspended on human input, shared by every clone of a gate.
#[derive(Debug, Default)]
struct GateClock(Mutex<Suspended>);

impl GateClock {
    fn with<R>(&self, f: impl FnOnce(&mut Suspended) -> R) -> R {
        f(&mut self.0.lock().unwrap_or_else(PoisonError::into_inner))
    }

    fn enter(&self) {
        self.with(|s| {
            s.since.get_or_insert_with(Instant::now);
        });
    }

    fn leave(&self) {
        self.with(|s| {
            if let Some(since) = s.since.take() {
                s.total += since.elapsed();
            }
        });
    }

    /// `None` while a suspension is in progress.
    fn completed(&self) -> Option<Duration> {
        self.with(|s| s.since.is_none().then_some(s.total))
    }
}

struct Suspension<'c>(&'c GateClock);

impl Drop for Suspension<'_> {
    fn drop(&mut self) {
        self.0.leave();
    }
}

/// Suspension point for human input. Has no timeout.
///
/// Clones share one clock, so a budget taken with [`HumanGate::within_budget`]
/// stops running while any clone is suspended.
#[derive(Debug, Clone)]
pub struct HumanGate {
    interval: Duration,
    clock: Arc<GateClock>,
}

impl HumanGate {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            clock: Arc::default(),
        }
    }

    pub async fn suspend_until<T, F, Fut>(&self, reason: &str, mut probe: F) -> DriverResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = DriverResult<Option<T>>>,
    {
        info!(reason, "waiting for user action (no timeout)");
        self.clock.enter();
        let _suspension = Suspension(&self.clock);
        loop {
            if let Some(value) = probe().await? {
                info!(reason, "user action completed");
                return Ok(value);
            }
            tokio::time::sleep(self.interval).await;
        }
    }

    /// Drives `work` for at most `budget`, not counting time spent suspended
    /// on this gate. Returns `None` once the budget is spent.
    pub async fn within_budget<F: Future>(&self, budget: Duration, work: F) -> Option<F::Output> {
        let started = Instant::now();
        tokio::pin!(work);
        loop {
            let wake = match self.clock.completed() {
                Some(suspended) => {
                    let deadline = started + budget + suspended;
                    if deadline <= Instant::now() {
                        return None;
                    }
                    deadline
                }
                None => Instant::now() + self.interval,
            };
            tokio::select! {
                biased;
                out = &mut work => return Some(out),
                () = tokio::time::sleep_until(wake) => {}
            }
        }
    }
}

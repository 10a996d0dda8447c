//! Generic wait-for-remote-status primitive.
//!
//! Every mutating control-plane call returns immediately while the resource
//! moves through intermediate states. [`StateChange::wait`] turns that into a
//! bounded synchronous wait: it calls a [`Refresh`] implementation until the
//! reported status lands in the target set, fails on any status outside the
//! pending set, and gives up with [`WaitError::Timeout`] once the budget is
//! spent.

use std::future::Future;
use std::time::Duration;

use thiserror::Error;
use tokio::time::{Instant, sleep, sleep_until, timeout_at};
use tracing::{debug, warn};

use crate::compute::ApiFuture;
use crate::error::ApiError;

/// Roughly thirty years; stands in for deadlines too large to represent.
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

/// Value observed by one refresh together with its status string.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Observation<T> {
    /// Refreshed value returned to the caller once the wait succeeds.
    pub value: T,
    /// Status used to decide whether to keep waiting.
    pub status: String,
}

impl<T> Observation<T> {
    /// Pairs a value with its status.
    pub fn new(value: T, status: impl Into<String>) -> Self {
        Self {
            value,
            status: status.into(),
        }
    }
}

/// Future returned by a refresh.
pub type RefreshFuture<'a, T> = ApiFuture<'a, Observation<T>>;

/// Queries the current remote status of one resource.
pub trait Refresh: Sync {
    /// Value type carried by each observation.
    type Value: Send;

    /// Performs one status query.
    fn refresh(&self) -> RefreshFuture<'_, Self::Value>;
}

/// Poll function bound into a [`StatusRefresh`].
pub type PollFn<C, K, T> = for<'a> fn(&'a C, &'a K) -> RefreshFuture<'a, T>;

/// Binds a client handle, a resource key, and a poll function so the poller
/// stays independent of any specific resource kind.
///
/// The key is usually a plain ID; sub-resources such as interfaces use a
/// composite key.
pub struct StatusRefresh<'c, C: ?Sized, K: ?Sized, T> {
    client: &'c C,
    resource: Box<K>,
    poll: PollFn<C, K, T>,
}

impl<'c, C: ?Sized, K: ?Sized, T> StatusRefresh<'c, C, K, T> {
    /// Creates a refresh for `resource` using `poll`.
    pub fn new(client: &'c C, resource: impl Into<Box<K>>, poll: PollFn<C, K, T>) -> Self {
        Self {
            client,
            resource: resource.into(),
            poll,
        }
    }
}

impl<C, K, T> Refresh for StatusRefresh<'_, C, K, T>
where
    C: ?Sized + Sync,
    K: ?Sized + Sync,
    T: Send,
{
    type Value = T;

    fn refresh(&self) -> RefreshFuture<'_, T> {
        (self.poll)(self.client, &self.resource)
    }
}

/// Errors raised while waiting for a status transition.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum WaitError {
    /// The refresh call itself failed; waiting stops immediately.
    #[error("status refresh failed: {0}")]
    Refresh(#[source] ApiError),
    /// The resource reported a status in neither the pending nor target set.
    #[error("unexpected status {status} (expected one of {})", .expected.join(", "))]
    UnexpectedStatus {
        /// Status that was observed.
        status: String,
        /// Pending and target statuses that would have been accepted.
        expected: Vec<String>,
    },
    /// The deadline passed before a target status was observed.
    #[error(
        "timed out after {timeout:?} (last status: {})",
        .last_status.as_deref().unwrap_or("none")
    )]
    Timeout {
        /// Budget that elapsed.
        timeout: Duration,
        /// Last status observed, if any refresh completed.
        last_status: Option<String>,
    },
}

/// Description of one awaited transition.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct StateChange {
    pending: Vec<String>,
    target: Vec<String>,
    timeout: Duration,
    poll_interval: Duration,
    min_delay: Duration,
}

impl StateChange {
    /// Default delay between refreshes.
    pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(3);

    /// Creates a transition with the default poll interval and no extra
    /// initial delay.
    #[must_use]
    pub fn new(pending: &[&str], target: &[&str], timeout: Duration) -> Self {
        Self {
            pending: pending.iter().map(|status| (*status).to_owned()).collect(),
            target: target.iter().map(|status| (*status).to_owned()).collect(),
            timeout,
            poll_interval: Self::DEFAULT_POLL_INTERVAL,
            min_delay: Duration::ZERO,
        }
    }

    /// Sets the delay between refreshes.
    #[must_use]
    pub const fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Sets the minimum delay before the first re-poll.
    #[must_use]
    pub const fn min_delay(mut self, delay: Duration) -> Self {
        self.min_delay = delay;
        self
    }

    /// Polls `refresh` until a target status is observed.
    ///
    /// The first refresh runs immediately. While the status is pending the
    /// poller sleeps (the first pause is at least the configured minimum
    /// delay) and refreshes again. Sleeps and in-flight refreshes are both
    /// cut short at the deadline.
    ///
    /// # Errors
    ///
    /// Returns [`WaitError::Refresh`] when a refresh fails,
    /// [`WaitError::UnexpectedStatus`] for a status outside both sets, and
    /// [`WaitError::Timeout`] when the deadline passes.
    pub async fn wait<R>(&self, refresh: &R) -> Result<R::Value, WaitError>
    where
        R: Refresh + ?Sized,
    {
        let deadline = instant_after(self.timeout);
        let mut last_status: Option<String> = None;
        let mut pause = self.min_delay.max(self.poll_interval);

        loop {
            let Ok(result) = timeout_at(deadline, refresh.refresh()).await else {
                return Err(self.timed_out(last_status));
            };
            let observation = result.map_err(WaitError::Refresh)?;

            if self.target.contains(&observation.status) {
                return Ok(observation.value);
            }
            if !self.pending.contains(&observation.status) {
                return Err(WaitError::UnexpectedStatus {
                    status: observation.status,
                    expected: self.expected(),
                });
            }

            debug!(status = %observation.status, "waiting for target status");
            last_status = Some(observation.status);

            let wake = instant_after(pause);
            if wake >= deadline {
                sleep_until(deadline).await;
                return Err(self.timed_out(last_status));
            }
            sleep_until(wake).await;
            pause = self.poll_interval;
        }
    }

    fn expected(&self) -> Vec<String> {
        self.pending.iter().chain(&self.target).cloned().collect()
    }

    const fn timed_out(&self, last_status: Option<String>) -> WaitError {
        WaitError::Timeout {
            timeout: self.timeout,
            last_status,
        }
    }
}

/// Returns the instant `delay` from now, clamped to a far-future instant when
/// the addition would overflow.
fn instant_after(delay: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(delay)
        .or_else(|| now.checked_add(FAR_FUTURE))
        .unwrap_or(now)
}

/// Re-runs a whole wait when it fails with a retryable refresh error.
///
/// Only [`WaitError::Refresh`] carrying a conflict or transient
/// unavailability is retried; timeouts and unexpected statuses are returned
/// unchanged.
///
/// # Errors
///
/// Returns the last error once `attempts` runs are exhausted or a
/// non-retryable error occurs.
pub async fn retry_transient<T, F, Fut>(
    attempts: u32,
    backoff: Duration,
    mut operation: F,
) -> Result<T, WaitError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, WaitError>>,
{
    let mut attempt = 1;
    loop {
        match operation().await {
            Err(WaitError::Refresh(err)) if err.is_retryable() && attempt < attempts => {
                warn!(attempt, error = %err, "retrying wait after transient failure");
                attempt += 1;
                sleep(backoff).await;
            }
            other => return other,
        }
    }
}

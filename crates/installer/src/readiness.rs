//! Bounded readiness polling and retry backoff.
//!
//! Every "wait for X" step goes through [`Poller`]. Waits suspend on a
//! ticker-or-cancellation select so a cancelled run never sits out a full
//! timeout.

use std::future::Future;
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use adhar_cloud::{Cluster, ClusterStatus, Provider};
use anyhow::anyhow;
use thiserror::Error;
use tracing::{debug, warn};

use crate::context::RunContext;

/// Why a poll ended without the condition becoming true.
#[derive(Error, Debug)]
pub enum PollError {
    /// The condition stayed false for the whole window.
    #[error("timed out after {}s waiting for {what}", elapsed.as_secs())]
    Timeout {
        /// What was being waited for.
        what: String,
        /// Time spent waiting.
        elapsed: Duration,
    },

    /// The run context was cancelled.
    #[error("cancelled while waiting for {what}")]
    Cancelled {
        /// What was being waited for.
        what: String,
    },

    /// The check itself reported an unrecoverable failure.
    #[error("stopped waiting for {what}: {source}")]
    Aborted {
        /// What was being waited for.
        what: String,
        /// The failure.
        #[source]
        source: anyhow::Error,
    },
}

impl PollError {
    /// Whether the wait timed out, as opposed to failing or being cancelled.
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    /// Whether the wait was cancelled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
    }
}

/// Outcome of one check.
#[derive(Debug)]
pub enum Check {
    /// Condition met.
    Ready,
    /// Not yet; keep polling.
    Pending,
    /// Give up immediately.
    Abort(anyhow::Error),
}

impl From<bool> for Check {
    fn from(ready: bool) -> Self {
        if ready {
            Self::Ready
        } else {
            Self::Pending
        }
    }
}

/// Interval-based poller with an upper bound.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Poller {
    /// Time between checks.
    pub interval: Duration,
    /// Give up after this long.
    pub timeout: Duration,
}

impl Poller {
    /// Poller checking every `interval` for at most `timeout`.
    #[must_use]
    pub fn new(interval: Duration, timeout: Duration) -> Self {
        Self { interval, timeout }
    }

    /// Poll `check` until it reports ready.
    ///
    /// The first check runs immediately. Check errors are treated as "not
    /// ready yet" and logged; return [`Check::Abort`] from [`Self::until`]
    /// to stop early instead.
    ///
    /// # Errors
    ///
    /// [`PollError::Timeout`] after `timeout` (plus at most one interval),
    /// or [`PollError::Cancelled`] as soon as the context is cancelled.
    pub async fn until_ready<F, Fut>(
        &self,
        ctx: &RunContext,
        what: &str,
        mut check: F,
    ) -> Result<(), PollError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = anyhow::Result<bool>>,
    {
        self.until(ctx, what, || {
            let fut = check();
            async move {
                match fut.await {
                    Ok(ready) => Check::from(ready),
                    Err(e) => {
                        debug!(error = %e, "Readiness check failed, will retry");
                        Check::Pending
                    }
                }
            }
        })
        .await
    }

    /// Poll `check` until it reports [`Check::Ready`] or [`Check::Abort`].
    ///
    /// # Errors
    ///
    /// See [`Self::until_ready`]; additionally [`PollError::Aborted`].
    pub async fn until<F, Fut>(&self, ctx: &RunContext, what: &str, mut check: F) -> Result<(), PollError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Check>,
    {
        let start = Instant::now();
        let deadline = start + self.timeout;
        let mut attempts: u32 = 0;

        loop {
            let outcome = match ctx.run_until_cancelled(check()).await {
                Some(outcome) => outcome,
                None => {
                    return Err(PollError::Cancelled {
                        what: what.to_string(),
                    })
                }
            };
            attempts += 1;

            match outcome {
                Check::Ready => {
                    debug!(what, attempts, elapsed_ms = start.elapsed().as_millis(), "Ready");
                    return Ok(());
                }
                Check::Abort(source) => {
                    return Err(PollError::Aborted {
                        what: what.to_string(),
                        source,
                    })
                }
                Check::Pending => {}
            }

            if Instant::now() >= deadline {
                return Err(PollError::Timeout {
                    what: what.to_string(),
                    elapsed: start.elapsed(),
                });
            }

            tokio::select! {
                () = ctx.cancelled() => {
                    return Err(PollError::Cancelled { what: what.to_string() });
                }
                () = tokio::time::sleep(self.interval) => {}
            }
        }
    }
}

/// Exponential backoff bounds.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Maximum number of retries.
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Maximum delay between retries.
    pub max_delay: Duration,
    /// Backoff multiplier.
    pub factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 30,
            initial_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(180),
            factor: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (zero-based).
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exp = i32::try_from(attempt.min(30)).unwrap_or(30);
        let delay_secs = self.initial_delay.as_secs_f64() * self.factor.powi(exp);
        Duration::from_secs_f64(delay_secs.min(self.max_delay.as_secs_f64()))
    }

    /// Whether another retry is allowed after `attempt` retries.
    #[must_use]
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }

    /// Run `op`, retrying failures with backoff until the budget is spent.
    ///
    /// # Errors
    ///
    /// Returns the last failure, or a cancellation error if the context is
    /// cancelled while backing off.
    pub async fn run<T, F, Fut>(&self, ctx: &RunContext, what: &str, mut op: F) -> anyhow::Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        let mut attempt = 0;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if self.should_retry(attempt) => {
                    let delay = self.delay_for_attempt(attempt);
                    warn!(what, attempt = attempt + 1, error = %e, delay_ms = delay.as_millis(), "Retrying");
                    tokio::select! {
                        () = ctx.cancelled() => {
                            return Err(PollError::Cancelled { what: what.to_string() }.into());
                        }
                        () = tokio::time::sleep(delay) => {}
                    }
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// Poll `provider` until cluster `id` is running.
///
/// A not-found answer means "not created yet" and keeps polling; an
/// `error` status or any other provider failure stops immediately.
///
/// # Errors
///
/// See [`Poller::until`].
pub async fn wait_for_cluster(
    provider: &dyn Provider,
    ctx: &RunContext,
    poller: &Poller,
    id: &str,
) -> Result<Cluster, PollError> {
    let latest: Mutex<Option<Cluster>> = Mutex::new(None);
    let running = &latest;
    poller
        .until(ctx, &format!("cluster {id}"), move || {
            let lookup = provider.get_cluster(id);
            async move {
                match lookup.await {
                    Ok(cluster) if cluster.status == ClusterStatus::Running => {
                        *running.lock().unwrap_or_else(PoisonError::into_inner) = Some(cluster);
                        Check::Ready
                    }
                    Ok(cluster) if cluster.status == ClusterStatus::Error => {
                        Check::Abort(anyhow!("cluster {} reported status error", cluster.id))
                    }
                    Ok(cluster) => {
                        debug!(id = %cluster.id, status = ?cluster.status, "Cluster not running yet");
                        Check::Pending
                    }
                    Err(e) if e.is_not_found() => Check::Pending,
                    Err(e) => Check::Abort(e.into()),
                }
            }
        })
        .await?;
    let latest = latest.into_inner().unwrap_or_else(PoisonError::into_inner);
    latest.ok_or_else(|| PollError::Aborted {
        what: format!("cluster {id}"),
        source: anyhow!("cluster disappeared"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::CancelReason;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_ready_after_third_check() {
        let poller = Poller::new(Duration::from_millis(10), Duration::from_secs(2));
        let checks = Arc::new(AtomicU32::new(0));
        let start = Instant::now();

        let counter = Arc::clone(&checks);
        poller
            .until_ready(&RunContext::new(), "third check", || {
                let counter = Arc::clone(&counter);
                async move { Ok(counter.fetch_add(1, Ordering::SeqCst) + 1 >= 3) }
            })
            .await
            .unwrap();

        assert_eq!(checks.load(Ordering::SeqCst), 3);
        // Two sleeps of 10ms between three checks
        assert!(start.elapsed() >= Duration::from_millis(20));
        assert!(start.elapsed() < Duration::from_millis(500));
    }

    #[tokio::test]
    async fn test_never_ready_times_out_within_bound() {
        let poller = Poller::new(Duration::from_millis(10), Duration::from_millis(50));
        let start = Instant::now();
        let err = poller
            .until_ready(&RunContext::new(), "nothing", || async { Ok(false) })
            .await
            .unwrap_err();

        assert!(err.is_timeout());
        assert!(start.elapsed() >= Duration::from_millis(50));
        // Bound plus one interval, with scheduling slack
        assert!(start.elapsed() < Duration::from_millis(250));
    }

    #[tokio::test]
    async fn test_check_errors_keep_polling() {
        let poller = Poller::new(Duration::from_millis(5), Duration::from_secs(1));
        let calls = AtomicU32::new(0);
        poller
            .until_ready(&RunContext::new(), "flaky", || {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n == 0 {
                        anyhow::bail!("connection refused")
                    }
                    Ok(true)
                }
            })
            .await
            .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_abort_stops_immediately() {
        let poller = Poller::new(Duration::from_millis(5), Duration::from_secs(10));
        let err = poller
            .until(&RunContext::new(), "doomed", || async {
                Check::Abort(anyhow::anyhow!("image pull failed"))
            })
            .await
            .unwrap_err();
        assert!(matches!(err, PollError::Aborted { .. }));
        assert!(err.to_string().contains("image pull failed"));
    }

    #[tokio::test]
    async fn test_cancellation_interrupts_wait() {
        let ctx = RunContext::new();
        let canceller = ctx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            canceller.cancel(CancelReason::Interrupt);
        });

        let poller = Poller::new(Duration::from_millis(100), Duration::from_secs(60));
        let start = Instant::now();
        let err = poller
            .until_ready(&ctx, "forever", || async { Ok(false) })
            .await
            .unwrap_err();
        assert!(err.is_cancelled());
        // Within one poll interval of the cancellation
        assert!(start.elapsed() < Duration::from_millis(500));
    }

    #[test]
    fn test_retry_policy_backoff() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for_attempt(0), Duration::from_secs(5));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_secs(10));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_secs(20));
        assert_eq!(policy.delay_for_attempt(10), Duration::from_secs(180));
        assert!(policy.should_retry(29));
        assert!(!policy.should_retry(30));
    }

    #[tokio::test]
    async fn test_retry_run_succeeds_after_failures() {
        let policy = RetryPolicy {
            max_attempts: 3,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            factor: 2.0,
        };
        let calls = AtomicU32::new(0);
        let value = policy
            .run(&RunContext::new(), "flaky op", || {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        anyhow::bail!("transient")
                    }
                    Ok(n)
                }
            })
            .await
            .unwrap();
        assert_eq!(value, 2);

        let err = RetryPolicy { max_attempts: 1, ..policy }
            .run(&RunContext::new(), "always fails", || async {
                Err::<(), _>(anyhow::anyhow!("boom"))
            })
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "boom");
    }

    #[tokio::test]
    async fn test_wait_for_cluster_tolerates_not_found() {
        use adhar_cloud::testing::FakeProvider;
        use adhar_cloud::ClusterSpec;

        let provider = FakeProvider::new("civo").with_polls_until_running(2);
        let created = provider
            .create_cluster(&ClusterSpec::new("civo", "prod"))
            .await
            .unwrap();
        let provider = provider.with_not_found_polls(1);

        let poller = Poller::new(Duration::from_millis(1), Duration::from_secs(1));
        let cluster = wait_for_cluster(&provider, &RunContext::new(), &poller, &created.id)
            .await
            .unwrap();
        assert_eq!(cluster.status, ClusterStatus::Running);
        assert_eq!(provider.calls().iter().filter(|c| *c == "get_cluster").count(), 3);
    }

    #[tokio::test]
    async fn test_wait_for_cluster_times_out_when_never_created() {
        use adhar_cloud::testing::FakeProvider;

        let provider = FakeProvider::new("civo");
        let poller = Poller::new(Duration::from_millis(1), Duration::from_millis(20));
        let err = wait_for_cluster(&provider, &RunContext::new(), &poller, "civo-missing")
            .await
            .unwrap_err();
        // Never created: keeps treating not-found as pending until the bound
        assert!(err.is_timeout());
    }
}

//! Run context threaded through every phase and external call.
//!
//! A single [`CancellationToken`] is the cancellable context. Alongside it a
//! side channel records *why* the run was cancelled: a user interrupt is a
//! failure, while self-cancellation after the platform reported sync is a
//! success. The first recorded reason wins when both race.

use std::future::Future;
use std::sync::{Arc, OnceLock};

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

/// Why the run was cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelReason {
    /// External interrupt signal.
    Interrupt,
    /// The platform reported readiness in exit-on-sync mode.
    SyncComplete,
}

impl CancelReason {
    /// Whether cancellation for this reason ends the run successfully.
    #[must_use]
    pub fn is_success(self) -> bool {
        matches!(self, Self::SyncComplete)
    }
}

impl std::fmt::Display for CancelReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Interrupt => write!(f, "interrupted"),
            Self::SyncComplete => write!(f, "platform synced"),
        }
    }
}

/// Shared cancellation and output policy for one CLI invocation.
#[derive(Debug, Clone)]
pub struct RunContext {
    run_id: Uuid,
    token: CancellationToken,
    reason: Arc<OnceLock<CancelReason>>,
    suppress_output: bool,
    exit_on_sync: bool,
}

impl Default for RunContext {
    fn default() -> Self {
        Self::new()
    }
}

impl RunContext {
    /// Fresh, uncancelled context with console output enabled.
    #[must_use]
    pub fn new() -> Self {
        Self {
            run_id: Uuid::new_v4(),
            token: CancellationToken::new(),
            reason: Arc::new(OnceLock::new()),
            suppress_output: false,
            exit_on_sync: false,
        }
    }

    /// Suppress progress rendering (nested runs, machine output).
    #[must_use]
    pub fn with_suppressed_output(mut self, suppress: bool) -> Self {
        self.suppress_output = suppress;
        self
    }

    /// Cancel the run once the platform reports sync.
    #[must_use]
    pub fn with_exit_on_sync(mut self, exit_on_sync: bool) -> Self {
        self.exit_on_sync = exit_on_sync;
        self
    }

    /// Identifier attached to log lines of this run.
    #[must_use]
    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    /// Whether progress rendering is suppressed.
    #[must_use]
    pub fn suppress_output(&self) -> bool {
        self.suppress_output
    }

    /// Whether exit-on-sync mode is enabled.
    #[must_use]
    pub fn exit_on_sync(&self) -> bool {
        self.exit_on_sync
    }

    /// Underlying token, for APIs that take one directly.
    #[must_use]
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Cancel with `reason`. Returns `false` when another reason was
    /// recorded first; the token is cancelled either way.
    pub fn cancel(&self, reason: CancelReason) -> bool {
        let recorded = self.reason.set(reason).is_ok();
        if !recorded {
            warn!(
                requested = %reason,
                recorded = %self.reason().map_or_else(String::new, |r| r.to_string()),
                "Run already cancelled for another reason"
            );
        }
        self.token.cancel();
        recorded
    }

    /// Whether the run has been cancelled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// The recorded cancellation reason, if any.
    #[must_use]
    pub fn reason(&self) -> Option<CancelReason> {
        self.reason.get().copied()
    }

    /// Whether the run was cancelled by a successful self-cancellation.
    #[must_use]
    pub fn cancelled_by_sync(&self) -> bool {
        self.is_cancelled() && self.reason().is_some_and(CancelReason::is_success)
    }

    /// Resolves once the run is cancelled.
    pub async fn cancelled(&self) {
        self.token.cancelled().await;
    }

    /// Run `fut` unless the context is cancelled first.
    ///
    /// Returns `None` on cancellation; the future is dropped, which kills any
    /// subprocess it was awaiting.
    pub async fn run_until_cancelled<F: Future>(&self, fut: F) -> Option<F::Output> {
        tokio::select! {
            biased;
            () = self.token.cancelled() => None,
            out = fut => Some(out),
        }
    }

    /// Turn Ctrl-C into an [`CancelReason::Interrupt`] cancellation.
    pub fn install_interrupt_handler(&self) {
        let ctx = self.clone();
        tokio::spawn(async move {
            tokio::select! {
                () = ctx.token.cancelled() => {}
                result = tokio::signal::ctrl_c() => {
                    if result.is_ok() {
                        info!("Interrupt received, cancelling");
                        ctx.cancel(CancelReason::Interrupt);
                    }
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_first_reason_wins() {
        let ctx = RunContext::new();
        assert!(ctx.reason().is_none());
        assert!(ctx.cancel(CancelReason::SyncComplete));
        assert!(!ctx.cancel(CancelReason::Interrupt));
        assert_eq!(ctx.reason(), Some(CancelReason::SyncComplete));
        assert!(ctx.cancelled_by_sync());
    }

    #[test]
    fn test_clones_share_cancellation() {
        let ctx = RunContext::new().with_exit_on_sync(true);
        let clone = ctx.clone();
        clone.cancel(CancelReason::Interrupt);
        assert!(ctx.is_cancelled());
        assert_eq!(ctx.reason(), Some(CancelReason::Interrupt));
        assert!(!ctx.cancelled_by_sync());
        assert!(ctx.exit_on_sync());
    }

    #[tokio::test]
    async fn test_run_until_cancelled_returns_promptly() {
        let ctx = RunContext::new();
        let canceller = ctx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            canceller.cancel(CancelReason::Interrupt);
        });

        let start = std::time::Instant::now();
        let out = ctx
            .run_until_cancelled(tokio::time::sleep(Duration::from_secs(30)))
            .await;
        assert!(out.is_none());
        assert!(start.elapsed() < Duration::from_secs(5));
    }
}

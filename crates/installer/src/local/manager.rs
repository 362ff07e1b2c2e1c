//! Controller-manager lifecycle.
//!
//! The manager runs on a background task. Startup is signalled over a
//! oneshot so the pipeline can move on, and the final result comes back on
//! a separate completion channel. Waiting for the platform is a small state
//! machine:
//!
//! ```text
//! Running --manager finished ok--> Done
//! Running --manager failed------> Failed
//! Running --context cancelled---> Draining
//! Running --safety net ready----> Draining (exit on sync: cancels with SyncComplete)
//! Running --safety net ready----> Running  (otherwise: keeps serving until interrupted)
//! Draining --exit or grace over--> Done
//! ```
//!
//! A manager that overruns the grace window is logged and abandoned; it
//! never fails an otherwise successful run. Without exit-on-sync an
//! interrupt after the platform was observed ready is a normal stop.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::context::{CancelReason, RunContext};
use crate::readiness::PollError;

/// Something that reconciles the platform until cancelled.
#[async_trait]
pub trait ControllerManager: Send + Sync {
    /// Run until the context is cancelled or reconciliation ends.
    ///
    /// Implementations send on `started` once they are watching; dropping
    /// it without sending counts as a failed start.
    async fn run(&self, ctx: RunContext, started: oneshot::Sender<()>) -> Result<()>;
}

/// Lifecycle state of a running manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ManagerState {
    /// Reconciling.
    Running,
    /// Context cancelled; waiting for the manager to exit.
    Draining,
    /// Finished.
    Done,
    /// The manager reported an error.
    Failed(String),
}

/// How the wait ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Exit {
    /// The manager finished by itself.
    Completed,
    /// The context was cancelled (by the manager or externally).
    Cancelled,
    /// The safety-net poll saw the platform ready first.
    SafetyNet,
    /// The platform was ready and the user stopped the controller.
    Stopped,
}

/// Handle to a started manager.
pub struct ManagerHandle {
    state: ManagerState,
    done: oneshot::Receiver<Result<()>>,
    task: JoinHandle<()>,
}

impl std::fmt::Debug for ManagerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManagerHandle").field("state", &self.state).finish_non_exhaustive()
    }
}

impl ManagerHandle {
    /// Spawn `manager` and return once it reports that it started.
    ///
    /// # Errors
    ///
    /// Fails when the manager exits or errors before signalling startup.
    pub async fn start(manager: Arc<dyn ControllerManager>, ctx: &RunContext) -> Result<Self> {
        let (started_tx, started_rx) = oneshot::channel();
        let (done_tx, mut done) = oneshot::channel();
        let task_ctx = ctx.clone();

        let task = tokio::spawn(async move {
            let result = manager.run(task_ctx, started_tx).await;
            if let Err(e) = &result {
                debug!(error = %e, "Controller manager exited with error");
            }
            // The receiver is gone once the pipeline stopped waiting
            let _ = done_tx.send(result);
        });

        tokio::select! {
            biased;
            started = started_rx => {
                if started.is_ok() {
                    info!("Controller manager started");
                    return Ok(Self { state: ManagerState::Running, done, task });
                }
                // Sender dropped: the manager is exiting, report why
                match (&mut done).await {
                    Ok(Err(e)) => Err(e.context("controller manager failed to start")),
                    _ => bail!("controller manager exited before starting"),
                }
            }
            result = &mut done => match result {
                Ok(Err(e)) => Err(e.context("controller manager failed to start")),
                _ => bail!("controller manager exited before starting"),
            },
        }
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> &ManagerState {
        &self.state
    }

    fn transition(&mut self, next: ManagerState) {
        debug!(from = ?self.state, to = ?next, "Controller manager state");
        self.state = next;
    }

    /// Wait for the platform to become ready.
    ///
    /// `safety_net` resolves `Ok(())` once readiness is observed
    /// independently. With exit-on-sync it then cancels the run with
    /// [`CancelReason::SyncComplete`]; otherwise the manager keeps running
    /// until it exits or the run is interrupted. After cancellation the
    /// manager gets `grace` to exit.
    ///
    /// # Errors
    ///
    /// Fails when the manager fails, the safety net gives up, or the run was
    /// interrupted before the platform was ready.
    pub async fn wait<F>(&mut self, ctx: &RunContext, grace: Duration, safety_net: F) -> Result<Exit>
    where
        F: Future<Output = Result<(), PollError>>,
    {
        tokio::pin!(safety_net);

        let exit = tokio::select! {
            biased;
            result = &mut self.done => {
                return self.finish(result.unwrap_or_else(|_| Err(anyhow!("controller manager task was lost"))));
            }
            () = ctx.cancelled() => Exit::Cancelled,
            polled = &mut safety_net => match polled {
                Ok(()) if ctx.exit_on_sync() => {
                    info!("Platform readiness observed, stopping controller manager");
                    ctx.cancel(CancelReason::SyncComplete);
                    Exit::SafetyNet
                }
                Ok(()) => return self.serve(ctx, grace).await,
                Err(PollError::Cancelled { .. }) => Exit::Cancelled,
                Err(e) => {
                    self.transition(ManagerState::Failed(e.to_string()));
                    self.task.abort();
                    return Err(anyhow::Error::new(e).context("platform did not become ready"));
                }
            },
        };

        self.drain(ctx, grace).await?;
        if ctx.cancelled_by_sync() {
            Ok(exit)
        } else {
            Err(anyhow!("interrupted while waiting for the platform"))
        }
    }

    /// Keep the ready platform's manager running until it exits or the run
    /// is cancelled.
    async fn serve(&mut self, ctx: &RunContext, grace: Duration) -> Result<Exit> {
        info!("Platform is ready, controller keeps running until interrupted");
        tokio::select! {
            biased;
            result = &mut self.done => {
                return self.finish(result.unwrap_or_else(|_| Err(anyhow!("controller manager task was lost"))));
            }
            () = ctx.cancelled() => {}
        }

        self.drain(ctx, grace).await?;
        Ok(if ctx.cancelled_by_sync() { Exit::Cancelled } else { Exit::Stopped })
    }

    /// Give a cancelled manager `grace` to exit.
    async fn drain(&mut self, ctx: &RunContext, grace: Duration) -> Result<()> {
        self.transition(ManagerState::Draining);
        match tokio::time::timeout(grace, &mut self.done).await {
            Ok(Ok(Err(e))) if !ctx.cancelled_by_sync() => {
                self.transition(ManagerState::Failed(format!("{e:#}")));
                return Err(e.context("controller manager failed while stopping"));
            }
            Ok(Ok(Err(e))) => {
                warn!(error = %format!("{e:#}"), "Controller manager reported an error after platform sync");
            }
            Ok(_) => debug!("Controller manager exited"),
            Err(_) => {
                warn!(grace_secs = grace.as_secs(), "Controller manager did not stop within the grace period, continuing");
                self.task.abort();
            }
        }
        self.transition(ManagerState::Done);
        Ok(())
    }

    /// Stop the manager task without waiting for it.
    pub fn abort(&mut self) {
        if !matches!(self.state, ManagerState::Done | ManagerState::Failed(_)) {
            debug!("Aborting controller manager");
            self.task.abort();
            self.transition(ManagerState::Done);
        }
    }

    fn finish(&mut self, result: Result<()>) -> Result<Exit> {
        match result {
            Ok(()) => {
                self.transition(ManagerState::Done);
                Ok(Exit::Completed)
            }
            Err(e) => {
                self.transition(ManagerState::Failed(format!("{e:#}")));
                Err(e.context("controller manager failed"))
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    /// Manager scripted for lifecycle tests.
    pub(crate) struct ScriptedManager {
        pub(crate) signal_start: bool,
        pub(crate) fail_with: Option<&'static str>,
        pub(crate) finish_after: Option<Duration>,
        pub(crate) ignore_cancel: bool,
        pub(crate) cancel_on_sync_after: Option<Duration>,
        pub(crate) stopped: Arc<AtomicBool>,
    }

    impl Default for ScriptedManager {
        fn default() -> Self {
            Self {
                signal_start: true,
                fail_with: None,
                finish_after: None,
                ignore_cancel: false,
                cancel_on_sync_after: None,
                stopped: Arc::new(AtomicBool::new(false)),
            }
        }
    }

    #[async_trait]
    impl ControllerManager for ScriptedManager {
        async fn run(&self, ctx: RunContext, started: oneshot::Sender<()>) -> Result<()> {
            if !self.signal_start {
                bail!("{}", self.fail_with.unwrap_or("no leader lease"));
            }
            let _ = started.send(());
            if let Some(after) = self.cancel_on_sync_after {
                tokio::time::sleep(after).await;
                ctx.cancel(CancelReason::SyncComplete);
            }
            if let Some(after) = self.finish_after {
                tokio::time::sleep(after).await;
                return match self.fail_with {
                    Some(message) => Err(anyhow!(message)),
                    None => Ok(()),
                };
            }
            if self.ignore_cancel {
                std::future::pending::<()>().await;
            }
            ctx.cancelled().await;
            // Simulated shutdown work
            tokio::time::sleep(Duration::from_millis(5)).await;
            self.stopped.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    fn never_ready() -> impl Future<Output = Result<(), PollError>> {
        std::future::pending()
    }

    async fn started(manager: ScriptedManager, ctx: &RunContext) -> ManagerHandle {
        ManagerHandle::start(Arc::new(manager), ctx).await.unwrap()
    }

    #[tokio::test]
    async fn test_start_failure_is_reported() {
        let manager = ScriptedManager {
            signal_start: false,
            fail_with: Some("webhook port in use"),
            ..ScriptedManager::default()
        };
        let err = ManagerHandle::start(Arc::new(manager), &RunContext::new())
            .await
            .unwrap_err();
        assert!(format!("{err:#}").contains("webhook port in use"));
    }

    #[tokio::test]
    async fn test_manager_completion_is_done() {
        let ctx = RunContext::new();
        let mut handle = started(
            ScriptedManager {
                finish_after: Some(Duration::from_millis(10)),
                ..ScriptedManager::default()
            },
            &ctx,
        )
        .await;

        let exit = handle.wait(&ctx, Duration::from_secs(1), never_ready()).await.unwrap();
        assert_eq!(exit, Exit::Completed);
        assert_eq!(handle.state(), &ManagerState::Done);
    }

    #[tokio::test]
    async fn test_manager_error_is_failed() {
        let ctx = RunContext::new();
        let mut handle = started(
            ScriptedManager {
                finish_after: Some(Duration::from_millis(10)),
                fail_with: Some("reconcile panicked"),
                ..ScriptedManager::default()
            },
            &ctx,
        )
        .await;

        let err = handle.wait(&ctx, Duration::from_secs(1), never_ready()).await.unwrap_err();
        assert!(format!("{err:#}").contains("reconcile panicked"));
        assert!(matches!(handle.state(), ManagerState::Failed(_)));
    }

    #[tokio::test]
    async fn test_self_cancellation_drains_manager() {
        let ctx = RunContext::new().with_exit_on_sync(true);
        let stopped = Arc::new(AtomicBool::new(false));
        let mut handle = started(
            ScriptedManager {
                cancel_on_sync_after: Some(Duration::from_millis(10)),
                stopped: Arc::clone(&stopped),
                ..ScriptedManager::default()
            },
            &ctx,
        )
        .await;

        let exit = handle.wait(&ctx, Duration::from_secs(1), never_ready()).await.unwrap();
        assert_eq!(exit, Exit::Cancelled);
        assert!(stopped.load(Ordering::SeqCst));
        assert_eq!(handle.state(), &ManagerState::Done);
    }

    #[tokio::test]
    async fn test_grace_overrun_is_success() {
        let ctx = RunContext::new().with_exit_on_sync(true);
        let mut handle = started(
            ScriptedManager {
                ignore_cancel: true,
                ..ScriptedManager::default()
            },
            &ctx,
        )
        .await;

        let start = std::time::Instant::now();
        let exit = handle
            .wait(&ctx, Duration::from_millis(50), async { Ok(()) })
            .await
            .unwrap();
        assert_eq!(exit, Exit::SafetyNet);
        assert_eq!(ctx.reason(), Some(CancelReason::SyncComplete));
        assert!(start.elapsed() < Duration::from_secs(2));
        assert_eq!(handle.state(), &ManagerState::Done);
    }

    #[tokio::test]
    async fn test_ready_platform_keeps_serving_without_exit_on_sync() {
        let ctx = RunContext::new();
        let stopped = Arc::new(AtomicBool::new(false));
        let mut handle = started(
            ScriptedManager {
                stopped: Arc::clone(&stopped),
                ..ScriptedManager::default()
            },
            &ctx,
        )
        .await;

        let exit = {
            let waiting = handle.wait(&ctx, Duration::from_secs(1), async { Ok(()) });
            tokio::pin!(waiting);
            assert!(tokio::time::timeout(Duration::from_millis(100), &mut waiting).await.is_err());
            assert_eq!(ctx.reason(), None);
            assert!(!stopped.load(Ordering::SeqCst));

            ctx.cancel(CancelReason::Interrupt);
            waiting.await.unwrap()
        };
        assert_eq!(exit, Exit::Stopped);
        assert!(stopped.load(Ordering::SeqCst));
        assert_eq!(handle.state(), &ManagerState::Done);
    }

    #[tokio::test]
    async fn test_abort_stops_the_task() {
        let ctx = RunContext::new();
        let stopped = Arc::new(AtomicBool::new(false));
        let mut handle = started(
            ScriptedManager {
                ignore_cancel: true,
                stopped: Arc::clone(&stopped),
                ..ScriptedManager::default()
            },
            &ctx,
        )
        .await;

        handle.abort();
        assert_eq!(handle.state(), &ManagerState::Done);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(handle.task.is_finished());
        assert!(!ctx.is_cancelled());
    }

    #[tokio::test]
    async fn test_interrupt_is_an_error() {
        let ctx = RunContext::new();
        let mut handle = started(ScriptedManager::default(), &ctx).await;
        let canceller = ctx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            canceller.cancel(CancelReason::Interrupt);
        });

        let err = handle.wait(&ctx, Duration::from_secs(1), never_ready()).await.unwrap_err();
        assert!(err.to_string().contains("interrupted"));
    }

    #[tokio::test]
    async fn test_safety_net_timeout_fails() {
        let ctx = RunContext::new();
        let mut handle = started(ScriptedManager::default(), &ctx).await;
        let timeout = async {
            Err(PollError::Timeout {
                what: "platform".to_string(),
                elapsed: Duration::from_secs(1800),
            })
        };

        let err = handle.wait(&ctx, Duration::from_secs(1), timeout).await.unwrap_err();
        assert!(format!("{err:#}").contains("timed out"));
    }
}

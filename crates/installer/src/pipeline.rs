//! Ordered, cancellable phase execution.
//!
//! Phases run strictly in order. A fatal failure halts the pipeline and
//! reports the failing index; a phase marked non-fatal logs a warning and
//! the pipeline continues. Self-cancellation after the platform synced
//! ends the run successfully and skips whatever is left.

use std::future::Future;

use async_trait::async_trait;
use thiserror::Error;
use tracing::{error, info, warn};

use crate::context::RunContext;
use crate::ui::{PhaseEvent, ProgressSink};

/// Executes one phase.
#[async_trait]
pub trait PhaseExecutor: Send + Sync {
    /// Run the phase to completion or failure.
    async fn execute(&self, ctx: &RunContext) -> anyhow::Result<()>;
}

/// Adapts an async closure into a [`PhaseExecutor`].
pub struct FnExecutor<F>(F);

#[async_trait]
impl<F, Fut> PhaseExecutor for FnExecutor<F>
where
    F: Fn(RunContext) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<()>> + Send,
{
    async fn execute(&self, ctx: &RunContext) -> anyhow::Result<()> {
        (self.0)(ctx.clone()).await
    }
}

/// A named step of a pipeline.
pub struct Phase {
    name: String,
    description: String,
    non_fatal: bool,
    executor: Box<dyn PhaseExecutor>,
}

impl Phase {
    /// Phase backed by `executor`.
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        executor: impl PhaseExecutor + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            non_fatal: false,
            executor: Box::new(executor),
        }
    }

    /// Phase backed by an async closure receiving the run context.
    pub fn from_fn<F, Fut>(name: impl Into<String>, description: impl Into<String>, f: F) -> Self
    where
        F: Fn(RunContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        Self::new(name, description, FnExecutor(f))
    }

    /// Log failures of this phase as warnings and keep going.
    #[must_use]
    pub fn non_fatal(mut self) -> Self {
        self.non_fatal = true;
        self
    }

    /// Phase name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Human description.
    #[must_use]
    pub fn description(&self) -> &str {
        &self.description
    }

    /// Whether failures are tolerated.
    #[must_use]
    pub fn is_non_fatal(&self) -> bool {
        self.non_fatal
    }
}

/// Terminal state of a phase.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PhaseStatus {
    /// Never reached.
    Pending,
    /// Ran successfully.
    Completed,
    /// Failed, tolerated.
    Warned(String),
    /// Not run.
    Skipped(String),
}

/// Per-phase results of a successful run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PipelineReport {
    /// Phase names and their terminal states, in order.
    pub phases: Vec<(String, PhaseStatus)>,
}

impl PipelineReport {
    /// Number of phases that ran successfully.
    #[must_use]
    pub fn completed(&self) -> usize {
        self.phases
            .iter()
            .filter(|(_, s)| *s == PhaseStatus::Completed)
            .count()
    }

    /// Number of phases.
    #[must_use]
    pub fn total(&self) -> usize {
        self.phases.len()
    }

    /// Tolerated failures.
    #[must_use]
    pub fn warnings(&self) -> Vec<(&str, &str)> {
        self.phases
            .iter()
            .filter_map(|(name, s)| match s {
                PhaseStatus::Warned(msg) => Some((name.as_str(), msg.as_str())),
                _ => None,
            })
            .collect()
    }

    /// "N of M steps completed".
    #[must_use]
    pub fn summary(&self) -> String {
        format!("{} of {} steps completed", self.completed(), self.total())
    }
}

/// Why a pipeline stopped.
#[derive(Error, Debug)]
pub enum PipelineError {
    /// A fatal phase failed.
    #[error("phase {} ({phase}) failed: {source:#}", index + 1)]
    Phase {
        /// Zero-based index of the failing phase.
        index: usize,
        /// Phase name.
        phase: String,
        /// Underlying error.
        #[source]
        source: anyhow::Error,
    },

    /// The run was interrupted.
    #[error("interrupted during phase {} ({phase})", index + 1)]
    Cancelled {
        /// Zero-based index of the interrupted phase.
        index: usize,
        /// Phase name.
        phase: String,
    },
}

impl PipelineError {
    /// Index of the phase that stopped the pipeline.
    #[must_use]
    pub fn index(&self) -> usize {
        match self {
            Self::Phase { index, .. } | Self::Cancelled { index, .. } => *index,
        }
    }
}

/// Ordered phases plus the name used in logs.
pub struct Pipeline {
    name: String,
    phases: Vec<Phase>,
}

impl Pipeline {
    /// Empty pipeline.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            phases: Vec::new(),
        }
    }

    /// Append a phase.
    #[must_use]
    pub fn phase(mut self, phase: Phase) -> Self {
        self.phases.push(phase);
        self
    }

    /// Phases in order.
    #[must_use]
    pub fn phases(&self) -> &[Phase] {
        &self.phases
    }

    /// Run every phase in order.
    ///
    /// # Errors
    ///
    /// [`PipelineError::Phase`] for the first fatal failure, or
    /// [`PipelineError::Cancelled`] when interrupted.
    pub async fn run(
        &self,
        ctx: &RunContext,
        sink: &dyn ProgressSink,
    ) -> Result<PipelineReport, PipelineError> {
        let total = self.phases.len();
        let mut report = PipelineReport {
            phases: self
                .phases
                .iter()
                .map(|p| (p.name.clone(), PhaseStatus::Pending))
                .collect(),
        };

        for (index, phase) in self.phases.iter().enumerate() {
            if ctx.is_cancelled() {
                if ctx.cancelled_by_sync() {
                    Self::skip_rest(&mut report, sink, index);
                    break;
                }
                return Err(PipelineError::Cancelled {
                    index,
                    phase: phase.name.clone(),
                });
            }

            sink.event(&PhaseEvent::Started {
                index,
                total,
                description: phase.description.clone(),
            });
            info!(pipeline = %self.name, phase = %phase.name, index, run_id = %ctx.run_id(), "Starting phase");

            match phase.executor.execute(ctx).await {
                Ok(()) => {
                    report.phases[index].1 = PhaseStatus::Completed;
                    sink.event(&PhaseEvent::Completed { index });
                }
                Err(e) if ctx.cancelled_by_sync() => {
                    info!(phase = %phase.name, detail = %e, "Phase ended by platform sync");
                    report.phases[index].1 = PhaseStatus::Completed;
                    sink.event(&PhaseEvent::Completed { index });
                }
                Err(_) if ctx.is_cancelled() => {
                    sink.event(&PhaseEvent::Failed {
                        index,
                        message: format!("{} interrupted", phase.name),
                    });
                    return Err(PipelineError::Cancelled {
                        index,
                        phase: phase.name.clone(),
                    });
                }
                Err(e) if phase.non_fatal => {
                    warn!(phase = %phase.name, error = %format!("{e:#}"), "Non-fatal phase failed, continuing");
                    let message = format!("{}: {e:#}", phase.name);
                    sink.event(&PhaseEvent::Warned {
                        index,
                        message: message.clone(),
                    });
                    report.phases[index].1 = PhaseStatus::Warned(message);
                }
                Err(e) => {
                    error!(pipeline = %self.name, phase = %phase.name, index, error = %format!("{e:#}"), "Phase failed");
                    sink.event(&PhaseEvent::Failed {
                        index,
                        message: format!("{}: {e:#}", phase.name),
                    });
                    return Err(PipelineError::Phase {
                        index,
                        phase: phase.name.clone(),
                        source: e,
                    });
                }
            }
        }

        info!(pipeline = %self.name, summary = %report.summary(), "Pipeline finished");
        Ok(report)
    }

    fn skip_rest(report: &mut PipelineReport, sink: &dyn ProgressSink, from: usize) {
        for index in from..report.phases.len() {
            report.phases[index].1 = PhaseStatus::Skipped("platform already synced".to_string());
            sink.event(&PhaseEvent::Skipped {
                index,
                reason: "platform already synced".to_string(),
            });
        }
    }
}

//! Bringing a node from "powered on with unknown state" to "running the desired salt state".
//!
//! Each node goes through `Idle → PowerCycling → AwaitingReady → Configuring` and ends in
//! `Succeeded` or `Failed`. Every step either moves forward or ends the run; nothing is
//! retried and nothing is rolled back, so a node that fails half way is left as it is.

use std::{fmt, num::NonZeroUsize, sync::Arc};

use futures::{stream, StreamExt};
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::{
    config::{BootstrapConfig, ConsoleSettings},
    console::ConsoleSource,
    directory::NodeRecord,
    power::{PowerController, PowerError},
    readiness::{ReadinessDetector, WaitError},
    salt::{ApplyError, ConfigurationApplier},
    subprocess::{CommandOutput, CommandRunner, SystemCommandRunner},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BootstrapPhase {
    Idle,
    PowerCycling,
    AwaitingReady,
    Configuring,
    Succeeded,
    Failed,
}

impl fmt::Display for BootstrapPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BootstrapPhase::Idle => "idle",
            BootstrapPhase::PowerCycling => "power cycling",
            BootstrapPhase::AwaitingReady => "awaiting ready",
            BootstrapPhase::Configuring => "configuring",
            BootstrapPhase::Succeeded => "succeeded",
            BootstrapPhase::Failed => "failed",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum BootstrapOutcome {
    Succeeded {
        ready_line: String,
        apply: CommandOutput,
    },
    PowerControlFailed {
        error: String,
        exit_code: Option<i32>,
        stderr: Option<String>,
    },
    TimedOutWaitingForReady {
        attempts_made: u32,
        last_line_seen: Option<String>,
    },
    ConfigurationApplyFailed {
        error: String,
        exit_code: Option<i32>,
        stdout: Option<String>,
        stderr: Option<String>,
    },
    /// Shutdown was requested before configuration started.
    Cancelled { phase: BootstrapPhase },
}

impl From<PowerError> for BootstrapOutcome {
    fn from(error: PowerError) -> Self {
        let (exit_code, stderr) = match &error {
            PowerError::Failed { exit_code, stderr } => (*exit_code, Some(stderr.clone())),
            _ => (None, None),
        };

        BootstrapOutcome::PowerControlFailed {
            error: error.to_string(),
            exit_code,
            stderr,
        }
    }
}

impl From<ApplyError> for BootstrapOutcome {
    fn from(error: ApplyError) -> Self {
        let (exit_code, stdout, stderr) = match &error {
            ApplyError::Failed {
                exit_code,
                stdout,
                stderr,
            } => (*exit_code, Some(stdout.clone()), Some(stderr.clone())),
            _ => (None, None, None),
        };

        BootstrapOutcome::ConfigurationApplyFailed {
            error: error.to_string(),
            exit_code,
            stdout,
            stderr,
        }
    }
}

/// Terminal result of bootstrapping one node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BootstrapResult {
    pub node: String,
    #[serde(flatten)]
    pub outcome: BootstrapOutcome,
}

impl BootstrapResult {
    pub fn is_success(&self) -> bool {
        matches!(self.outcome, BootstrapOutcome::Succeeded { .. })
    }

    /// One line summary for the operator.
    pub fn summary(&self) -> String {
        match &self.outcome {
            BootstrapOutcome::Succeeded { ready_line, .. } => {
                format!("{}: configured (console: {})", self.node, ready_line)
            }
            BootstrapOutcome::PowerControlFailed { error, .. } => {
                format!("{}: power cycle failed: {}", self.node, error)
            }
            BootstrapOutcome::TimedOutWaitingForReady {
                attempts_made,
                last_line_seen,
            } => format!(
                "{}: not ready after {} attempts, last console line: {}",
                self.node,
                attempts_made,
                last_line_seen.as_deref().unwrap_or("<none>")
            ),
            BootstrapOutcome::ConfigurationApplyFailed { error, .. } => {
                format!("{}: state apply failed: {}", self.node, error)
            }
            BootstrapOutcome::Cancelled { phase } => {
                format!("{}: cancelled while {}", self.node, phase)
            }
        }
    }
}

/// Hands out a console for each node being bootstrapped.
pub trait ConsoleProvider: Send + Sync {
    fn console_for(&self, node: &NodeRecord) -> Box<dyn ConsoleSource>;
}

impl ConsoleProvider for ConsoleSettings {
    fn console_for(&self, node: &NodeRecord) -> Box<dyn ConsoleSource> {
        ConsoleSettings::console_for(self, node)
    }
}

/// Phase bookkeeping for a single run.
struct BootstrapRun<'a> {
    node: &'a str,
    phase: BootstrapPhase,
}

impl<'a> BootstrapRun<'a> {
    fn new(node: &'a str) -> Self {
        Self {
            node,
            phase: BootstrapPhase::Idle,
        }
    }

    fn advance(&mut self, to: BootstrapPhase) {
        tracing::info!("Node {}: {} -> {}", self.node, self.phase, to);
        self.phase = to;
    }

    fn finish(mut self, outcome: BootstrapOutcome) -> BootstrapResult {
        match &outcome {
            BootstrapOutcome::Succeeded { .. } => self.advance(BootstrapPhase::Succeeded),
            BootstrapOutcome::Cancelled { phase } => {
                tracing::warn!("Node {}: cancelled while {}", self.node, phase)
            }
            _ => {
                tracing::error!("Node {}: failed while {}", self.node, self.phase);
                self.advance(BootstrapPhase::Failed);
            }
        }

        BootstrapResult {
            node: self.node.to_owned(),
            outcome,
        }
    }

    fn cancelled(self) -> BootstrapResult {
        let phase = self.phase;
        self.finish(BootstrapOutcome::Cancelled { phase })
    }
}

pub struct BootstrapOrchestrator {
    power: PowerController,
    readiness: ReadinessDetector,
    applier: ConfigurationApplier,
    consoles: Arc<dyn ConsoleProvider>,
    max_concurrency: NonZeroUsize,
}

impl BootstrapOrchestrator {
    /// Orchestrator running the real external tools.
    pub fn new(config: BootstrapConfig) -> Self {
        let power_runner = Arc::new(SystemCommandRunner::new(config.power_timeout));
        let apply_runner = Arc::new(SystemCommandRunner::new(config.apply_timeout));
        let consoles = Arc::new(config.console.clone());

        Self::with_parts(config, power_runner, apply_runner, consoles)
    }

    pub fn with_parts(
        config: BootstrapConfig,
        power_runner: Arc<dyn CommandRunner>,
        apply_runner: Arc<dyn CommandRunner>,
        consoles: Arc<dyn ConsoleProvider>,
    ) -> Self {
        Self {
            power: PowerController::new(config.ipmi, power_runner),
            readiness: ReadinessDetector::new(config.readiness),
            applier: ConfigurationApplier::new(config.salt, apply_runner),
            consoles,
            max_concurrency: config.max_concurrency,
        }
    }

    pub fn power(&self) -> &PowerController {
        &self.power
    }

    pub fn readiness(&self) -> &ReadinessDetector {
        &self.readiness
    }

    pub fn applier(&self) -> &ConfigurationApplier {
        &self.applier
    }

    pub fn console_for(&self, node: &NodeRecord) -> Box<dyn ConsoleSource> {
        self.consoles.console_for(node)
    }

    pub async fn bootstrap(
        &self,
        node: &NodeRecord,
        state_name: &str,
        cancel: &CancellationToken,
    ) -> BootstrapResult {
        let console = self.consoles.console_for(node);
        self.bootstrap_with_console(node, state_name, console, cancel)
            .await
    }

    /// Runs the full sequence for one node.
    ///
    /// Cancellation is honoured up to the point where configuration starts. An apply that
    /// is already running is left to finish so the node is not left half configured.
    pub async fn bootstrap_with_console(
        &self,
        node: &NodeRecord,
        state_name: &str,
        mut console: Box<dyn ConsoleSource>,
        cancel: &CancellationToken,
    ) -> BootstrapResult {
        let mut run = BootstrapRun::new(&node.name);

        if cancel.is_cancelled() {
            return run.cancelled();
        }

        run.advance(BootstrapPhase::PowerCycling);

        // Anything on the console from before the power cycle must not count as ready
        if let Err(e) = console.mark().await {
            tracing::warn!(
                "Node {}: could not mark console {}, old output may be read: {}",
                node.name,
                console.name(),
                e
            );
        }

        if let Err(e) = self.power.power_cycle(node).await {
            return run.finish(e.into());
        }

        run.advance(BootstrapPhase::AwaitingReady);

        let ready_line = match self
            .readiness
            .wait_until_ready(console.as_ref(), cancel)
            .await
        {
            Ok(line) => line,
            Err(WaitError::Timeout(timeout)) => {
                return run.finish(BootstrapOutcome::TimedOutWaitingForReady {
                    attempts_made: timeout.attempts_made,
                    last_line_seen: timeout.last_line_seen,
                })
            }
            Err(WaitError::Cancelled { .. }) => return run.cancelled(),
        };

        if cancel.is_cancelled() {
            return run.cancelled();
        }

        run.advance(BootstrapPhase::Configuring);

        match self.applier.apply_configuration(&node.name, state_name).await {
            Ok(apply) => run.finish(BootstrapOutcome::Succeeded {
                ready_line: ready_line.text,
                apply,
            }),
            Err(e) => run.finish(e.into()),
        }
    }

    /// Bootstraps every node independently, at most `max_concurrency` at a time.
    /// Results come back in completion order.
    pub async fn bootstrap_all(
        &self,
        nodes: &[NodeRecord],
        state_name: &str,
        cancel: &CancellationToken,
    ) -> Vec<BootstrapResult> {
        tracing::info!(
            "Bootstrapping {} nodes with state {} ({} at a time)",
            nodes.len(),
            state_name,
            self.max_concurrency
        );

        stream::iter(nodes)
            .map(|node| self.bootstrap(node, state_name, cancel))
            .buffer_unordered(self.max_concurrency.get())
            .collect()
            .await
    }
}

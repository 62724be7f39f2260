//! Runs the hardware daemon and the labeler as sibling processes.
//!
//! Either both children run or neither does: the first child to exit, or
//! a shutdown signal, drains every remaining child. Draining sends SIGTERM,
//! waits for the grace period and then kills whatever is left.

use core::error::Error;
use std::future::Future;
use std::process::ExitStatus;
use std::time::Duration;

use derive_more::Display;
use error_stack::Report;
use error_stack::ResultExt;
use futures::future::select_all;
use tokio::process::Child;
use tokio::process::Command;
use tokio::select;
use tokio::time::Instant;
use tracing::error;
use tracing::info;
use tracing::warn;

/// Default time children get to exit after SIGTERM.
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(10);

#[derive(Debug, Display)]
pub enum SupervisorError {
    #[display("Failed to spawn child {name}")]
    Spawn { name: String },
}

impl Error for SupervisorError {}

#[derive(Debug, Display, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    Starting,
    Running,
    Draining,
    Stopped,
}

/// Command line of one supervised child.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChildSpec {
    pub name: String,
    pub program: String,
    pub args: Vec<String>,
}

impl ChildSpec {
    pub fn new(
        name: impl Into<String>,
        program: impl Into<String>,
        args: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        Self {
            name: name.into(),
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }
}

/// How a child ended.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq)]
pub enum ChildOutcome {
    /// Stopped after being asked to
    #[display("stopped gracefully")]
    Graceful,

    /// Exited on its own while the supervisor was running
    #[display("exited unexpectedly ({})", describe_code(*code))]
    ExitedUnexpectedly { code: Option<i32> },

    /// Still alive after the grace period
    #[display("was killed after the grace period")]
    ForceKilled,
}

fn describe_code(code: Option<i32>) -> String {
    match code {
        Some(code) => format!("exit code {code}"),
        None => "terminated by signal".to_string(),
    }
}

impl ChildOutcome {
    pub fn is_failure(&self) -> bool {
        !matches!(self, ChildOutcome::Graceful)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChildReport {
    pub name: String,
    pub outcome: ChildOutcome,
}

/// What moved the supervisor from running to draining.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DrainReason {
    ShutdownRequested,
    ChildExited { name: String },
}

/// Final result of a supervision run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SupervisorOutcome {
    pub reason: DrainReason,
    pub children: Vec<ChildReport>,
}

impl SupervisorOutcome {
    /// First child that exited unexpectedly or had to be killed.
    pub fn failed_child(&self) -> Option<&ChildReport> {
        self.children
            .iter()
            .find(|child| matches!(child.outcome, ChildOutcome::ExitedUnexpectedly { .. }))
            .or_else(|| self.children.iter().find(|child| child.outcome.is_failure()))
    }

    /// Process exit code for the supervisor itself.
    pub fn exit_code(&self) -> i32 {
        if self.failed_child().is_some() {
            1
        } else {
            0
        }
    }
}

struct RunningChild {
    name: String,
    child: Child,
}

pub struct Supervisor {
    children: Vec<ChildSpec>,
    grace_period: Duration,
    state: SupervisorState,
}

impl Supervisor {
    pub fn new(children: Vec<ChildSpec>, grace_period: Duration) -> Self {
        Self {
            children,
            grace_period,
            state: SupervisorState::Starting,
        }
    }

    /// Spawns every child and supervises them until `shutdown` resolves or
    /// one of them exits. No child is left running when this returns.
    ///
    /// # Errors
    ///
    /// - [`SupervisorError::Spawn`] if a child cannot be started; children
    ///   that were already started are drained first
    #[tracing::instrument(skip(self, shutdown), fields(grace_period = ?self.grace_period))]
    pub async fn run(
        mut self,
        shutdown: impl Future<Output = ()>,
    ) -> Result<SupervisorOutcome, Report<SupervisorError>> {
        let specs = std::mem::take(&mut self.children);
        let mut running = Vec::with_capacity(specs.len());
        for spec in &specs {
            match spawn(spec) {
                Ok(child) => running.push(child),
                Err(e) => {
                    error!("Failed to start {}: {e:?}", spec.name);
                    self.transition(SupervisorState::Draining);
                    drain(running, self.grace_period).await;
                    self.transition(SupervisorState::Stopped);
                    return Err(e);
                }
            }
        }
        self.transition(SupervisorState::Running);

        tokio::pin!(shutdown);
        let first_exit = if running.is_empty() {
            warn!("No children configured, waiting for shutdown");
            shutdown.await;
            None
        } else {
            let waits = running.iter_mut().map(|c| Box::pin(c.child.wait()));
            select! {
                _ = &mut shutdown => None,
                (result, index, _) = select_all(waits) => Some((index, result)),
            }
        };

        self.transition(SupervisorState::Draining);
        let mut reports = Vec::with_capacity(running.len());
        let reason = match first_exit {
            None => DrainReason::ShutdownRequested,
            Some((index, result)) => {
                let exited = running.remove(index);
                let code = match result {
                    Ok(status) => status.code(),
                    Err(e) => {
                        error!("Failed to wait for {}: {e}", exited.name);
                        None
                    }
                };
                let outcome = ChildOutcome::ExitedUnexpectedly { code };
                error!("Child {} {outcome}, draining remaining children", exited.name);
                reports.push(ChildReport {
                    name: exited.name.clone(),
                    outcome,
                });
                DrainReason::ChildExited { name: exited.name }
            }
        };

        reports.extend(drain(running, self.grace_period).await);
        self.transition(SupervisorState::Stopped);

        let outcome = SupervisorOutcome {
            reason,
            children: reports,
        };
        match outcome.failed_child() {
            Some(failed) => error!(
                "Supervisor stopped with exit code {}: child {} {}",
                outcome.exit_code(),
                failed.name,
                failed.outcome
            ),
            None => info!("Supervisor stopped, all children exited cleanly"),
        }
        Ok(outcome)
    }

    fn transition(&mut self, next: SupervisorState) {
        info!("Supervisor state: {} -> {next}", self.state);
        self.state = next;
    }
}

fn spawn(spec: &ChildSpec) -> Result<RunningChild, Report<SupervisorError>> {
    let child = Command::new(&spec.program)
        .args(&spec.args)
        .kill_on_drop(true)
        .spawn()
        .change_context(SupervisorError::Spawn {
            name: spec.name.clone(),
        })
        .attach_printable_lazy(|| format!("command: {} {}", spec.program, spec.args.join(" ")))?;
    info!(pid = ?child.id(), "Started {}", spec.name);
    Ok(RunningChild {
        name: spec.name.clone(),
        child,
    })
}

/// Stops every child: SIGTERM, then SIGKILL once the shared deadline passes.
///
/// A child found already dead was not asked to stop, so it is reported as
/// an unexpected exit.
async fn drain(mut children: Vec<RunningChild>, grace_period: Duration) -> Vec<ChildReport> {
    let mut exited_before = Vec::with_capacity(children.len());
    for running in &mut children {
        let status = running.child.try_wait().unwrap_or_else(|e| {
            warn!("Failed to poll {}: {e}", running.name);
            None
        });
        match status {
            Some(status) => error!("{} had already exited before draining: {status}", running.name),
            None => terminate(running),
        }
        exited_before.push(status);
    }

    let deadline = Instant::now() + grace_period;
    let mut reports = Vec::with_capacity(children.len());
    for (mut running, exited) in children.into_iter().zip(exited_before) {
        let outcome = if let Some(status) = exited {
            ChildOutcome::ExitedUnexpectedly {
                code: status.code(),
            }
        } else {
            match tokio::time::timeout_at(deadline, running.child.wait()).await {
                Ok(status) => {
                    log_exit(&running.name, status);
                    ChildOutcome::Graceful
                }
                Err(_) => {
                    warn!(
                        "{} did not stop within {:?}, killing it",
                        running.name, grace_period
                    );
                    if let Err(e) = running.child.kill().await {
                        error!("Failed to kill {}: {e}", running.name);
                    }
                    ChildOutcome::ForceKilled
                }
            }
        };
        reports.push(ChildReport {
            name: running.name,
            outcome,
        });
    }
    reports
}

fn terminate(running: &RunningChild) {
    // `id` is None once the child has been reaped.
    let Some(pid) = running.child.id() else {
        return;
    };
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return;
    };
    info!(pid, "Sending SIGTERM to {}", running.name);
    if unsafe { libc::kill(pid, libc::SIGTERM) } != 0 {
        warn!(
            "Failed to send SIGTERM to {}: {}",
            running.name,
            std::io::Error::last_os_error()
        );
    }
}

fn log_exit(name: &str, status: std::io::Result<ExitStatus>) {
    match status {
        Ok(status) => info!("{name} exited: {status}"),
        Err(e) => warn!("Failed to wait for {name}: {e}"),
    }
}

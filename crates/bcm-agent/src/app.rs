//! Background task management for the labeler process.

use std::future::Future;
use std::time::Duration;

use anyhow::Result;
use tokio::select;
use tokio::signal::unix::signal;
use tokio::signal::unix::Signal;
use tokio::signal::unix::SignalKind;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::labeler::Labeler;
use crate::metrics::server::MetricsServer;

/// How long tasks get to finish after cancellation. Kept below the
/// supervisor's default grace period.
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// SIGTERM and SIGINT listeners.
///
/// Install them before starting any work so an early signal is not lost.
pub struct ShutdownSignals {
    sigterm: Signal,
    sigint: Signal,
}

impl ShutdownSignals {
    pub fn install() -> std::io::Result<Self> {
        Ok(Self {
            sigterm: signal(SignalKind::terminate())?,
            sigint: signal(SignalKind::interrupt())?,
        })
    }

    /// Resolves on the first SIGTERM or SIGINT.
    pub async fn recv(mut self) {
        select! {
            _ = self.sigterm.recv() => {
                tracing::info!("Received SIGTERM, initiating graceful shutdown");
            }
            _ = self.sigint.recv() => {
                tracing::info!("Received SIGINT, initiating graceful shutdown");
            }
        }
    }
}

/// Task manager, owns the tick loop and the metrics server
pub struct Tasks {
    tasks: Vec<JoinHandle<()>>,
    names: Vec<&'static str>,
    cancellation_token: CancellationToken,
    shutdown_timeout: Duration,
}

impl Default for Tasks {
    fn default() -> Self {
        Self::new(DEFAULT_SHUTDOWN_TIMEOUT)
    }
}

impl Tasks {
    /// Tasks still running `shutdown_timeout` after cancellation are aborted.
    pub fn new(shutdown_timeout: Duration) -> Self {
        Self {
            tasks: Vec::new(),
            names: Vec::new(),
            cancellation_token: CancellationToken::new(),
            shutdown_timeout,
        }
    }

    pub fn spawn_labeler(&mut self, mut labeler: Labeler, interval: Duration) {
        let token = self.cancellation_token.clone();
        let task = tokio::spawn(async move {
            tracing::info!("Starting labeler task");
            labeler.run(interval, token).await;
            tracing::info!("Labeler task completed");
        });
        self.push("labeler", task);
    }

    pub fn spawn_metrics_server(&mut self, server: MetricsServer) {
        let token = self.cancellation_token.clone();
        let task = tokio::spawn(async move {
            if let Err(e) = server.run(token).await {
                tracing::error!("Metrics server failed: {e:?}");
            } else {
                tracing::info!("Metrics server completed");
            }
        });
        self.push("metrics server", task);
    }

    fn push(&mut self, name: &'static str, task: JoinHandle<()>) {
        self.names.push(name);
        self.tasks.push(task);
    }

    /// Waits for `shutdown` to resolve or for any task to stop on its own.
    ///
    /// A task stopping before shutdown was requested is an error; the
    /// remaining tasks are cancelled either way.
    pub async fn wait_for_completion(&mut self, shutdown: impl Future<Output = ()>) -> Result<()> {
        if self.tasks.is_empty() {
            shutdown.await;
            return Ok(());
        }

        let stopped = select! {
            _ = shutdown => {
                tracing::info!("Shutdown signal received, cancelling all tasks");
                None
            }
            (result, index, _) = futures::future::select_all(&mut self.tasks) => {
                if let Err(e) = result {
                    tracing::error!("Task {} completed with error: {e}", self.names[index]);
                }
                Some(index)
            }
        };

        self.cancellation_token.cancel();
        self.wait_for_tasks_with_timeout().await;

        match stopped {
            Some(index) => Err(anyhow::anyhow!(
                "{} task stopped unexpectedly",
                self.names[index]
            )),
            None => Ok(()),
        }
    }

    async fn wait_for_tasks_with_timeout(&mut self) {
        let timeout = self.shutdown_timeout;
        let finished = tokio::time::timeout(timeout, async {
            for task in &mut self.tasks {
                if task.is_finished() {
                    continue;
                }
                if let Err(e) = task.await {
                    tracing::error!("Task failed during shutdown: {e}");
                }
            }
        })
        .await;

        if finished.is_err() {
            tracing::warn!("Task shutdown timed out after {timeout:?}, aborting");
            for (task, name) in self.tasks.iter().zip(&self.names) {
                if !task.is_finished() {
                    tracing::warn!("Aborting {name} task");
                    task.abort();
                }
            }
        }
    }
}

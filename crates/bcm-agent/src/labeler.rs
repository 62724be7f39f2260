//! The tick loop: poll the fact source, map, reconcile, export.

use std::time::Duration;

use tokio::select;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;

use crate::domain::HardwareSnapshot;
use crate::fact_source::FactReading;
use crate::fact_source::FactSource;
use crate::k8s::NodeReconciler;
use crate::k8s::ReconcileOutcome;
use crate::labels;
use crate::metrics::MetricsSnapshot;
use crate::metrics::ReconcileCounters;
use crate::metrics::SharedMetrics;
use crate::metrics::OVERALL_COMPONENT;

#[derive(Debug, Default)]
struct LabelerState {
    last_snapshot: Option<HardwareSnapshot>,
    source_unavailable_total: u64,
    stale_ticks: u64,
    reconcile: ReconcileCounters,
    last_error: Option<&'static str>,
}

/// Drives one node's labels and metrics from the hardware fact source.
///
/// Ticks never overlap. Every tick ends by publishing a complete metrics
/// snapshot, whatever happened before it.
pub struct Labeler {
    node_name: String,
    label_prefix: String,
    source: Box<dyn FactSource>,
    reconciler: Option<NodeReconciler>,
    metrics: SharedMetrics,
    state: LabelerState,
}

impl Labeler {
    /// Creates a metrics-only labeler. Use [`Labeler::with_reconciler`] to
    /// also write node labels.
    pub fn new(
        node_name: impl Into<String>,
        label_prefix: impl Into<String>,
        source: Box<dyn FactSource>,
        metrics: SharedMetrics,
    ) -> Self {
        Self {
            node_name: node_name.into(),
            label_prefix: label_prefix.into(),
            source,
            reconciler: None,
            metrics,
            state: LabelerState::default(),
        }
    }

    pub fn with_reconciler(mut self, reconciler: NodeReconciler) -> Self {
        self.reconciler = Some(reconciler);
        self
    }

    pub fn labeling_enabled(&self) -> bool {
        self.reconciler.is_some()
    }

    /// Runs ticks every `interval` until `token` is cancelled.
    ///
    /// The first tick runs immediately. A tick that overruns delays the
    /// next one instead of bunching them up. Cancellation also abandons a
    /// tick in progress.
    #[tracing::instrument(skip(self, token), fields(node = %self.node_name))]
    pub async fn run(&mut self, interval: Duration, token: CancellationToken) {
        info!(
            "Starting labeler, source: {}, labeling enabled: {}",
            self.source.describe(),
            self.labeling_enabled()
        );

        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            select! {
                biased;
                _ = token.cancelled() => {
                    info!("Labeler shutdown requested");
                    break;
                }
                _ = ticker.tick() => {}
            }

            select! {
                biased;
                _ = token.cancelled() => {
                    info!("Labeler shutdown requested, abandoning tick in progress");
                    break;
                }
                _ = self.tick() => {}
            }
        }
    }

    /// Performs one poll, map, reconcile and export cycle.
    pub async fn tick(&mut self) {
        let reading = self.source.read().await;
        match reading {
            FactReading::Available(snapshot) => {
                debug!(
                    gpu_count = ?snapshot.gpu_count,
                    health = %snapshot.health,
                    "Read hardware snapshot"
                );
                self.state.stale_ticks = 0;
                self.state.last_snapshot = Some(snapshot);
                self.reconcile().await;
            }
            FactReading::Unavailable(e) => {
                self.state.source_unavailable_total += 1;
                self.state.stale_ticks += 1;
                warn!(
                    stale_ticks = self.state.stale_ticks,
                    "Hardware facts unavailable from {}: {e:?}",
                    self.source.describe()
                );
            }
        }

        self.metrics.publish(self.metrics_snapshot());
    }

    async fn reconcile(&mut self) {
        let Some(reconciler) = &self.reconciler else {
            return;
        };
        let Some(snapshot) = &self.state.last_snapshot else {
            return;
        };

        let desired = labels::map(snapshot, &self.label_prefix);
        match reconciler.reconcile(&self.node_name, &desired).await {
            Ok(outcome) => {
                match outcome {
                    ReconcileOutcome::Unchanged => self.state.reconcile.unchanged += 1,
                    ReconcileOutcome::Patched { .. } => self.state.reconcile.patched += 1,
                }
                self.state.last_error = None;
            }
            Err(e) => {
                let error = e.current_context();
                if error.is_transient() {
                    warn!("Node label reconcile failed, retrying on next fresh read: {e:?}");
                } else {
                    error!("Node label reconcile failed: {e:?}");
                }
                self.state.reconcile.error += 1;
                self.state.last_error = Some(error.kind());
            }
        }
    }

    fn metrics_snapshot(&self) -> MetricsSnapshot {
        let mut metrics = MetricsSnapshot::empty(&self.node_name, self.labeling_enabled());
        metrics.source_unavailable_total = self.state.source_unavailable_total;
        metrics.source_stale_ticks = self.state.stale_ticks;
        metrics.reconcile = self.state.reconcile;
        metrics.last_error = self.state.last_error;

        if let Some(snapshot) = &self.state.last_snapshot {
            metrics.node_name.clone_from(&snapshot.node_name);
            if let Some(cluster) = &snapshot.bcm_cluster {
                metrics.bcm_cluster.clone_from(cluster);
            }
            for (component, status) in &snapshot.components {
                if component == OVERALL_COMPONENT {
                    debug!("Ignoring daemon component named {OVERALL_COMPONENT}");
                    continue;
                }
                metrics.component_health.insert(component.clone(), *status);
            }
            metrics
                .component_health
                .insert(OVERALL_COMPONENT.to_string(), snapshot.health);
            metrics.gpu_count = snapshot.gpu_count.map_or(0, u64::from);
            metrics.cpu_count = snapshot.cpu_count.map_or(0, u64::from);
            metrics.memory_gb = snapshot.memory_gb.unwrap_or(0);
            metrics.last_sync_timestamp = Some(snapshot.last_updated.timestamp());
        }

        metrics
    }
}

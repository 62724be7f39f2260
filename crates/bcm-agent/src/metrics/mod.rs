//! Prometheus metrics for the labeler.
//!
//! Every tick produces one immutable [`MetricsSnapshot`] that replaces the
//! previous one inside [`SharedMetrics`]. Scrapes render whatever snapshot
//! is current, so they never see values from two different ticks.

pub mod server;

use core::error::Error;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::PoisonError;
use std::sync::RwLock;

use derive_more::Display;
use error_stack::Report;
use error_stack::ResultExt;
use prometheus::Encoder;
use prometheus::GaugeVec;
use prometheus::IntCounterVec;
use prometheus::IntGaugeVec;
use prometheus::Opts;
use prometheus::Registry;
use prometheus::TextEncoder;

use crate::domain::HealthStatus;

/// Component name used for the node-wide health series.
pub const OVERALL_COMPONENT: &str = "overall";

/// Errors raised by the metrics exporter.
#[derive(Debug, Display)]
pub enum MetricsError {
    #[display("Failed to encode metrics")]
    Encoding,

    #[display("Metrics server error: {message}")]
    Server { message: String },
}

impl Error for MetricsError {}

/// Reconcile attempts per result since startup.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileCounters {
    pub unchanged: u64,
    pub patched: u64,
    pub error: u64,
}

/// Values of every exported series at the end of one tick.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricsSnapshot {
    /// Node the agent runs on, attached to every series
    pub node: String,
    pub node_name: String,
    pub bcm_cluster: String,
    pub component_health: BTreeMap<String, HealthStatus>,
    pub gpu_count: u64,
    pub cpu_count: u64,
    pub memory_gb: u64,
    /// Unix seconds of the last available snapshot
    pub last_sync_timestamp: Option<i64>,
    pub source_unavailable_total: u64,
    pub source_stale_ticks: u64,
    pub reconcile: ReconcileCounters,
    /// Kind of the error that failed the most recent reconcile attempt
    pub last_error: Option<&'static str>,
    pub labeling_enabled: bool,
}

impl MetricsSnapshot {
    /// Snapshot published before the first tick completes.
    pub fn empty(node: impl Into<String>, labeling_enabled: bool) -> Self {
        let node = node.into();
        Self {
            node_name: node.clone(),
            node,
            bcm_cluster: "unknown".to_string(),
            component_health: BTreeMap::from([(
                OVERALL_COMPONENT.to_string(),
                HealthStatus::Unknown,
            )]),
            gpu_count: 0,
            cpu_count: 0,
            memory_gb: 0,
            last_sync_timestamp: None,
            source_unavailable_total: 0,
            source_stale_ticks: 0,
            reconcile: ReconcileCounters::default(),
            last_error: None,
            labeling_enabled,
        }
    }

    /// Encodes the snapshot in the Prometheus text exposition format.
    pub fn render(&self) -> Result<String, Report<MetricsError>> {
        let registry = self.build_registry()?;
        let mut buffer = Vec::new();
        TextEncoder::new()
            .encode(&registry.gather(), &mut buffer)
            .change_context(MetricsError::Encoding)?;
        String::from_utf8(buffer).change_context(MetricsError::Encoding)
    }

    fn build_registry(&self) -> Result<Registry, Report<MetricsError>> {
        let registry = Registry::new();
        let node = self.node.as_str();

        let node_info = IntGaugeVec::new(
            Opts::new("bcm_node_info", "BCM node information"),
            &["node", "node_name", "bcm_cluster"],
        )
        .change_context(MetricsError::Encoding)?;
        node_info
            .with_label_values(&[node, self.node_name.as_str(), self.bcm_cluster.as_str()])
            .set(1);
        register(&registry, node_info)?;

        let health = GaugeVec::new(
            Opts::new(
                "bcm_hardware_health",
                "Hardware health status (1 healthy, 0.5 degraded, 0 unknown)",
            ),
            &["node", "component"],
        )
        .change_context(MetricsError::Encoding)?;
        for (component, status) in &self.component_health {
            health
                .with_label_values(&[node, component.as_str()])
                .set(status.gauge_value());
        }
        register(&registry, health)?;

        let node_gauges = [
            ("bcm_gpu_count", "Number of GPUs detected", self.gpu_count),
            ("bcm_cpu_count", "Number of CPUs", self.cpu_count),
            ("bcm_memory_gb", "Total memory in GB", self.memory_gb),
            (
                "bcm_source_stale_ticks",
                "Consecutive ticks without fresh hardware data",
                self.source_stale_ticks,
            ),
            (
                "bcm_labeling_enabled",
                "Whether node labeling is enabled",
                u64::from(self.labeling_enabled),
            ),
        ];
        for (name, help, value) in node_gauges {
            let gauge = IntGaugeVec::new(Opts::new(name, help), &["node"])
                .change_context(MetricsError::Encoding)?;
            gauge
                .with_label_values(&[node])
                .set(i64::try_from(value).unwrap_or(i64::MAX));
            register(&registry, gauge)?;
        }

        if let Some(timestamp) = self.last_sync_timestamp {
            let last_sync = IntGaugeVec::new(
                Opts::new("bcm_last_sync_timestamp", "Last BCM sync timestamp"),
                &["node"],
            )
            .change_context(MetricsError::Encoding)?;
            last_sync.with_label_values(&[node]).set(timestamp);
            register(&registry, last_sync)?;
        }

        let unavailable = IntCounterVec::new(
            Opts::new(
                "bcm_source_unavailable_total",
                "Ticks on which the hardware fact source was unavailable",
            ),
            &["node"],
        )
        .change_context(MetricsError::Encoding)?;
        unavailable
            .with_label_values(&[node])
            .inc_by(self.source_unavailable_total);
        register(&registry, unavailable)?;

        let reconciles = IntCounterVec::new(
            Opts::new("bcm_reconcile_total", "Node label reconcile attempts by result"),
            &["node", "result"],
        )
        .change_context(MetricsError::Encoding)?;
        for (result, count) in [
            ("unchanged", self.reconcile.unchanged),
            ("patched", self.reconcile.patched),
            ("error", self.reconcile.error),
        ] {
            reconciles.with_label_values(&[node, result]).inc_by(count);
        }
        register(&registry, reconciles)?;

        let last_error = IntGaugeVec::new(
            Opts::new(
                "bcm_reconcile_last_error",
                "Set while the most recent reconcile attempt failed, by error kind",
            ),
            &["node", "kind"],
        )
        .change_context(MetricsError::Encoding)?;
        if let Some(kind) = self.last_error {
            last_error.with_label_values(&[node, kind]).set(1);
        }
        register(&registry, last_error)?;

        Ok(registry)
    }
}

fn register<C>(registry: &Registry, collector: C) -> Result<(), Report<MetricsError>>
where
    C: prometheus::core::Collector + 'static,
{
    registry
        .register(Box::new(collector))
        .change_context(MetricsError::Encoding)
}

/// Latest metrics snapshot shared between the tick loop and HTTP scrapes.
#[derive(Clone)]
pub struct SharedMetrics {
    current: Arc<RwLock<Arc<MetricsSnapshot>>>,
}

impl SharedMetrics {
    pub fn new(initial: MetricsSnapshot) -> Self {
        Self {
            current: Arc::new(RwLock::new(Arc::new(initial))),
        }
    }

    /// Replaces the current snapshot as a whole.
    pub fn publish(&self, snapshot: MetricsSnapshot) {
        let snapshot = Arc::new(snapshot);
        *self.current.write().unwrap_or_else(PoisonError::into_inner) = snapshot;
    }

    /// Returns the current snapshot; later publishes do not affect it.
    pub fn load(&self) -> Arc<MetricsSnapshot> {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn populated() -> MetricsSnapshot {
        let mut snapshot = MetricsSnapshot::empty("gpu-node-01", true);
        snapshot.bcm_cluster = "bcm-head".to_string();
        snapshot.gpu_count = 8;
        snapshot.cpu_count = 128;
        snapshot.memory_gb = 512;
        snapshot.last_sync_timestamp = Some(1_740_830_400);
        snapshot.source_unavailable_total = 3;
        snapshot
            .component_health
            .insert(OVERALL_COMPONENT.to_string(), HealthStatus::Healthy);
        snapshot
            .component_health
            .insert("psu".to_string(), HealthStatus::Degraded);
        snapshot.reconcile.patched = 2;
        snapshot.last_error = Some("forbidden");
        snapshot
    }

    #[test]
    fn renders_all_series() {
        let text = populated().render().unwrap();

        for expected in [
            r#"bcm_node_info{bcm_cluster="bcm-head",node="gpu-node-01",node_name="gpu-node-01"} 1"#,
            r#"bcm_hardware_health{component="overall",node="gpu-node-01"} 1"#,
            r#"bcm_hardware_health{component="psu",node="gpu-node-01"} 0.5"#,
            r#"bcm_gpu_count{node="gpu-node-01"} 8"#,
            r#"bcm_cpu_count{node="gpu-node-01"} 128"#,
            r#"bcm_memory_gb{node="gpu-node-01"} 512"#,
            r#"bcm_last_sync_timestamp{node="gpu-node-01"} 1740830400"#,
            r#"bcm_source_unavailable_total{node="gpu-node-01"} 3"#,
            r#"bcm_reconcile_total{node="gpu-node-01",result="patched"} 2"#,
            r#"bcm_reconcile_last_error{kind="forbidden",node="gpu-node-01"} 1"#,
            r#"bcm_labeling_enabled{node="gpu-node-01"} 1"#,
        ] {
            assert!(text.contains(expected), "missing `{expected}` in:\n{text}");
        }
    }

    #[test]
    fn empty_snapshot_has_no_sync_timestamp() {
        let text = MetricsSnapshot::empty("gpu-node-01", false).render().unwrap();

        assert!(!text.contains("bcm_last_sync_timestamp{"));
        assert!(!text.contains("bcm_reconcile_last_error{"));
        assert!(text.contains(r#"bcm_labeling_enabled{node="gpu-node-01"} 0"#));
    }

    #[test]
    fn publish_replaces_snapshot_atomically() {
        let shared = SharedMetrics::new(MetricsSnapshot::empty("gpu-node-01", true));
        let before = shared.load();

        shared.publish(populated());
        let after = shared.load();

        assert_eq!(before.gpu_count, 0, "held snapshot must not change");
        assert_eq!(after.gpu_count, 8);
        assert_eq!(after.memory_gb, 512);
    }

    #[test]
    fn concurrent_readers_see_whole_snapshots() {
        let shared = SharedMetrics::new(MetricsSnapshot::empty("n", true));

        std::thread::scope(|scope| {
            let writer = shared.clone();
            scope.spawn(move || {
                for i in 0..500u64 {
                    let mut snapshot = MetricsSnapshot::empty("n", true);
                    snapshot.gpu_count = i;
                    snapshot.cpu_count = i;
                    snapshot.memory_gb = i;
                    writer.publish(snapshot);
                }
            });
            for _ in 0..4 {
                let reader = shared.clone();
                scope.spawn(move || {
                    for _ in 0..500 {
                        let snapshot = reader.load();
                        assert_eq!(snapshot.gpu_count, snapshot.cpu_count);
                        assert_eq!(snapshot.cpu_count, snapshot.memory_gb);
                    }
                });
            }
        });
    }
}

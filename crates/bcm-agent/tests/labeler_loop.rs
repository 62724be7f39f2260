//! Drives the labeler end to end: fact file on disk, in-memory cluster and
//! the metrics endpoint.

use std::sync::Arc;

use bcm_agent::fact_source::FileFactSource;
use bcm_agent::k8s::InMemoryNodeApi;
use bcm_agent::k8s::NodeReconciler;
use bcm_agent::labeler::Labeler;
use bcm_agent::metrics::server::routes;
use bcm_agent::metrics::MetricsSnapshot;
use bcm_agent::metrics::SharedMetrics;
use poem::test::TestClient;
use similar_asserts::assert_eq;
use tempfile::TempDir;

const NODE: &str = "gpu-node-01";
const PREFIX: &str = "bcm.nvidia.com";

struct Harness {
    dir: TempDir,
    api: Arc<InMemoryNodeApi>,
    metrics: SharedMetrics,
    labeler: Labeler,
}

impl Harness {
    fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let api = Arc::new(
            InMemoryNodeApi::new().with_node(
                NODE,
                [
                    ("kubernetes.io/hostname", NODE),
                    ("bcm.nvidia.com/legacy", "true"),
                ],
            ),
        );
        let metrics = SharedMetrics::new(MetricsSnapshot::empty(NODE, true));
        let labeler = Labeler::new(
            NODE,
            PREFIX,
            Box::new(FileFactSource::new(dir.path().join("config.json"), NODE)),
            metrics.clone(),
        )
        .with_reconciler(NodeReconciler::new(api.clone(), PREFIX));

        Self {
            dir,
            api,
            metrics,
            labeler,
        }
    }

    fn write_facts(&self, json: &str) {
        std::fs::write(self.dir.path().join("config.json"), json).unwrap();
    }

    fn remove_facts(&self) {
        std::fs::remove_file(self.dir.path().join("config.json")).unwrap();
    }

    fn label(&self, name: &str) -> Option<String> {
        self.api.labels(NODE).get(&format!("{PREFIX}/{name}")).cloned()
    }

    async fn scrape(&self) -> String {
        let client = TestClient::new(routes(self.metrics.clone()));
        let resp = client.get("/metrics").send().await;
        resp.assert_status_is_ok();
        resp.0.into_body().into_string().await.unwrap()
    }
}

#[test_log::test(tokio::test)]
async fn labels_follow_the_fact_document() {
    let mut harness = Harness::new();
    harness.write_facts(
        r#"{
            "gpuCount": 8,
            "cpuModel": "AMD EPYC 7763 64-Core Processor",
            "memoryGB": 512,
            "health": "healthy",
            "host": "bcm-head",
            "components": {"gpu": "ok", "psu": "warning"},
            "timestamp": 1740830400,
            "firmware": "ignored"
        }"#,
    );

    harness.labeler.tick().await;

    assert_eq!(harness.label("gpu-count").as_deref(), Some("8"));
    assert_eq!(
        harness.label("cpu-model").as_deref(),
        Some("AMD-EPYC-7763-64-Core-Processor")
    );
    assert_eq!(harness.label("memory-gb").as_deref(), Some("512"));
    assert_eq!(harness.label("health-status").as_deref(), Some("healthy"));
    assert_eq!(harness.label("bcm-cluster").as_deref(), Some("bcm-head"));
    assert_eq!(harness.label("legacy"), None, "stale owned label removed");
    assert_eq!(
        harness.api.labels(NODE).get("kubernetes.io/hostname").cloned(),
        Some(NODE.to_string())
    );

    let body = harness.scrape().await;
    assert!(body.contains(r#"bcm_gpu_count{node="gpu-node-01"} 8"#));
    assert!(body.contains(r#"bcm_hardware_health{component="psu",node="gpu-node-01"} 0.5"#));
    assert!(body.contains(r#"bcm_last_sync_timestamp{node="gpu-node-01"} 1740830400"#));

    // The daemon stops reporting the CPU model and the node degrades.
    harness.write_facts(r#"{"gpu_count": 7, "memory_gb": 512, "health_status": "Critical"}"#);
    harness.labeler.tick().await;

    assert_eq!(harness.label("gpu-count").as_deref(), Some("7"));
    assert_eq!(harness.label("cpu-model"), None);
    assert_eq!(harness.label("health-status").as_deref(), Some("degraded"));
}

#[test_log::test(tokio::test)]
async fn missing_source_keeps_last_state() {
    let mut harness = Harness::new();
    harness.write_facts(r#"{"gpuCount": 4, "health": "ok", "timestamp": 1740830400}"#);
    harness.labeler.tick().await;
    let patches = harness.api.patches().len();

    harness.remove_facts();
    for _ in 0..3 {
        harness.labeler.tick().await;
    }

    assert_eq!(harness.api.patches().len(), patches);
    assert_eq!(harness.label("gpu-count").as_deref(), Some("4"));

    let body = harness.scrape().await;
    assert!(body.contains(r#"bcm_source_unavailable_total{node="gpu-node-01"} 3"#));
    assert!(body.contains(r#"bcm_source_stale_ticks{node="gpu-node-01"} 3"#));
    assert!(body.contains(r#"bcm_last_sync_timestamp{node="gpu-node-01"} 1740830400"#));
}

#[test_log::test(tokio::test)]
async fn malformed_document_counts_as_unavailable() {
    let mut harness = Harness::new();
    harness.write_facts("[1, 2, 3]");

    harness.labeler.tick().await;

    assert!(harness.api.patches().is_empty());
    let snapshot = harness.metrics.load();
    assert_eq!(snapshot.source_unavailable_total, 1);
    assert_eq!(snapshot.last_sync_timestamp, None);
}

use std::collections::BTreeMap;
use std::sync::Arc;

use error_stack::Report;
use tracing::debug;
use tracing::info;

use crate::k8s::KubernetesError;
use crate::k8s::NodeLabelApi;
use crate::k8s::NodeLabels;
use crate::k8s::NodePatchRequest;
use crate::labels;
use crate::labels::LabelSet;

/// Result of one successful reconcile call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// Node already carried the desired labels; nothing was written
    Unchanged,
    Patched { set: usize, removed: usize },
}

/// Keeps the labels under one prefix of a node equal to a desired set.
///
/// Labels outside the prefix belong to other controllers and are never
/// part of a patch. Each call makes at most one read and one write; errors
/// are returned to the caller, who retries on its next tick.
pub struct NodeReconciler {
    api: Arc<dyn NodeLabelApi>,
    owned_prefix: String,
}

impl NodeReconciler {
    pub fn new(api: Arc<dyn NodeLabelApi>, label_prefix: &str) -> Self {
        Self {
            api,
            owned_prefix: format!("{}/", labels::normalize_prefix(label_prefix)),
        }
    }

    /// Brings the prefixed labels of `node_name` in line with `desired`.
    ///
    /// The current labels are always fetched first, so a conflict seen by a
    /// previous call is resolved against fresh state.
    ///
    /// # Errors
    ///
    /// - [`KubernetesError::Conflict`] if the node changed between read and patch
    /// - [`KubernetesError::Forbidden`] if RBAC does not allow get or patch on nodes
    /// - [`KubernetesError::NodeNotFound`] if the node does not exist
    /// - [`KubernetesError::Unreachable`] for transport failures
    #[tracing::instrument(skip(self, desired), fields(desired = desired.len()))]
    pub async fn reconcile(
        &self,
        node_name: &str,
        desired: &LabelSet,
    ) -> Result<ReconcileOutcome, Report<KubernetesError>> {
        let current = self.api.get_labels(node_name).await?;

        let Some(request) = self.plan(node_name, &current, desired) else {
            debug!("Node labels already up to date");
            return Ok(ReconcileOutcome::Unchanged);
        };

        let (set, removed) = (request.set_count(), request.removed_count());
        self.api.patch_labels(&request).await?;
        info!(set, removed, "Applied label changes to node {node_name}");

        Ok(ReconcileOutcome::Patched { set, removed })
    }

    /// Computes the patch needed to move `current` to `desired`.
    ///
    /// Returns `None` when the owned labels already match.
    pub fn plan(
        &self,
        node_name: &str,
        current: &NodeLabels,
        desired: &LabelSet,
    ) -> Option<NodePatchRequest> {
        let mut changes: BTreeMap<String, Option<String>> = BTreeMap::new();

        for (key, value) in desired.iter().filter(|(key, _)| self.owns(key)) {
            if current.labels.get(key).map(String::as_str) != Some(value) {
                changes.insert(key.to_string(), Some(value.to_string()));
            }
        }

        for key in current.labels.keys().filter(|key| self.owns(key)) {
            if desired.get(key).is_none() {
                changes.insert(key.clone(), None);
            }
        }

        if changes.is_empty() {
            return None;
        }

        Some(NodePatchRequest {
            node_name: node_name.to_string(),
            resource_version: current.resource_version.clone(),
            changes,
        })
    }

    fn owns(&self, key: &str) -> bool {
        key.starts_with(&self.owned_prefix)
    }
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;
    use test_log::test;

    use super::*;
    use crate::k8s::InMemoryNodeApi;

    const NODE: &str = "gpu-node-01";
    const NO_LABELS: [(&str, &str); 0] = [];

    fn desired() -> LabelSet {
        [
            ("bcm.nvidia.com/gpu-count", "8"),
            ("bcm.nvidia.com/health-status", "healthy"),
        ]
        .into_iter()
        .collect()
    }

    fn setup<'a>(
        labels: impl IntoIterator<Item = (&'a str, &'a str)>,
    ) -> (Arc<InMemoryNodeApi>, NodeReconciler) {
        let api = Arc::new(InMemoryNodeApi::new().with_node(NODE, labels));
        let reconciler = NodeReconciler::new(api.clone(), "bcm.nvidia.com");
        (api, reconciler)
    }

    #[test(tokio::test)]
    async fn applies_missing_labels() {
        let (api, reconciler) = setup([("kubernetes.io/hostname", NODE)]);

        let outcome = reconciler.reconcile(NODE, &desired()).await.unwrap();

        assert_eq!(outcome, ReconcileOutcome::Patched { set: 2, removed: 0 });
        let labels = api.labels(NODE);
        assert_eq!(labels.get("bcm.nvidia.com/gpu-count").map(String::as_str), Some("8"));
        assert_eq!(
            labels.get("kubernetes.io/hostname").map(String::as_str),
            Some(NODE)
        );
    }

    #[test(tokio::test)]
    async fn no_write_when_already_in_sync() {
        let (api, reconciler) = setup([
            ("bcm.nvidia.com/gpu-count", "8"),
            ("bcm.nvidia.com/health-status", "healthy"),
            ("team", "ml"),
        ]);

        let outcome = reconciler.reconcile(NODE, &desired()).await.unwrap();

        assert_eq!(outcome, ReconcileOutcome::Unchanged);
        assert!(api.patches().is_empty(), "no patch should be issued");
    }

    #[test(tokio::test)]
    async fn removes_stale_owned_labels_only() {
        let (api, reconciler) = setup([
            ("bcm.nvidia.com/gpu-count", "8"),
            ("bcm.nvidia.com/health-status", "healthy"),
            ("bcm.nvidia.com/cpu-model", "old-cpu"),
            ("other.io/cpu-model", "keep-me"),
        ]);

        let outcome = reconciler.reconcile(NODE, &desired()).await.unwrap();

        assert_eq!(outcome, ReconcileOutcome::Patched { set: 0, removed: 1 });
        let patches = api.patches();
        let patch = &patches[0];
        assert_eq!(
            patch.changes.get("bcm.nvidia.com/cpu-model"),
            Some(&None)
        );
        assert_eq!(
            api.labels(NODE).get("other.io/cpu-model").map(String::as_str),
            Some("keep-me")
        );
    }

    #[test]
    fn plan_never_touches_foreign_keys() {
        let (_api, reconciler) = setup(NO_LABELS);
        let current = NodeLabels {
            labels: [
                ("bcm.nvidia.com.evil/gpu-count", "1"),
                ("nvidia.com/gpu.count", "4"),
                ("bcm.nvidia.com/gpu-count", "4"),
            ]
            .into_iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect(),
            resource_version: Some("7".to_string()),
        };
        let mut wanted = desired();
        wanted.insert("foreign.io/label", "x");

        let request = reconciler.plan(NODE, &current, &wanted).unwrap();

        assert!(request
            .changes
            .keys()
            .all(|key| key.starts_with("bcm.nvidia.com/")));
        assert_eq!(request.resource_version.as_deref(), Some("7"));
        assert_eq!(request.changes.len(), 2);
    }

    #[test(tokio::test)]
    async fn conflict_is_reported_without_retry() {
        let (api, reconciler) = setup(NO_LABELS);
        api.fail_next_patch(KubernetesError::Conflict {
            node_name: NODE.to_string(),
        });

        let error = reconciler.reconcile(NODE, &desired()).await.unwrap_err();

        assert!(error.current_context().is_transient());
        assert_eq!(api.patches().len(), 1, "exactly one patch attempt");
        assert_eq!(api.get_calls(), 1);
    }

    #[test(tokio::test)]
    async fn concurrent_edit_produces_conflict() {
        let (api, reconciler) = setup(NO_LABELS);
        let current = api.get_labels(NODE).await.unwrap();
        let request = reconciler.plan(NODE, &current, &desired()).unwrap();

        api.set_label(NODE, "team", "ml");
        let error = api.patch_labels(&request).await.unwrap_err();

        assert!(matches!(
            error.current_context(),
            KubernetesError::Conflict { .. }
        ));
    }

    #[test(tokio::test)]
    async fn forbidden_is_permanent() {
        let (api, reconciler) = setup(NO_LABELS);
        api.fail_next_get(KubernetesError::Forbidden {
            node_name: NODE.to_string(),
        });

        let error = reconciler.reconcile(NODE, &desired()).await.unwrap_err();

        assert!(!error.current_context().is_transient());
        assert!(api.patches().is_empty());
    }

    #[test(tokio::test)]
    async fn missing_node_is_reported() {
        let api = Arc::new(InMemoryNodeApi::new());
        let reconciler = NodeReconciler::new(api, "bcm.nvidia.com");

        let error = reconciler.reconcile(NODE, &desired()).await.unwrap_err();

        assert_eq!(error.current_context().kind(), "not_found");
    }
}

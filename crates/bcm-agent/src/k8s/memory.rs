//! In-memory [`NodeLabelApi`] used by tests and local dry runs.

use std::collections::BTreeMap;
use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::PoisonError;

use async_trait::async_trait;
use error_stack::Report;

use crate::k8s::KubernetesError;
use crate::k8s::NodeLabelApi;
use crate::k8s::NodeLabels;
use crate::k8s::NodePatchRequest;

#[derive(Default)]
struct State {
    nodes: BTreeMap<String, StoredNode>,
    get_failures: VecDeque<KubernetesError>,
    patch_failures: VecDeque<KubernetesError>,
    get_calls: usize,
    patches: Vec<NodePatchRequest>,
}

struct StoredNode {
    labels: BTreeMap<String, String>,
    resource_version: u64,
}

/// Node store that behaves like the API server for label operations.
///
/// Patches carrying a stale resource version are rejected with
/// [`KubernetesError::Conflict`]. Every patch attempt is recorded, whether
/// it succeeded or not.
#[derive(Default)]
pub struct InMemoryNodeApi {
    state: Mutex<State>,
}

impl InMemoryNodeApi {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a node with the given labels.
    pub fn with_node<'a>(
        self,
        node_name: &str,
        labels: impl IntoIterator<Item = (&'a str, &'a str)>,
    ) -> Self {
        self.lock().nodes.insert(
            node_name.to_string(),
            StoredNode {
                labels: labels
                    .into_iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect(),
                resource_version: 1,
            },
        );
        self
    }

    /// Simulates another controller writing a label.
    pub fn set_label(&self, node_name: &str, key: &str, value: &str) {
        if let Some(node) = self.lock().nodes.get_mut(node_name) {
            node.labels.insert(key.to_string(), value.to_string());
            node.resource_version += 1;
        }
    }

    pub fn fail_next_get(&self, error: KubernetesError) {
        self.lock().get_failures.push_back(error);
    }

    pub fn fail_next_patch(&self, error: KubernetesError) {
        self.lock().patch_failures.push_back(error);
    }

    pub fn labels(&self, node_name: &str) -> BTreeMap<String, String> {
        self.lock()
            .nodes
            .get(node_name)
            .map(|n| n.labels.clone())
            .unwrap_or_default()
    }

    /// Every patch attempt, in order.
    pub fn patches(&self) -> Vec<NodePatchRequest> {
        self.lock().patches.clone()
    }

    pub fn get_calls(&self) -> usize {
        self.lock().get_calls
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl NodeLabelApi for InMemoryNodeApi {
    async fn get_labels(&self, node_name: &str) -> Result<NodeLabels, Report<KubernetesError>> {
        let mut state = self.lock();
        state.get_calls += 1;
        if let Some(error) = state.get_failures.pop_front() {
            return Err(Report::new(error));
        }

        let node = state.nodes.get(node_name).ok_or_else(|| {
            Report::new(KubernetesError::NodeNotFound {
                node_name: node_name.to_string(),
            })
        })?;
        Ok(NodeLabels {
            labels: node.labels.clone(),
            resource_version: Some(node.resource_version.to_string()),
        })
    }

    async fn patch_labels(
        &self,
        request: &NodePatchRequest,
    ) -> Result<(), Report<KubernetesError>> {
        let mut state = self.lock();
        state.patches.push(request.clone());
        if let Some(error) = state.patch_failures.pop_front() {
            return Err(Report::new(error));
        }

        let node = state.nodes.get_mut(&request.node_name).ok_or_else(|| {
            Report::new(KubernetesError::NodeNotFound {
                node_name: request.node_name.clone(),
            })
        })?;
        if let Some(expected) = &request.resource_version {
            if *expected != node.resource_version.to_string() {
                return Err(Report::new(KubernetesError::Conflict {
                    node_name: request.node_name.clone(),
                }));
            }
        }

        for (key, value) in &request.changes {
            match value {
                Some(value) => {
                    node.labels.insert(key.clone(), value.clone());
                }
                None => {
                    node.labels.remove(key);
                }
            }
        }
        node.resource_version += 1;
        Ok(())
    }
}

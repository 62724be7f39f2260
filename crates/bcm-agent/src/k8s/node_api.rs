use std::collections::BTreeMap;
use std::path::Path;

use async_trait::async_trait;
use error_stack::Report;
use error_stack::ResultExt;
use k8s_openapi::api::core::v1::Node;
use kube::api::Patch;
use kube::api::PatchParams;
use kube::config::KubeConfigOptions;
use kube::config::Kubeconfig;
use kube::Api;
use kube::Client;
use kube::Config;
use serde_json::json;
use tracing::debug;
use tracing::info;

use crate::k8s::KubernetesError;

const FIELD_MANAGER: &str = "bcm-agent";

/// Labels of a node as observed by one `get`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NodeLabels {
    pub labels: BTreeMap<String, String>,
    pub resource_version: Option<String>,
}

/// Label delta for a single node.
///
/// A `None` value removes the key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodePatchRequest {
    pub node_name: String,
    /// Version the delta was computed against; a newer node makes the patch
    /// fail with a conflict instead of overwriting someone else's change.
    pub resource_version: Option<String>,
    pub changes: BTreeMap<String, Option<String>>,
}

impl NodePatchRequest {
    /// Renders the JSON merge patch body.
    pub fn to_merge_patch(&self) -> serde_json::Value {
        let mut metadata = json!({ "labels": self.changes });
        if let Some(resource_version) = &self.resource_version {
            metadata["resourceVersion"] = json!(resource_version);
        }
        json!({ "metadata": metadata })
    }

    pub fn set_count(&self) -> usize {
        self.changes.values().filter(|v| v.is_some()).count()
    }

    pub fn removed_count(&self) -> usize {
        self.changes.values().filter(|v| v.is_none()).count()
    }
}

/// Node operations needed to keep the agent's labels in sync.
#[async_trait]
pub trait NodeLabelApi: Send + Sync {
    async fn get_labels(&self, node_name: &str) -> Result<NodeLabels, Report<KubernetesError>>;

    async fn patch_labels(&self, request: &NodePatchRequest)
        -> Result<(), Report<KubernetesError>>;
}

/// [`NodeLabelApi`] talking to the Kubernetes API server.
pub struct KubeNodeApi {
    api: Api<Node>,
}

impl KubeNodeApi {
    pub fn new(client: Client) -> Self {
        Self {
            api: Api::all(client),
        }
    }

    /// Connects through `kubeconfig`, or through the in-cluster service
    /// account with `~/.kube/config` as fallback when none is given.
    pub async fn connect(kubeconfig: Option<&Path>) -> Result<Self, Report<KubernetesError>> {
        let config = match kubeconfig {
            Some(path) => {
                let kubeconfig = Kubeconfig::read_from(path).change_context_lazy(|| {
                    connection_failed(format!("cannot read kubeconfig {}", path.display()))
                })?;
                Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
                    .await
                    .change_context_lazy(|| {
                        connection_failed(format!("invalid kubeconfig {}", path.display()))
                    })?
            }
            None => Config::infer().await.change_context_lazy(|| {
                connection_failed("no in-cluster config or ~/.kube/config found".to_string())
            })?,
        };

        info!("Using Kubernetes API server {}", config.cluster_url);
        let client = Client::try_from(config).change_context_lazy(|| {
            connection_failed("cannot build Kubernetes client".to_string())
        })?;
        Ok(Self::new(client))
    }
}

fn connection_failed(message: String) -> KubernetesError {
    KubernetesError::ConnectionFailed { message }
}

#[async_trait]
impl NodeLabelApi for KubeNodeApi {
    async fn get_labels(&self, node_name: &str) -> Result<NodeLabels, Report<KubernetesError>> {
        let node = self.api.get(node_name).await.map_err(|e| {
            let context = KubernetesError::from_kube(&e, node_name);
            Report::new(e).change_context(context)
        })?;

        Ok(NodeLabels {
            labels: node.metadata.labels.unwrap_or_default(),
            resource_version: node.metadata.resource_version,
        })
    }

    async fn patch_labels(
        &self,
        request: &NodePatchRequest,
    ) -> Result<(), Report<KubernetesError>> {
        let body = request.to_merge_patch();
        debug!(node = %request.node_name, patch = %body, "Patching node labels");

        let params = PatchParams {
            field_manager: Some(FIELD_MANAGER.to_string()),
            ..PatchParams::default()
        };
        self.api
            .patch(&request.node_name, &params, &Patch::Merge(&body))
            .await
            .map_err(|e| {
                let context = KubernetesError::from_kube(&e, &request.node_name);
                Report::new(e).change_context(context)
            })?;

        Ok(())
    }
}

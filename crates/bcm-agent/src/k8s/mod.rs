//! Kubernetes integration module.
//!
//! This module owns every interaction the labeler has with the cluster:
//! reading the local node's labels and patching the ones under the agent's
//! prefix.
//!
//! The main components are:
//! - [`NodeLabelApi`]: the two node operations the labeler needs
//! - [`KubeNodeApi`]: [`NodeLabelApi`] backed by the Kubernetes API server
//! - [`NodeReconciler`]: computes and applies the label delta for one node

pub mod memory;
pub mod node_api;
pub mod reconciler;
pub mod types;

pub use memory::InMemoryNodeApi;
pub use node_api::KubeNodeApi;
pub use node_api::NodeLabelApi;
pub use node_api::NodeLabels;
pub use node_api::NodePatchRequest;
pub use reconciler::NodeReconciler;
pub use reconciler::ReconcileOutcome;
pub use types::KubernetesError;

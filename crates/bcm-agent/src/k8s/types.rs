use thiserror::Error;

/// Errors that can occur during Kubernetes operations.
#[derive(Debug, Error)]
pub enum KubernetesError {
    #[error("Failed to connect to Kubernetes API: {message}")]
    ConnectionFailed { message: String },
    #[error("Node {node_name} was modified concurrently")]
    Conflict { node_name: String },
    #[error("Access to node {node_name} is forbidden")]
    Forbidden { node_name: String },
    #[error("Node not found: {node_name}")]
    NodeNotFound { node_name: String },
    #[error("Update of node {node_name} rejected as invalid: {message}")]
    Invalid { node_name: String, message: String },
    #[error("Kubernetes API unreachable: {message}")]
    Unreachable { message: String },
}

impl KubernetesError {
    /// Whether the next tick is expected to succeed without operator action.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            KubernetesError::Conflict { .. } | KubernetesError::Unreachable { .. }
        )
    }

    /// Short identifier used as a metric label.
    pub fn kind(&self) -> &'static str {
        match self {
            KubernetesError::ConnectionFailed { .. } => "connection",
            KubernetesError::Conflict { .. } => "conflict",
            KubernetesError::Forbidden { .. } => "forbidden",
            KubernetesError::NodeNotFound { .. } => "not_found",
            KubernetesError::Invalid { .. } => "invalid",
            KubernetesError::Unreachable { .. } => "unreachable",
        }
    }

    /// Classifies a client error for an operation on `node_name`.
    pub fn from_kube(error: &kube::Error, node_name: &str) -> Self {
        let node_name = node_name.to_string();
        match error {
            kube::Error::Api(response) => match response.code {
                409 => KubernetesError::Conflict { node_name },
                401 | 403 => KubernetesError::Forbidden { node_name },
                404 => KubernetesError::NodeNotFound { node_name },
                400 | 422 => KubernetesError::Invalid {
                    node_name,
                    message: response.message.clone(),
                },
                _ => KubernetesError::Unreachable {
                    message: format!("{} ({})", response.message, response.code),
                },
            },
            other => KubernetesError::Unreachable {
                message: other.to_string(),
            },
        }
    }
}

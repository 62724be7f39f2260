//! Maps hardware snapshots to Kubernetes node labels.

use std::collections::BTreeMap;

use crate::domain::HardwareSnapshot;

/// Default prefix for every label this agent owns.
pub const DEFAULT_LABEL_PREFIX: &str = "bcm.nvidia.com";

/// Maximum length of a Kubernetes label value.
pub const MAX_LABEL_VALUE_LEN: usize = 63;
pub const MAX_LABEL_PREFIX_LEN: usize = 253;

pub const GPU_COUNT: &str = "gpu-count";
pub const CPU_MODEL: &str = "cpu-model";
pub const CPU_COUNT: &str = "cpu-count";
pub const MEMORY_GB: &str = "memory-gb";
pub const HEALTH_STATUS: &str = "health-status";
pub const BCM_CLUSTER: &str = "bcm-cluster";

/// Ordered set of fully qualified node labels.
///
/// Ordering is by key so two sets built from the same snapshot serialize
/// identically.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LabelSet(BTreeMap<String, String>);

impl LabelSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn as_map(&self) -> &BTreeMap<String, String> {
        &self.0
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for LabelSet {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(
            iter.into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }
}

/// Builds the label set for a snapshot.
///
/// Missing hardware facts are left out instead of being emitted with an
/// empty value. Health is always present since `unknown` is a valid
/// status.
pub fn map(snapshot: &HardwareSnapshot, prefix: &str) -> LabelSet {
    let prefix = normalize_prefix(prefix);
    let mut labels = LabelSet::new();
    let mut put = |name: &str, value: Option<String>| {
        if let Some(value) = value.as_deref().and_then(sanitize_label_value) {
            labels.insert(format!("{prefix}/{name}"), value);
        }
    };

    put(GPU_COUNT, snapshot.gpu_count.map(|n| n.to_string()));
    put(CPU_MODEL, snapshot.cpu_model.clone());
    put(CPU_COUNT, snapshot.cpu_count.map(|n| n.to_string()));
    put(MEMORY_GB, snapshot.memory_gb.map(|n| n.to_string()));
    put(HEALTH_STATUS, Some(snapshot.health.as_str().to_string()));
    put(BCM_CLUSTER, snapshot.bcm_cluster.clone());

    labels
}

/// Returns the prefix without surrounding whitespace or trailing slashes.
pub fn normalize_prefix(prefix: &str) -> &str {
    prefix.trim().trim_end_matches('/')
}

/// Checks that `prefix` is a DNS subdomain usable as a label key prefix.
pub fn is_valid_label_prefix(prefix: &str) -> bool {
    !prefix.is_empty()
        && prefix.len() <= MAX_LABEL_PREFIX_LEN
        && prefix.split('.').all(|part| {
            let bytes = part.as_bytes();
            match (bytes.first(), bytes.last()) {
                (Some(first), Some(last)) => {
                    bytes.len() <= MAX_LABEL_VALUE_LEN
                        && first.is_ascii_alphanumeric()
                        && last.is_ascii_alphanumeric()
                        && bytes
                            .iter()
                            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || *b == b'-')
                }
                _ => false,
            }
        })
}

/// Rewrites a free-form string into a valid label value.
///
/// Returns `None` when nothing usable is left.
pub fn sanitize_label_value(value: &str) -> Option<String> {
    let replaced: String = value
        .trim()
        .chars()
        .map(|c| match c {
            '/' => '_',
            c if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') => c,
            _ => '-',
        })
        .take(MAX_LABEL_VALUE_LEN)
        .collect();

    let trimmed = replaced.trim_matches(|c| matches!(c, '-' | '_' | '.'));
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

/// Checks the Kubernetes label value grammar.
pub fn is_valid_label_value(value: &str) -> bool {
    let bytes = value.as_bytes();
    let (Some(first), Some(last)) = (bytes.first(), bytes.last()) else {
        return false;
    };
    value.len() <= MAX_LABEL_VALUE_LEN
        && first.is_ascii_alphanumeric()
        && last.is_ascii_alphanumeric()
        && bytes
            .iter()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_' | b'.'))
}

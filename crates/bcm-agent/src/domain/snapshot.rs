use std::collections::BTreeMap;
use std::fmt;

use chrono::DateTime;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;

/// Health reported by the BCM daemon for the node or one of its components.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    #[default]
    Unknown,
}

impl HealthStatus {
    /// Parses the free-form status strings the daemon emits.
    ///
    /// Matching is case-insensitive. Warning and failure states collapse
    /// into [`HealthStatus::Degraded`]; anything unrecognised is
    /// [`HealthStatus::Unknown`].
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "healthy" | "ok" | "up" => HealthStatus::Healthy,
            "degraded" | "warning" | "unhealthy" | "critical" | "down" => HealthStatus::Degraded,
            _ => HealthStatus::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            HealthStatus::Healthy => "healthy",
            HealthStatus::Degraded => "degraded",
            HealthStatus::Unknown => "unknown",
        }
    }

    /// Gauge value exported for this status.
    pub fn gauge_value(&self) -> f64 {
        match self {
            HealthStatus::Healthy => 1.0,
            HealthStatus::Degraded => 0.5,
            HealthStatus::Unknown => 0.0,
        }
    }
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Hardware state of one node as captured at a single tick.
///
/// Snapshots are never mutated once built. The next successful read
/// replaces the previous snapshot as a whole.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HardwareSnapshot {
    pub node_name: String,
    /// BCM head node the daemon is registered with
    pub bcm_cluster: Option<String>,
    pub gpu_count: Option<u32>,
    pub cpu_model: Option<String>,
    pub cpu_count: Option<u32>,
    pub memory_gb: Option<u64>,
    pub health: HealthStatus,
    /// Per-component health, e.g. `gpu`, `disk`, `psu`
    pub components: BTreeMap<String, HealthStatus>,
    pub last_updated: DateTime<Utc>,
}

impl HardwareSnapshot {
    /// Creates a snapshot with only the node identity filled in.
    pub fn new(node_name: impl Into<String>, last_updated: DateTime<Utc>) -> Self {
        Self {
            node_name: node_name.into(),
            bcm_cluster: None,
            gpu_count: None,
            cpu_model: None,
            cpu_count: None,
            memory_gb: None,
            health: HealthStatus::Unknown,
            components: BTreeMap::new(),
            last_updated,
        }
    }
}

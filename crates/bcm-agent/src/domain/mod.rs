//! Core value types shared by the labeler components.

pub mod snapshot;

pub use snapshot::HardwareSnapshot;
pub use snapshot::HealthStatus;

//! Command layer - entry points for the bcm-agent subcommands

pub mod bootstrap;
pub mod labeler;
pub mod supervise;

pub use bootstrap::run_bootstrap_cert;
pub use labeler::run_labeler;
pub use supervise::run_supervise;

use clap::Parser;
use clap::Subcommand;
use utils::version;

use crate::config::labeler::LabelerArgs;
use crate::config::supervise::BootstrapCertArgs;
use crate::config::supervise::SuperviseArgs;

#[derive(Parser)]
#[command(about, long_about, version = &**version::VERSION)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Sync hardware facts into node labels and Prometheus metrics
    Labeler(LabelerArgs),
    /// Run the BCM daemon and the labeler side by side (container entrypoint)
    Supervise(Box<SuperviseArgs>),
    /// Obtain the node certificate using the bootstrap credential
    #[command(name = "bootstrap-cert")]
    BootstrapCert(BootstrapCertArgs),
}

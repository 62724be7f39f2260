use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;

use crate::bootstrap::CertBootstrap;
use crate::bootstrap::DEFAULT_REGISTER_COMMAND;
use crate::config::labeler::LabelerArgs;
use crate::config::labeler::LogArgs;
use crate::supervisor::DEFAULT_GRACE_PERIOD;

pub const DEFAULT_DAEMON_COMMAND: &str = "cm-lite-daemon";

#[derive(Parser, Debug, Clone)]
pub struct CertArgs {
    #[arg(
        long,
        env = "NODE_CERT_PATH",
        value_hint = clap::ValueHint::FilePath,
        help = "Node certificate; enables the certificate bootstrap when set"
    )]
    pub cert_path: Option<PathBuf>,

    #[arg(
        long,
        env = "NODE_KEY_PATH",
        value_hint = clap::ValueHint::FilePath,
        help = "Private key of the node certificate"
    )]
    pub key_path: Option<PathBuf>,

    #[arg(
        long,
        env = "BOOTSTRAP_CERT_PATH",
        value_hint = clap::ValueHint::FilePath,
        help = "Shared bootstrap certificate used to request the node certificate"
    )]
    pub bootstrap_cert_path: Option<PathBuf>,

    #[arg(
        long,
        env = "BOOTSTRAP_KEY_PATH",
        value_hint = clap::ValueHint::FilePath,
        help = "Private key of the bootstrap certificate"
    )]
    pub bootstrap_key_path: Option<PathBuf>,

    #[arg(
        long,
        env = "REGISTER_COMMAND",
        default_value = DEFAULT_REGISTER_COMMAND,
        help = "External tool that registers the node and writes its certificate"
    )]
    pub register_command: String,

    #[arg(
        long = "register-arg",
        allow_hyphen_values = true,
        help = "Argument passed to the registration command, may be repeated"
    )]
    pub register_args: Vec<String>,

    #[arg(
        long,
        env = "CERT_RENEW_BEFORE",
        help = "Re-register when the certificate expires within this many seconds"
    )]
    pub renew_before: Option<u64>,
}

impl CertArgs {
    /// Builds the bootstrap, or `None` when no certificate path is configured.
    pub fn bootstrap(&self) -> Result<Option<CertBootstrap>> {
        let Some(cert_path) = &self.cert_path else {
            return Ok(None);
        };
        let (Some(key_path), Some(bootstrap_cert), Some(bootstrap_key)) = (
            &self.key_path,
            &self.bootstrap_cert_path,
            &self.bootstrap_key_path,
        ) else {
            anyhow::bail!(
                "--cert-path requires --key-path, --bootstrap-cert-path and --bootstrap-key-path"
            );
        };

        Ok(Some(
            CertBootstrap::new(cert_path, key_path, bootstrap_cert, bootstrap_key)
                .with_register_command(&self.register_command, &self.register_args)
                .with_renew_before(self.renew_before.map(Duration::from_secs)),
        ))
    }
}

#[derive(Parser, Debug, Clone)]
pub struct BootstrapCertArgs {
    #[command(flatten)]
    pub cert: CertArgs,

    #[command(flatten)]
    pub log: LogArgs,
}

#[derive(Parser, Debug, Clone)]
pub struct SuperviseArgs {
    #[command(flatten)]
    pub labeler: LabelerArgs,

    #[arg(
        long,
        env = "BCM_DAEMON_COMMAND",
        default_value = DEFAULT_DAEMON_COMMAND,
        help = "BCM hardware daemon executable"
    )]
    pub daemon_command: String,

    #[arg(
        long = "daemon-arg",
        allow_hyphen_values = true,
        help = "Argument passed to the BCM daemon, may be repeated"
    )]
    pub daemon_args: Vec<String>,

    #[arg(
        long,
        env = "START_BCM_DAEMON",
        help = "Start the BCM daemon next to the labeler",
        default_value_t = true,
        action = clap::ArgAction::Set
    )]
    pub start_daemon: bool,

    #[arg(
        long,
        env = "SHUTDOWN_GRACE_PERIOD",
        default_value_t = DEFAULT_GRACE_PERIOD.as_secs(),
        help = "Seconds children get to exit after SIGTERM before being killed"
    )]
    pub grace_period: u64,

    #[command(flatten)]
    pub cert: CertArgs,
}

impl SuperviseArgs {
    pub fn grace_period(&self) -> Duration {
        Duration::from_secs(self.grace_period)
    }
}

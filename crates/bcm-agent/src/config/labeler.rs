use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use anyhow::Result;
use clap::Parser;
use tracing::level_filters::LevelFilter;

use crate::app::DEFAULT_SHUTDOWN_TIMEOUT;
use crate::fact_source::DEFAULT_FACT_FILE;
use crate::labels;
use crate::labels::DEFAULT_LABEL_PREFIX;

#[derive(Parser, Debug, Clone)]
pub struct LogArgs {
    #[arg(
        long,
        env = "LOG_LEVEL",
        default_value = "info",
        help = "Log level used when RUST_LOG is not set"
    )]
    pub log_level: String,

    #[arg(long, help = "Shortcut for --log-level debug")]
    pub debug: bool,
}

impl LogArgs {
    pub fn level(&self) -> LevelFilter {
        if self.debug {
            LevelFilter::DEBUG
        } else {
            utils::logging::parse_level(&self.log_level)
        }
    }

    fn push_cli_args(&self, args: &mut Vec<String>) {
        args.push("--log-level".to_string());
        args.push(self.log_level.clone());
        if self.debug {
            args.push("--debug".to_string());
        }
    }
}

#[derive(Parser, Debug, Clone)]
pub struct LabelerArgs {
    #[arg(
        long,
        env = "NODE_NAME",
        help = "Kubernetes node to label, defaults to the hostname"
    )]
    pub node_name: Option<String>,

    #[arg(
        long,
        env = "SYNC_INTERVAL",
        default_value_t = 300,
        value_parser = clap::value_parser!(u64).range(1..),
        help = "Seconds between two syncs"
    )]
    pub interval: u64,

    #[arg(
        long,
        env = "LABEL_PREFIX",
        default_value = DEFAULT_LABEL_PREFIX,
        value_parser = parse_label_prefix,
        help = "Prefix of every label written by the agent"
    )]
    pub label_prefix: String,

    #[arg(
        long,
        env = "METRICS_PORT",
        default_value_t = 9100,
        help = "Port of the Prometheus metrics endpoint"
    )]
    pub metrics_port: u16,

    #[arg(
        long,
        visible_alias = "metrics-only",
        env = "DISABLE_LABELING",
        help = "Only export metrics, never write node labels"
    )]
    pub disable_labeling: bool,

    #[arg(
        long,
        env = "BCM_FACT_FILE",
        value_hint = clap::ValueHint::FilePath,
        default_value = DEFAULT_FACT_FILE,
        help = "JSON document written by the BCM daemon"
    )]
    pub source_file: PathBuf,

    #[arg(
        long,
        env = "BCM_FACT_SOCKET",
        value_hint = clap::ValueHint::FilePath,
        help = "Unix socket serving the hardware facts, takes precedence over --source-file"
    )]
    pub source_socket: Option<PathBuf>,

    #[arg(
        long,
        env = "KUBECONFIG",
        value_hint = clap::ValueHint::FilePath,
        help = "Path to kubeconfig file (defaults to cluster config or ~/.kube/config)"
    )]
    pub kubeconfig: Option<PathBuf>,

    #[arg(
        long,
        env = "LABELER_SHUTDOWN_TIMEOUT",
        default_value_t = DEFAULT_SHUTDOWN_TIMEOUT.as_secs(),
        help = "Seconds the labeler waits for its tasks after a shutdown signal"
    )]
    pub shutdown_timeout: u64,

    #[command(flatten)]
    pub log: LogArgs,
}

impl LabelerArgs {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout)
    }

    pub fn metrics_listen_addr(&self) -> String {
        format!("0.0.0.0:{}", self.metrics_port)
    }

    /// Arguments that make a `labeler` child behave like this configuration.
    ///
    /// The node name is passed resolved so parent and child agree on it.
    pub fn to_cli_args(&self, node_name: &str) -> Vec<String> {
        let mut args = vec![
            "labeler".to_string(),
            "--node-name".to_string(),
            node_name.to_string(),
            "--interval".to_string(),
            self.interval.to_string(),
            "--label-prefix".to_string(),
            self.label_prefix.clone(),
            "--metrics-port".to_string(),
            self.metrics_port.to_string(),
            "--source-file".to_string(),
            self.source_file.display().to_string(),
            "--shutdown-timeout".to_string(),
            self.shutdown_timeout.to_string(),
        ];
        if let Some(socket) = &self.source_socket {
            args.push("--source-socket".to_string());
            args.push(socket.display().to_string());
        }
        if let Some(kubeconfig) = &self.kubeconfig {
            args.push("--kubeconfig".to_string());
            args.push(kubeconfig.display().to_string());
        }
        if self.disable_labeling {
            args.push("--disable-labeling".to_string());
        }
        self.log.push_cli_args(&mut args);
        args
    }
}

fn parse_label_prefix(value: &str) -> std::result::Result<String, String> {
    let prefix = labels::normalize_prefix(value);
    if labels::is_valid_label_prefix(prefix) {
        Ok(prefix.to_string())
    } else {
        Err(format!(
            "{value:?} is not a DNS subdomain such as {DEFAULT_LABEL_PREFIX}"
        ))
    }
}

/// Returns `explicit` when set, otherwise the machine's hostname.
pub fn resolve_node_name(explicit: Option<&str>) -> Result<String> {
    if let Some(name) = explicit.map(str::trim).filter(|name| !name.is_empty()) {
        return Ok(name.to_string());
    }

    let hostname = hostname::get()
        .context("NODE_NAME is not set and the hostname cannot be read")?
        .into_string()
        .map_err(|_| anyhow::anyhow!("hostname is not valid UTF-8"))?;
    tracing::warn!("NODE_NAME not set, falling back to hostname {hostname}");
    Ok(hostname)
}

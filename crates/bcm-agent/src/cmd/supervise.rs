use anyhow::Context;
use anyhow::Result;
use utils::version;

use crate::app::ShutdownSignals;
use crate::config::resolve_node_name;
use crate::config::SuperviseArgs;
use crate::supervisor::ChildSpec;
use crate::supervisor::Supervisor;

pub const DAEMON_CHILD: &str = "bcm-daemon";
pub const LABELER_CHILD: &str = "labeler";

/// Runs the supervisor and returns the process exit code.
pub async fn run_supervise(args: SuperviseArgs) -> Result<i32> {
    utils::logging::init(args.labeler.log.level());

    tracing::info!("Starting bcm-agent supervisor {}", &**version::VERSION);

    let signals = ShutdownSignals::install()?;

    if let Some(bootstrap) = args.cert.bootstrap()? {
        bootstrap
            .ensure_certificate()
            .await
            .map_err(|e| anyhow::anyhow!("Certificate bootstrap failed: {e:?}"))?;
    }

    let children = child_specs(&args)?;
    let outcome = Supervisor::new(children, args.grace_period())
        .run(signals.recv())
        .await
        .map_err(|e| anyhow::anyhow!("Supervisor failed to start children: {e:?}"))?;

    Ok(outcome.exit_code())
}

fn child_specs(args: &SuperviseArgs) -> Result<Vec<ChildSpec>> {
    let node_name = resolve_node_name(args.labeler.node_name.as_deref())?;
    let exe = std::env::current_exe().context("Failed to locate the bcm-agent executable")?;

    let mut children = Vec::with_capacity(2);
    if args.start_daemon {
        children.push(ChildSpec::new(
            DAEMON_CHILD,
            &args.daemon_command,
            &args.daemon_args,
        ));
    } else {
        tracing::info!("BCM daemon start disabled, supervising the labeler only");
    }
    // The labeler must be done before the grace period ends or it is killed.
    let mut labeler = args.labeler.clone();
    labeler.shutdown_timeout = labeler.shutdown_timeout.min(args.grace_period / 2);
    children.push(ChildSpec::new(
        LABELER_CHILD,
        exe.display().to_string(),
        labeler.to_cli_args(&node_name),
    ));
    Ok(children)
}

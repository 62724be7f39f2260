use anyhow::Result;
use utils::version;

use crate::config::BootstrapCertArgs;

pub async fn run_bootstrap_cert(args: BootstrapCertArgs) -> Result<()> {
    utils::logging::init(args.log.level());

    tracing::info!("Starting bcm-agent certificate bootstrap {}", &**version::VERSION);

    let Some(bootstrap) = args.cert.bootstrap()? else {
        anyhow::bail!("--cert-path is required");
    };
    let outcome = bootstrap
        .ensure_certificate()
        .await
        .map_err(|e| anyhow::anyhow!("Certificate bootstrap failed: {e:?}"))?;

    tracing::info!("Certificate bootstrap finished: {outcome:?}");
    Ok(())
}

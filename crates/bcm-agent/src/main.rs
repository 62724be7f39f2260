use anyhow::Result;
use bcm_agent::cmd;
use bcm_agent::config::Cli;
use bcm_agent::config::Commands;
use clap::Parser;

/// Sets up global panic hooks.
fn setup_global_hooks() {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |panic_info| {
        default_hook(panic_info);
        tracing::error!("Thread panicked: {}", panic_info);
    }));
}

#[tokio::main]
async fn main() -> Result<()> {
    setup_global_hooks();

    let cli = Cli::parse();

    match cli.command {
        Commands::Labeler(args) => cmd::run_labeler(args).await,
        Commands::BootstrapCert(args) => cmd::run_bootstrap_cert(args).await,
        Commands::Supervise(args) => {
            let code = cmd::run_supervise(*args).await?;
            if code != 0 {
                std::process::exit(code);
            }
            Ok(())
        }
    }
}

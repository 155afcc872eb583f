//! pack CLI entry point.

use clap::Parser;
use pack_core::OperationContext;
use tracing_subscriber::EnvFilter;

use pack_cli::commands::{dispatch, Cli};

#[tokio::main]
async fn main() {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();

    let ctx = OperationContext::new();
    let interrupt = ctx.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupted, cancelling");
            interrupt.cancel();
        }
    });

    if let Err(e) = dispatch(cli, &ctx).await {
        eprintln!("ERROR: {e}");
        std::process::exit(e.exit_code());
    }
}

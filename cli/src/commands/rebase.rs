//! `pack rebase` command.

use clap::Args;
use pack_core::{OperationContext, Result};
use pack_runtime::{EngineConfig, Pack, PhaseLog, RebaseOptions};

#[derive(Args)]
pub struct RebaseArgs {
    /// Image to rebase
    pub image: String,

    /// Rewrite the image in the registry instead of the docker daemon
    #[arg(long)]
    pub publish: bool,

    /// Use the run image already in the daemon
    #[arg(long = "no-pull")]
    pub no_pull: bool,
}

pub async fn execute(args: RebaseArgs, ctx: &OperationContext) -> Result<()> {
    let config = EngineConfig::from_env();
    let quiet = config.quiet;
    let pack = Pack::connect(config)?;
    let opts = RebaseOptions {
        publish: args.publish,
        pull: !args.no_pull,
    };
    pack.rebase(ctx, &args.image, opts, &PhaseLog::new(quiet)).await?;
    Ok(())
}

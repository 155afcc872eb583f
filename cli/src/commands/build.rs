//! `pack build` command.

use std::path::PathBuf;

use clap::Args;
use pack_core::{OperationContext, Result};
use pack_runtime::{BuildRequest, EngineConfig, Pack, PhaseLog};

#[derive(Args)]
pub struct BuildArgs {
    /// Name of the image to build
    pub image: String,

    /// Path to the app directory (defaults to the current directory)
    #[arg(short, long)]
    pub path: Option<PathBuf>,

    /// Builder image (defaults to the stack's build image)
    #[arg(long)]
    pub builder: Option<String>,

    /// Run image (defaults to the stack's run image)
    #[arg(long = "run-image")]
    pub run_image: Option<String>,

    /// Buildpack to use instead of detection, as ID[@VERSION]; repeatable
    #[arg(long = "buildpack")]
    pub buildpacks: Vec<String>,

    /// Stack to build on (defaults to the default stack)
    #[arg(long)]
    pub stack: Option<String>,

    /// Publish to the registry instead of the docker daemon
    #[arg(long)]
    pub publish: bool,

    /// Use images already in the daemon instead of pulling them
    #[arg(long = "no-pull")]
    pub no_pull: bool,

    /// Only print the final image
    #[arg(short, long)]
    pub quiet: bool,
}

pub async fn execute(args: BuildArgs, ctx: &OperationContext) -> Result<()> {
    let source = match args.path {
        Some(path) => path,
        None => std::env::current_dir()?,
    };
    let pack = Pack::connect(EngineConfig::from_env().quiet(args.quiet))?;

    let request = BuildRequest {
        image: args.image,
        source,
        stack: args.stack,
        builder: args.builder,
        run_image: args.run_image,
        buildpacks: args.buildpacks,
        publish: args.publish,
        pull: !args.no_pull,
    };
    let log = PhaseLog::new(args.quiet);
    let result = pack.build(ctx, request, &log).await?;
    if args.quiet {
        println!("{}", result.reference.with_digest(&result.digest));
    }
    Ok(())
}

//! CLI command definitions and dispatch.

mod build;
mod rebase;
mod stack;

use clap::{Parser, Subcommand};
use pack_core::{OperationContext, Result};

/// pack - build OCI images from source with Cloud Native Buildpacks.
#[derive(Parser)]
#[command(name = "pack", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

/// Available commands.
#[derive(Subcommand)]
pub enum Command {
    /// Generate an app image from source code
    Build(build::BuildArgs),
    /// Put an app image on the latest run image of its stack
    Rebase(rebase::RebaseArgs),
    /// Add a stack to the configuration
    AddStack(stack::StackImagesArgs),
    /// Replace the images of a configured stack
    UpdateStack(stack::StackImagesArgs),
    /// Remove a stack from the configuration
    DeleteStack(stack::StackIdArgs),
    /// Use a stack when none is given
    SetDefaultStack(stack::StackIdArgs),
    /// List configured stacks
    Stacks,
}

/// Dispatch a parsed command line.
pub async fn dispatch(cli: Cli, ctx: &OperationContext) -> Result<()> {
    match cli.command {
        Command::Build(args) => build::execute(args, ctx).await,
        Command::Rebase(args) => rebase::execute(args, ctx).await,
        Command::AddStack(args) => stack::add(args),
        Command::UpdateStack(args) => stack::update(args),
        Command::DeleteStack(args) => stack::delete(args),
        Command::SetDefaultStack(args) => stack::set_default(args),
        Command::Stacks => stack::list(),
    }
}

//! Stack configuration commands.

use clap::Args;
use pack_core::{Result, Stack, StackRegistry};

#[derive(Args)]
pub struct StackImagesArgs {
    /// Stack ID, e.g. io.buildpacks.stacks.bionic
    pub id: String,

    /// Build image; repeatable
    #[arg(long = "build-image", required = true)]
    pub build_images: Vec<String>,

    /// Run image; repeatable
    #[arg(long = "run-image", required = true)]
    pub run_images: Vec<String>,
}

#[derive(Args)]
pub struct StackIdArgs {
    /// Stack ID
    pub id: String,
}

pub fn add(args: StackImagesArgs) -> Result<()> {
    println!("{}", add_stack(&StackRegistry::default_path()?, args)?);
    Ok(())
}

pub fn update(args: StackImagesArgs) -> Result<()> {
    println!("{}", update_stack(&StackRegistry::default_path()?, args)?);
    Ok(())
}

pub fn delete(args: StackIdArgs) -> Result<()> {
    println!("{}", delete_stack(&StackRegistry::default_path()?, args)?);
    Ok(())
}

pub fn set_default(args: StackIdArgs) -> Result<()> {
    println!("{}", set_default_stack(&StackRegistry::default_path()?, args)?);
    Ok(())
}

pub fn list() -> Result<()> {
    println!("{}", stack_table(&StackRegistry::default_path()?)?);
    Ok(())
}

fn add_stack(registry: &StackRegistry, args: StackImagesArgs) -> Result<String> {
    registry.add_stack(Stack::new(&args.id, args.build_images, args.run_images))?;
    Ok(format!("{} successfully added", args.id))
}

fn update_stack(registry: &StackRegistry, args: StackImagesArgs) -> Result<String> {
    registry.update_stack(&args.id, args.build_images, args.run_images)?;
    Ok(format!("{} successfully updated", args.id))
}

fn delete_stack(registry: &StackRegistry, args: StackIdArgs) -> Result<String> {
    registry.delete_stack(&args.id)?;
    Ok(format!("{} has been successfully deleted", args.id))
}

fn set_default_stack(registry: &StackRegistry, args: StackIdArgs) -> Result<String> {
    registry.set_default_stack(&args.id)?;
    Ok(format!("{} is now the default stack", args.id))
}

fn stack_table(registry: &StackRegistry) -> Result<comfy_table::Table> {
    let default = registry.default_stack().ok().map(|s| s.id);
    let mut table = comfy_table::Table::new();
    table.load_preset(comfy_table::presets::NOTHING);
    table.set_header(vec!["STACK ID", "BUILD IMAGES", "RUN IMAGES"]);
    for stack in registry.list()? {
        let id = if default.as_deref() == Some(stack.id.as_str()) {
            format!("{} (default)", stack.id)
        } else {
            stack.id
        };
        table.add_row(vec![id, stack.build_images.join(", "), stack.run_images.join(", ")]);
    }
    Ok(table)
}

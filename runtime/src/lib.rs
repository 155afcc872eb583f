//! Pack Runtime - build and rebase engine.
//!
//! Resolves image references, talks to OCI registries and the container
//! engine, runs buildpack phases in containers, and assembles or rebases
//! application images.

#![allow(clippy::result_large_err)]

pub mod cache;
pub mod client;
pub mod config;
pub mod daemon;
pub mod image;
pub mod lifecycle;
pub mod log;
pub mod oci;
pub mod rebase;

#[cfg(test)]
mod testing;

// Re-export common types
pub use cache::CacheManager;
pub use client::{BuildRequest, Pack};
pub use config::EngineConfig;
pub use daemon::{ContainerEngine, DockerEngine};
pub use image::{ImageAssembler, LifecycleMetadata};
pub use lifecycle::{BuildContext, BuildResult, Orchestrator};
pub use log::{Phase, PhaseLog};
pub use oci::{ImageReference, ImageRegistry, RegistryAuth, RegistryClient};
pub use rebase::{RebaseEngine, RebaseOptions, RebaseResult};

/// Pack Runtime version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

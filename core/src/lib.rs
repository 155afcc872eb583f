//! Pack Core - Foundational Types
//!
//! Errors, operation context, and the persisted stack configuration
//! shared by the pack runtime and CLI.

pub mod config;
pub mod context;
pub mod error;

// Re-export commonly used types
pub use config::{pack_home, PackConfig, Stack, StackRegistry};
pub use context::OperationContext;
pub use error::{PackError, Result};

/// Pack version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

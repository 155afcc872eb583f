//! OCI image plumbing.
//!
//! References, manifests and configs, layer tars, docker archives, and the
//! Distribution v2 registry client with its authentication.

pub mod archive;
pub mod auth;
pub mod credentials;
pub mod layers;
pub mod manifest;
pub mod reference;
pub mod registry;

pub use archive::DockerArchive;
pub use credentials::RegistryAuth;
pub use manifest::{Descriptor, ImageConfig, ImageManifest};
pub use reference::ImageReference;
pub use registry::{ImageRegistry, RegistryClient, RemoteImage};

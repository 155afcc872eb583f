//! Test doubles for the engine and the registry, plus image fixtures.

mod engine;
mod registry;

pub use engine::{FakeEngine, Node, ScriptContext, Tree};
pub use registry::MemoryRegistry;

use std::io::Write;

use bytes::Bytes;
use flate2::write::GzEncoder;
use flate2::Compression;

use crate::oci::archive::DockerArchive;
use crate::oci::manifest::{
    sha256_digest, ContainerConfig, Descriptor, History, ImageConfig, ImageManifest, RootFs,
    DOCKER_CONFIG, DOCKER_LAYER_GZIP,
};
use crate::oci::reference::ImageReference;

/// Uncompressed layer holding text files at the given paths.
pub fn layer_of(files: &[(&str, &str)]) -> Bytes {
    let mut builder = tar::Builder::new(Vec::new());
    for (path, contents) in files {
        let mut header = tar::Header::new_gnu();
        header.set_entry_type(tar::EntryType::Regular);
        header.set_size(contents.len() as u64);
        header.set_mode(0o755);
        header.set_mtime(crate::oci::layers::NORMALIZED_MTIME);
        builder
            .append_data(&mut header, path.trim_start_matches('/'), contents.as_bytes())
            .unwrap();
    }
    Bytes::from(builder.into_inner().unwrap())
}

/// Single-layer image with the given files and labels.
pub fn image_from_files(files: &[(&str, &str)], labels: &[(&str, &str)]) -> DockerArchive {
    image_from_layers(vec![layer_of(files)], labels)
}

/// Image over existing uncompressed layers.
pub fn image_from_layers(layers: Vec<Bytes>, labels: &[(&str, &str)]) -> DockerArchive {
    let mut config = ImageConfig {
        architecture: Some("amd64".to_string()),
        os: Some("linux".to_string()),
        config: ContainerConfig {
            user: Some("1000:1000".to_string()),
            env: Some(vec!["PATH=/usr/bin:/bin".to_string()]),
            ..ContainerConfig::default()
        },
        rootfs: RootFs::layers(layers.iter().map(|l| sha256_digest(l)).collect()),
        history: layers
            .iter()
            .enumerate()
            .map(|(i, _)| History::layer("2018-01-01T00:00:00Z", format!("base layer {}", i)))
            .collect(),
        ..ImageConfig::default()
    };
    for (key, value) in labels {
        config.set_label(key, *value);
    }
    DockerArchive::new(config, layers)
}

pub fn gzip(data: &[u8]) -> Bytes {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data).unwrap();
    Bytes::from(encoder.finish().unwrap())
}

/// Push an archive's layers, config and manifest; returns the manifest digest.
pub fn push_image(
    registry: &MemoryRegistry,
    reference: &ImageReference,
    archive: &DockerArchive,
) -> String {
    let repository = &reference.repository;
    let layers: Vec<Descriptor> = archive
        .layers
        .iter()
        .map(|layer| {
            let blob = gzip(layer);
            let size = blob.len() as u64;
            let digest = registry.seed_blob(repository, blob);
            Descriptor::new(DOCKER_LAYER_GZIP, digest, size)
        })
        .collect();
    let config = Bytes::from(archive.config.to_bytes().unwrap());
    let size = config.len() as u64;
    let config_digest = registry.seed_blob(repository, config);
    let manifest =
        ImageManifest::docker(Descriptor::new(DOCKER_CONFIG, config_digest, size), layers);
    registry.seed_manifest(reference, &manifest)
}

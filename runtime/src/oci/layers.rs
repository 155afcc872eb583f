//! Content-addressed layer store.
//!
//! Layers produced during export are ingested here: the uncompressed tar is
//! gzip-compressed while both the diff-id (SHA-256 of the tar) and the
//! digest (SHA-256 of the gzip stream) are computed in a single pass. The
//! compressed blob lands in a scratch directory under its digest. Reading a
//! layer back yields the uncompressed tar and fails if it no longer hashes to
//! the recorded diff-id.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{self, BufReader, Read, Write};
use std::path::{Path, PathBuf};

use bytes::Bytes;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use pack_core::error::{PackError, Result};
use sha2::{Digest, Sha256};

/// Timestamp stamped on every tar entry we produce (1980-01-01T00:00:01Z).
pub const NORMALIZED_MTIME: u64 = 315_532_801;

/// A layer whose identifiers are both known.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Layer {
    /// `sha256:` of the uncompressed tar
    pub diff_id: String,
    /// `sha256:` of the gzip blob
    pub digest: String,
    /// Size of the gzip blob in bytes
    pub size: u64,
}

/// Scratch-directory backed store of compressed layer blobs.
pub struct LayerStore {
    dir: PathBuf,
    _scratch: Option<tempfile::TempDir>,
}

impl LayerStore {
    /// Store in a fresh temporary directory, removed on drop.
    pub fn temporary() -> Result<Self> {
        let scratch = tempfile::Builder::new()
            .prefix("pack-layers-")
            .tempdir()
            .map_err(|e| PackError::Other(format!("Failed to create layer scratch dir: {}", e)))?;
        Ok(Self {
            dir: scratch.path().to_path_buf(),
            _scratch: Some(scratch),
        })
    }

    /// Store rooted at an existing directory.
    pub fn in_dir(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            _scratch: None,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Compress `reader` into the store, hashing both forms on the way.
    pub fn ingest<R: Read>(&self, mut reader: R) -> Result<Layer> {
        let tmp_path = self.dir.join(format!("ingest-{}.tmp", uuid::Uuid::new_v4()));
        let file = File::create(&tmp_path).map_err(|e| {
            PackError::Other(format!(
                "Failed to create layer file {}: {}",
                tmp_path.display(),
                e
            ))
        })?;

        let mut diff_hasher = Sha256::new();
        let mut encoder = GzEncoder::new(HashingWriter::new(file), Compression::default());
        let mut buf = vec![0u8; 64 * 1024];
        loop {
            let n = reader.read(&mut buf)?;
            if n == 0 {
                break;
            }
            diff_hasher.update(&buf[..n]);
            encoder.write_all(&buf[..n])?;
        }
        let mut hashing = encoder.finish()?;
        hashing.flush()?;
        let (digest, size) = hashing.finish();
        let diff_id = format!("sha256:{}", hex::encode(diff_hasher.finalize()));

        let blob_path = self.blob_path(&digest);
        std::fs::rename(&tmp_path, &blob_path).map_err(|e| {
            PackError::Other(format!(
                "Failed to store layer {}: {}",
                blob_path.display(),
                e
            ))
        })?;

        tracing::debug!(%diff_id, %digest, size, "Ingested layer");
        Ok(Layer {
            diff_id,
            digest,
            size,
        })
    }

    /// Ingest an already-compressed blob, verifying it against `digest`.
    pub fn ingest_compressed(&self, digest: &str, data: &[u8]) -> Result<Layer> {
        let actual = crate::oci::manifest::sha256_digest(data);
        if actual != digest {
            return Err(PackError::Other(format!(
                "blob digest mismatch: expected {}, got {}",
                digest, actual
            )));
        }
        let mut hasher = Sha256::new();
        let mut decoder = GzDecoder::new(data);
        let mut buf = vec![0u8; 64 * 1024];
        loop {
            let n = decoder.read(&mut buf)?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
        }
        std::fs::write(self.blob_path(digest), data)?;
        Ok(Layer {
            diff_id: format!("sha256:{}", hex::encode(hasher.finalize())),
            digest: digest.to_string(),
            size: data.len() as u64,
        })
    }

    pub fn contains(&self, digest: &str) -> bool {
        self.blob_path(digest).exists()
    }

    /// Compressed bytes of a stored layer, for upload.
    pub fn read_blob(&self, digest: &str) -> Result<Bytes> {
        let path = self.blob_path(digest);
        let data = std::fs::read(&path).map_err(|e| {
            PackError::NotFound(format!("layer blob {} ({}): {}", digest, path.display(), e))
        })?;
        Ok(Bytes::from(data))
    }

    /// Verified uncompressed stream of a stored layer.
    pub fn materialize(
        &self,
        layer: &Layer,
    ) -> Result<VerifyingReader<GzDecoder<BufReader<File>>>> {
        let path = self.blob_path(&layer.digest);
        let file = File::open(&path).map_err(|e| {
            PackError::NotFound(format!("layer blob {} ({}): {}", layer.digest, path.display(), e))
        })?;
        Ok(VerifyingReader::new(
            GzDecoder::new(BufReader::new(file)),
            &layer.diff_id,
        ))
    }

    /// Uncompressed tar of a stored layer, fully verified.
    pub fn uncompressed(&self, layer: &Layer) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        self.materialize(layer)?
            .read_to_end(&mut out)
            .map_err(|e| PackError::Other(format!("layer {}: {}", layer.digest, e)))?;
        Ok(out)
    }

    fn blob_path(&self, digest: &str) -> PathBuf {
        let hex = digest.strip_prefix("sha256:").unwrap_or(digest);
        self.dir.join(format!("{}.tar.gz", hex))
    }
}

/// Writer adapter that hashes and counts everything passing through.
struct HashingWriter<W> {
    inner: W,
    hasher: Sha256,
    written: u64,
}

impl<W: Write> HashingWriter<W> {
    fn new(inner: W) -> Self {
        Self {
            inner,
            hasher: Sha256::new(),
            written: 0,
        }
    }

    fn finish(self) -> (String, u64) {
        (
            format!("sha256:{}", hex::encode(self.hasher.finalize())),
            self.written,
        )
    }
}

impl<W: Write> Write for HashingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.hasher.update(&buf[..n]);
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Reader that fails at end of stream unless the content hashed to `expected`.
pub struct VerifyingReader<R> {
    inner: R,
    hasher: Option<Sha256>,
    expected: String,
}

impl<R: Read> VerifyingReader<R> {
    pub fn new(inner: R, expected: &str) -> Self {
        Self {
            inner,
            hasher: Some(Sha256::new()),
            expected: expected.to_string(),
        }
    }
}

impl<R: Read> Read for VerifyingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        if n > 0 {
            if let Some(hasher) = self.hasher.as_mut() {
                hasher.update(&buf[..n]);
            }
            return Ok(n);
        }
        if let Some(hasher) = self.hasher.take() {
            let actual = format!("sha256:{}", hex::encode(hasher.finalize()));
            if actual != self.expected {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("diff-id mismatch: expected {}, got {}", self.expected, actual),
                ));
            }
        }
        Ok(0)
    }
}

/// Deterministic tar of `src_dir`, with entries placed under `target`.
///
/// Parent directories of `target` are emitted first. Entries are sorted,
/// stamped with [`NORMALIZED_MTIME`] and owned by `uid:gid`, so identical
/// trees always produce identical diff-ids.
pub fn tar_dir(src_dir: &Path, target: &str, uid: u32, gid: u32) -> Result<Vec<u8>> {
    let mut builder = tar::Builder::new(Vec::new());
    builder.follow_symlinks(false);

    let target = target.trim_matches('/');
    let mut prefix = PathBuf::new();
    for component in Path::new(target).components() {
        prefix.push(component);
        append_dir_entry(&mut builder, &prefix, 0o755, uid, gid)?;
    }
    if src_dir.exists() {
        add_dir_to_tar(&mut builder, src_dir, src_dir, Path::new(target), uid, gid)?;
    }

    builder
        .into_inner()
        .map_err(|e| PackError::Other(format!("Failed to finalize layer: {}", e)))
}

fn append_dir_entry<W: Write>(
    builder: &mut tar::Builder<W>,
    path: &Path,
    mode: u32,
    uid: u32,
    gid: u32,
) -> Result<()> {
    let mut header = tar::Header::new_gnu();
    header.set_entry_type(tar::EntryType::Directory);
    header.set_size(0);
    header.set_mode(mode);
    header.set_uid(uid as u64);
    header.set_gid(gid as u64);
    header.set_mtime(NORMALIZED_MTIME);
    builder
        .append_data(&mut header, path, io::empty())
        .map_err(|e| PackError::Other(format!("Failed to add directory to layer: {}", e)))
}

/// Recursively add a directory's contents to a tar builder.
fn add_dir_to_tar<W: Write>(
    builder: &mut tar::Builder<W>,
    root: &Path,
    current: &Path,
    target_prefix: &Path,
    uid: u32,
    gid: u32,
) -> Result<()> {
    let mut entries = std::fs::read_dir(current)
        .map_err(|e| {
            PackError::Other(format!(
                "Failed to read directory {}: {}",
                current.display(),
                e
            ))
        })?
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| PackError::Other(format!("Failed to read entry: {}", e)))?;
    entries.sort_by_key(|e| e.file_name());

    for entry in entries {
        let path = entry.path();
        let relative = path
            .strip_prefix(root)
            .map_err(|e| PackError::Other(format!("Failed to strip prefix: {}", e)))?;
        let tar_path = target_prefix.join(relative);
        let metadata = std::fs::symlink_metadata(&path)?;
        let mode = permissions_mode(&metadata);

        if metadata.file_type().is_symlink() {
            let link = std::fs::read_link(&path)?;
            let mut header = tar::Header::new_gnu();
            header.set_entry_type(tar::EntryType::Symlink);
            header.set_size(0);
            header.set_mode(0o777);
            header.set_uid(uid as u64);
            header.set_gid(gid as u64);
            header.set_mtime(NORMALIZED_MTIME);
            builder
                .append_link(&mut header, &tar_path, &link)
                .map_err(|e| PackError::Other(format!("Failed to add link to layer: {}", e)))?;
        } else if metadata.is_dir() {
            append_dir_entry(builder, &tar_path, mode, uid, gid)?;
            add_dir_to_tar(builder, root, &path, target_prefix, uid, gid)?;
        } else {
            let mut header = tar::Header::new_gnu();
            header.set_entry_type(tar::EntryType::Regular);
            header.set_size(metadata.len());
            header.set_mode(mode);
            header.set_uid(uid as u64);
            header.set_gid(gid as u64);
            header.set_mtime(NORMALIZED_MTIME);
            let file = File::open(&path)?;
            builder
                .append_data(&mut header, &tar_path, file)
                .map_err(|e| PackError::Other(format!("Failed to add file to layer: {}", e)))?;
        }
    }

    Ok(())
}

#[cfg(unix)]
fn permissions_mode(metadata: &std::fs::Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    metadata.permissions().mode() & 0o7777
}

#[cfg(not(unix))]
fn permissions_mode(metadata: &std::fs::Metadata) -> u32 {
    if metadata.is_dir() {
        0o755
    } else {
        0o644
    }
}

/// Unpack a tar stream (as returned by a container copy-out) into `dest`.
pub fn unpack(data: &[u8], dest: &Path) -> Result<()> {
    std::fs::create_dir_all(dest)?;
    let mut archive = tar::Archive::new(data);
    archive.set_preserve_permissions(true);
    archive.unpack(dest).map_err(|e| {
        PackError::Other(format!(
            "Failed to extract archive to {}: {}",
            dest.display(),
            e
        ))
    })
}

/// Tar containing a single regular file at `path`.
pub fn tar_single_file(path: &str, contents: &[u8], mode: u32) -> Result<Vec<u8>> {
    tar_files(&[(path.to_string(), contents.to_vec())], mode, 0, 0)
}

/// Tar of regular files at absolute `paths`, owned by `uid:gid`.
pub fn tar_files(files: &[(String, Vec<u8>)], mode: u32, uid: u32, gid: u32) -> Result<Vec<u8>> {
    let mut builder = tar::Builder::new(Vec::new());
    for (path, contents) in files {
        let mut header = tar::Header::new_gnu();
        header.set_entry_type(tar::EntryType::Regular);
        header.set_size(contents.len() as u64);
        header.set_mode(mode);
        header.set_uid(uid as u64);
        header.set_gid(gid as u64);
        header.set_mtime(NORMALIZED_MTIME);
        builder
            .append_data(&mut header, path.trim_start_matches('/'), &contents[..])
            .map_err(|e| PackError::Other(format!("Failed to build archive: {}", e)))?;
    }
    builder
        .into_inner()
        .map_err(|e| PackError::Other(format!("Failed to build archive: {}", e)))
}

/// Contents of the first regular file in a tar stream.
pub fn read_single_file(data: &[u8]) -> Result<Vec<u8>> {
    let mut archive = tar::Archive::new(data);
    let entries = archive
        .entries()
        .map_err(|e| PackError::Other(format!("Failed to read archive: {}", e)))?;
    for entry in entries {
        let mut entry =
            entry.map_err(|e| PackError::Other(format!("Failed to read archive: {}", e)))?;
        if entry.header().entry_type().is_file() {
            let mut contents = Vec::new();
            entry.read_to_end(&mut contents)?;
            return Ok(contents);
        }
    }
    Err(PackError::NotFound("no file in archive".to_string()))
}

/// Regular files directly inside `dir` of a layer, by file name.
///
/// Accepts the uncompressed tar or the gzip blob.
pub fn files_in_dir(data: &[u8], dir: &str) -> Result<BTreeMap<String, Vec<u8>>> {
    if data.starts_with(&[0x1f, 0x8b]) {
        let mut tar = Vec::new();
        GzDecoder::new(data).read_to_end(&mut tar)?;
        return files_in_dir(&tar, dir);
    }
    let dir = dir.trim_matches('/');
    let mut files = BTreeMap::new();
    let mut archive = tar::Archive::new(data);
    let entries = archive
        .entries()
        .map_err(|e| PackError::Other(format!("Failed to read archive: {}", e)))?;
    for entry in entries {
        let mut entry =
            entry.map_err(|e| PackError::Other(format!("Failed to read archive: {}", e)))?;
        if !entry.header().entry_type().is_file() {
            continue;
        }
        let path = entry
            .path()
            .map_err(|e| PackError::Other(format!("Failed to read archive: {}", e)))?
            .to_string_lossy()
            .trim_start_matches("./")
            .trim_start_matches('/')
            .to_string();
        let Some(name) = path.strip_prefix(dir).and_then(|rest| rest.strip_prefix('/')) else {
            continue;
        };
        if name.is_empty() || name.contains('/') {
            continue;
        }
        let name = name.to_string();
        let mut contents = Vec::new();
        entry.read_to_end(&mut contents)?;
        files.insert(name, contents);
    }
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn sample_tree() -> TempDir {
        let tmp = TempDir::new().unwrap();
        fs::create_dir_all(tmp.path().join("node_modules/left-pad")).unwrap();
        fs::write(tmp.path().join("package.json"), "{}").unwrap();
        fs::write(tmp.path().join("node_modules/left-pad/index.js"), "pad").unwrap();
        tmp
    }

    fn entry_names(data: &[u8]) -> Vec<String> {
        let mut archive = tar::Archive::new(data);
        archive
            .entries()
            .unwrap()
            .map(|e| {
                let entry = e.unwrap();
                let path = entry.path().unwrap().to_string_lossy().to_string();
                path.trim_end_matches('/').to_string()
            })
            .collect()
    }

    #[test]
    fn test_ingest_computes_both_ids() {
        let store = LayerStore::temporary().unwrap();
        let data = b"layer contents".to_vec();
        let layer = store.ingest(&data[..]).unwrap();

        assert_eq!(layer.diff_id, crate::oci::manifest::sha256_digest(&data));
        let blob = store.read_blob(&layer.digest).unwrap();
        assert_eq!(layer.digest, crate::oci::manifest::sha256_digest(&blob));
        assert_eq!(layer.size, blob.len() as u64);
        assert!(store.contains(&layer.digest));
    }

    #[test]
    fn test_materialize_roundtrip() {
        let store = LayerStore::temporary().unwrap();
        let layer = store.ingest(&b"hello layer"[..]).unwrap();
        assert_eq!(store.uncompressed(&layer).unwrap(), b"hello layer");
    }

    #[test]
    fn test_materialize_detects_wrong_diff_id() {
        let store = LayerStore::temporary().unwrap();
        let mut layer = store.ingest(&b"hello layer"[..]).unwrap();
        layer.diff_id = "sha256:0000".to_string();
        let err = store.uncompressed(&layer).unwrap_err();
        assert!(err.to_string().contains("diff-id mismatch"));
    }

    #[test]
    fn test_ingest_compressed_verifies_digest() {
        let store = LayerStore::temporary().unwrap();
        let source = LayerStore::temporary().unwrap();
        let layer = source.ingest(&b"payload"[..]).unwrap();
        let blob = source.read_blob(&layer.digest).unwrap();

        let copied = store.ingest_compressed(&layer.digest, &blob).unwrap();
        assert_eq!(copied, layer);
        assert!(store.ingest_compressed("sha256:bad", &blob).is_err());
    }

    #[test]
    fn test_read_missing_blob() {
        let store = LayerStore::temporary().unwrap();
        assert!(matches!(
            store.read_blob("sha256:absent"),
            Err(PackError::NotFound(_))
        ));
    }

    #[test]
    fn test_tar_dir_layout() {
        let tree = sample_tree();
        let data = tar_dir(tree.path(), "/workspace/app", 1000, 1000).unwrap();
        let names = entry_names(&data);
        assert_eq!(
            names,
            vec![
                "workspace",
                "workspace/app",
                "workspace/app/node_modules",
                "workspace/app/node_modules/left-pad",
                "workspace/app/node_modules/left-pad/index.js",
                "workspace/app/package.json",
            ]
        );
    }

    #[test]
    fn test_tar_dir_is_deterministic() {
        let tree = sample_tree();
        let a = tar_dir(tree.path(), "layers/bp/modules", 1000, 1000).unwrap();
        let b = tar_dir(tree.path(), "layers/bp/modules", 1000, 1000).unwrap();
        assert_eq!(a, b);

        let mut archive = tar::Archive::new(&a[..]);
        for entry in archive.entries().unwrap() {
            let entry = entry.unwrap();
            assert_eq!(entry.header().mtime().unwrap(), NORMALIZED_MTIME);
            assert_eq!(entry.header().uid().unwrap(), 1000);
        }
    }

    #[test]
    fn test_tar_dir_missing_source_yields_parents_only() {
        let tmp = TempDir::new().unwrap();
        let data = tar_dir(&tmp.path().join("absent"), "a/b", 0, 0).unwrap();
        assert_eq!(entry_names(&data), vec!["a", "a/b"]);
    }

    #[test]
    fn test_unpack() {
        let tree = sample_tree();
        let data = tar_dir(tree.path(), "app", 0, 0).unwrap();
        let out = TempDir::new().unwrap();
        unpack(&data, out.path()).unwrap();
        assert_eq!(
            fs::read_to_string(out.path().join("app/node_modules/left-pad/index.js")).unwrap(),
            "pad"
        );
    }

    #[test]
    fn test_tar_single_file() {
        let data = tar_single_file("/workspace/group.toml", b"x", 0o644).unwrap();
        assert_eq!(entry_names(&data), vec!["workspace/group.toml"]);
        assert_eq!(read_single_file(&data).unwrap(), b"x");
    }

    #[test]
    fn test_tar_files_ownership() {
        let files = vec![
            ("/layers/bp/a.toml".to_string(), b"launch = true".to_vec()),
            ("/layers/bp/b.toml".to_string(), Vec::new()),
        ];
        let data = tar_files(&files, 0o644, 1000, 1001).unwrap();
        let mut archive = tar::Archive::new(&data[..]);
        for entry in archive.entries().unwrap() {
            let header = entry.unwrap().header().clone();
            assert_eq!(header.uid().unwrap(), 1000);
            assert_eq!(header.gid().unwrap(), 1001);
        }
        assert_eq!(entry_names(&data), vec!["layers/bp/a.toml", "layers/bp/b.toml"]);
    }

    #[test]
    fn test_read_single_file_skips_directories() {
        let tmp = sample_tree();
        let data = tar_dir(&tmp.path().join("node_modules/left-pad"), "lib", 0, 0).unwrap();
        assert_eq!(read_single_file(&data).unwrap(), b"pad");
        let empty = tar_dir(Path::new("/nonexistent"), "lib", 0, 0).unwrap();
        assert!(matches!(read_single_file(&empty), Err(PackError::NotFound(_))));
    }

    #[test]
    fn test_files_in_dir() {
        let tmp = TempDir::new().unwrap();
        let layer = tmp.path().join("node_modules");
        fs::create_dir_all(layer.join("env.launch/nested")).unwrap();
        fs::write(layer.join("env.launch/NODE_PATH"), "/layers/nm").unwrap();
        fs::write(layer.join("env.launch/nested/IGNORED"), "x").unwrap();
        fs::write(layer.join("left-pad.js"), "pad").unwrap();
        let tar = tar_dir(&layer, "/layers/io.buildpacks.nodejs/node_modules", 1000, 1000).unwrap();

        let dir = "/layers/io.buildpacks.nodejs/node_modules/env.launch";
        let files = files_in_dir(&tar, dir).unwrap();
        assert_eq!(files.len(), 1);
        assert_eq!(files["NODE_PATH"], b"/layers/nm");

        let store = LayerStore::temporary().unwrap();
        let ingested = store.ingest(&tar[..]).unwrap();
        let blob = store.read_blob(&ingested.digest).unwrap();
        assert_eq!(files_in_dir(&blob, dir).unwrap(), files);
        assert!(files_in_dir(&tar, "/layers/other").unwrap().is_empty());
    }
}

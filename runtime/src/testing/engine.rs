//! In-process `ContainerEngine`.
//!
//! Images are docker archives, volumes are in-memory file trees, and a
//! started container runs the script registered for its `cmd[0]`.

use std::collections::{BTreeMap, HashMap};
use std::io::Read;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use pack_core::error::{PackError, Result};
use parking_lot::Mutex;

use crate::daemon::{ContainerEngine, ContainerSpec, ImageInspect};
use crate::oci::archive::DockerArchive;
use crate::oci::layers::NORMALIZED_MTIME;
use crate::oci::manifest::{sha256_digest, History};

/// One filesystem entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Node {
    Dir,
    File(Vec<u8>),
    Symlink(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub node: Node,
    pub mode: u32,
    pub uid: u64,
    pub gid: u64,
}

/// Paths relative to the tree root, without leading or trailing `/`.
pub type Tree = BTreeMap<String, Entry>;

fn clean(path: &str) -> String {
    path.split('/')
        .filter(|c| !c.is_empty() && *c != ".")
        .collect::<Vec<_>>()
        .join("/")
}

fn ensure_parents(tree: &mut Tree, path: &str) {
    let mut prefix = String::new();
    let parts: Vec<&str> = path.split('/').collect();
    for part in &parts[..parts.len().saturating_sub(1)] {
        if !prefix.is_empty() {
            prefix.push('/');
        }
        prefix.push_str(part);
        tree.entry(prefix.clone()).or_insert(Entry {
            node: Node::Dir,
            mode: 0o755,
            uid: 0,
            gid: 0,
        });
    }
}

fn apply_tar(tree: &mut Tree, dest: &str, data: &[u8]) -> Result<()> {
    let mut archive = tar::Archive::new(data);
    let entries = archive
        .entries()
        .map_err(|e| PackError::Daemon(format!("bad tar: {}", e)))?;
    for entry in entries {
        let mut entry = entry.map_err(|e| PackError::Daemon(format!("bad tar: {}", e)))?;
        let rel = entry
            .path()
            .map_err(|e| PackError::Daemon(format!("bad tar path: {}", e)))?
            .to_string_lossy()
            .to_string();
        let path = clean(&format!("{}/{}", dest, rel));
        if path.is_empty() {
            continue;
        }
        let header = entry.header().clone();
        let node = match header.entry_type() {
            tar::EntryType::Directory => Node::Dir,
            tar::EntryType::Symlink => Node::Symlink(
                entry
                    .link_name()
                    .ok()
                    .flatten()
                    .map(|l| l.to_string_lossy().to_string())
                    .unwrap_or_default(),
            ),
            _ => {
                let mut contents = Vec::new();
                entry.read_to_end(&mut contents)?;
                Node::File(contents)
            }
        };
        ensure_parents(tree, &path);
        tree.insert(
            path,
            Entry {
                node,
                mode: header.mode().unwrap_or(0o644),
                uid: header.uid().unwrap_or(0),
                gid: header.gid().unwrap_or(0),
            },
        );
    }
    Ok(())
}

/// Tar of everything under `rel`, with entries renamed to start at `name`.
fn tar_subtree(tree: &Tree, rel: &str, name: &str) -> Result<Option<Vec<u8>>> {
    let mut selected: Vec<(String, &Entry)> = Vec::new();
    for (path, entry) in tree {
        let suffix = if rel.is_empty() {
            Some(path.as_str())
        } else if path == rel {
            Some("")
        } else {
            path.strip_prefix(rel).and_then(|p| p.strip_prefix('/'))
        };
        if let Some(suffix) = suffix {
            let out = if suffix.is_empty() {
                name.to_string()
            } else {
                format!("{}/{}", name, suffix)
            };
            selected.push((out, entry));
        }
    }
    if selected.is_empty() && !rel.is_empty() {
        return Ok(None);
    }

    let mut builder = tar::Builder::new(Vec::new());
    if rel.is_empty() {
        append(&mut builder, name, &Entry { node: Node::Dir, mode: 0o755, uid: 0, gid: 0 })?;
    }
    for (path, entry) in selected {
        append(&mut builder, &path, entry)?;
    }
    builder
        .into_inner()
        .map(Some)
        .map_err(|e| PackError::Daemon(e.to_string()))
}

fn append(builder: &mut tar::Builder<Vec<u8>>, path: &str, entry: &Entry) -> Result<()> {
    let mut header = tar::Header::new_gnu();
    header.set_mode(entry.mode);
    header.set_uid(entry.uid);
    header.set_gid(entry.gid);
    header.set_mtime(NORMALIZED_MTIME);
    let result = match &entry.node {
        Node::Dir => {
            header.set_entry_type(tar::EntryType::Directory);
            header.set_size(0);
            builder.append_data(&mut header, path, std::io::empty())
        }
        Node::File(data) => {
            header.set_entry_type(tar::EntryType::Regular);
            header.set_size(data.len() as u64);
            builder.append_data(&mut header, path, &data[..])
        }
        Node::Symlink(target) => {
            header.set_entry_type(tar::EntryType::Symlink);
            header.set_size(0);
            builder.append_link(&mut header, path, target)
        }
    };
    result.map_err(|e| PackError::Daemon(e.to_string()))
}

/// Filesystem seen by a running script: the container root plus its mounts.
pub struct ContainerFs {
    root: Tree,
    /// (mount point, volume name, tree, read-only), longest mount point first
    mounts: Vec<(String, String, Tree, bool)>,
}

impl ContainerFs {
    /// Which tree a path lives in, and its path inside that tree.
    fn resolve(&self, path: &str) -> (Option<usize>, String) {
        let path = clean(path);
        for (i, (target, _, _, _)) in self.mounts.iter().enumerate() {
            if path == *target {
                return (Some(i), String::new());
            }
            let rest = path
                .strip_prefix(target.as_str())
                .and_then(|r| r.strip_prefix('/'));
            if let Some(rest) = rest {
                return (Some(i), rest.to_string());
            }
        }
        (None, path)
    }

    fn tree(&self, index: Option<usize>) -> &Tree {
        match index {
            Some(i) => &self.mounts[i].2,
            None => &self.root,
        }
    }

    fn tree_mut(&mut self, index: Option<usize>) -> std::io::Result<&mut Tree> {
        match index {
            Some(i) if self.mounts[i].3 => Err(std::io::Error::new(
                std::io::ErrorKind::PermissionDenied,
                format!("/{} is mounted read-only", self.mounts[i].0),
            )),
            Some(i) => Ok(&mut self.mounts[i].2),
            None => Ok(&mut self.root),
        }
    }
}

/// Handle given to phase scripts.
pub struct ScriptContext<'a> {
    pub args: &'a [String],
    pub env: &'a HashMap<String, String>,
    pub user: (u64, u64),
    working_dir: String,
    fs: &'a mut ContainerFs,
    output: &'a mut Vec<String>,
}

impl ScriptContext<'_> {
    fn absolute(&self, path: &str) -> String {
        if path.starts_with('/') {
            path.to_string()
        } else {
            format!("{}/{}", self.working_dir, path)
        }
    }

    pub fn env(&self, key: &str) -> Option<&str> {
        self.env.get(key).map(String::as_str)
    }

    pub fn println(&mut self, line: impl Into<String>) {
        self.output.push(line.into());
    }

    pub fn exists(&self, path: &str) -> bool {
        let (index, rel) = self.fs.resolve(&self.absolute(path));
        rel.is_empty() || self.fs.tree(index).contains_key(&rel)
    }

    pub fn read(&self, path: &str) -> Option<Vec<u8>> {
        let (index, rel) = self.fs.resolve(&self.absolute(path));
        match &self.fs.tree(index).get(&rel)?.node {
            Node::File(data) => Some(data.clone()),
            _ => None,
        }
    }

    pub fn read_string(&self, path: &str) -> Option<String> {
        self.read(path).map(|d| String::from_utf8_lossy(&d).to_string())
    }

    /// Immediate children of a directory, sorted.
    pub fn list(&self, dir: &str) -> Vec<String> {
        let (index, rel) = self.fs.resolve(&self.absolute(dir));
        self.fs
            .tree(index)
            .keys()
            .filter_map(|path| {
                let rest = if rel.is_empty() {
                    Some(path.as_str())
                } else {
                    path.strip_prefix(rel.as_str()).and_then(|p| p.strip_prefix('/'))
                }?;
                (!rest.is_empty() && !rest.contains('/')).then(|| rest.to_string())
            })
            .collect()
    }

    pub fn write(&mut self, path: &str, contents: impl AsRef<[u8]>) -> std::io::Result<()> {
        let (uid, gid) = self.user;
        let (index, rel) = self.fs.resolve(&self.absolute(path));
        let tree = self.fs.tree_mut(index)?;
        ensure_parents(tree, &rel);
        tree.insert(
            rel,
            Entry {
                node: Node::File(contents.as_ref().to_vec()),
                mode: 0o644,
                uid,
                gid,
            },
        );
        Ok(())
    }

    pub fn mkdir(&mut self, path: &str) -> std::io::Result<()> {
        let (uid, gid) = self.user;
        let (index, rel) = self.fs.resolve(&self.absolute(path));
        if rel.is_empty() {
            return Ok(());
        }
        let tree = self.fs.tree_mut(index)?;
        ensure_parents(tree, &rel);
        tree.entry(rel).or_insert(Entry {
            node: Node::Dir,
            mode: 0o755,
            uid,
            gid,
        });
        Ok(())
    }

    /// Remove a path and everything below it.
    pub fn remove(&mut self, path: &str) -> std::io::Result<()> {
        let (index, rel) = self.fs.resolve(&self.absolute(path));
        let tree = self.fs.tree_mut(index)?;
        let prefix = format!("{}/", rel);
        tree.retain(|p, _| p != &rel && !p.starts_with(&prefix));
        Ok(())
    }
}

/// A phase binary, returning its exit code.
pub type Script = Arc<dyn Fn(&mut ScriptContext<'_>) -> i64 + Send + Sync>;

#[derive(Clone)]
struct Container {
    spec: ContainerSpec,
    root: Tree,
    exit_code: Option<i64>,
    output: Vec<String>,
}

#[derive(Default)]
struct State {
    images: HashMap<String, DockerArchive>,
    pullable: HashMap<String, DockerArchive>,
    volumes: HashMap<String, Tree>,
    containers: HashMap<String, Container>,
    created: Vec<String>,
    pulls: Vec<String>,
}

/// Container engine that runs registered scripts in-process.
#[derive(Default)]
pub struct FakeEngine {
    state: Mutex<State>,
    scripts: Mutex<HashMap<String, Script>>,
}

/// `name[:tag]` with the implicit tag made explicit.
fn image_key(reference: &str) -> String {
    if reference.contains('@') {
        return reference.to_string();
    }
    let slash = reference.rfind('/').map(|i| i + 1).unwrap_or(0);
    if reference[slash..].contains(':') {
        reference.to_string()
    } else {
        format!("{}:latest", reference)
    }
}

fn parse_user(user: Option<&str>) -> (u64, u64) {
    let Some(user) = user else { return (0, 0) };
    let (uid, gid) = user.split_once(':').unwrap_or((user, user));
    (uid.parse().unwrap_or(0), gid.parse().unwrap_or(0))
}

fn rootfs(archive: &DockerArchive) -> Result<Tree> {
    let mut tree = Tree::new();
    for layer in &archive.layers {
        apply_tar(&mut tree, "", layer)?;
    }
    Ok(tree)
}

impl FakeEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the behaviour of the binary at `path`.
    pub fn script<F>(&self, path: &str, f: F)
    where
        F: Fn(&mut ScriptContext<'_>) -> i64 + Send + Sync + 'static,
    {
        self.scripts.lock().insert(path.to_string(), Arc::new(f));
    }

    /// Put an image into the daemon.
    pub fn add_image(&self, reference: &str, mut archive: DockerArchive) {
        archive.repo_tags = vec![image_key(reference)];
        self.state.lock().images.insert(image_key(reference), archive);
    }

    /// Make an image available to `pull_image` without loading it.
    pub fn add_pullable(&self, reference: &str, archive: DockerArchive) {
        self.state.lock().pullable.insert(image_key(reference), archive);
    }

    pub fn image(&self, reference: &str) -> Option<DockerArchive> {
        self.state.lock().images.get(&image_key(reference)).cloned()
    }

    /// Names of every container ever created.
    pub fn created_containers(&self) -> Vec<String> {
        self.state.lock().created.clone()
    }

    /// Containers not yet removed.
    pub fn live_containers(&self) -> Vec<String> {
        let mut names: Vec<String> = self.state.lock().containers.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn volumes(&self) -> Vec<String> {
        let mut names: Vec<String> = self.state.lock().volumes.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn volume(&self, name: &str) -> Option<Tree> {
        self.state.lock().volumes.get(name).cloned()
    }

    pub fn pulls(&self) -> Vec<String> {
        self.state.lock().pulls.clone()
    }

    /// Files under `path` in an image's filesystem.
    pub fn image_file(&self, reference: &str, path: &str) -> Option<Vec<u8>> {
        let archive = self.image(reference)?;
        let tree = rootfs(&archive).ok()?;
        match &tree.get(&clean(path))?.node {
            Node::File(data) => Some(data.clone()),
            _ => None,
        }
    }

    fn run_script(&self, container: &mut Container, volumes: &mut HashMap<String, Tree>) {
        let mut mounts: Vec<(String, String, Tree, bool)> = container
            .spec
            .binds
            .iter()
            .map(|b| {
                let tree = volumes.remove(&b.volume).unwrap_or_default();
                (clean(&b.target), b.volume.clone(), tree, b.read_only)
            })
            .collect();
        mounts.sort_by(|a, b| b.0.len().cmp(&a.0.len()));
        let mut fs = ContainerFs {
            root: std::mem::take(&mut container.root),
            mounts,
        };

        let env: HashMap<String, String> = container.spec.env.iter().cloned().collect();
        let mut output = Vec::new();
        let args = container.spec.cmd.clone();
        let program = args.first().cloned().unwrap_or_default();
        let script = self.scripts.lock().get(&program).cloned();
        let user = parse_user(container.spec.user.as_deref());

        let exit_code = match (program.as_str(), script) {
            (_, Some(script)) => {
                let mut ctx = ScriptContext {
                    args: &args,
                    env: &env,
                    user,
                    working_dir: container.spec.working_dir.clone().unwrap_or_default(),
                    fs: &mut fs,
                    output: &mut output,
                };
                script(&mut ctx)
            }
            ("chown", None) => chown(&mut fs, &args[1..]),
            (other, None) => {
                output.push(format!("exec: \"{}\": executable file not found", other));
                127
            }
        };

        container.root = fs.root;
        for (_, volume, tree, _) in fs.mounts {
            volumes.insert(volume, tree);
        }
        container.exit_code = Some(exit_code);
        container.output = output;
    }

    fn with_container<T>(
        &self,
        id: &str,
        f: impl FnOnce(&mut Container, &mut HashMap<String, Tree>) -> Result<T>,
    ) -> Result<T> {
        let mut state = self.state.lock();
        let State {
            containers,
            volumes,
            ..
        } = &mut *state;
        let container = containers
            .get_mut(id)
            .ok_or_else(|| PackError::NotFound(format!("container {}", id)))?;
        f(container, volumes)
    }
}

/// `chown [-R] uid:gid path…`
fn chown(fs: &mut ContainerFs, args: &[String]) -> i64 {
    let args: Vec<&String> = args.iter().filter(|a| *a != "-R").collect();
    let Some((owner, paths)) = args.split_first() else {
        return 1;
    };
    let (uid, gid) = parse_user(Some(owner.as_str()));
    for path in paths {
        let (index, rel) = fs.resolve(path);
        let Ok(tree) = fs.tree_mut(index) else {
            return 1;
        };
        let prefix = format!("{}/", rel);
        for (p, entry) in tree.iter_mut() {
            if rel.is_empty() || *p == rel || p.starts_with(&prefix) {
                entry.uid = uid;
                entry.gid = gid;
            }
        }
    }
    0
}

#[async_trait]
impl ContainerEngine for FakeEngine {
    async fn pull_image(&self, reference: &str) -> Result<()> {
        let mut state = self.state.lock();
        state.pulls.push(reference.to_string());
        let key = image_key(reference);
        let archive = state
            .pullable
            .get(&key)
            .cloned()
            .ok_or_else(|| PackError::NotFound(format!("image {}", reference)))?;
        state.images.insert(key, archive);
        Ok(())
    }

    async fn image_exists(&self, reference: &str) -> Result<bool> {
        Ok(self.state.lock().images.contains_key(&image_key(reference)))
    }

    async fn inspect_image(&self, reference: &str) -> Result<ImageInspect> {
        let archive = self
            .image(reference)
            .ok_or_else(|| PackError::NotFound(format!("image {}", reference)))?;
        let config = &archive.config.config;
        Ok(ImageInspect {
            id: archive.image_id()?,
            labels: config.labels.clone().unwrap_or_default(),
            env: config.env.clone().unwrap_or_default(),
            user: config.user.clone(),
        })
    }

    async fn create_container(&self, spec: &ContainerSpec) -> Result<String> {
        let archive = self
            .image(&spec.image)
            .ok_or_else(|| PackError::NotFound(format!("image {}", spec.image)))?;
        let root = rootfs(&archive)?;
        let mut state = self.state.lock();
        if state.containers.contains_key(&spec.name) {
            return Err(PackError::Daemon(format!(
                "Conflict. The container name \"/{}\" is already in use",
                spec.name
            )));
        }
        for bind in &spec.binds {
            state.volumes.entry(bind.volume.clone()).or_default();
        }
        state.created.push(spec.name.clone());
        state.containers.insert(
            spec.name.clone(),
            Container {
                spec: spec.clone(),
                root,
                exit_code: None,
                output: Vec::new(),
            },
        );
        Ok(spec.name.clone())
    }

    async fn start_container(&self, id: &str) -> Result<()> {
        let (mut container, mut volumes) = {
            let mut state = self.state.lock();
            let container = state
                .containers
                .get(id)
                .cloned()
                .ok_or_else(|| PackError::NotFound(format!("container {}", id)))?;
            let volumes = std::mem::take(&mut state.volumes);
            (container, volumes)
        };
        self.run_script(&mut container, &mut volumes);
        let mut state = self.state.lock();
        state.volumes.extend(volumes);
        state.containers.insert(id.to_string(), container);
        Ok(())
    }

    async fn wait_container(&self, id: &str) -> Result<i64> {
        self.with_container(id, |c, _| {
            c.exit_code
                .ok_or_else(|| PackError::Daemon(format!("container {} was never started", id)))
        })
    }

    async fn container_logs(&self, id: &str) -> Result<Vec<String>> {
        self.with_container(id, |c, _| Ok(c.output.clone()))
    }

    async fn copy_in(&self, id: &str, dest: &str, tar: Bytes) -> Result<()> {
        self.with_container(id, |container, volumes| {
            // Split the archive per mount by applying it to a scratch tree first.
            let mut scratch = Tree::new();
            apply_tar(&mut scratch, dest, &tar)?;
            let fs_mounts: Vec<(String, String, bool)> = container
                .spec
                .binds
                .iter()
                .map(|b| (clean(&b.target), b.volume.clone(), b.read_only))
                .collect();
            for (path, entry) in scratch {
                let mount = fs_mounts.iter().find(|(target, _, _)| {
                    path == *target || path.starts_with(&format!("{}/", target))
                });
                match mount {
                    Some((target, volume, read_only)) => {
                        if *read_only {
                            return Err(PackError::Daemon(format!(
                                "/{} is mounted read-only",
                                target
                            )));
                        }
                        let rel = path[target.len()..].trim_start_matches('/').to_string();
                        if !rel.is_empty() {
                            volumes.entry(volume.clone()).or_default().insert(rel, entry);
                        }
                    }
                    None => {
                        container.root.insert(path, entry);
                    }
                }
            }
            Ok(())
        })
    }

    async fn copy_out(&self, id: &str, src: &str) -> Result<Bytes> {
        self.with_container(id, |container, volumes| {
            let path = clean(src);
            let name = path.rsplit('/').next().unwrap_or("").to_string();
            let mount = container.spec.binds.iter().find(|b| {
                let target = clean(&b.target);
                path == target || path.starts_with(&format!("{}/", target))
            });
            let data = match mount {
                Some(bind) => {
                    let rel = path[clean(&bind.target).len()..]
                        .trim_start_matches('/')
                        .to_string();
                    let empty = Tree::new();
                    let tree = volumes.get(&bind.volume).unwrap_or(&empty);
                    tar_subtree(tree, &rel, &name)?
                }
                None => tar_subtree(&container.root, &path, &name)?,
            };
            data.map(Bytes::from).ok_or_else(|| {
                PackError::NotFound(format!("{} in container {}", src, id))
            })
        })
    }

    async fn commit(&self, id: &str, reference: &str) -> Result<String> {
        let (image, root) =
            self.with_container(id, |c, _| Ok((c.spec.image.clone(), c.root.clone())))?;
        let mut archive = self
            .image(&image)
            .ok_or_else(|| PackError::NotFound(format!("image {}", image)))?;
        let layer = tar_subtree(&root, "", ".")?.unwrap_or_default();
        archive.config.rootfs.diff_ids.push(sha256_digest(&layer));
        archive
            .config
            .history
            .push(History::layer("1980-01-01T00:00:01Z", format!("commit {}", id)));
        archive.layers.push(Bytes::from(layer));
        let image_id = archive.image_id()?;
        self.add_image(reference, archive);
        Ok(image_id)
    }

    async fn kill_container(&self, id: &str) -> Result<()> {
        self.with_container(id, |_, _| Ok(()))
    }

    async fn remove_container(&self, id: &str) -> Result<()> {
        self.state
            .lock()
            .containers
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| PackError::NotFound(format!("container {}", id)))
    }

    async fn volume_exists(&self, name: &str) -> Result<bool> {
        Ok(self.state.lock().volumes.contains_key(name))
    }

    async fn create_volume(&self, name: &str) -> Result<()> {
        self.state.lock().volumes.entry(name.to_string()).or_default();
        Ok(())
    }

    async fn remove_volume(&self, name: &str) -> Result<()> {
        self.state.lock().volumes.remove(name);
        Ok(())
    }

    async fn save_image(&self, reference: &str) -> Result<Bytes> {
        let archive = self
            .image(reference)
            .ok_or_else(|| PackError::NotFound(format!("image {}", reference)))?;
        Ok(Bytes::from(archive.write()?))
    }

    async fn load_image(&self, archive: Bytes) -> Result<()> {
        let archive = DockerArchive::read(&archive)?;
        let tags = archive.repo_tags.clone();
        for tag in tags {
            self.add_image(&tag, archive.clone());
        }
        Ok(())
    }

    async fn remove_image(&self, reference: &str, _force: bool) -> Result<()> {
        self.state
            .lock()
            .images
            .remove(&image_key(reference))
            .map(|_| ())
            .ok_or_else(|| PackError::NotFound(format!("image {}", reference)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::daemon::Bind;
    use crate::testing::image_from_files;
    use pack_core::context::OperationContext;

    fn engine() -> FakeEngine {
        let engine = FakeEngine::new();
        engine.add_image(
            "packs/build",
            image_from_files(&[("lifecycle/launcher", "launcher")], &[]),
        );
        engine
    }

    #[tokio::test]
    async fn test_copy_in_lands_in_volume() {
        let engine = engine();
        let spec =
            ContainerSpec::new("c1", "packs/build").bind(Bind::read_write("ws", "/workspace"));
        let id = engine.create_container(&spec).await.unwrap();
        let tar =
            crate::oci::layers::tar_single_file("workspace/app/index.js", b"js", 0o644).unwrap();
        engine.copy_in(&id, "/", Bytes::from(tar)).await.unwrap();

        let volume = engine.volume("ws").unwrap();
        assert_eq!(volume["app/index.js"].node, Node::File(b"js".to_vec()));
    }

    #[tokio::test]
    async fn test_copy_out_rooted_at_basename() {
        let engine = engine();
        let spec = ContainerSpec::new("c1", "packs/build");
        let id = engine.create_container(&spec).await.unwrap();
        let tar = engine.copy_out(&id, "/lifecycle/launcher").await.unwrap();
        let mut archive = tar::Archive::new(&tar[..]);
        let names: Vec<String> = archive
            .entries()
            .unwrap()
            .map(|e| e.unwrap().path().unwrap().to_string_lossy().to_string())
            .collect();
        assert_eq!(names, vec!["launcher"]);

        assert!(matches!(
            engine.copy_out(&id, "/missing").await.unwrap_err(),
            PackError::NotFound(_)
        ));
    }

    #[tokio::test]
    async fn test_run_script_with_volume() {
        let engine = engine();
        engine.script("/bin/hello", |ctx| {
            let name = ctx.env("NAME").unwrap_or("nobody").to_string();
            ctx.write("/workspace/out.txt", format!("hello {}", name)).unwrap();
            ctx.println("wrote greeting");
            0
        });
        let spec = ContainerSpec::new("c1", "packs/build")
            .cmd(["/bin/hello"])
            .env("NAME", "pack")
            .bind(Bind::read_write("ws", "/workspace"));
        let run = engine
            .run_container(&OperationContext::new(), &spec)
            .await
            .unwrap();
        assert!(run.success());
        assert_eq!(run.output, vec!["wrote greeting"]);
        assert_eq!(
            engine.volume("ws").unwrap()["out.txt"].node,
            Node::File(b"hello pack".to_vec())
        );
    }

    #[tokio::test]
    async fn test_read_only_mount_rejects_writes() {
        let engine = engine();
        engine.script("/bin/touch", |ctx| match ctx.write("/layers/x", "x") {
            Ok(()) => 0,
            Err(_) => 1,
        });
        let spec = ContainerSpec::new("c1", "packs/build")
            .cmd(["/bin/touch"])
            .bind(Bind::read_only("cache", "/layers"));
        let run = engine
            .run_container(&OperationContext::new(), &spec)
            .await
            .unwrap();
        assert_eq!(run.exit_code, 1);
    }

    #[tokio::test]
    async fn test_unknown_binary_exits_127() {
        let engine = engine();
        let spec = ContainerSpec::new("c1", "packs/build").cmd(["/bin/missing"]);
        let run = engine
            .run_container(&OperationContext::new(), &spec)
            .await
            .unwrap();
        assert_eq!(run.exit_code, 127);
    }

    #[tokio::test]
    async fn test_name_conflict_and_remove() {
        let engine = engine();
        let spec = ContainerSpec::new("c1", "packs/build");
        engine.create_container(&spec).await.unwrap();
        assert!(engine.create_container(&spec).await.is_err());
        engine.remove_container("c1").await.unwrap();
        assert!(engine.live_containers().is_empty());
        engine.create_container(&spec).await.unwrap();
    }

    #[tokio::test]
    async fn test_save_load_and_commit() {
        let engine = engine();
        let saved = engine.save_image("packs/build").await.unwrap();
        engine.remove_image("packs/build", true).await.unwrap();
        assert!(!engine.image_exists("packs/build").await.unwrap());
        engine.load_image(saved).await.unwrap();
        assert!(engine.image_exists("packs/build:latest").await.unwrap());

        engine.script("/bin/mark", |ctx| {
            ctx.write("/marker", "m").unwrap();
            0
        });
        let spec = ContainerSpec::new("c1", "packs/build").cmd(["/bin/mark"]);
        engine
            .run_container(&OperationContext::new(), &spec)
            .await
            .unwrap();
        let id = engine.commit("c1", "local/marked").await.unwrap();
        assert_eq!(engine.inspect_image("local/marked").await.unwrap().id, id);
        assert_eq!(engine.image_file("local/marked", "/marker").unwrap(), b"m");
    }

    #[tokio::test]
    async fn test_pull() {
        let engine = FakeEngine::new();
        engine.add_pullable("packs/run", image_from_files(&[], &[]));
        assert!(engine.pull_image("packs/nothing").await.is_err());
        engine.pull_image("packs/run").await.unwrap();
        assert!(engine.image_exists("packs/run").await.unwrap());
        assert_eq!(engine.pulls(), vec!["packs/nothing", "packs/run"]);
    }
}

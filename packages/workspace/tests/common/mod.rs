// ABOUTME: In-memory fakes shared by the workspace integration tests
// ABOUTME: Simulates a container runtime, object storage and injected store failures

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::SinkExt;
use std::collections::{BTreeMap, HashMap};
use std::io::{Cursor, Read};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio_util::codec::FramedWrite;

use sandcastle_workspace::archive::gzip;
use sandcastle_workspace::demux::FrameCodec;
use sandcastle_workspace::files;
use sandcastle_workspace::object_store::{self, ObjectStore, ObjectStoreError, UploadResult};
use sandcastle_workspace::runtime::{
    self, BoxedReader, ContainerDetails, ContainerRuntime, OutputChunk, OutputStream,
    RuntimeError,
};
use sandcastle_workspace::store::{self, Project, ProjectStore, SqliteProjectStore, StorageError};
use sandcastle_workspace::{
    ControllerSettings, ExecOutput, ShellSession, WorkspaceController, WorkspaceStatus,
};

pub const IMAGE: &str = "code-workspace:latest";

/// Absolute path to contents; `None` marks a directory.
pub type FileTree = BTreeMap<String, Option<Vec<u8>>>;

struct FakeContainer {
    id: String,
    image: String,
    running: bool,
    created_at: DateTime<Utc>,
    files: FileTree,
}

#[derive(Default)]
struct FakeState {
    /// Keyed by container name, which is the project id.
    containers: HashMap<String, FakeContainer>,
    removed: Vec<String>,
    loaded_images: Vec<usize>,
}

impl FakeState {
    fn find(&mut self, reference: &str) -> Option<&mut FakeContainer> {
        let name = self
            .containers
            .iter()
            .find(|(name, c)| name.as_str() == reference || c.id == reference)
            .map(|(name, _)| name.clone())?;
        self.containers.get_mut(&name)
    }
}

fn absolute(path: &str) -> String {
    let path = path.trim_end_matches('/');
    if path.starts_with('/') {
        path.to_string()
    } else {
        format!("{}/{}", runtime::WORKSPACE_DIR, path)
    }
}

fn add_dir(tree: &mut FileTree, path: &str) {
    let mut current = String::new();
    for segment in path.split('/').filter(|s| !s.is_empty()) {
        current.push('/');
        current.push_str(segment);
        tree.entry(current.clone()).or_insert(None);
    }
}

fn add_file(tree: &mut FileTree, path: &str, contents: Vec<u8>) {
    if let Some((parent, _)) = path.rsplit_once('/') {
        add_dir(tree, parent);
    }
    tree.insert(path.to_string(), Some(contents));
}

fn ok(stdout: impl Into<String>) -> ExecOutput {
    ExecOutput {
        stdout: stdout.into(),
        stderr: String::new(),
        exit_code: Some(0),
    }
}

fn failed(code: i64, stderr: impl Into<String>) -> ExecOutput {
    ExecOutput {
        stdout: String::new(),
        stderr: stderr.into(),
        exit_code: Some(code),
    }
}

fn listing(tree: &FileTree) -> String {
    let prefix = format!("{}/", runtime::WORKSPACE_DIR);
    tree.iter()
        .filter_map(|(path, contents)| {
            let relative = path.strip_prefix(&prefix)?;
            if relative
                .split('/')
                .any(|segment| files::IGNORED_DIRS.contains(&segment))
            {
                return None;
            }
            let kind = if contents.is_none() { "d" } else { "f" };
            Some(format!("{}\t{}\n", kind, relative))
        })
        .collect()
}

fn children(tree: &FileTree, dir: &str) -> Option<String> {
    if !matches!(tree.get(dir), Some(None)) {
        return None;
    }
    Some(
        tree.iter()
            .filter_map(|(path, contents)| {
                let (parent, name) = path.rsplit_once('/')?;
                (parent == dir).then(|| match contents {
                    None => format!("{}/\n", name),
                    Some(_) => format!("{}\n", name),
                })
            })
            .collect(),
    )
}

/// The handful of commands the tests drive through exec.
fn run_argv(tree: &mut FileTree, argv: &[String]) -> ExecOutput {
    if argv == files::list_command().as_slice() {
        return ok(listing(tree));
    }

    let args: Vec<&str> = argv.iter().map(String::as_str).collect();
    match args.as_slice() {
        ["mkdir", "-p", path] | ["mkdir", path] => {
            add_dir(tree, &absolute(path));
            ok("")
        }
        ["cat", "--", path] => match tree.get(&absolute(path)) {
            Some(Some(contents)) => ok(String::from_utf8_lossy(contents)),
            Some(None) => failed(1, format!("cat: {}: Is a directory\n", path)),
            None => failed(1, format!("cat: {}: No such file or directory\n", path)),
        },
        ["ls", "-1Ap", path] => match children(tree, &absolute(path)) {
            Some(names) => ok(names),
            None => failed(2, format!("ls: cannot access '{}'\n", path)),
        },
        ["echo", rest @ ..] => ok(format!("{}\n", rest.join(" "))),
        ["true"] | ["sleep", _] => ok(""),
        ["false"] => failed(1, ""),
        [command, ..] => failed(127, format!("{}: command not found\n", command)),
        [] => ok(""),
    }
}

fn run_shell_line(tree: &mut FileTree, command: &str) -> ExecOutput {
    let command = command.trim();
    if let Some(code) = command
        .strip_prefix("(exit ")
        .and_then(|rest| rest.strip_suffix(')'))
    {
        return failed(code.trim().parse().unwrap_or(1), "");
    }
    let argv: Vec<String> = command.split_whitespace().map(str::to_string).collect();
    run_argv(tree, &argv)
}

fn tar_tree(tree: &FileTree) -> std::io::Result<Vec<u8>> {
    let mut builder = tar::Builder::new(Vec::new());
    for (path, contents) in tree {
        if path != runtime::WORKSPACE_DIR && !path.starts_with(&format!("{}/", runtime::WORKSPACE_DIR))
        {
            continue;
        }
        let name = path.trim_start_matches('/');
        let mut header = tar::Header::new_gnu();
        header.set_mtime(0);
        match contents {
            None => {
                header.set_entry_type(tar::EntryType::Directory);
                header.set_mode(0o755);
                header.set_size(0);
                builder.append_data(&mut header, format!("{}/", name), std::io::empty())?;
            }
            Some(bytes) => {
                header.set_entry_type(tar::EntryType::Regular);
                header.set_mode(0o644);
                header.set_size(bytes.len() as u64);
                builder.append_data(&mut header, name, &bytes[..])?;
            }
        }
    }
    builder.into_inner()
}

/// Entries of an uncompressed tar as a file tree rooted at `/`.
pub fn untar(bytes: &[u8]) -> std::io::Result<FileTree> {
    let mut tree = FileTree::new();
    untar_into(&mut tree, bytes)?;
    Ok(tree)
}

fn untar_into(tree: &mut FileTree, bytes: &[u8]) -> std::io::Result<()> {
    let mut archive = tar::Archive::new(bytes);
    for entry in archive.entries()? {
        let mut entry = entry?;
        let path = format!(
            "/{}",
            entry.path()?.to_string_lossy().trim_end_matches('/')
        );
        if entry.header().entry_type() == tar::EntryType::Directory {
            add_dir(tree, &path);
        } else {
            let mut contents = Vec::new();
            entry.read_to_end(&mut contents)?;
            add_file(tree, &path, contents);
        }
    }
    Ok(())
}

/// Decompress a gzip artifact with an independent implementation.
pub fn gunzip_with_flate2(bytes: &[u8]) -> Vec<u8> {
    let mut out = Vec::new();
    flate2::read::GzDecoder::new(bytes)
        .read_to_end(&mut out)
        .expect("artifact should be valid gzip");
    out
}

/// Container runtime that keeps each container's filesystem in memory.
pub struct FakeRuntime {
    state: Arc<Mutex<FakeState>>,
    creates: AtomicUsize,
    create_delay: Duration,
    pub fail_export: AtomicBool,
    pub fail_import: AtomicBool,
    pub fail_remove: AtomicBool,
}

impl FakeRuntime {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(FakeState::default())),
            creates: AtomicUsize::new(0),
            create_delay: Duration::from_millis(20),
            fail_export: AtomicBool::new(false),
            fail_import: AtomicBool::new(false),
            fail_remove: AtomicBool::new(false),
        }
    }

    pub fn creates(&self) -> usize {
        self.creates.load(Ordering::SeqCst)
    }

    pub fn removed(&self) -> Vec<String> {
        self.state.lock().unwrap().removed.clone()
    }

    pub fn loaded_images(&self) -> Vec<usize> {
        self.state.lock().unwrap().loaded_images.clone()
    }

    pub fn container_count(&self) -> usize {
        self.state.lock().unwrap().containers.len()
    }

    /// Filesystem of the container named after `project_id`.
    pub fn files(&self, project_id: &str) -> Option<FileTree> {
        self.state
            .lock()
            .unwrap()
            .containers
            .get(project_id)
            .map(|c| c.files.clone())
    }

    pub fn seed_file(&self, project_id: &str, path: &str, contents: &[u8]) {
        let mut state = self.state.lock().unwrap();
        let container = state
            .containers
            .get_mut(project_id)
            .expect("container should exist");
        add_file(&mut container.files, &absolute(path), contents.to_vec());
    }

    /// A container created behind the controller's back, as if left by an earlier process.
    pub async fn spawn_orphan(&self, project_id: &str) -> String {
        self.create_container(project_id, IMAGE)
            .await
            .expect("Failed to create orphan container")
    }

    pub fn stop(&self, project_id: &str) {
        let mut state = self.state.lock().unwrap();
        if let Some(container) = state.containers.get_mut(project_id) {
            container.running = false;
        }
    }

    fn export_tar(&self, container_id: &str) -> runtime::Result<Vec<u8>> {
        let mut state = self.state.lock().unwrap();
        let container = state
            .find(container_id)
            .ok_or_else(|| RuntimeError::NotFound(container_id.to_string()))?;
        Ok(tar_tree(&container.files)?)
    }

    fn spawn_shell(&self, container_id: String) -> ShellSession {
        let (client, server) = tokio::io::duplex(64 * 1024);
        let (client_read, client_write) = tokio::io::split(client);
        let (server_read, server_write) = tokio::io::split(server);
        let state = self.state.clone();

        tokio::spawn(async move {
            let mut lines = BufReader::new(server_read).lines();
            let mut frames = FramedWrite::new(server_write, FrameCodec);
            while let Ok(Some(line)) = lines.next_line().await {
                let Some((command, tail)) = line.rsplit_once("; echo ") else {
                    continue;
                };
                let marker = tail.trim_end_matches("$?").to_string();
                if let Some(secs) = command
                    .trim()
                    .strip_prefix("sleep ")
                    .and_then(|secs| secs.trim().parse::<f64>().ok())
                {
                    tokio::time::sleep(Duration::from_secs_f64(secs)).await;
                }
                let output = {
                    let mut state = state.lock().unwrap();
                    match state.find(&container_id) {
                        Some(container) => run_shell_line(&mut container.files, command),
                        None => break,
                    }
                };
                let code = output.exit_code.unwrap_or(0).to_string();
                let chunks = vec![
                    OutputChunk::stdout(output.stdout),
                    OutputChunk::stderr(output.stderr),
                    OutputChunk::stdout(marker),
                    OutputChunk::stdout(format!("{}\n", code)),
                ];
                for chunk in chunks {
                    if chunk.data.is_empty() {
                        continue;
                    }
                    if frames.send(chunk).await.is_err() {
                        return;
                    }
                }
            }
        });

        ShellSession::from_multiplexed(client_read, client_write)
    }
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    async fn ensure_image(&self, _image: &str) -> runtime::Result<Vec<String>> {
        Ok(Vec::new())
    }

    async fn create_container(&self, project_id: &str, image: &str) -> runtime::Result<String> {
        tokio::time::sleep(self.create_delay).await;

        let mut state = self.state.lock().unwrap();
        if state.containers.contains_key(project_id) {
            return Err(RuntimeError::WorkspaceExists(project_id.to_string()));
        }
        let n = self.creates.fetch_add(1, Ordering::SeqCst) + 1;
        let id = format!("ctr-{}", n);
        let mut files = FileTree::new();
        add_dir(&mut files, runtime::WORKSPACE_DIR);
        state.containers.insert(
            project_id.to_string(),
            FakeContainer {
                id: id.clone(),
                image: image.to_string(),
                running: true,
                created_at: Utc::now(),
                files,
            },
        );
        Ok(id)
    }

    async fn start_container(&self, container_id: &str) -> runtime::Result<()> {
        let mut state = self.state.lock().unwrap();
        let container = state
            .find(container_id)
            .ok_or_else(|| RuntimeError::NotFound(container_id.to_string()))?;
        container.running = true;
        Ok(())
    }

    async fn open_shell(&self, container_id: &str) -> runtime::Result<ShellSession> {
        let id = {
            let mut state = self.state.lock().unwrap();
            let container = state
                .find(container_id)
                .ok_or_else(|| RuntimeError::NotFound(container_id.to_string()))?;
            if !container.running {
                return Err(RuntimeError::Exec(format!("{} is not running", container_id)));
            }
            container.id.clone()
        };
        Ok(self.spawn_shell(id))
    }

    async fn inspect(&self, container_id: &str) -> runtime::Result<Option<ContainerDetails>> {
        let mut state = self.state.lock().unwrap();
        Ok(state.find(container_id).map(|c| ContainerDetails {
            id: c.id.clone(),
            image: c.image.clone(),
            status: if c.running { "running" } else { "exited" }.to_string(),
            created_at: c.created_at,
        }))
    }

    async fn exec_one_shot(
        &self,
        container_id: &str,
        argv: &[String],
    ) -> runtime::Result<ExecOutput> {
        let mut state = self.state.lock().unwrap();
        let container = state
            .find(container_id)
            .ok_or_else(|| RuntimeError::NotFound(container_id.to_string()))?;
        Ok(run_argv(&mut container.files, argv))
    }

    async fn watch_files(&self, container_id: &str) -> runtime::Result<OutputStream> {
        let lines: String = {
            let mut state = self.state.lock().unwrap();
            let container = state
                .find(container_id)
                .ok_or_else(|| RuntimeError::NotFound(container_id.to_string()))?;
            container
                .files
                .iter()
                .filter(|(path, _)| path.as_str() != runtime::WORKSPACE_DIR)
                .map(|(path, contents)| match contents {
                    None => format!("CREATE,ISDIR|{}\n", path),
                    Some(_) => format!("CREATE|{}\n", path),
                })
                .collect()
        };

        // Deliver in small pieces so lines straddle chunk boundaries
        let chunks: Vec<runtime::Result<OutputChunk>> = lines
            .into_bytes()
            .chunks(7)
            .map(|piece| Ok(OutputChunk::stdout(piece.to_vec())))
            .collect();
        Ok(Box::pin(futures::stream::iter(chunks)))
    }

    async fn export_filesystem(&self, container_id: &str) -> runtime::Result<BoxedReader> {
        if self.fail_export.load(Ordering::SeqCst) {
            return Err(RuntimeError::Export("injected export failure".to_string()));
        }
        let tar = self.export_tar(container_id)?;
        Ok(gzip(Cursor::new(tar)))
    }

    async fn export_container(&self, container_id: &str) -> runtime::Result<BoxedReader> {
        let tar = self.export_tar(container_id)?;
        Ok(gzip(Cursor::new(tar)))
    }

    async fn import_filesystem(
        &self,
        container_id: &str,
        mut tar: BoxedReader,
    ) -> runtime::Result<()> {
        if self.fail_import.load(Ordering::SeqCst) {
            return Err(RuntimeError::Import("injected import failure".to_string()));
        }
        let mut bytes = Vec::new();
        tar.read_to_end(&mut bytes).await?;

        let mut state = self.state.lock().unwrap();
        let container = state
            .find(container_id)
            .ok_or_else(|| RuntimeError::NotFound(container_id.to_string()))?;
        untar_into(&mut container.files, &bytes)
            .map_err(|e| RuntimeError::Import(e.to_string()))
    }

    async fn load_image(&self, mut tar: BoxedReader) -> runtime::Result<()> {
        let mut bytes = Vec::new();
        tar.read_to_end(&mut bytes).await?;
        untar(&bytes).map_err(|e| RuntimeError::Import(e.to_string()))?;
        self.state.lock().unwrap().loaded_images.push(bytes.len());
        Ok(())
    }

    async fn stop_and_remove(&self, container_id: &str) -> runtime::Result<()> {
        if self.fail_remove.load(Ordering::SeqCst) {
            return Err(RuntimeError::Container("injected remove failure".to_string()));
        }
        let mut state = self.state.lock().unwrap();
        let name = state
            .containers
            .iter()
            .find(|(name, c)| name.as_str() == container_id || c.id == container_id)
            .map(|(name, _)| name.clone());
        if let Some(name) = name {
            if let Some(container) = state.containers.remove(&name) {
                state.removed.push(container.id);
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct StoredObject {
    pub bytes: Vec<u8>,
    pub content_type: String,
}

#[derive(Default)]
pub struct MemoryObjectStore {
    objects: Mutex<HashMap<String, StoredObject>>,
    pub fail_upload: AtomicBool,
}

impl MemoryObjectStore {
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.objects.lock().unwrap().keys().cloned().collect();
        keys.sort();
        keys
    }

    pub fn get(&self, key: &str) -> Option<StoredObject> {
        self.objects.lock().unwrap().get(key).cloned()
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn upload(
        &self,
        key: &str,
        mut body: BoxedReader,
        content_type: &str,
    ) -> object_store::Result<UploadResult> {
        if self.fail_upload.load(Ordering::SeqCst) {
            return Err(ObjectStoreError::Upload("injected upload failure".to_string()));
        }
        let mut bytes = Vec::new();
        body.read_to_end(&mut bytes).await?;
        let etag = format!("\"{}\"", bytes.len());
        self.objects.lock().unwrap().insert(
            key.to_string(),
            StoredObject {
                bytes,
                content_type: content_type.to_string(),
            },
        );
        Ok(UploadResult {
            key: key.to_string(),
            etag: Some(etag),
            location: format!("memory://workspaces/{}", key),
        })
    }

    async fn download_stream(&self, key: &str) -> object_store::Result<BoxedReader> {
        let object = self
            .get(key)
            .ok_or_else(|| ObjectStoreError::NotFound(key.to_string()))?;
        Ok(Box::pin(Cursor::new(object.bytes)))
    }
}

/// Delegates to SQLite, optionally failing storage-link writes.
pub struct FailingStore {
    inner: Arc<SqliteProjectStore>,
    pub fail_storage_link: AtomicBool,
    pub heartbeats: AtomicUsize,
}

impl FailingStore {
    pub fn new(inner: Arc<SqliteProjectStore>) -> Self {
        Self {
            inner,
            fail_storage_link: AtomicBool::new(false),
            heartbeats: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl ProjectStore for FailingStore {
    async fn insert(
        &self,
        project_id: &str,
        user_id: i64,
        status: WorkspaceStatus,
    ) -> store::Result<Project> {
        self.inner.insert(project_id, user_id, status).await
    }

    async fn get(&self, project_id: &str) -> store::Result<Project> {
        self.inner.get(project_id).await
    }

    async fn update_status(&self, project_id: &str, status: WorkspaceStatus) -> store::Result<()> {
        self.inner.update_status(project_id, status).await
    }

    async fn update_heartbeat(&self, project_id: &str) -> store::Result<()> {
        self.heartbeats.fetch_add(1, Ordering::SeqCst);
        self.inner.update_heartbeat(project_id).await
    }

    async fn update_storage_link(&self, project_id: &str, key: &str) -> store::Result<()> {
        if self.fail_storage_link.load(Ordering::SeqCst) {
            return Err(StorageError::Database(sqlx::Error::PoolClosed));
        }
        self.inner.update_storage_link(project_id, key).await
    }

    async fn find_stale(&self, timeout: Duration) -> store::Result<Vec<Project>> {
        self.inner.find_stale(timeout).await
    }
}

pub struct Harness {
    pub controller: Arc<WorkspaceController>,
    pub runtime: Arc<FakeRuntime>,
    pub sqlite: Arc<SqliteProjectStore>,
    pub store: Arc<FailingStore>,
    pub objects: Arc<MemoryObjectStore>,
}

impl Harness {
    pub async fn new() -> Self {
        Self::with_settings(ControllerSettings {
            default_image: IMAGE.to_string(),
            ..ControllerSettings::default()
        })
        .await
    }

    pub async fn with_settings(settings: ControllerSettings) -> Self {
        let sqlite = Arc::new(
            SqliteProjectStore::in_memory()
                .await
                .expect("Failed to open in-memory store"),
        );
        let store = Arc::new(FailingStore::new(sqlite.clone()));
        let runtime = Arc::new(FakeRuntime::new());
        let objects = Arc::new(MemoryObjectStore::default());

        let controller = Arc::new(WorkspaceController::new(
            runtime.clone(),
            store.clone(),
            objects.clone(),
            settings,
        ));

        Self {
            controller,
            runtime,
            sqlite,
            store,
            objects,
        }
    }

    pub async fn project(&self) -> String {
        self.controller
            .create_project(1)
            .await
            .expect("Failed to create project")
            .id
    }

    /// A project with a running, registered workspace.
    pub async fn active_project(&self) -> String {
        let project_id = self.project().await;
        self.controller
            .get_or_create_workspace(&project_id, IMAGE)
            .await
            .expect("Failed to create workspace");
        project_id
    }
}

// ABOUTME: Container runtime trait and the runtime-side workspace types
// ABOUTME: Defines the adapter interface used by the lifecycle controller

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use std::fmt;
use std::pin::Pin;
use thiserror::Error;
use tokio::io::AsyncRead;
use tokio::sync::Mutex;

use crate::shell::{ExecOutput, ShellSession};

pub mod docker;

pub use docker::{DockerRuntime, DockerSettings};

/// Directory inside every workspace container that holds the project files.
pub const WORKSPACE_DIR: &str = "/workspace";

#[derive(Error, Debug)]
pub enum RuntimeError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Failed to create container: {0}")]
    ContainerCreate(String),

    #[error("Workspace already exists: {0}")]
    WorkspaceExists(String),

    #[error("Image build failed for {image} ({} log lines)", .logs.len())]
    BuildFailed { image: String, logs: Vec<String> },

    #[error("Image error: {0}")]
    Image(String),

    #[error("Exec error: {0}")]
    Exec(String),

    #[error("Container not found: {0}")]
    NotFound(String),

    #[error("Export error: {0}")]
    Export(String),

    #[error("Import error: {0}")]
    Import(String),

    #[error("Container error: {0}")]
    Container(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, RuntimeError>;

/// Byte stream handed between the runtime, the compressor and object storage.
pub type BoxedReader = Pin<Box<dyn AsyncRead + Send>>;

/// Demultiplexed output of an exec or watch process.
pub type OutputStream = BoxStream<'static, Result<OutputChunk>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamType {
    Stdout,
    Stderr,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputChunk {
    pub stream: StreamType,
    pub data: Bytes,
}

impl OutputChunk {
    pub fn stdout(data: impl Into<Bytes>) -> Self {
        Self {
            stream: StreamType::Stdout,
            data: data.into(),
        }
    }

    pub fn stderr(data: impl Into<Bytes>) -> Self {
        Self {
            stream: StreamType::Stderr,
            data: data.into(),
        }
    }
}

/// What the runtime reports about an existing container.
#[derive(Debug, Clone)]
pub struct ContainerDetails {
    pub id: String,
    pub image: String,
    pub status: String,
    pub created_at: DateTime<Utc>,
}

impl ContainerDetails {
    pub fn is_running(&self) -> bool {
        self.status == "running"
    }
}

/// A live container paired with the interactive shell attached to it.
pub struct Workspace {
    pub container_id: String,
    pub project_id: String,
    pub image: String,
    pub status: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    shell: Mutex<ShellSession>,
}

impl Workspace {
    pub fn new(
        container_id: impl Into<String>,
        project_id: impl Into<String>,
        image: impl Into<String>,
        status: impl Into<String>,
        created_at: DateTime<Utc>,
        shell: ShellSession,
    ) -> Self {
        Self {
            container_id: container_id.into(),
            project_id: project_id.into(),
            image: image.into(),
            status: status.into(),
            created_at,
            updated_at: Utc::now(),
            shell: Mutex::new(shell),
        }
    }

    /// Runs one command in the workspace shell. Calls are serialized per workspace.
    pub async fn run(&self, command: &str) -> Result<ExecOutput> {
        let mut shell = self.shell.lock().await;
        shell.run(command).await
    }

    pub async fn close_shell(&self) {
        let mut shell = self.shell.lock().await;
        shell.close().await;
    }
}

impl fmt::Debug for Workspace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Workspace")
            .field("container_id", &self.container_id)
            .field("project_id", &self.project_id)
            .field("image", &self.image)
            .field("status", &self.status)
            .field("created_at", &self.created_at)
            .finish_non_exhaustive()
    }
}

/// Lifecycle operations over a container runtime.
///
/// Containers are named after the project they serve, so a project identifier
/// doubles as the container reference for reattachment.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Make sure `image` exists locally, building it if needed. Returns build log lines.
    async fn ensure_image(&self, image: &str) -> Result<Vec<String>>;

    /// Create and start a container named `project_id`. Returns the container id.
    async fn create_container(&self, project_id: &str, image: &str) -> Result<String>;

    async fn start_container(&self, container_id: &str) -> Result<()>;

    /// Open a fresh interactive shell inside a running container.
    async fn open_shell(&self, container_id: &str) -> Result<ShellSession>;

    /// Look up a container by id or name. `None` when it does not exist.
    async fn inspect(&self, container_id: &str) -> Result<Option<ContainerDetails>>;

    /// Run a single command to completion and capture its output.
    async fn exec_one_shot(&self, container_id: &str, argv: &[String]) -> Result<ExecOutput>;

    /// Start the recursive file watcher and return its raw output.
    async fn watch_files(&self, container_id: &str) -> Result<OutputStream>;

    /// Gzip-compressed tar of the workspace directory.
    async fn export_filesystem(&self, container_id: &str) -> Result<BoxedReader>;

    /// Gzip-compressed export of an image committed from the container.
    async fn export_container(&self, container_id: &str) -> Result<BoxedReader>;

    /// Extract an uncompressed tar stream into `/` of a running container.
    async fn import_filesystem(&self, container_id: &str, tar: BoxedReader) -> Result<()>;

    /// Load an image from an uncompressed tar stream.
    async fn load_image(&self, tar: BoxedReader) -> Result<()>;

    async fn stop_and_remove(&self, container_id: &str) -> Result<()>;

    async fn create_workspace(&self, project_id: &str, image: &str) -> Result<Workspace> {
        self.ensure_image(image).await?;
        let container_id = self.create_container(project_id, image).await?;
        let shell = self.open_shell(&container_id).await?;

        Ok(Workspace::new(
            container_id,
            project_id,
            image,
            "running",
            Utc::now(),
            shell,
        ))
    }

    async fn get_workspace(&self, project_id: &str) -> Result<Option<Workspace>> {
        let Some(details) = self.inspect(project_id).await? else {
            return Ok(None);
        };

        if !details.is_running() {
            self.start_container(&details.id).await?;
        }
        let shell = self.open_shell(&details.id).await?;

        Ok(Some(Workspace::new(
            details.id,
            project_id,
            details.image,
            "running",
            details.created_at,
            shell,
        )))
    }
}

// ABOUTME: Error taxonomy surfaced by the workspace lifecycle controller
// ABOUTME: Wraps runtime, storage and object store failures into typed variants

use thiserror::Error;

use crate::edit::EditError;
use crate::object_store::ObjectStoreError;
use crate::runtime::RuntimeError;
use crate::store::{StorageError, WorkspaceStatus};

#[derive(Error, Debug)]
pub enum WorkspaceError {
    #[error("Failed to create container: {0}")]
    ContainerCreate(String),

    #[error("Workspace already exists: {0}")]
    WorkspaceExists(String),

    #[error("Image build failed for {image}: {}", .logs.last().map(String::as_str).unwrap_or("no output"))]
    BuildFailed { image: String, logs: Vec<String> },

    #[error("Exec error: {0}")]
    Exec(String),

    #[error("Archive failed for project {project_id}: {reason}")]
    Archive { project_id: String, reason: String },

    #[error("Restore failed for project {project_id}: {reason}")]
    Restore { project_id: String, reason: String },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Workspace already registered for project {0}")]
    RegistryConflict(String),

    #[error("Edit of {path} failed: {source}")]
    Edit { path: String, source: EditError },

    #[error("Project {project_id} is {status}")]
    InvalidState {
        project_id: String,
        status: WorkspaceStatus,
    },

    #[error("Runtime error: {0}")]
    Runtime(RuntimeError),

    #[error("Storage error: {0}")]
    Storage(StorageError),

    #[error("Object storage error: {0}")]
    ObjectStore(ObjectStoreError),
}

pub type Result<T> = std::result::Result<T, WorkspaceError>;

impl WorkspaceError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    /// Wrap a failure inside the archive pipeline.
    pub fn archive(project_id: &str, err: impl Into<WorkspaceError>) -> Self {
        Self::Archive {
            project_id: project_id.to_string(),
            reason: err.into().to_string(),
        }
    }

    /// Wrap a failure inside the restore pipeline. Missing artifacts stay `NotFound`.
    pub fn restore(project_id: &str, err: impl Into<WorkspaceError>) -> Self {
        match err.into() {
            e @ Self::NotFound(_) => e,
            e => Self::Restore {
                project_id: project_id.to_string(),
                reason: e.to_string(),
            },
        }
    }
}

impl From<RuntimeError> for WorkspaceError {
    fn from(err: RuntimeError) -> Self {
        match err {
            RuntimeError::ContainerCreate(msg) => Self::ContainerCreate(msg),
            RuntimeError::WorkspaceExists(name) => Self::WorkspaceExists(name),
            RuntimeError::BuildFailed { image, logs } => Self::BuildFailed { image, logs },
            RuntimeError::Exec(msg) => Self::Exec(msg),
            RuntimeError::NotFound(name) => Self::NotFound(format!("container {}", name)),
            other => Self::Runtime(other),
        }
    }
}

impl From<StorageError> for WorkspaceError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::NotFound(id) => Self::NotFound(format!("project {}", id)),
            other => Self::Storage(other),
        }
    }
}

impl From<ObjectStoreError> for WorkspaceError {
    fn from(err: ObjectStoreError) -> Self {
        match err {
            ObjectStoreError::NotFound(key) => Self::NotFound(format!("archive {}", key)),
            other => Self::ObjectStore(other),
        }
    }
}

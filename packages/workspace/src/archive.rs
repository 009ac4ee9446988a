// ABOUTME: Archive and restore pipeline between live containers and object storage
// ABOUTME: Streams gzip tar snapshots out to storage and back into fresh containers

use async_compression::tokio::bufread::{GzipDecoder, GzipEncoder};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::{Stream, TryStreamExt};
use std::io;
use std::sync::Arc;
use tokio::io::{AsyncRead, BufReader};
use tokio_util::io::StreamReader;
use tracing::{error, info, warn};

use crate::error::{Result, WorkspaceError};
use crate::lifecycle::activate;
use crate::object_store::ObjectStore;
use crate::registry::RegistryEntry;
use crate::runtime::{BoxedReader, ContainerRuntime, Workspace};
use crate::store::{Project, ProjectStore, WorkspaceStatus};

pub const ARCHIVE_CONTENT_TYPE: &str = "application/gzip";

/// Object key for a snapshot taken at `at`. Restores depend on this exact layout.
pub fn archive_key(project_id: &str, at: DateTime<Utc>) -> String {
    format!("workspaces/{}/{}.tar.gz", project_id, at.timestamp_millis())
}

/// Object key for a committed-image export.
pub fn image_key(project_id: &str, at: DateTime<Utc>) -> String {
    format!("images/{}/{}.tar.gz", project_id, at.timestamp_millis())
}

pub fn gzip<R>(reader: R) -> BoxedReader
where
    R: AsyncRead + Send + 'static,
{
    Box::pin(GzipEncoder::new(BufReader::new(reader)))
}

pub fn gunzip<R>(reader: R) -> BoxedReader
where
    R: AsyncRead + Send + 'static,
{
    Box::pin(GzipDecoder::new(BufReader::new(reader)))
}

/// Adapt a byte-chunk stream into a reader.
pub fn stream_reader<S, E>(stream: S) -> BoxedReader
where
    S: Stream<Item = std::result::Result<Bytes, E>> + Send + 'static,
    E: std::error::Error + Send + Sync + 'static,
{
    Box::pin(StreamReader::new(stream.map_err(io::Error::other)))
}

/// An uncompressed tar holding a single regular file at the absolute `path`.
pub fn single_file_tar(path: &str, contents: &[u8]) -> io::Result<Vec<u8>> {
    let relative = path.trim_start_matches('/');
    if relative.is_empty() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "file path must name a file",
        ));
    }

    let mut header = tar::Header::new_gnu();
    header.set_size(contents.len() as u64);
    header.set_mode(0o644);
    header.set_mtime(Utc::now().timestamp().max(0) as u64);
    header.set_entry_type(tar::EntryType::Regular);

    let mut archive = tar::Builder::new(Vec::new());
    archive.append_data(&mut header, relative, contents)?;
    archive.into_inner()
}

/// Moves workspaces between running containers and durable snapshots.
#[derive(Clone)]
pub struct ArchivePipeline {
    runtime: Arc<dyn ContainerRuntime>,
    store: Arc<dyn ProjectStore>,
    objects: Arc<dyn ObjectStore>,
}

impl ArchivePipeline {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        store: Arc<dyn ProjectStore>,
        objects: Arc<dyn ObjectStore>,
    ) -> Self {
        Self {
            runtime,
            store,
            objects,
        }
    }

    /// Snapshot the container serving `entry`'s project and tear it down.
    ///
    /// The storage link is persisted before the container is removed. Any failure
    /// puts the project back to `active` and leaves the container alone.
    pub async fn archive(&self, entry: &mut RegistryEntry, container_id: &str) -> Result<String> {
        let project_id = entry.project_id().to_string();
        info!("Archiving workspace for project {}", project_id);

        self.store
            .update_status(&project_id, WorkspaceStatus::Archiving)
            .await
            .map_err(|e| WorkspaceError::archive(&project_id, e))?;

        match self.snapshot_and_teardown(entry, container_id).await {
            Ok(key) => {
                info!("Archived project {} to {}", project_id, key);
                Ok(key)
            }
            Err(e) => {
                error!("Archive of project {} failed: {}", project_id, e);
                if let Err(revert) = self
                    .store
                    .update_status(&project_id, WorkspaceStatus::Active)
                    .await
                {
                    warn!(
                        "Failed to revert project {} to active: {}",
                        project_id, revert
                    );
                }
                Err(e)
            }
        }
    }

    async fn snapshot_and_teardown(
        &self,
        entry: &mut RegistryEntry,
        container_id: &str,
    ) -> Result<String> {
        let project_id = entry.project_id().to_string();
        let fail = |e: WorkspaceError| WorkspaceError::archive(&project_id, e);

        let export = self
            .runtime
            .export_filesystem(container_id)
            .await
            .map_err(|e| fail(e.into()))?;

        let key = archive_key(&project_id, Utc::now());
        let uploaded = self
            .objects
            .upload(&key, export, ARCHIVE_CONTENT_TYPE)
            .await
            .map_err(|e| fail(e.into()))?;
        info!(
            "Uploaded snapshot of project {} to {}",
            project_id, uploaded.location
        );

        self.store
            .update_storage_link(&project_id, &uploaded.key)
            .await
            .map_err(|e| fail(e.into()))?;

        self.runtime
            .stop_and_remove(container_id)
            .await
            .map_err(|e| fail(e.into()))?;
        if let Some(workspace) = entry.take() {
            workspace.close_shell().await;
        }

        self.store
            .update_status(&project_id, WorkspaceStatus::Inactive)
            .await
            .map_err(|e| fail(e.into()))?;

        Ok(uploaded.key)
    }

    /// Rebuild a container for `project` from its recorded snapshot.
    ///
    /// On success the project is `active`; registering the returned workspace is
    /// left to the caller holding the registry entry.
    pub async fn restore(&self, project: &Project, image: &str) -> Result<Workspace> {
        let project_id = project.id.as_str();
        let key = project.storage_link.as_deref().ok_or_else(|| {
            WorkspaceError::NotFound(format!("no archive recorded for project {}", project_id))
        })?;
        info!("Restoring project {} from {}", project_id, key);

        let download = self
            .objects
            .download_stream(key)
            .await
            .map_err(|e| WorkspaceError::restore(project_id, e))?;
        let tar = gunzip(download);

        let workspace = self
            .runtime
            .create_workspace(project_id, image)
            .await
            .map_err(|e| WorkspaceError::restore(project_id, e))?;

        let populated = match self
            .runtime
            .import_filesystem(&workspace.container_id, tar)
            .await
        {
            Ok(()) => activate(self.store.as_ref(), project_id).await,
            Err(e) => Err(e.into()),
        };

        if let Err(e) = populated {
            self.discard(&workspace).await;
            return Err(WorkspaceError::restore(project_id, e));
        }

        info!(
            "Restored project {} into container {}",
            project_id, workspace.container_id
        );
        Ok(workspace)
    }

    /// Best-effort removal of a container whose restore did not complete.
    pub(crate) async fn discard(&self, workspace: &Workspace) {
        workspace.close_shell().await;
        if let Err(e) = self.runtime.stop_and_remove(&workspace.container_id).await {
            warn!(
                "Failed to remove half-restored container {}: {}",
                workspace.container_id, e
            );
        }
    }
}

// ABOUTME: Workspace lifecycle controller tying runtime, registry, store and archives together
// ABOUTME: Owns the inactive -> active -> archiving -> inactive transitions for every project

use chrono::Utc;
use futures::stream::BoxStream;
use futures::{StreamExt, TryStreamExt};
use std::io::Cursor;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::archive::{self, ArchivePipeline, ARCHIVE_CONTENT_TYPE};
use crate::error::{Result, WorkspaceError};
use crate::files::{self, FileChange, FileEntry};
use crate::object_store::ObjectStore;
use crate::registry::{RegistryEntry, WorkspaceRegistry};
use crate::runtime::{ContainerRuntime, Workspace, WORKSPACE_DIR};
use crate::session::{SessionContext, SessionRegistry};
use crate::shell::ExecOutput;
use crate::store::{Project, ProjectStore, WorkspaceStatus};

/// Mark a project active and refresh its heartbeat.
pub(crate) async fn activate(store: &dyn ProjectStore, project_id: &str) -> Result<()> {
    store
        .update_status(project_id, WorkspaceStatus::Active)
        .await?;
    store.update_heartbeat(project_id).await?;
    Ok(())
}

/// Whether a project's heartbeat is more than `timeout` old.
fn is_stale(project: &Project, timeout: Duration) -> bool {
    Utc::now()
        .signed_duration_since(project.last_heartbeat)
        .to_std()
        .is_ok_and(|age| age > timeout)
}

/// Resolve a tool-supplied path against the workspace directory.
pub fn resolve_path(path: &str) -> String {
    let path = path.trim();
    if path.starts_with('/') {
        path.to_string()
    } else if path.is_empty() || path == "." {
        WORKSPACE_DIR.to_string()
    } else {
        format!("{}/{}", WORKSPACE_DIR, path.trim_start_matches("./"))
    }
}

#[derive(Debug, Clone)]
pub struct ControllerSettings {
    /// Image used when a workspace is provisioned or restored without an explicit one.
    pub default_image: String,
    /// How often a long-running tool call refreshes the heartbeat. Keep it well
    /// under the reclaim timeout.
    pub heartbeat_interval: Duration,
}

impl Default for ControllerSettings {
    fn default() -> Self {
        Self {
            default_image: "code-workspace:latest".to_string(),
            heartbeat_interval: Duration::from_secs(200),
        }
    }
}

/// The single entry point for workspace lifecycle operations.
///
/// Every create, archive and restore for a project runs while holding that
/// project's registry entry, so the same project never has two in flight.
pub struct WorkspaceController {
    runtime: Arc<dyn ContainerRuntime>,
    store: Arc<dyn ProjectStore>,
    objects: Arc<dyn ObjectStore>,
    registry: WorkspaceRegistry,
    sessions: SessionRegistry,
    pipeline: ArchivePipeline,
    settings: ControllerSettings,
}

impl WorkspaceController {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        store: Arc<dyn ProjectStore>,
        objects: Arc<dyn ObjectStore>,
        settings: ControllerSettings,
    ) -> Self {
        let pipeline = ArchivePipeline::new(runtime.clone(), store.clone(), objects.clone());
        Self {
            runtime,
            store,
            objects,
            registry: WorkspaceRegistry::new(),
            sessions: SessionRegistry::new(),
            pipeline,
            settings,
        }
    }

    pub fn store(&self) -> &Arc<dyn ProjectStore> {
        &self.store
    }

    pub fn registry(&self) -> &WorkspaceRegistry {
        &self.registry
    }

    pub fn default_image(&self) -> &str {
        &self.settings.default_image
    }

    pub fn heartbeat_interval(&self) -> Duration {
        self.settings.heartbeat_interval
    }

    /// Record a new, inactive project for `user_id`.
    pub async fn create_project(&self, user_id: i64) -> Result<Project> {
        let project_id = Uuid::new_v4().to_string();
        let project = self
            .store
            .insert(&project_id, user_id, WorkspaceStatus::Inactive)
            .await?;
        info!("Created project {} for user {}", project_id, user_id);
        Ok(project)
    }

    /// Return the live workspace for a project, bringing one up if needed.
    ///
    /// On a miss the controller reattaches to a surviving container, restores
    /// from the recorded snapshot, or provisions a fresh container, in that order.
    pub async fn get_or_create_workspace(
        &self,
        project_id: &str,
        image: &str,
    ) -> Result<Arc<Workspace>> {
        let mut entry = self.registry.entry(project_id).await;
        if let Some(workspace) = entry.workspace() {
            return Ok(workspace);
        }

        let project = self.store.get(project_id).await?;

        let workspace = if let Some(workspace) = self.runtime.get_workspace(project_id).await? {
            info!(
                "Reattached to container {} for project {}",
                workspace.container_id, project_id
            );
            self.activate_or_discard(workspace).await?
        } else if project.storage_link.is_some() {
            self.pipeline.restore(&project, image).await?
        } else {
            info!("Provisioning workspace for project {}", project_id);
            let workspace = self.runtime.create_workspace(project_id, image).await?;
            self.activate_or_discard(workspace).await?
        };

        entry.insert(Arc::new(workspace))
    }

    async fn activate_or_discard(&self, workspace: Workspace) -> Result<Workspace> {
        if let Err(e) = activate(self.store.as_ref(), &workspace.project_id).await {
            self.pipeline.discard(&workspace).await;
            return Err(e);
        }
        Ok(workspace)
    }

    /// Run a one-shot command in a container.
    pub async fn execute(&self, container_id: &str, argv: &[String]) -> Result<ExecOutput> {
        debug!("Executing in {}: {:?}", container_id, argv);
        Ok(self.runtime.exec_one_shot(container_id, argv).await?)
    }

    /// Run a command in the workspace's persistent shell.
    pub async fn run_interactive(&self, workspace: &Workspace, command: &str) -> Result<ExecOutput> {
        Ok(workspace.run(command).await?)
    }

    /// Snapshot a project's workspace to object storage and tear it down.
    pub async fn archive_workspace(&self, project_id: &str) -> Result<()> {
        let mut entry = self.registry.entry(project_id).await;

        let project = self.store.get(project_id).await?;
        if project.workspace_status != WorkspaceStatus::Active {
            return Err(WorkspaceError::InvalidState {
                project_id: project_id.to_string(),
                status: project.workspace_status,
            });
        }

        self.archive_locked(&mut entry, project_id).await?;
        drop(entry);
        self.sessions.end(project_id).await;
        Ok(())
    }

    /// Archive a project only if it is still active and its heartbeat is older
    /// than `timeout` once its registry entry is held.
    ///
    /// Returns `false` when the project was skipped because it was touched or
    /// changed state after it was found stale.
    pub async fn archive_if_stale(&self, project_id: &str, timeout: Duration) -> Result<bool> {
        let mut entry = self.registry.entry(project_id).await;

        let project = self.store.get(project_id).await?;
        if project.workspace_status != WorkspaceStatus::Active {
            debug!(
                "Skipping reclaim of project {}: now {}",
                project_id, project.workspace_status
            );
            return Ok(false);
        }
        if !is_stale(&project, timeout) {
            debug!(
                "Skipping reclaim of project {}: heartbeat refreshed at {}",
                project_id, project.last_heartbeat
            );
            return Ok(false);
        }

        self.archive_locked(&mut entry, project_id).await?;
        drop(entry);
        self.sessions.end(project_id).await;
        Ok(true)
    }

    async fn archive_locked(&self, entry: &mut RegistryEntry, project_id: &str) -> Result<()> {
        let container_id = match entry.workspace() {
            Some(workspace) => workspace.container_id.clone(),
            None => match self.runtime.inspect(project_id).await? {
                Some(details) => details.id,
                None => {
                    // Nothing left to snapshot; the previous link stays authoritative.
                    warn!(
                        "Project {} is active but has no container, marking inactive",
                        project_id
                    );
                    self.store
                        .update_status(project_id, WorkspaceStatus::Inactive)
                        .await?;
                    return Ok(());
                }
            },
        };

        self.pipeline.archive(entry, &container_id).await?;
        Ok(())
    }

    /// Bring an archived project back into a fresh container.
    pub async fn restore_workspace(&self, project_id: &str) -> Result<()> {
        let mut entry = self.registry.entry(project_id).await;
        if entry.workspace().is_some() {
            return Err(WorkspaceError::RegistryConflict(project_id.to_string()));
        }

        let project = self.store.get(project_id).await?;
        let workspace = self
            .pipeline
            .restore(&project, &self.settings.default_image)
            .await?;
        entry.insert(Arc::new(workspace))?;
        Ok(())
    }

    /// Entries under the workspace directory, excluding dependency and VCS dirs.
    pub async fn list_files(&self, container_id: &str) -> Result<Vec<FileEntry>> {
        let output = self
            .runtime
            .exec_one_shot(container_id, &files::list_command())
            .await?;
        if !output.success() {
            return Err(WorkspaceError::Exec(format!(
                "listing files failed: {}",
                output.stderr.trim()
            )));
        }
        Ok(files::parse_listing(&output.stdout))
    }

    /// Live change feed for a container's workspace directory.
    pub async fn watch_files(
        &self,
        container_id: &str,
    ) -> Result<BoxStream<'static, Result<FileChange>>> {
        let output = self.runtime.watch_files(container_id).await?;
        Ok(files::change_events(output)
            .map_err(WorkspaceError::from)
            .boxed())
    }

    pub async fn read_file(&self, container_id: &str, path: &str) -> Result<String> {
        let path = resolve_path(path);
        let argv = vec!["cat".to_string(), "--".to_string(), path.clone()];
        let output = self.runtime.exec_one_shot(container_id, &argv).await?;
        if output.success() {
            return Ok(output.stdout);
        }
        if output.stderr.contains("No such file") {
            return Err(WorkspaceError::NotFound(format!("file {}", path)));
        }
        Err(WorkspaceError::Exec(format!(
            "reading {} failed: {}",
            path,
            output.stderr.trim()
        )))
    }

    /// Write a file by importing a one-entry tar, so contents never pass through a shell.
    pub async fn write_file(&self, container_id: &str, path: &str, contents: &[u8]) -> Result<()> {
        let path = resolve_path(path);
        let tar = archive::single_file_tar(&path, contents)
            .map_err(|e| WorkspaceError::Exec(format!("invalid file path {}: {}", path, e)))?;
        self.runtime
            .import_filesystem(container_id, Box::pin(Cursor::new(tar)))
            .await?;
        debug!("Wrote {} bytes to {} in {}", contents.len(), path, container_id);
        Ok(())
    }

    pub async fn touch_heartbeat(&self, project_id: &str) -> Result<()> {
        Ok(self.store.update_heartbeat(project_id).await?)
    }

    /// Start or rejoin the agent session for a project.
    pub async fn begin_session(
        &self,
        project_id: &str,
        image: &str,
    ) -> Result<Arc<SessionContext>> {
        let workspace = self.get_or_create_workspace(project_id, image).await?;
        Ok(self.sessions.begin(workspace).await)
    }

    pub async fn session(&self, project_id: &str) -> Option<Arc<SessionContext>> {
        self.sessions.get(project_id).await
    }

    pub async fn end_session(&self, project_id: &str) {
        self.sessions.end(project_id).await;
    }

    /// Commit the project's container to an image and upload its export.
    pub async fn export_image(&self, project_id: &str) -> Result<String> {
        let entry = self.registry.entry(project_id).await;
        let workspace = entry.workspace().ok_or_else(|| {
            WorkspaceError::NotFound(format!("workspace for project {}", project_id))
        })?;

        let export = self
            .runtime
            .export_container(&workspace.container_id)
            .await
            .map_err(|e| WorkspaceError::archive(project_id, e))?;
        let key = archive::image_key(project_id, Utc::now());
        let uploaded = self
            .objects
            .upload(&key, export, ARCHIVE_CONTENT_TYPE)
            .await
            .map_err(|e| WorkspaceError::archive(project_id, e))?;

        info!("Exported image of project {} to {}", project_id, uploaded.location);
        Ok(uploaded.key)
    }

    /// Load a previously exported image back into the runtime.
    pub async fn import_image(&self, key: &str) -> Result<()> {
        let download = self.objects.download_stream(key).await?;
        self.runtime.load_image(archive::gunzip(download)).await?;
        info!("Loaded image from {}", key);
        Ok(())
    }
}

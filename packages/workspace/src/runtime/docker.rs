// ABOUTME: Docker implementation of the container runtime adapter
// ABOUTME: Uses bollard for provisioning, exec, file watching, export and import

use super::{
    BoxedReader, ContainerDetails, ContainerRuntime, OutputChunk, OutputStream, Result,
    RuntimeError, WORKSPACE_DIR,
};
use crate::archive::{gzip, stream_reader};
use crate::files;
use crate::shell::{ExecOutput, ShellSession};
use async_trait::async_trait;
use bollard::{
    container::{
        Config, CreateContainerOptions, DownloadFromContainerOptions, LogOutput,
        RemoveContainerOptions, StartContainerOptions, StopContainerOptions,
        UploadToContainerOptions,
    },
    errors::Error as BollardError,
    exec::{CreateExecOptions, StartExecResults},
    image::{BuildImageOptions, CommitContainerOptions, ImportImageOptions, RemoveImageOptions},
    models::HostConfig,
    Docker,
};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::{future, Stream, StreamExt};
use std::collections::{HashMap, HashSet};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;
use tokio_util::io::{ReaderStream, StreamReader};
use tracing::{debug, error, info, warn};

const LABEL_PROJECT: &str = "sandcastle.project";

/// Resource ceilings and routing applied to every workspace container.
#[derive(Debug, Clone)]
pub struct DockerSettings {
    /// Directory holding the Dockerfile used when the image is missing
    pub build_context: Option<PathBuf>,
    pub dockerfile: String,
    pub route_domain: String,
    pub route_network: String,
    pub route_port: u16,
    pub exposed_ports: Vec<u16>,
    pub memory_bytes: i64,
    pub cpu_period: i64,
    pub cpu_quota: i64,
    pub stop_timeout: Duration,
    pub shell: String,
}

impl Default for DockerSettings {
    fn default() -> Self {
        Self {
            build_context: None,
            dockerfile: "Dockerfile".to_string(),
            route_domain: "localhost".to_string(),
            route_network: "web".to_string(),
            route_port: 5173,
            exposed_ports: vec![5173, 3000, 8080],
            memory_bytes: 500 * 1024 * 1024,
            cpu_period: 100_000,
            cpu_quota: 50_000,
            stop_timeout: Duration::from_secs(10),
            shell: "/bin/bash".to_string(),
        }
    }
}

pub struct DockerRuntime {
    client: Docker,
    settings: DockerSettings,
    /// Images confirmed present, so repeated provisioning skips the inspect call
    known_images: Arc<RwLock<HashSet<String>>>,
}

impl DockerRuntime {
    pub fn new(settings: DockerSettings) -> Result<Self> {
        let client = Docker::connect_with_defaults()
            .map_err(|e| RuntimeError::Connection(e.to_string()))?;
        Ok(Self::with_client(client, settings))
    }

    pub fn with_client(client: Docker, settings: DockerSettings) -> Self {
        Self {
            client,
            settings,
            known_images: Arc::new(RwLock::new(HashSet::new())),
        }
    }

    pub async fn ping(&self) -> Result<()> {
        self.client
            .ping()
            .await
            .map(|_| ())
            .map_err(|e| RuntimeError::Connection(e.to_string()))
    }

    /// Container definition for a project's workspace.
    fn container_config(settings: &DockerSettings, project_id: &str, image: &str) -> Config<String> {
        let router = format!("traefik.http.routers.{}", project_id);
        let service = format!("traefik.http.services.{}", project_id);

        let mut labels = HashMap::new();
        labels.insert("traefik.enable".to_string(), "true".to_string());
        labels.insert(
            "traefik.docker.network".to_string(),
            settings.route_network.clone(),
        );
        labels.insert(
            format!("{}.rule", router),
            format!("Host(`{}.{}`)", project_id, settings.route_domain),
        );
        labels.insert(format!("{}.entrypoints", router), "web".to_string());
        labels.insert(
            format!("{}.loadbalancer.server.port", service),
            settings.route_port.to_string(),
        );
        labels.insert(LABEL_PROJECT.to_string(), project_id.to_string());

        let exposed_ports = settings
            .exposed_ports
            .iter()
            .map(|port| (format!("{}/tcp", port), HashMap::new()))
            .collect();

        let host_config = HostConfig {
            memory: Some(settings.memory_bytes),
            memory_swap: Some(settings.memory_bytes),
            cpu_period: Some(settings.cpu_period),
            cpu_quota: Some(settings.cpu_quota),
            ..Default::default()
        };

        Config {
            image: Some(image.to_string()),
            cmd: Some(vec![
                "tail".to_string(),
                "-f".to_string(),
                "/dev/null".to_string(),
            ]),
            working_dir: Some(WORKSPACE_DIR.to_string()),
            exposed_ports: Some(exposed_ports),
            labels: Some(labels),
            host_config: Some(host_config),
            tty: Some(false),
            ..Default::default()
        }
    }

    /// Exec options for every process we attach to. No TTY, so output stays
    /// framed and the shell does not echo submitted commands back.
    fn exec_options(cmd: Vec<String>, attach_stdin: bool) -> CreateExecOptions<String> {
        CreateExecOptions {
            cmd: Some(cmd),
            attach_stdin: Some(attach_stdin),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            tty: Some(false),
            working_dir: Some(WORKSPACE_DIR.to_string()),
            ..Default::default()
        }
    }

    async fn build_image(&self, image: &str) -> Result<Vec<String>> {
        let context = self.settings.build_context.clone().ok_or_else(|| {
            RuntimeError::Image(format!(
                "image {} is missing and no build context is configured",
                image
            ))
        })?;
        info!("Building image {} from {}", image, context.display());

        let tar = tokio::task::spawn_blocking(move || create_context_tar(&context))
            .await
            .map_err(|e| RuntimeError::Image(format!("build context task failed: {}", e)))??;

        let options = BuildImageOptions {
            dockerfile: self.settings.dockerfile.clone(),
            t: image.to_string(),
            nocache: true,
            rm: true,
            ..Default::default()
        };

        let mut progress =
            Box::pin(self.client.build_image(options, None, Some(Bytes::from(tar))));
        let mut logs = Vec::new();
        let mut failed = false;

        while let Some(item) = progress.next().await {
            match item {
                Ok(info) => {
                    if let Some(line) = info.stream {
                        let line = line.trim_end();
                        if !line.is_empty() {
                            debug!("build {}: {}", image, line);
                            logs.push(line.to_string());
                        }
                    }
                    if let Some(err) = info.error {
                        logs.push(format!("Build Error: {}", err));
                        failed = true;
                    }
                }
                Err(e) => {
                    logs.push(format!("Build Error: {}", e));
                    failed = true;
                    break;
                }
            }
        }

        if failed {
            error!("Build of image {} failed", image);
            return Err(RuntimeError::BuildFailed {
                image: image.to_string(),
                logs,
            });
        }

        info!("Built image {}", image);
        Ok(logs)
    }

    async fn start_attached_exec(
        &self,
        container_id: &str,
        cmd: Vec<String>,
        attach_stdin: bool,
    ) -> Result<(
        std::pin::Pin<Box<dyn Stream<Item = std::result::Result<LogOutput, BollardError>> + Send>>,
        std::pin::Pin<Box<dyn tokio::io::AsyncWrite + Send>>,
        String,
    )> {
        let options = Self::exec_options(cmd, attach_stdin);

        let exec = self
            .client
            .create_exec(container_id, options)
            .await
            .map_err(|e| not_found_or(e, container_id, RuntimeError::Exec))?;

        match self
            .client
            .start_exec(&exec.id, None)
            .await
            .map_err(|e| RuntimeError::Exec(e.to_string()))?
        {
            StartExecResults::Attached { output, input } => Ok((output, input, exec.id)),
            StartExecResults::Detached => Err(RuntimeError::Exec(
                "Exec was detached unexpectedly".to_string(),
            )),
        }
    }

    async fn require_container(&self, container_id: &str) -> Result<()> {
        match self.inspect(container_id).await? {
            Some(_) => Ok(()),
            None => Err(RuntimeError::NotFound(container_id.to_string())),
        }
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn ensure_image(&self, image: &str) -> Result<Vec<String>> {
        if self.known_images.read().await.contains(image) {
            return Ok(Vec::new());
        }

        let logs = match self.client.inspect_image(image).await {
            Ok(_) => {
                debug!("Image {} already present", image);
                Vec::new()
            }
            Err(BollardError::DockerResponseServerError {
                status_code: 404, ..
            }) => self.build_image(image).await?,
            Err(e) => return Err(RuntimeError::Image(e.to_string())),
        };

        self.known_images.write().await.insert(image.to_string());
        Ok(logs)
    }

    async fn create_container(&self, project_id: &str, image: &str) -> Result<String> {
        info!("Creating workspace container {} from {}", project_id, image);

        let options = CreateContainerOptions {
            name: project_id.to_string(),
            platform: None,
        };
        let config = Self::container_config(&self.settings, project_id, image);

        let response = match self.client.create_container(Some(options), config).await {
            Ok(response) => response,
            Err(BollardError::DockerResponseServerError {
                status_code: 409, ..
            }) => return Err(RuntimeError::WorkspaceExists(project_id.to_string())),
            Err(e) => return Err(RuntimeError::ContainerCreate(e.to_string())),
        };
        for warning in &response.warnings {
            warn!("Docker warning for {}: {}", project_id, warning);
        }

        self.client
            .start_container(&response.id, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| RuntimeError::ContainerCreate(e.to_string()))?;

        info!("Started container {} for project {}", response.id, project_id);
        Ok(response.id)
    }

    async fn start_container(&self, container_id: &str) -> Result<()> {
        match self
            .client
            .start_container(container_id, None::<StartContainerOptions<String>>)
            .await
        {
            Ok(_) => Ok(()),
            Err(BollardError::DockerResponseServerError {
                status_code: 304, ..
            }) => {
                debug!("Container {} already running", container_id);
                Ok(())
            }
            Err(e) => Err(not_found_or(e, container_id, RuntimeError::Container)),
        }
    }

    async fn open_shell(&self, container_id: &str) -> Result<ShellSession> {
        debug!("Opening shell in container {}", container_id);
        let (output, input, _) = self
            .start_attached_exec(container_id, vec![self.settings.shell.clone()], true)
            .await?;

        let output = output
            .filter_map(|item| future::ready(log_to_chunk(item)))
            .boxed();
        Ok(ShellSession::new(input, output))
    }

    async fn inspect(&self, container_id: &str) -> Result<Option<ContainerDetails>> {
        let inspect = match self.client.inspect_container(container_id, None).await {
            Ok(inspect) => inspect,
            Err(BollardError::DockerResponseServerError {
                status_code: 404, ..
            }) => return Ok(None),
            Err(e) => return Err(RuntimeError::Container(e.to_string())),
        };

        let status = inspect
            .state
            .as_ref()
            .and_then(|state| state.status.as_ref())
            .map(|s| AsRef::<str>::as_ref(s).to_string())
            .unwrap_or_else(|| "unknown".to_string());

        let image = inspect
            .config
            .as_ref()
            .and_then(|config| config.image.clone())
            .or_else(|| inspect.image.clone())
            .unwrap_or_default();

        let created_at = inspect
            .created
            .as_deref()
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(Utc::now);

        Ok(Some(ContainerDetails {
            id: inspect.id.unwrap_or_else(|| container_id.to_string()),
            image,
            status,
            created_at,
        }))
    }

    async fn exec_one_shot(&self, container_id: &str, argv: &[String]) -> Result<ExecOutput> {
        debug!("Executing in container {}: {:?}", container_id, argv);

        let (mut output, mut input, exec_id) = self
            .start_attached_exec(container_id, argv.to_vec(), true)
            .await?;
        // Nothing is piped in, close stdin so readers see EOF
        if let Err(e) = input.shutdown().await {
            debug!("Failed to close exec stdin: {}", e);
        }

        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        while let Some(msg) = output.next().await {
            match msg {
                Ok(LogOutput::StdOut { message }) | Ok(LogOutput::Console { message }) => {
                    stdout.extend_from_slice(&message)
                }
                Ok(LogOutput::StdErr { message }) => stderr.extend_from_slice(&message),
                Ok(LogOutput::StdIn { .. }) => {}
                Err(e) => return Err(RuntimeError::Exec(e.to_string())),
            }
        }

        let inspect = self
            .client
            .inspect_exec(&exec_id)
            .await
            .map_err(|e| RuntimeError::Exec(e.to_string()))?;

        Ok(ExecOutput {
            stdout: String::from_utf8_lossy(&stdout).into_owned(),
            stderr: String::from_utf8_lossy(&stderr).into_owned(),
            exit_code: inspect.exit_code,
        })
    }

    async fn watch_files(&self, container_id: &str) -> Result<OutputStream> {
        info!("Starting file watcher in container {}", container_id);
        let (mut output, input, _) = self
            .start_attached_exec(container_id, files::watch_command(), false)
            .await?;

        let stream = async_stream::stream! {
            // The hijacked connection stays open as long as its write half lives
            let _input = input;
            while let Some(item) = output.next().await {
                if let Some(chunk) = log_to_chunk(item) {
                    yield chunk;
                }
            }
        };
        Ok(stream.boxed())
    }

    async fn export_filesystem(&self, container_id: &str) -> Result<BoxedReader> {
        self.require_container(container_id).await?;
        info!("Exporting {} from container {}", WORKSPACE_DIR, container_id);

        let tar = self.client.download_from_container(
            container_id,
            Some(DownloadFromContainerOptions {
                path: WORKSPACE_DIR.to_string(),
            }),
        );
        Ok(gzip(stream_reader(tar)))
    }

    async fn export_container(&self, container_id: &str) -> Result<BoxedReader> {
        let reference = format!("archived-{}:latest", container_id);
        info!("Committing container {} as {}", container_id, reference);

        let options = CommitContainerOptions {
            container: container_id.to_string(),
            repo: format!("archived-{}", container_id),
            tag: "latest".to_string(),
            pause: true,
            ..Default::default()
        };
        self.client
            .commit_container(options, Config::<String>::default())
            .await
            .map_err(|e| not_found_or(e, container_id, RuntimeError::Export))?;

        let image = ThrowawayImage::new(self.client.clone(), reference);
        let client = self.client.clone();
        let body = async_stream::stream! {
            let mut export = Box::pin(client.export_image(image.reference()));
            while let Some(chunk) = export.next().await {
                let failed = chunk.is_err();
                yield chunk.map_err(io::Error::other);
                if failed {
                    break;
                }
            }
            drop(export);
            image.remove().await;
        };

        Ok(gzip(StreamReader::new(Box::pin(body))))
    }

    async fn import_filesystem(&self, container_id: &str, tar: BoxedReader) -> Result<()> {
        info!("Importing archive into container {}", container_id);
        let (body, failure) = body_stream(tar);

        self.client
            .upload_to_container_streaming(
                container_id,
                Some(UploadToContainerOptions {
                    path: "/".to_string(),
                    ..Default::default()
                }),
                body,
            )
            .await
            .map_err(|e| not_found_or(e, container_id, RuntimeError::Import))?;

        if let Some(e) = take_failure(&failure) {
            return Err(RuntimeError::Import(format!("archive stream failed: {}", e)));
        }
        Ok(())
    }

    async fn load_image(&self, tar: BoxedReader) -> Result<()> {
        info!("Loading image from archive");
        let (body, failure) = body_stream(tar);

        let mut progress = Box::pin(self.client.import_image_stream(
            ImportImageOptions::default(),
            body,
            None,
        ));
        while let Some(item) = progress.next().await {
            let info = item.map_err(|e| RuntimeError::Import(e.to_string()))?;
            if let Some(err) = info.error {
                return Err(RuntimeError::Import(err));
            }
            if let Some(status) = info.status {
                debug!("load image: {}", status);
            }
        }

        if let Some(e) = take_failure(&failure) {
            return Err(RuntimeError::Import(format!("image stream failed: {}", e)));
        }
        Ok(())
    }

    async fn stop_and_remove(&self, container_id: &str) -> Result<()> {
        info!("Stopping container {}", container_id);

        let stop = self
            .client
            .stop_container(
                container_id,
                Some(StopContainerOptions {
                    t: self.settings.stop_timeout.as_secs() as i64,
                }),
            )
            .await;
        match stop {
            Ok(_) => {}
            Err(BollardError::DockerResponseServerError {
                status_code: 304, ..
            }) => debug!("Container {} already stopped", container_id),
            Err(BollardError::DockerResponseServerError {
                status_code: 404, ..
            }) => {
                debug!("Container {} already removed", container_id);
                return Ok(());
            }
            Err(e) => return Err(RuntimeError::Container(e.to_string())),
        }

        let remove = self
            .client
            .remove_container(
                container_id,
                Some(RemoveContainerOptions {
                    force: true,
                    v: true,
                    ..Default::default()
                }),
            )
            .await;
        match remove {
            Ok(_) => {
                info!("Removed container {}", container_id);
                Ok(())
            }
            Err(BollardError::DockerResponseServerError {
                status_code: 404, ..
            }) => {
                debug!("Container {} already removed", container_id);
                Ok(())
            }
            Err(e) => Err(RuntimeError::Container(e.to_string())),
        }
    }
}

/// Image committed for a single export. Removed when the export drains, or
/// in the background if the export is dropped early.
struct ThrowawayImage {
    client: Docker,
    reference: String,
    armed: bool,
}

impl ThrowawayImage {
    fn new(client: Docker, reference: String) -> Self {
        Self {
            client,
            reference,
            armed: true,
        }
    }

    fn reference(&self) -> &str {
        &self.reference
    }

    async fn remove(mut self) {
        self.armed = false;
        remove_image(&self.client, &self.reference).await;
    }
}

impl Drop for ThrowawayImage {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let client = self.client.clone();
        let reference = std::mem::take(&mut self.reference);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move { remove_image(&client, &reference).await });
            }
            Err(_) => warn!("No runtime to remove throwaway image {}", reference),
        }
    }
}

async fn remove_image(client: &Docker, reference: &str) {
    let options = RemoveImageOptions {
        force: true,
        ..Default::default()
    };
    match client.remove_image(reference, Some(options), None).await {
        Ok(_) => debug!("Removed throwaway image {}", reference),
        Err(e) => warn!("Failed to remove throwaway image {}: {}", reference, e),
    }
}

type FailureSlot = Arc<StdMutex<Option<io::Error>>>;

/// Turn a reader into the body stream bollard uploads. A read error ends the
/// stream and is parked in the returned slot for the caller to report.
fn body_stream(reader: BoxedReader) -> (impl Stream<Item = Bytes> + Send + 'static, FailureSlot) {
    let failure: FailureSlot = Arc::default();
    let body = ReaderStream::new(reader).scan(failure.clone(), |slot, chunk| {
        future::ready(match chunk {
            Ok(bytes) => Some(bytes),
            Err(e) => {
                if let Ok(mut parked) = slot.lock() {
                    *parked = Some(e);
                }
                None
            }
        })
    });
    (body, failure)
}

fn take_failure(slot: &FailureSlot) -> Option<io::Error> {
    slot.lock().ok().and_then(|mut parked| parked.take())
}

fn log_to_chunk(
    item: std::result::Result<LogOutput, BollardError>,
) -> Option<Result<OutputChunk>> {
    match item {
        Ok(LogOutput::StdOut { message }) | Ok(LogOutput::Console { message }) => {
            Some(Ok(OutputChunk::stdout(message)))
        }
        Ok(LogOutput::StdErr { message }) => Some(Ok(OutputChunk::stderr(message))),
        Ok(LogOutput::StdIn { .. }) => None,
        Err(e) => Some(Err(RuntimeError::Exec(e.to_string()))),
    }
}

fn not_found_or(
    err: BollardError,
    container_id: &str,
    wrap: fn(String) -> RuntimeError,
) -> RuntimeError {
    match err {
        BollardError::DockerResponseServerError {
            status_code: 404, ..
        } => RuntimeError::NotFound(container_id.to_string()),
        other => wrap(other.to_string()),
    }
}

fn create_context_tar(path: &Path) -> Result<Vec<u8>> {
    if !path.is_dir() {
        return Err(RuntimeError::Image(format!(
            "build context {} is not a directory",
            path.display()
        )));
    }

    let mut archive = tar::Builder::new(Vec::new());
    archive.append_dir_all(".", path)?;
    Ok(archive.into_inner()?)
}

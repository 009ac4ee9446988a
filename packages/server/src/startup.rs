// ABOUTME: Startup wiring for the store, object storage and container runtime
// ABOUTME: Retries each dependency with bounded exponential backoff before giving up

use anyhow::{Context, Result};
use backoff::ExponentialBackoffBuilder;
use sandcastle_config::Config;
use sandcastle_workspace::{
    ControllerSettings, DockerRuntime, DockerSettings, S3ObjectStore, S3Settings,
    SqliteProjectStore, WorkspaceController,
};
use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

const INITIAL_RETRY_INTERVAL: Duration = Duration::from_millis(500);

/// Run `operation` until it succeeds or `max_elapsed` has passed.
pub async fn with_backoff<T, E, F, Fut>(
    what: &str,
    max_elapsed: Duration,
    mut operation: F,
) -> Result<T, E>
where
    E: Display,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let policy = ExponentialBackoffBuilder::new()
        .with_initial_interval(INITIAL_RETRY_INTERVAL.min(max_elapsed))
        .with_max_elapsed_time(Some(max_elapsed))
        .build();

    backoff::future::retry(policy, || {
        let attempt = operation();
        async move {
            attempt.await.map_err(|e| {
                warn!("{} not ready: {}", what, e);
                backoff::Error::transient(e)
            })
        }
    })
    .await
}

/// Everything a subcommand needs, connected and ready.
pub struct Services {
    pub controller: Arc<WorkspaceController>,
}

pub async fn connect(config: &Config) -> Result<Services> {
    let max_elapsed = config.startup_max_elapsed;

    let store = with_backoff("project store", max_elapsed, || {
        SqliteProjectStore::connect(&config.database_url)
    })
    .await
    .with_context(|| format!("connecting to {}", config.database_url))?;
    info!("Project store ready");

    let objects = S3ObjectStore::connect(S3Settings {
        endpoint: config.s3.endpoint.clone(),
        region: config.s3.region.clone(),
        access_key: config.s3.access_key.clone(),
        secret_key: config.s3.secret_key.clone(),
        bucket: config.s3.bucket.clone(),
        force_path_style: config.s3.force_path_style,
    })
    .await;
    with_backoff("object storage", max_elapsed, || objects.ensure_bucket())
        .await
        .with_context(|| format!("preparing bucket {}", objects.bucket()))?;
    info!("Object storage ready");

    let runtime = DockerRuntime::new(DockerSettings {
        build_context: config.build_context.clone(),
        route_domain: config.route_domain.clone(),
        ..DockerSettings::default()
    })
    .context("connecting to docker")?;
    with_backoff("docker", max_elapsed, || runtime.ping())
        .await
        .context("waiting for docker")?;
    info!("Container runtime ready");

    let controller = WorkspaceController::new(
        Arc::new(runtime),
        Arc::new(store),
        Arc::new(objects),
        ControllerSettings {
            default_image: config.image.clone(),
            heartbeat_interval: config.heartbeat_timeout / 3,
        },
    );

    Ok(Services {
        controller: Arc::new(controller),
    })
}

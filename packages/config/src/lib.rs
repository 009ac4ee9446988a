// ABOUTME: Process configuration loaded from environment variables
// ABOUTME: Covers the project store, workspace image, reclaimer timings and object storage

pub mod constants;

use std::env;
use std::num::ParseIntError;
use std::path::PathBuf;
use std::str::ParseBoolError;
use std::time::Duration;
use thiserror::Error;

use constants::*;

pub const DEFAULT_DATABASE_URL: &str = "sqlite://sandcastle.db?mode=rwc";
pub const DEFAULT_IMAGE: &str = "code-workspace:latest";
pub const DEFAULT_ROUTE_DOMAIN: &str = "localhost";
pub const DEFAULT_HEARTBEAT_TIMEOUT_SECS: u64 = 600;
pub const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 30;
pub const DEFAULT_SWEEP_CONCURRENCY: usize = 2;
pub const DEFAULT_STARTUP_MAX_ELAPSED_SECS: u64 = 30;
pub const DEFAULT_S3_ENDPOINT: &str = "http://localhost:9000";
pub const DEFAULT_S3_REGION: &str = "us-east-1";
pub const DEFAULT_S3_BUCKET: &str = "workspaces";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid number in {name}: {source}")]
    InvalidNumber {
        name: &'static str,
        #[source]
        source: ParseIntError,
    },
    #[error("Invalid boolean in {name}: {source}")]
    InvalidBool {
        name: &'static str,
        #[source]
        source: ParseBoolError,
    },
    #[error("{0} must be greater than zero")]
    Zero(&'static str),
    #[error("Missing required environment variable: {0}")]
    Missing(&'static str),
}

/// Connection settings for the S3-compatible bucket that holds workspace archives.
#[derive(Debug, Clone, PartialEq)]
pub struct S3Config {
    pub endpoint: String,
    pub region: String,
    pub access_key: String,
    pub secret_key: String,
    pub bucket: String,
    pub force_path_style: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub database_url: String,
    pub image: String,
    pub build_context: Option<PathBuf>,
    pub route_domain: String,
    pub heartbeat_timeout: Duration,
    pub sweep_interval: Duration,
    pub sweep_concurrency: usize,
    pub startup_max_elapsed: Duration,
    pub s3: S3Config,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let database_url = string_or(SANDCASTLE_DATABASE_URL, DEFAULT_DATABASE_URL);
        let image = string_or(SANDCASTLE_IMAGE, DEFAULT_IMAGE);
        let build_context = env::var(SANDCASTLE_BUILD_CONTEXT)
            .ok()
            .filter(|s| !s.trim().is_empty())
            .map(PathBuf::from);
        let route_domain = string_or(SANDCASTLE_ROUTE_DOMAIN, DEFAULT_ROUTE_DOMAIN);

        let heartbeat_timeout = Duration::from_secs(positive(
            SANDCASTLE_HEARTBEAT_TIMEOUT_SECS,
            DEFAULT_HEARTBEAT_TIMEOUT_SECS,
        )?);
        let sweep_interval = Duration::from_secs(positive(
            SANDCASTLE_SWEEP_INTERVAL_SECS,
            DEFAULT_SWEEP_INTERVAL_SECS,
        )?);
        let sweep_concurrency =
            positive(SANDCASTLE_SWEEP_CONCURRENCY, DEFAULT_SWEEP_CONCURRENCY as u64)? as usize;
        let startup_max_elapsed = Duration::from_secs(positive(
            SANDCASTLE_STARTUP_MAX_ELAPSED_SECS,
            DEFAULT_STARTUP_MAX_ELAPSED_SECS,
        )?);

        let s3 = S3Config {
            endpoint: string_or(S3_ENDPOINT, DEFAULT_S3_ENDPOINT),
            region: string_or(S3_REGION, DEFAULT_S3_REGION),
            access_key: required(S3_ACCESS_KEY)?,
            secret_key: required(S3_SECRET_KEY)?,
            bucket: string_or(S3_BUCKET_NAME, DEFAULT_S3_BUCKET),
            force_path_style: boolean(S3_FORCE_PATH_STYLE, true)?,
        };

        tracing::debug!(
            "Loaded configuration: image={}, heartbeat_timeout={:?}, sweep_interval={:?}",
            image,
            heartbeat_timeout,
            sweep_interval
        );

        Ok(Config {
            database_url,
            image,
            build_context,
            route_domain,
            heartbeat_timeout,
            sweep_interval,
            sweep_concurrency,
            startup_max_elapsed,
            s3,
        })
    }
}

fn string_or(name: &str, default: &str) -> String {
    env::var(name)
        .ok()
        .filter(|s| !s.trim().is_empty())
        .unwrap_or_else(|| default.to_string())
}

fn required(name: &'static str) -> Result<String, ConfigError> {
    env::var(name)
        .ok()
        .filter(|s| !s.trim().is_empty())
        .ok_or(ConfigError::Missing(name))
}

fn positive(name: &'static str, default: u64) -> Result<u64, ConfigError> {
    let value = match env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse::<u64>()
            .map_err(|source| ConfigError::InvalidNumber { name, source })?,
        Err(_) => default,
    };

    if value == 0 {
        return Err(ConfigError::Zero(name));
    }
    Ok(value)
}

fn boolean(name: &'static str, default: bool) -> Result<bool, ConfigError> {
    match env::var(name) {
        Ok(raw) => raw
            .trim()
            .to_lowercase()
            .parse::<bool>()
            .map_err(|source| ConfigError::InvalidBool { name, source }),
        Err(_) => Ok(default),
    }
}

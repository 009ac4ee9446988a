// ABOUTME: Environment variable name constants
// ABOUTME: Centralized definitions of all environment variable names used across Sandcastle

// Durable project store
pub const SANDCASTLE_DATABASE_URL: &str = "SANDCASTLE_DATABASE_URL";

// Workspace image and routing
pub const SANDCASTLE_IMAGE: &str = "SANDCASTLE_IMAGE";
pub const SANDCASTLE_BUILD_CONTEXT: &str = "SANDCASTLE_BUILD_CONTEXT";
pub const SANDCASTLE_ROUTE_DOMAIN: &str = "SANDCASTLE_ROUTE_DOMAIN";

// Heartbeat reclaimer
pub const SANDCASTLE_HEARTBEAT_TIMEOUT_SECS: &str = "SANDCASTLE_HEARTBEAT_TIMEOUT_SECS";
pub const SANDCASTLE_SWEEP_INTERVAL_SECS: &str = "SANDCASTLE_SWEEP_INTERVAL_SECS";
pub const SANDCASTLE_SWEEP_CONCURRENCY: &str = "SANDCASTLE_SWEEP_CONCURRENCY";

// Startup
pub const SANDCASTLE_STARTUP_MAX_ELAPSED_SECS: &str = "SANDCASTLE_STARTUP_MAX_ELAPSED_SECS";

// Object storage (S3-compatible)
pub const S3_ENDPOINT: &str = "S3_ENDPOINT";
pub const S3_REGION: &str = "S3_REGION";
pub const S3_ACCESS_KEY: &str = "S3_ACCESS_KEY";
pub const S3_SECRET_KEY: &str = "S3_SECRET_KEY";
pub const S3_BUCKET_NAME: &str = "S3_BUCKET_NAME";
pub const S3_FORCE_PATH_STYLE: &str = "S3_FORCE_PATH_STYLE";

// Logging
pub const RUST_LOG: &str = "RUST_LOG";

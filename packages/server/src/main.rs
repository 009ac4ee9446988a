// ABOUTME: Sandcastle binary running the workspace reclaimer and operator commands
// ABOUTME: Loads configuration from the environment, initializes logging and dispatches subcommands

use anyhow::Result;
use clap::{Parser, Subcommand};
use colored::*;
use sandcastle_config::Config;
use sandcastle_workspace::HeartbeatReclaimer;
use tokio_util::sync::CancellationToken;
use tracing::info;

mod startup;

#[derive(Parser)]
#[command(name = "sandcastle")]
#[command(about = "Sandcastle - ephemeral development workspaces")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the heartbeat reclaimer until interrupted
    Serve,
    /// Run a single reclaim sweep and exit
    Sweep,
    /// Archive a project's workspace to object storage
    Archive {
        /// Project identifier
        project_id: String,
    },
    /// Restore a project's workspace from its latest archive
    Restore {
        /// Project identifier
        project_id: String,
    },
    /// Create a new project for a user
    CreateProject {
        /// Owning user identifier
        user_id: i64,
    },
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .compact()
        .init();
}

fn reclaimer(config: &Config, services: &startup::Services) -> HeartbeatReclaimer {
    HeartbeatReclaimer::new(
        services.controller.clone(),
        config.sweep_interval,
        config.heartbeat_timeout,
        config.sweep_concurrency,
    )
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();

    let cli = Cli::parse();
    let config = Config::from_env()?;
    let services = startup::connect(&config).await?;

    match cli.command {
        Commands::Serve => {
            let shutdown = CancellationToken::new();
            let handle = reclaimer(&config, &services).spawn(shutdown.clone());

            tokio::signal::ctrl_c().await?;
            info!("Shutting down");
            shutdown.cancel();
            handle.await?;
        }
        Commands::Sweep => {
            let report = reclaimer(&config, &services).sweep_once().await?;
            println!(
                "{} archived {}, skipped {}, failed {}",
                "Sweep complete:".green().bold(),
                report.archived.len(),
                report.skipped.len(),
                report.failed.len()
            );
            for project_id in &report.failed {
                println!("  {} {}", "failed".red(), project_id);
            }
        }
        Commands::Archive { project_id } => {
            services.controller.archive_workspace(&project_id).await?;
            let project = services.controller.store().get(&project_id).await?;
            println!(
                "{} {} -> {}",
                "Archived".green().bold(),
                project_id,
                project.storage_link.unwrap_or_default()
            );
        }
        Commands::Restore { project_id } => {
            services.controller.restore_workspace(&project_id).await?;
            println!("{} {}", "Restored".green().bold(), project_id);
        }
        Commands::CreateProject { user_id } => {
            let project = services.controller.create_project(user_id).await?;
            println!("{}", project.id);
        }
    }

    Ok(())
}

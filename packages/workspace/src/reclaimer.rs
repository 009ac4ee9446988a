// ABOUTME: Background sweep that archives workspaces whose heartbeat has gone stale
// ABOUTME: Queries the durable store on an interval and drives each stale project through archive

use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::error::Result;
use crate::lifecycle::WorkspaceController;

/// Outcome of one sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweepReport {
    pub archived: Vec<String>,
    /// Found stale, but touched or moved on before its archive could start.
    pub skipped: Vec<String>,
    pub failed: Vec<String>,
}

enum Outcome {
    Archived,
    Skipped,
    Failed,
}

pub struct HeartbeatReclaimer {
    controller: Arc<WorkspaceController>,
    interval: Duration,
    timeout: Duration,
    concurrency: usize,
}

impl HeartbeatReclaimer {
    pub fn new(
        controller: Arc<WorkspaceController>,
        interval: Duration,
        timeout: Duration,
        concurrency: usize,
    ) -> Self {
        Self {
            controller,
            interval,
            timeout,
            concurrency: concurrency.max(1),
        }
    }

    /// Archive every stale project once.
    ///
    /// A failed archive is logged and reported; it never stops the sweep. The
    /// project stays `active` and is reconsidered on the next sweep.
    pub async fn sweep_once(&self) -> Result<SweepReport> {
        let stale = self.controller.store().find_stale(self.timeout).await?;
        if stale.is_empty() {
            return Ok(SweepReport::default());
        }
        info!("Found {} stale workspace(s)", stale.len());

        let timeout = self.timeout;
        let outcomes: Vec<(String, Outcome)> = futures::stream::iter(stale)
            .map(|project| {
                let controller = self.controller.clone();
                async move {
                    // Staleness is rechecked under the project's registry entry
                    match controller.archive_if_stale(&project.id, timeout).await {
                        Ok(true) => (project.id, Outcome::Archived),
                        Ok(false) => (project.id, Outcome::Skipped),
                        Err(e) => {
                            warn!("Failed to reclaim workspace {}: {}", project.id, e);
                            (project.id, Outcome::Failed)
                        }
                    }
                }
            })
            .buffer_unordered(self.concurrency)
            .collect()
            .await;

        let mut report = SweepReport::default();
        for (project_id, outcome) in outcomes {
            match outcome {
                Outcome::Archived => report.archived.push(project_id),
                Outcome::Skipped => report.skipped.push(project_id),
                Outcome::Failed => report.failed.push(project_id),
            }
        }
        report.archived.sort();
        report.skipped.sort();
        report.failed.sort();
        Ok(report)
    }

    /// Run sweeps on the configured interval until `shutdown` fires.
    pub fn spawn(self, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!(
                "Heartbeat reclaimer started (interval {:?}, timeout {:?})",
                self.interval, self.timeout
            );
            let mut ticker = time::interval(self.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        match self.sweep_once().await {
                            Ok(report) if !report.archived.is_empty() || !report.failed.is_empty() => {
                                info!(
                                    "Sweep archived {} workspace(s), {} failed",
                                    report.archived.len(),
                                    report.failed.len()
                                );
                            }
                            Ok(_) => {}
                            Err(e) => error!("Heartbeat sweep failed: {}", e),
                        }
                    }
                }
            }

            info!("Heartbeat reclaimer stopped");
        })
    }
}

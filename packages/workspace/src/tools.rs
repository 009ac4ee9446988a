// ABOUTME: Agent-facing tool operations bound to an explicit session context
// ABOUTME: Every call refreshes the project heartbeat before touching the workspace

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, warn};

use crate::edit::{self, MatchStrategy};
use crate::error::{Result, WorkspaceError};
use crate::lifecycle::{resolve_path, WorkspaceController};
use crate::session::{SessionContext, TodoItem};
use crate::shell::ExecOutput;

const MIN_HEARTBEAT_INTERVAL: Duration = Duration::from_millis(10);

/// Render file contents the way the agent reads them: numbered lines wrapped in a path tag.
pub fn format_numbered(path: &str, contents: &str) -> String {
    let mut out = format!("<{}>\n", path);
    for (index, line) in contents.lines().enumerate() {
        out.push_str(&format!("{:04} | {}\n", index + 1, line));
    }
    out.push_str(&format!("</{}>", path));
    out
}

/// What an edit changed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EditReport {
    pub diff: String,
    pub strategy: MatchStrategy,
    pub replacements: usize,
}

/// Tools available to one agent run.
pub struct AgentTools<'a> {
    controller: &'a WorkspaceController,
    session: &'a SessionContext,
}

impl<'a> AgentTools<'a> {
    pub fn new(controller: &'a WorkspaceController, session: &'a SessionContext) -> Self {
        Self {
            controller,
            session,
        }
    }

    async fn heartbeat(&self) {
        if let Err(e) = self.controller.touch_heartbeat(&self.session.project_id).await {
            warn!(
                "Failed to refresh heartbeat for project {}: {}",
                self.session.project_id, e
            );
        }
    }

    /// Run a command in the session's persistent shell.
    ///
    /// The heartbeat keeps ticking while the command runs, so a long silent
    /// build is not reclaimed out from under the session.
    pub async fn terminal(&self, command: &str) -> Result<ExecOutput> {
        self.heartbeat().await;

        let period = self
            .controller
            .heartbeat_interval()
            .max(MIN_HEARTBEAT_INTERVAL);
        let mut ticker = time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let run = self
            .controller
            .run_interactive(&self.session.workspace, command);
        tokio::pin!(run);

        let output = loop {
            tokio::select! {
                output = &mut run => break output,
                _ = ticker.tick() => {
                    debug!("Command still running in {}, refreshing heartbeat", self.session.project_id);
                    self.heartbeat().await;
                }
            }
        };
        if let Err(e) = &output {
            warn!("terminal tool failed for {}: {}", self.session.project_id, e);
        }
        output
    }

    pub async fn read(&self, path: &str) -> Result<String> {
        self.heartbeat().await;
        let contents = self
            .controller
            .read_file(self.session.container_id(), path)
            .await?;
        Ok(format_numbered(path, &contents))
    }

    pub async fn write(&self, path: &str, content: &str) -> Result<()> {
        self.heartbeat().await;
        self.controller
            .write_file(self.session.container_id(), path, content.as_bytes())
            .await
    }

    /// Replace `old` with `new` in a file and report the resulting diff.
    ///
    /// Matching is line-based and falls back from exact to whitespace-normalized
    /// to fuzzy. The file is written back whole, never through a shell.
    pub async fn edit(
        &self,
        path: &str,
        old: &str,
        new: &str,
        replace_all: bool,
    ) -> Result<EditReport> {
        self.heartbeat().await;
        let container_id = self.session.container_id();
        let before = self.controller.read_file(container_id, path).await?;

        let replaced = edit::smart_replace(&before, old, new, replace_all).map_err(|source| {
            WorkspaceError::Edit {
                path: path.to_string(),
                source,
            }
        })?;
        self.controller
            .write_file(container_id, path, replaced.content.as_bytes())
            .await?;

        debug!(
            "Edited {} in {} ({} replacement(s), {:?} match)",
            path, self.session.project_id, replaced.replacements, replaced.strategy
        );
        Ok(EditReport {
            diff: edit::unified_diff(path, &before, &replaced.content),
            strategy: replaced.strategy,
            replacements: replaced.replacements,
        })
    }

    /// Names in a directory; directories carry a trailing slash.
    pub async fn ls(&self, path: &str) -> Result<Vec<String>> {
        self.heartbeat().await;
        let path = resolve_path(path);
        let argv = vec!["ls".to_string(), "-1Ap".to_string(), path.clone()];
        let output = self
            .controller
            .execute(self.session.container_id(), &argv)
            .await?;
        if !output.success() {
            return Err(WorkspaceError::Exec(format!(
                "listing {} failed: {}",
                path,
                output.stderr.trim()
            )));
        }
        Ok(output
            .stdout
            .lines()
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect())
    }

    pub async fn todo_write(&self, items: Vec<TodoItem>) -> Result<usize> {
        self.heartbeat().await;
        let count = items.len();
        self.session.set_todos(items).await;
        debug!("Recorded {} todos for {}", count, self.session.project_id);
        Ok(count)
    }

    pub async fn todo_read(&self) -> Result<Vec<TodoItem>> {
        self.heartbeat().await;
        Ok(self.session.todos().await)
    }

    pub async fn describe(&self, description: &str) -> Result<()> {
        self.heartbeat().await;
        self.session.set_description(description.to_string()).await;
        Ok(())
    }

    /// Record how the project is run and, optionally, built.
    pub async fn serve(&self, run_command: &str, build_command: Option<&str>) -> Result<()> {
        self.heartbeat().await;
        self.session
            .set_commands(run_command.to_string(), build_command.map(str::to_string))
            .await;
        Ok(())
    }
}

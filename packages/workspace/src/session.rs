// ABOUTME: Per-run session context attached to a registered workspace
// ABOUTME: Holds scratch state written by agent tools during one agent invocation

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

use crate::runtime::Workspace;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TodoStatus {
    Pending,
    InProgress,
    Completed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TodoPriority {
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TodoItem {
    pub description: String,
    pub status: TodoStatus,
    pub priority: TodoPriority,
}

/// Mutable fields an agent run may set.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionScratch {
    pub run_command: Option<String>,
    pub build_command: Option<String>,
    pub description: Option<String>,
    pub todos: Vec<TodoItem>,
}

/// One agent run's view of a workspace.
///
/// The workspace handle is shared with the registry; the scratch state lives
/// only as long as the session.
pub struct SessionContext {
    pub project_id: String,
    pub workspace: Arc<Workspace>,
    scratch: RwLock<SessionScratch>,
}

impl SessionContext {
    pub fn new(workspace: Arc<Workspace>) -> Self {
        Self {
            project_id: workspace.project_id.clone(),
            workspace,
            scratch: RwLock::new(SessionScratch::default()),
        }
    }

    pub fn container_id(&self) -> &str {
        &self.workspace.container_id
    }

    pub async fn scratch(&self) -> SessionScratch {
        self.scratch.read().await.clone()
    }

    pub async fn set_commands(&self, run_command: String, build_command: Option<String>) {
        let mut scratch = self.scratch.write().await;
        scratch.run_command = Some(run_command);
        scratch.build_command = build_command;
    }

    pub async fn set_description(&self, description: String) {
        self.scratch.write().await.description = Some(description);
    }

    /// Replace the todo list wholesale.
    pub async fn set_todos(&self, todos: Vec<TodoItem>) {
        self.scratch.write().await.todos = todos;
    }

    pub async fn todos(&self) -> Vec<TodoItem> {
        self.scratch.read().await.todos.clone()
    }
}

impl fmt::Debug for SessionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionContext")
            .field("project_id", &self.project_id)
            .field("container_id", &self.workspace.container_id)
            .finish_non_exhaustive()
    }
}

/// Sessions currently in flight, keyed by project.
#[derive(Default)]
pub struct SessionRegistry {
    sessions: RwLock<HashMap<String, Arc<SessionContext>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Join the in-flight session for this workspace, or start one.
    ///
    /// A session bound to a different container (left over from before an
    /// archive) is replaced.
    pub async fn begin(&self, workspace: Arc<Workspace>) -> Arc<SessionContext> {
        let mut sessions = self.sessions.write().await;
        if let Some(existing) = sessions.get(&workspace.project_id) {
            if Arc::ptr_eq(&existing.workspace, &workspace) {
                debug!("Rejoining session for project {}", workspace.project_id);
                return existing.clone();
            }
        }

        let session = Arc::new(SessionContext::new(workspace));
        sessions.insert(session.project_id.clone(), session.clone());
        debug!("Started session for project {}", session.project_id);
        session
    }

    pub async fn get(&self, project_id: &str) -> Option<Arc<SessionContext>> {
        self.sessions.read().await.get(project_id).cloned()
    }

    pub async fn end(&self, project_id: &str) -> Option<Arc<SessionContext>> {
        let ended = self.sessions.write().await.remove(project_id);
        if ended.is_some() {
            debug!("Ended session for project {}", project_id);
        }
        ended
    }
}

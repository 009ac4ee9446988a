// ABOUTME: In-process registry of live workspaces keyed by project identifier
// ABOUTME: Serializes every mutation for a project behind that project's own lock

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex, MutexGuard};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::debug;

use crate::error::{Result, WorkspaceError};
use crate::runtime::Workspace;

type Slot = Arc<Mutex<Option<Arc<Workspace>>>>;
type Slots = Arc<StdMutex<HashMap<String, Slot>>>;

fn lock_slots(slots: &Slots) -> MutexGuard<'_, HashMap<String, Slot>> {
    slots.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// The single mapping from project to live workspace.
///
/// Each project has its own slot lock. Holding a [`RegistryEntry`] excludes every
/// other create, archive or restore for that project, while other projects proceed
/// independently. Empty slots are dropped once nobody holds or waits on them.
#[derive(Default)]
pub struct WorkspaceRegistry {
    slots: Slots,
}

/// Exclusive access to one project's registry slot.
pub struct RegistryEntry {
    project_id: String,
    slots: Slots,
    guard: OwnedMutexGuard<Option<Arc<Workspace>>>,
}

impl RegistryEntry {
    pub fn project_id(&self) -> &str {
        &self.project_id
    }

    pub fn workspace(&self) -> Option<Arc<Workspace>> {
        self.guard.clone()
    }

    /// Register `workspace`. Fails if the slot is already occupied.
    pub fn insert(&mut self, workspace: Arc<Workspace>) -> Result<Arc<Workspace>> {
        if self.guard.is_some() {
            return Err(WorkspaceError::RegistryConflict(self.project_id.clone()));
        }
        debug!(
            "Registered workspace {} for project {}",
            workspace.container_id, self.project_id
        );
        *self.guard = Some(workspace.clone());
        Ok(workspace)
    }

    pub fn take(&mut self) -> Option<Arc<Workspace>> {
        let taken = self.guard.take();
        if taken.is_some() {
            debug!("Dropped workspace for project {}", self.project_id);
        }
        taken
    }
}

impl Drop for RegistryEntry {
    fn drop(&mut self) {
        if self.guard.is_some() {
            return;
        }
        // Waiters clone the slot under the map lock, so with the map held a
        // count of two (map and this guard) means nobody else can reach it.
        let mut slots = lock_slots(&self.slots);
        let ours = OwnedMutexGuard::mutex(&self.guard);
        let unshared = slots
            .get(&self.project_id)
            .is_some_and(|slot| Arc::ptr_eq(slot, ours) && Arc::strong_count(ours) == 2);
        if unshared {
            slots.remove(&self.project_id);
        }
    }
}

impl WorkspaceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, project_id: &str) -> Slot {
        lock_slots(&self.slots)
            .entry(project_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(None)))
            .clone()
    }

    /// Wait for exclusive access to a project's slot.
    pub async fn entry(&self, project_id: &str) -> RegistryEntry {
        let guard = self.slot(project_id).lock_owned().await;
        RegistryEntry {
            project_id: project_id.to_string(),
            slots: self.slots.clone(),
            guard,
        }
    }

    pub async fn get(&self, project_id: &str) -> Option<Arc<Workspace>> {
        self.entry(project_id).await.workspace()
    }

    pub async fn insert(&self, workspace: Arc<Workspace>) -> Result<Arc<Workspace>> {
        let mut entry = self.entry(&workspace.project_id).await;
        entry.insert(workspace)
    }

    pub async fn remove(&self, project_id: &str) -> Option<Arc<Workspace>> {
        self.entry(project_id).await.take()
    }

    /// Find the registered workspace running in `container_id`.
    ///
    /// Slots that are busy with a lifecycle operation are skipped.
    pub fn find_by_container(&self, container_id: &str) -> Option<Arc<Workspace>> {
        let slots: Vec<Slot> = lock_slots(&self.slots).values().cloned().collect();
        slots.iter().find_map(|slot| {
            slot.try_lock()
                .ok()
                .and_then(|guard| guard.clone())
                .filter(|ws| ws.container_id == container_id)
        })
    }

    /// Projects with a registered workspace, skipping slots that are busy.
    pub fn project_ids(&self) -> Vec<String> {
        let slots = lock_slots(&self.slots);
        let mut ids: Vec<String> = slots
            .iter()
            .filter(|(_, slot)| slot.try_lock().map(|g| g.is_some()).unwrap_or(false))
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }

    /// Number of slots currently tracked, occupied or not.
    pub fn slot_count(&self) -> usize {
        lock_slots(&self.slots).len()
    }
}

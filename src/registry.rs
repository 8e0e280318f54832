//! Task registry: the authoritative lifecycle record of every generation job.
//!
//! Two views are kept. The durable [`TaskStore`] is the source of truth and is
//! written on every mutation before the mutation is visible anywhere else. The
//! fast view is an in-memory map of live tasks used for low-latency polling.
//! Reads that merge both (`get`, `list`) are eventually consistent; on an id
//! collision the fast view wins because it is never older than the store for
//! in-flight tasks.
//!
//! Each task in the fast view sits behind its own async mutex so writers to one
//! id are serialized while writers to different ids proceed independently. The
//! outer map lock is only held to look up or insert an entry, never across an
//! await point.

use crate::db::TaskStore;
use crate::error::RegistryError;
use crate::events::TaskEvent;
use crate::task::{self, NewTask, Task, TaskPatch, TaskStatus};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, Mutex};
use tokio_util::sync::CancellationToken;

struct LiveState {
    task: Task,
    /// Set once the task turns terminal; the cleanup pass drops it after this instant.
    evict_at: Option<Instant>,
}

struct LiveEntry {
    cancel: CancellationToken,
    state: Mutex<LiveState>,
}

impl LiveEntry {
    fn new(task: Task, evict_at: Option<Instant>) -> Arc<Self> {
        let cancel = CancellationToken::new();
        if task.status == TaskStatus::Cancelled {
            cancel.cancel();
        }
        Arc::new(LiveEntry {
            cancel,
            state: Mutex::new(LiveState { task, evict_at }),
        })
    }
}

type Entry = Arc<LiveEntry>;

pub struct TaskRegistry {
    store: Arc<dyn TaskStore>,
    live: RwLock<HashMap<String, Entry>>,
    events: broadcast::Sender<TaskEvent>,
    grace: Duration,
}

impl TaskRegistry {
    pub fn new(
        store: Arc<dyn TaskStore>,
        events: broadcast::Sender<TaskEvent>,
        grace: Duration,
    ) -> Self {
        TaskRegistry {
            store,
            live: RwLock::new(HashMap::new()),
            events,
            grace,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TaskEvent> {
        self.events.subscribe()
    }

    /// Register a new pending task. Does not start any work.
    pub async fn create(&self, req: NewTask) -> Result<Task, RegistryError> {
        let task = Task::new(req);
        self.store.upsert_task(&task)?;

        let entry = LiveEntry::new(task.clone(), None);
        self.write_live().insert(task.id.clone(), entry);

        tracing::debug!(task_id = %task.id, kind = task.kind.as_str(), "task created");
        self.publish(&task);
        Ok(task)
    }

    /// Merge `patch` into the task and write it through to the store.
    pub async fn update(&self, id: &str, patch: TaskPatch) -> Result<Task, RegistryError> {
        loop {
            let entry = self.load_entry(id)?;
            let mut guard = entry.state.lock().await;

            // evicted between lookup and lock: this entry is orphaned, reload it
            if !self.is_current(id, &entry) {
                drop(guard);
                continue;
            }

            let mut next = guard.task.clone();
            next.apply(patch, task::now());
            self.store.upsert_task(&next)?;

            if next.status == TaskStatus::Cancelled {
                entry.cancel.cancel();
            }
            if next.status.is_terminal() && guard.evict_at.is_none() {
                guard.evict_at = Some(Instant::now() + self.grace);
            }
            guard.task = next.clone();
            drop(guard);

            self.publish(&next);
            return Ok(next);
        }
    }

    /// Prefer the fast view; fall back to the durable store.
    pub async fn get(&self, id: &str) -> Result<Task, RegistryError> {
        let entry = self.read_live().get(id).cloned();
        if let Some(entry) = entry {
            return Ok(entry.state.lock().await.task.clone());
        }
        self.store
            .get_task(id)?
            .ok_or_else(|| RegistryError::NotFound(id.to_string()))
    }

    /// Tasks of one owner, newest first, merged from both views.
    pub async fn list(
        &self,
        owner_id: &str,
        status: Option<TaskStatus>,
        limit: usize,
    ) -> Result<Vec<Task>, RegistryError> {
        let mut merged: HashMap<String, Task> = self
            .store
            .list_tasks(owner_id, status, limit)?
            .into_iter()
            .map(|t| (t.id.clone(), t))
            .collect();

        for task in self.live_snapshot().await {
            if task.owner_id == owner_id {
                merged.insert(task.id.clone(), task);
            }
        }

        let mut tasks: Vec<Task> = merged
            .into_values()
            .filter(|t| status.map_or(true, |s| t.status == s))
            .collect();
        tasks.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| a.id.cmp(&b.id)));
        tasks.truncate(limit);
        Ok(tasks)
    }

    /// Record cancellation intent. In-flight provider calls are not interrupted;
    /// the executor observes the token at its next checkpoint.
    pub async fn cancel(&self, id: &str) -> Result<Task, RegistryError> {
        let task = self.update(id, TaskPatch::status(TaskStatus::Cancelled)).await?;
        if task.status == TaskStatus::Cancelled {
            tracing::info!(task_id = %id, "task cancelled");
        }
        Ok(task)
    }

    /// Pending or running tasks of one owner, from the fast view only.
    pub async fn count_running(&self, owner_id: &str) -> usize {
        self.live_snapshot()
            .await
            .iter()
            .filter(|t| t.owner_id == owner_id && t.status.is_active())
            .count()
    }

    /// Token the executor checks at each checkpoint. `None` once the task has left the fast view.
    pub fn cancellation_token(&self, id: &str) -> Option<CancellationToken> {
        let entry = self.read_live().get(id).cloned()?;
        Some(entry.cancel.clone())
    }

    /// Whether the task is currently held in the fast view.
    pub fn is_live(&self, id: &str) -> bool {
        self.read_live().contains_key(id)
    }

    /// Drop terminal tasks whose grace window has elapsed. Entries being
    /// mutated right now are skipped and picked up by the next pass.
    pub fn evict_expired(&self) -> usize {
        let now = Instant::now();
        let mut live = self.write_live();
        let before = live.len();
        live.retain(|_, entry| match entry.state.try_lock() {
            Ok(e) => !matches!(e.evict_at, Some(at) if at <= now),
            Err(_) => true,
        });
        before - live.len()
    }

    fn load_entry(&self, id: &str) -> Result<Entry, RegistryError> {
        let cached = self.read_live().get(id).cloned();
        if let Some(entry) = cached {
            return Ok(entry);
        }

        let task = self
            .store
            .get_task(id)?
            .ok_or_else(|| RegistryError::NotFound(id.to_string()))?;
        let evict_at = task
            .status
            .is_terminal()
            .then(|| Instant::now() + self.grace);

        // another writer may have loaded the same id meanwhile; keep theirs
        let mut live = self.write_live();
        let entry = live
            .entry(id.to_string())
            .or_insert_with(|| LiveEntry::new(task, evict_at));
        Ok(entry.clone())
    }

    fn is_current(&self, id: &str, entry: &Entry) -> bool {
        self.read_live()
            .get(id)
            .map_or(false, |live| Arc::ptr_eq(live, entry))
    }

    async fn live_snapshot(&self) -> Vec<Task> {
        let entries: Vec<Entry> = self.read_live().values().cloned().collect();
        let mut tasks = Vec::with_capacity(entries.len());
        for entry in entries {
            tasks.push(entry.state.lock().await.task.clone());
        }
        tasks
    }

    fn read_live(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, Entry>> {
        self.live.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write_live(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, Entry>> {
        self.live.write().unwrap_or_else(|e| e.into_inner())
    }

    fn publish(&self, task: &Task) {
        // no subscribers is fine
        let _ = self.events.send(TaskEvent::from(task));
    }
}

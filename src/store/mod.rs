//! Interfaces onto the replicated document store.
//!
//! The store itself lives outside the daemon (it is replicated and
//! conflict-resolved elsewhere). The daemon consumes it as a JSON
//! projection plus batched mutations, expressed here as the `TaskStore`
//! and `SetupStatusStore` traits. `MemoryStore` backs tests and
//! standalone operation; `json_file::JsonFileStore` persists the same
//! projection to disk so state survives a daemon restart.

pub mod json_file;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::Mutex;

/// Milliseconds since the Unix epoch, the store's native timestamp unit.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

// ─── Task documents ──────────────────────────────────────────────────────────

/// Task lifecycle status as replicated by the review UI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TaskStatus {
    Backlog,
    Starting,
    Working,
    InputRequired,
    Review,
    Done,
    Failed,
}

impl TaskStatus {
    /// A transitional status implies an agent was running or awaiting input
    /// when the daemon last wrote it — suspect after an unclean shutdown.
    pub fn is_transitional(self) -> bool {
        matches!(
            self,
            TaskStatus::Working | TaskStatus::Starting | TaskStatus::InputRequired
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskSessionStatus {
    Active,
    Pending,
    Interrupted,
    Completed,
    Failed,
}

/// One agent run recorded under a task. Sessions are stored oldest-first;
/// the most recent session is the last element.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskSession {
    pub id: String,
    pub status: TaskSessionStatus,
    pub started_at: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskDoc {
    pub id: String,
    pub status: TaskStatus,
    #[serde(default)]
    pub sessions: Vec<TaskSession>,
    pub updated_at: i64,
}

#[async_trait]
pub trait TaskStore: Send + Sync {
    async fn load_tasks(&self) -> Result<Vec<TaskDoc>>;
    async fn save_task(&self, doc: &TaskDoc) -> Result<()>;
}

// ─── Worktree setup-status entries ───────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SetupStatus {
    Running,
    Done,
    Failed,
}

impl SetupStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, SetupStatus::Done | SetupStatus::Failed)
    }
}

/// Progress record for a worktree setup script, keyed by worktree path.
/// Owned by the machine that created it (`machine_id`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetupStatusEntry {
    pub status: SetupStatus,
    pub machine_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    pub started_at: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signal: Option<String>,
}

/// One transaction's worth of setup-status changes. Applied atomically by
/// the store so a crashed sweep never leaves half its edits behind.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SetupStatusBatch {
    pub deletes: Vec<String>,
    pub updates: Vec<(String, SetupStatusEntry)>,
}

impl SetupStatusBatch {
    pub fn is_empty(&self) -> bool {
        self.deletes.is_empty() && self.updates.is_empty()
    }

    pub fn len(&self) -> usize {
        self.deletes.len() + self.updates.len()
    }
}

#[async_trait]
pub trait SetupStatusStore: Send + Sync {
    async fn entries(&self) -> Result<HashMap<String, SetupStatusEntry>>;
    async fn apply(&self, batch: SetupStatusBatch) -> Result<()>;
}

// ─── In-memory store ─────────────────────────────────────────────────────────

/// In-memory store backing tests and standalone runs.
#[derive(Default)]
pub struct MemoryStore {
    tasks: Mutex<HashMap<String, TaskDoc>>,
    setup_entries: Mutex<HashMap<String, SetupStatusEntry>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert_task(&self, doc: TaskDoc) {
        self.tasks.lock().await.insert(doc.id.clone(), doc);
    }

    pub async fn insert_setup_entry(&self, path: &str, entry: SetupStatusEntry) {
        self.setup_entries
            .lock()
            .await
            .insert(path.to_string(), entry);
    }
}

#[async_trait]
impl TaskStore for MemoryStore {
    async fn load_tasks(&self) -> Result<Vec<TaskDoc>> {
        let mut docs: Vec<TaskDoc> = self.tasks.lock().await.values().cloned().collect();
        docs.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(docs)
    }

    async fn save_task(&self, doc: &TaskDoc) -> Result<()> {
        self.tasks
            .lock()
            .await
            .insert(doc.id.clone(), doc.clone());
        Ok(())
    }
}

#[async_trait]
impl SetupStatusStore for MemoryStore {
    async fn entries(&self) -> Result<HashMap<String, SetupStatusEntry>> {
        Ok(self.setup_entries.lock().await.clone())
    }

    async fn apply(&self, batch: SetupStatusBatch) -> Result<()> {
        let mut map = self.setup_entries.lock().await;
        for path in &batch.deletes {
            map.remove(path);
        }
        for (path, entry) in batch.updates {
            map.insert(path, entry);
        }
        Ok(())
    }
}

//! File-backed store adapter.
//!
//! Persists the daemon's projection of the replicated store to a single
//! JSON file under the data directory. In a full deployment the replicated
//! store replaces this adapter; the on-disk shape matches the replicated
//! projection so the two are interchangeable behind the traits.

use super::{
    SetupStatusBatch, SetupStatusEntry, SetupStatusStore, TaskDoc, TaskStore,
};
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StateFile {
    #[serde(default)]
    tasks: HashMap<String, TaskDoc>,
    #[serde(default)]
    worktree_setup_status: HashMap<String, SetupStatusEntry>,
}

pub struct JsonFileStore {
    path: PathBuf,
    // Serializes read-modify-write cycles; the daemon is the only writer.
    lock: Mutex<()>,
}

impl JsonFileStore {
    pub fn new(data_dir: &Path) -> Self {
        Self {
            path: data_dir.join("state.json"),
            lock: Mutex::new(()),
        }
    }

    async fn read_state(&self) -> Result<StateFile> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .with_context(|| format!("corrupt state file at {}", self.path.display())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(StateFile::default()),
            Err(e) => Err(e).context("failed to read state file"),
        }
    }

    async fn write_state(&self, state: &StateFile) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .context("failed to create data directory")?;
        }
        // Write-then-rename so a crash mid-write never truncates good state.
        let tmp = self.path.with_extension("json.tmp");
        let bytes = serde_json::to_vec_pretty(state)?;
        tokio::fs::write(&tmp, bytes)
            .await
            .context("failed to write state file")?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .context("failed to replace state file")?;
        Ok(())
    }
}

#[async_trait]
impl TaskStore for JsonFileStore {
    async fn load_tasks(&self) -> Result<Vec<TaskDoc>> {
        let _guard = self.lock.lock().await;
        let state = self.read_state().await?;
        let mut docs: Vec<TaskDoc> = state.tasks.into_values().collect();
        docs.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(docs)
    }

    async fn save_task(&self, doc: &TaskDoc) -> Result<()> {
        let _guard = self.lock.lock().await;
        let mut state = self.read_state().await?;
        state.tasks.insert(doc.id.clone(), doc.clone());
        self.write_state(&state).await
    }
}

#[async_trait]
impl SetupStatusStore for JsonFileStore {
    async fn entries(&self) -> Result<HashMap<String, SetupStatusEntry>> {
        let _guard = self.lock.lock().await;
        Ok(self.read_state().await?.worktree_setup_status)
    }

    async fn apply(&self, batch: SetupStatusBatch) -> Result<()> {
        let _guard = self.lock.lock().await;
        let mut state = self.read_state().await?;
        for path in &batch.deletes {
            state.worktree_setup_status.remove(path);
        }
        for (path, entry) in batch.updates {
            state.worktree_setup_status.insert(path, entry);
        }
        self.write_state(&state).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{SetupStatus, TaskStatus};
    use tempfile::TempDir;

    #[tokio::test]
    async fn round_trips_tasks_across_instances() {
        let dir = TempDir::new().unwrap();
        let store = JsonFileStore::new(dir.path());
        let doc = TaskDoc {
            id: "t1".into(),
            status: TaskStatus::Working,
            sessions: vec![],
            updated_at: 42,
        };
        store.save_task(&doc).await.unwrap();

        // A second instance pointing at the same directory sees the task.
        let reopened = JsonFileStore::new(dir.path());
        let docs = reopened.load_tasks().await.unwrap();
        assert_eq!(docs, vec![doc]);
    }

    #[tokio::test]
    async fn missing_file_is_empty_store() {
        let dir = TempDir::new().unwrap();
        let store = JsonFileStore::new(dir.path());
        assert!(store.load_tasks().await.unwrap().is_empty());
        assert!(store.entries().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn batch_is_applied_atomically_to_disk() {
        let dir = TempDir::new().unwrap();
        let store = JsonFileStore::new(dir.path());
        let entry = SetupStatusEntry {
            status: SetupStatus::Running,
            machine_id: "m1".into(),
            pid: Some(1),
            started_at: 1,
            completed_at: None,
            exit_code: None,
            signal: None,
        };
        store
            .apply(SetupStatusBatch {
                deletes: vec![],
                updates: vec![("/w/a".into(), entry.clone())],
            })
            .await
            .unwrap();

        let entries = store.entries().await.unwrap();
        assert_eq!(entries["/w/a"], entry);
    }
}

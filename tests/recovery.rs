//! Integration tests for startup state repair across daemon restarts.
//! These use the file-backed store directly (no agent CLI needed).

use reviewd::recovery::{recover_orphaned_tasks, ORPHANED_SESSION_ERROR};
use reviewd::store::{
    json_file::JsonFileStore, SetupStatus, SetupStatusBatch, SetupStatusEntry, SetupStatusStore,
    TaskDoc, TaskSession, TaskSessionStatus, TaskStatus, TaskStore,
};
use reviewd::worktrees::cleanup_stale_setup_entries;
use tempfile::TempDir;

fn working_task(id: &str) -> TaskDoc {
    TaskDoc {
        id: id.to_string(),
        status: TaskStatus::Working,
        sessions: vec![TaskSession {
            id: format!("{id}-s1"),
            status: TaskSessionStatus::Active,
            started_at: 1_000,
            completed_at: None,
            error: None,
        }],
        updated_at: 1_000,
    }
}

#[tokio::test]
async fn interrupted_tasks_are_failed_on_restart() {
    let dir = TempDir::new().unwrap();

    // 1. First daemon run leaves a task mid-flight.
    {
        let store = JsonFileStore::new(dir.path());
        store.save_task(&working_task("t1")).await.unwrap();
        store
            .save_task(&TaskDoc {
                id: "t2".into(),
                status: TaskStatus::Review,
                sessions: vec![],
                updated_at: 1_000,
            })
            .await
            .unwrap();
    }

    // 2. Simulate restart: a fresh store instance over the same directory.
    let store = JsonFileStore::new(dir.path());
    let recovered = recover_orphaned_tasks(&store).await.unwrap();
    assert_eq!(recovered, 1);

    let docs = store.load_tasks().await.unwrap();
    let t1 = docs.iter().find(|d| d.id == "t1").unwrap();
    assert_eq!(t1.status, TaskStatus::Failed);
    assert_eq!(t1.sessions[0].status, TaskSessionStatus::Interrupted);
    assert_eq!(t1.sessions[0].error.as_deref(), Some(ORPHANED_SESSION_ERROR));
    assert!(t1.sessions[0].completed_at.unwrap() > 0);

    // The reviewed task is untouched.
    let t2 = docs.iter().find(|d| d.id == "t2").unwrap();
    assert_eq!(t2.status, TaskStatus::Review);
    assert_eq!(t2.updated_at, 1_000);

    // 3. A second recovery pass finds nothing left to repair.
    assert_eq!(recover_orphaned_tasks(&store).await.unwrap(), 0);
}

#[tokio::test]
async fn worktree_sweep_repairs_local_dead_entries_across_restart() {
    let dir = TempDir::new().unwrap();
    let now = reviewd::store::now_millis();

    {
        let store = JsonFileStore::new(dir.path());
        store
            .apply(SetupStatusBatch {
                deletes: vec![],
                updates: vec![
                    (
                        "/w/dead".into(),
                        SetupStatusEntry {
                            status: SetupStatus::Running,
                            machine_id: "local".into(),
                            pid: Some(999_999),
                            started_at: now - 60_000,
                            completed_at: None,
                            exit_code: None,
                            signal: None,
                        },
                    ),
                    (
                        "/w/foreign".into(),
                        SetupStatusEntry {
                            status: SetupStatus::Running,
                            machine_id: "another-machine".into(),
                            pid: Some(999_999),
                            started_at: now - 60_000,
                            completed_at: None,
                            exit_code: None,
                            signal: None,
                        },
                    ),
                ],
            })
            .await
            .unwrap();
    }

    let store = JsonFileStore::new(dir.path());
    let changes = cleanup_stale_setup_entries(&store, "local").await;
    assert_eq!(changes, 1);

    let entries = store.entries().await.unwrap();
    assert_eq!(entries["/w/dead"].status, SetupStatus::Failed);
    assert!(entries["/w/dead"].completed_at.unwrap() >= now);
    // Another machine's running entry is never touched.
    assert_eq!(entries["/w/foreign"].status, SetupStatus::Running);
}

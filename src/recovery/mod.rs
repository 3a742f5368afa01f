//! Startup recovery of tasks left in a crash-interruptible state.
//!
//! A task whose replicated status is transitional (`working`, `starting`,
//! `input-required`) when the daemon starts can only mean the previous
//! daemon died mid-run: the agent process it was supervising is gone. The
//! task is failed and its most recent live session marked interrupted.

use crate::store::{TaskDoc, TaskSessionStatus, TaskStore};
use anyhow::Result;
use tracing::{info, warn};

/// Error recorded on a session orphaned by an unclean daemon shutdown.
pub const ORPHANED_SESSION_ERROR: &str = "Daemon process exited unexpectedly";

/// Reset one task out of a crash-interruptible state.
///
/// No-op (returns `false`) unless the status is transitional. Otherwise
/// the most recent `active`/`pending` session (if any) becomes
/// `interrupted` with `completed_at = now` and the fixed error message,
/// and the task itself becomes `failed` — whether or not a session was
/// found.
pub fn recover_orphaned_task(task: &mut TaskDoc, now_ms: i64) -> bool {
    if !task.status.is_transitional() {
        return false;
    }

    // Sessions are stored oldest-first; scan from the most recent.
    for session in task.sessions.iter_mut().rev() {
        if matches!(
            session.status,
            TaskSessionStatus::Active | TaskSessionStatus::Pending
        ) {
            session.status = TaskSessionStatus::Interrupted;
            session.completed_at = Some(now_ms);
            session.error = Some(ORPHANED_SESSION_ERROR.to_string());
            break;
        }
    }

    task.status = crate::store::TaskStatus::Failed;
    task.updated_at = now_ms;
    true
}

/// Startup pass: run [`recover_orphaned_task`] over every task in the
/// store and persist the ones that changed. Returns the recovered count.
pub async fn recover_orphaned_tasks(store: &dyn TaskStore) -> Result<u64> {
    let mut recovered = 0u64;
    for mut task in store.load_tasks().await? {
        if recover_orphaned_task(&mut task, crate::store::now_millis()) {
            info!(task_id = %task.id, "recovered orphaned task from previous run");
            if let Err(e) = store.save_task(&task).await {
                warn!(task_id = %task.id, err = %e, "failed to persist recovered task");
                continue;
            }
            recovered += 1;
        }
    }
    Ok(recovered)
}

//! Startup sweep over the replicated worktree setup-status map.
//!
//! Reaps entries left behind by dead setup processes and by age. Entries
//! are machine-owned: a `running` entry is only reset by the machine that
//! created it; terminal entries old enough are deleted by whoever sees
//! them first (the store's conflict resolution makes duplicate deletes
//! harmless).

use crate::store::{now_millis, SetupStatus, SetupStatusBatch, SetupStatusEntry, SetupStatusStore};
use std::collections::HashMap;
use tracing::{info, warn};

/// Terminal entries completed longer ago than this are deleted.
pub const STALE_ENTRY_MAX_AGE_MS: i64 = 7 * 24 * 60 * 60 * 1000;

/// Signal-0 liveness probe.
///
/// `true` only when the OS confirms the pid is reachable. Any error —
/// including permission-denied, which on multi-user systems can mean the
/// process exists but belongs to someone else — reports `false`.
#[cfg(unix)]
pub fn is_pid_alive(pid: u32) -> bool {
    // SAFETY: signal 0 performs error checking only; no signal is sent.
    unsafe { libc::kill(pid as libc::pid_t, 0) == 0 }
}

#[cfg(not(unix))]
pub fn is_pid_alive(_pid: u32) -> bool {
    false
}

/// Pure classification of one sweep. Terminal entries past the age window
/// are deleted regardless of owner; `running` entries owned by
/// `local_machine_id` whose pid is dead or missing are reset to `failed`
/// with `completed_at = now` and every other field preserved; `running`
/// entries owned by other machines are never touched.
pub fn classify_stale_entries(
    entries: &HashMap<String, SetupStatusEntry>,
    local_machine_id: &str,
    now_ms: i64,
) -> SetupStatusBatch {
    let mut batch = SetupStatusBatch::default();

    for (path, entry) in entries {
        if entry.status.is_terminal() {
            if let Some(completed_at) = entry.completed_at {
                if now_ms - completed_at > STALE_ENTRY_MAX_AGE_MS {
                    batch.deletes.push(path.clone());
                }
            }
            continue;
        }

        // status == running
        if entry.machine_id != local_machine_id {
            continue;
        }
        let dead = entry.pid.map(|pid| !is_pid_alive(pid)).unwrap_or(true);
        if dead {
            let mut updated = entry.clone();
            updated.status = SetupStatus::Failed;
            updated.completed_at = Some(now_ms);
            batch.updates.push((path.clone(), updated));
        }
    }

    batch.deletes.sort();
    batch.updates.sort_by(|a, b| a.0.cmp(&b.0));
    batch
}

/// Single startup pass: classify, then apply everything in one batched
/// mutation. An empty classification performs zero mutations and logs
/// nothing. Store errors are caught and logged as warnings — startup
/// always continues. Returns the number of changes applied.
pub async fn cleanup_stale_setup_entries(
    store: &dyn SetupStatusStore,
    local_machine_id: &str,
) -> u64 {
    let entries = match store.entries().await {
        Ok(e) => e,
        Err(e) => {
            warn!(err = %e, "worktree setup-status sweep failed to read store");
            return 0;
        }
    };

    let batch = classify_stale_entries(&entries, local_machine_id, now_millis());
    if batch.is_empty() {
        return 0;
    }

    let changes = batch.len() as u64;
    let deleted = batch.deletes.len();
    let reset = batch.updates.len();
    if let Err(e) = store.apply(batch).await {
        warn!(err = %e, "worktree setup-status sweep failed to apply batch");
        return 0;
    }
    info!(deleted, reset, "reaped stale worktree setup entries");
    changes
}

//! Filesystem-driven branch tracking.
//!
//! Watches each tracked environment's git HEAD file (resolving worktree
//! `gitdir:` indirection), debounces change bursts per environment, and
//! re-resolves branch/remote metadata through the capability-detection
//! collaborator. A single subscriber receives the full updated environment
//! list whenever anything actually changed.

use crate::capabilities::{Environment, EnvironmentDetector};
use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tracing::{debug, warn};

/// Quiet period before a burst of HEAD changes collapses into one
/// metadata re-resolution.
const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(500);

type UpdateFn = Box<dyn Fn(Vec<Environment>) + Send + Sync>;

/// Per-environment watch state: the live filesystem watch plus at most one
/// pending debounce timer.
struct WatchedHead {
    _watcher: RecommendedWatcher,
    head_path: PathBuf,
    pending: Option<tokio::task::JoinHandle<()>>,
}

struct Inner {
    detector: Arc<dyn EnvironmentDetector>,
    on_update: UpdateFn,
    debounce: Duration,
    closed: AtomicBool,
    environments: Mutex<Vec<Environment>>,
    watches: Mutex<HashMap<String, WatchedHead>>,
}

pub struct BranchWatcher {
    inner: Arc<Inner>,
}

impl BranchWatcher {
    /// Start watching `environments`. Must be called from within a tokio
    /// runtime — filesystem events are bridged onto it for debouncing.
    ///
    /// A watch-setup failure for one environment never prevents the others
    /// from being watched.
    pub fn spawn(
        environments: Vec<Environment>,
        detector: Arc<dyn EnvironmentDetector>,
        on_update: impl Fn(Vec<Environment>) + Send + Sync + 'static,
    ) -> Self {
        Self::spawn_with_debounce(environments, detector, on_update, DEFAULT_DEBOUNCE)
    }

    pub fn spawn_with_debounce(
        environments: Vec<Environment>,
        detector: Arc<dyn EnvironmentDetector>,
        on_update: impl Fn(Vec<Environment>) + Send + Sync + 'static,
        debounce: Duration,
    ) -> Self {
        let inner = Arc::new(Inner {
            detector,
            on_update: Box::new(on_update),
            debounce,
            closed: AtomicBool::new(false),
            environments: Mutex::new(Vec::new()),
            watches: Mutex::new(HashMap::new()),
        });

        for env in environments {
            let path = env.path.clone();
            inner.environments.lock().unwrap().push(env);
            Inner::watch_environment(&inner, &path);
        }

        Self { inner }
    }

    /// Track one more environment, with the same HEAD resolution and watch
    /// setup as at construction. A path already tracked is left untouched.
    pub fn add_environment(&self, path: &str, branch: &str) {
        if self.inner.closed.load(Ordering::SeqCst) {
            return;
        }
        {
            let mut envs = self.inner.environments.lock().unwrap();
            if envs.iter().any(|e| e.path == path) {
                return;
            }
            let name = Path::new(path)
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_else(|| path.to_string());
            envs.push(Environment {
                path: path.to_string(),
                name,
                branch: branch.to_string(),
                remote: None,
            });
        }
        Inner::watch_environment(&self.inner, path);
    }

    /// Current tracked environment list.
    pub fn environments(&self) -> Vec<Environment> {
        self.inner.environments.lock().unwrap().clone()
    }

    pub fn watched_count(&self) -> usize {
        self.inner.watches.lock().unwrap().len()
    }

    /// Resolved HEAD file paths currently under watch, keyed by environment.
    pub fn watched_heads(&self) -> HashMap<String, PathBuf> {
        self.inner
            .watches
            .lock()
            .unwrap()
            .iter()
            .map(|(path, w)| (path.clone(), w.head_path.clone()))
            .collect()
    }

    /// Stop all watches and cancel every pending debounce. Idempotent; no
    /// update callback fires after close.
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut watches = self.inner.watches.lock().unwrap();
        for (_, watched) in watches.drain() {
            if let Some(pending) = watched.pending {
                pending.abort();
            }
            // RecommendedWatcher stops on drop.
        }
    }
}

impl Drop for BranchWatcher {
    fn drop(&mut self) {
        self.close();
    }
}

impl Inner {
    /// Resolve the environment's HEAD file and start a non-recursive watch
    /// on it. Failures degrade to "not watched" — logged, never thrown.
    fn watch_environment(inner: &Arc<Inner>, path: &str) {
        if inner.watches.lock().unwrap().contains_key(path) {
            return;
        }
        let head_path = match resolve_head_path(Path::new(path)) {
            Some(p) => p,
            None => {
                debug!(path, "no resolvable HEAD file — environment not watched");
                return;
            }
        };

        let rt = tokio::runtime::Handle::current();
        let weak: Weak<Inner> = Arc::downgrade(inner);
        let event_path = path.to_string();

        let mut watcher = match notify::recommended_watcher(
            move |res: notify::Result<notify::Event>| {
                if let Err(e) = res {
                    warn!(path = %event_path, err = %e, "HEAD watch error");
                    return;
                }
                let Some(inner) = weak.upgrade() else { return };
                let path = event_path.clone();
                rt.spawn(async move {
                    Inner::schedule_debounce(&inner, &path);
                });
            },
        ) {
            Ok(w) => w,
            Err(e) => {
                warn!(path, err = %e, "failed to create HEAD watcher");
                return;
            }
        };

        if let Err(e) = watcher.watch(&head_path, RecursiveMode::NonRecursive) {
            warn!(path, head = %head_path.display(), err = %e, "failed to watch HEAD file");
            return;
        }
        debug!(path, head = %head_path.display(), "watching HEAD");

        inner.watches.lock().unwrap().insert(
            path.to_string(),
            WatchedHead {
                _watcher: watcher,
                head_path,
                pending: None,
            },
        );
    }

    /// Start or refresh this environment's debounce timer. Bursts within
    /// the quiet period collapse to a single resolution.
    fn schedule_debounce(inner: &Arc<Inner>, path: &str) {
        if inner.closed.load(Ordering::SeqCst) {
            return;
        }
        let mut watches = inner.watches.lock().unwrap();
        let Some(watched) = watches.get_mut(path) else { return };
        if let Some(pending) = watched.pending.take() {
            pending.abort();
        }
        let inner_task = Arc::clone(inner);
        let path_task = path.to_string();
        watched.pending = Some(tokio::spawn(async move {
            tokio::time::sleep(inner_task.debounce).await;
            inner_task.resolve(&path_task).await;
        }));
    }

    /// Re-detect metadata for one environment after its debounce fired.
    async fn resolve(self: &Arc<Self>, path: &str) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        let detected = match self.detector.detect(Path::new(path)).await {
            Ok(d) => d,
            Err(e) => {
                warn!(path, err = %e, "environment re-detection failed");
                return;
            }
        };

        let mut removed = false;
        let updated = {
            let mut envs = self.environments.lock().unwrap();
            match detected {
                // Repository gone — drop it and notify with the reduced list.
                None => {
                    let before = envs.len();
                    envs.retain(|e| e.path != path);
                    removed = envs.len() != before;
                    removed.then(|| envs.clone())
                }
                Some(meta) => {
                    let changed = match envs.iter_mut().find(|e| e.path == path) {
                        Some(existing)
                            if existing.branch != meta.branch
                                || existing.remote != meta.remote =>
                        {
                            *existing = meta;
                            true
                        }
                        // Unchanged, or removed concurrently — no notification.
                        _ => false,
                    };
                    changed.then(|| envs.clone())
                }
            }
        };

        if removed {
            if let Some(watched) = self.watches.lock().unwrap().remove(path) {
                if let Some(pending) = watched.pending {
                    pending.abort();
                }
            }
        }

        if let Some(list) = updated {
            if !self.closed.load(Ordering::SeqCst) {
                (self.on_update)(list);
            }
        }
    }
}

// ─── HEAD resolution ─────────────────────────────────────────────────────────

/// Resolve the HEAD file to watch for a repository path.
///
/// `${path}/.git` as a directory means a primary checkout
/// (`${path}/.git/HEAD`); as a regular file it is a worktree pointer whose
/// `gitdir: <target>` line names the real git dir (absolute, or relative to
/// `path`). Anything unreadable or unrecognized resolves to `None`.
pub fn resolve_head_path(repo_path: &Path) -> Option<PathBuf> {
    let dot_git = repo_path.join(".git");
    let meta = std::fs::metadata(&dot_git).ok()?;

    if meta.is_dir() {
        return Some(dot_git.join("HEAD"));
    }
    if meta.is_file() {
        let content = std::fs::read_to_string(&dot_git).ok()?;
        let target = content.lines().next()?.strip_prefix("gitdir:")?.trim();
        if target.is_empty() {
            return None;
        }
        let target = Path::new(target);
        let gitdir = if target.is_absolute() {
            normalize_path(target)
        } else {
            normalize_path(&repo_path.join(target))
        };
        return Some(gitdir.join("HEAD"));
    }
    None
}

/// Lexically normalize a path: strip `.` components and fold `..` into
/// their parent. No filesystem access, no symlink resolution.
fn normalize_path(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for comp in path.components() {
        match comp {
            Component::CurDir => {}
            Component::ParentDir => {
                // Going above the root stays at the root.
                if !out.pop() && !out.has_root() {
                    out.push("..");
                }
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn plain_git_directory_resolves_to_its_head() {
        let dir = TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join(".git")).unwrap();
        fs::write(dir.path().join(".git/HEAD"), "ref: refs/heads/main\n").unwrap();

        assert_eq!(
            resolve_head_path(dir.path()),
            Some(dir.path().join(".git/HEAD"))
        );
    }

    #[test]
    fn worktree_pointer_with_absolute_gitdir() {
        let repo = TempDir::new().unwrap();
        let gitdir = TempDir::new().unwrap();
        fs::write(
            repo.path().join(".git"),
            format!("gitdir: {}\n", gitdir.path().display()),
        )
        .unwrap();

        assert_eq!(
            resolve_head_path(repo.path()),
            Some(gitdir.path().join("HEAD"))
        );
    }

    #[test]
    fn worktree_pointer_with_relative_gitdir_is_normalized() {
        let root = TempDir::new().unwrap();
        let wt = root.path().join("wt");
        fs::create_dir_all(&wt).unwrap();
        fs::write(wt.join(".git"), "gitdir: ../main/.git/worktrees/wt\n").unwrap();

        assert_eq!(
            resolve_head_path(&wt),
            Some(root.path().join("main/.git/worktrees/wt/HEAD"))
        );
    }

    #[test]
    fn missing_dot_git_resolves_to_none() {
        let dir = TempDir::new().unwrap();
        assert_eq!(resolve_head_path(dir.path()), None);
    }

    #[test]
    fn malformed_pointer_file_resolves_to_none() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join(".git"), "this is not a gitdir pointer\n").unwrap();
        assert_eq!(resolve_head_path(dir.path()), None);

        fs::write(dir.path().join(".git"), "gitdir:\n").unwrap();
        assert_eq!(resolve_head_path(dir.path()), None);
    }

    #[test]
    fn normalize_folds_parent_components() {
        assert_eq!(
            normalize_path(Path::new("/a/b/../c/./d")),
            PathBuf::from("/a/c/d")
        );
        assert_eq!(normalize_path(Path::new("/a/../../b")), PathBuf::from("/b"));
    }
}

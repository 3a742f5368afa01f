pub mod agents;
pub mod branches;
pub mod capabilities;
pub mod config;
pub mod identity;
pub mod protocol;
pub mod pty;
pub mod recovery;
pub mod server;
pub mod store;
pub mod worktrees;

use std::sync::Arc;

use agents::AgentSpawner;
use config::DaemonConfig;
use pty::PtyManager;

/// Shared application state, constructed once in `main` and passed by
/// reference to every handler and background task. There are no hidden
/// module-level globals — single-instance semantics (one listener, one
/// spawner registry, one PTY manager) follow from this being built once.
pub struct AppContext {
    pub config: Arc<DaemonConfig>,
    pub spawner: Arc<AgentSpawner>,
    /// Dev-environment shell for the review UI; one PTY per manager.
    pub pty: Arc<PtyManager>,
    pub started_at: std::time::Instant,
    /// Stable machine identity (SHA-256 of a platform hardware ID).
    /// Scopes ownership of replicated worktree setup entries.
    pub machine_id: String,
}

impl AppContext {
    pub fn new(config: DaemonConfig, machine_id: String) -> Arc<Self> {
        let spawner = Arc::new(AgentSpawner::new(config.agent.clone()));
        Arc::new(Self {
            config: Arc::new(config),
            spawner,
            pty: Arc::new(PtyManager::new()),
            started_at: std::time::Instant::now(),
            machine_id,
        })
    }
}

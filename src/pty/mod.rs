//! Pseudo-terminal session lifecycle.
//!
//! One `PtyManager` owns at most one PTY-backed shell process at a time
//! (`Idle → Running → Idle` across spawn/exit/dispose; re-spawnable).
//! Output and exit notifications fan out to explicitly registered
//! observer lists, cleared on dispose.

use portable_pty::{native_pty_system, ChildKiller, CommandBuilder, MasterPty, PtySize};
use serde::Serialize;
use std::collections::HashMap;
use std::io::Write;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

const DEFAULT_COLS: u16 = 80;
const DEFAULT_ROWS: u16 = 24;

/// Delay between the graceful and the forceful kill signal.
const KILL_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum PtyError {
    #[error("PTY already spawned")]
    AlreadySpawned,

    #[error("PTY is not running")]
    NotRunning,

    #[error("Failed to spawn PTY: {0}")]
    Spawn(String),

    #[error("failed to resize PTY: {0}")]
    Resize(String),

    #[error("PTY I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Options for [`PtyManager::spawn`]. Environment entries are merged over
/// the daemon's own environment.
#[derive(Debug, Clone)]
pub struct PtySpawnOptions {
    pub cwd: PathBuf,
    pub cols: u16,
    pub rows: u16,
    /// Shell program; defaults to `$SHELL`, then `/bin/sh`.
    pub shell: Option<String>,
    pub env: HashMap<String, String>,
}

impl PtySpawnOptions {
    pub fn new(cwd: impl Into<PathBuf>) -> Self {
        Self {
            cwd: cwd.into(),
            cols: DEFAULT_COLS,
            rows: DEFAULT_ROWS,
            shell: None,
            env: HashMap::new(),
        }
    }
}

/// Snapshot of the running session for debug endpoints and callers.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PtySessionInfo {
    pub pid: Option<u32>,
    pub alive: bool,
    pub cols: u16,
    pub rows: u16,
    pub cwd: String,
    pub shell: String,
    /// Environment overrides the session was spawned with (not the full
    /// merged environment).
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    pub env: HashMap<String, String>,
}

type DataListener = Box<dyn Fn(&str) + Send + Sync>;
type ExitListener = Box<dyn Fn(Option<i32>, Option<String>) + Send + Sync>;

struct Session {
    pid: Option<u32>,
    alive: Arc<AtomicBool>,
    cols: u16,
    rows: u16,
    cwd: PathBuf,
    shell: String,
    env: HashMap<String, String>,
    master: Box<dyn MasterPty + Send>,
    writer: Box<dyn Write + Send>,
    killer: Box<dyn ChildKiller + Send + Sync>,
    /// Pending forceful-kill escalation; cancelled when exit is observed
    /// so a reused pid is never signalled.
    kill_timer: Option<tokio::task::JoinHandle<()>>,
}

pub struct PtyManager {
    state: Arc<Mutex<Option<Session>>>,
    data_listeners: Arc<Mutex<Vec<DataListener>>>,
    exit_listeners: Arc<Mutex<Vec<ExitListener>>>,
    kill_grace: Duration,
}

impl Default for PtyManager {
    fn default() -> Self {
        Self::new()
    }
}

impl PtyManager {
    pub fn new() -> Self {
        Self::with_kill_grace(KILL_GRACE)
    }

    pub fn with_kill_grace(kill_grace: Duration) -> Self {
        Self {
            state: Arc::new(Mutex::new(None)),
            data_listeners: Arc::new(Mutex::new(Vec::new())),
            exit_listeners: Arc::new(Mutex::new(Vec::new())),
            kill_grace,
        }
    }

    pub fn is_running(&self) -> bool {
        self.state
            .lock()
            .unwrap()
            .as_ref()
            .map(|s| s.alive.load(Ordering::SeqCst))
            .unwrap_or(false)
    }

    pub fn session(&self) -> Option<PtySessionInfo> {
        self.state.lock().unwrap().as_ref().map(|s| PtySessionInfo {
            pid: s.pid,
            alive: s.alive.load(Ordering::SeqCst),
            cols: s.cols,
            rows: s.rows,
            cwd: s.cwd.to_string_lossy().to_string(),
            shell: s.shell.clone(),
            env: s.env.clone(),
        })
    }

    /// Spawn the shell. Must be called from within a tokio runtime — the
    /// kill-escalation timer runs on it.
    pub fn spawn(&self, opts: PtySpawnOptions) -> Result<PtySessionInfo, PtyError> {
        let mut state = self.state.lock().unwrap();
        if state
            .as_ref()
            .map(|s| s.alive.load(Ordering::SeqCst))
            .unwrap_or(false)
        {
            return Err(PtyError::AlreadySpawned);
        }

        let shell = opts
            .shell
            .clone()
            .or_else(|| std::env::var("SHELL").ok())
            .unwrap_or_else(|| "/bin/sh".to_string());

        let pty_system = native_pty_system();
        let pair = pty_system
            .openpty(PtySize {
                rows: opts.rows,
                cols: opts.cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| PtyError::Spawn(e.to_string()))?;

        let mut cmd = CommandBuilder::new(&shell);
        cmd.cwd(&opts.cwd);
        for (key, value) in &opts.env {
            cmd.env(key, value);
        }

        let child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| PtyError::Spawn(e.to_string()))?;
        // Slave side is the child's now.
        drop(pair.slave);

        let pid = child.process_id();
        let alive = Arc::new(AtomicBool::new(true));
        let killer = child.clone_killer();

        let reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| PtyError::Spawn(e.to_string()))?;
        let writer = pair
            .master
            .take_writer()
            .map_err(|e| PtyError::Spawn(e.to_string()))?;

        spawn_reader_thread(reader, Arc::clone(&self.data_listeners), Arc::clone(&alive));
        spawn_wait_thread(
            child,
            Arc::clone(&self.state),
            Arc::clone(&self.exit_listeners),
            Arc::clone(&alive),
        );

        let session = Session {
            pid,
            alive,
            cols: opts.cols,
            rows: opts.rows,
            cwd: opts.cwd.clone(),
            shell: shell.clone(),
            env: opts.env,
            master: pair.master,
            writer,
            killer,
            kill_timer: None,
        };
        let info = PtySessionInfo {
            pid,
            alive: true,
            cols: session.cols,
            rows: session.rows,
            cwd: session.cwd.to_string_lossy().to_string(),
            shell: session.shell.clone(),
            env: session.env.clone(),
        };
        *state = Some(session);
        debug!(pid = ?info.pid, shell = %info.shell, "PTY spawned");
        Ok(info)
    }

    pub fn write(&self, data: &str) -> Result<(), PtyError> {
        let mut state = self.state.lock().unwrap();
        let session = state
            .as_mut()
            .filter(|s| s.alive.load(Ordering::SeqCst))
            .ok_or(PtyError::NotRunning)?;
        session.writer.write_all(data.as_bytes())?;
        session.writer.flush()?;
        Ok(())
    }

    pub fn resize(&self, cols: u16, rows: u16) -> Result<(), PtyError> {
        let mut state = self.state.lock().unwrap();
        let session = state
            .as_mut()
            .filter(|s| s.alive.load(Ordering::SeqCst))
            .ok_or(PtyError::NotRunning)?;
        session
            .master
            .resize(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| PtyError::Resize(e.to_string()))?;
        session.cols = cols;
        session.rows = rows;
        Ok(())
    }

    /// Register an output observer. Multiple listeners are supported; all
    /// are cleared by `dispose()`.
    pub fn on_data(&self, cb: impl Fn(&str) + Send + Sync + 'static) {
        self.data_listeners.lock().unwrap().push(Box::new(cb));
    }

    /// Register an exit observer, called with `(exit_code, signal)`.
    pub fn on_exit(&self, cb: impl Fn(Option<i32>, Option<String>) + Send + Sync + 'static) {
        self.exit_listeners.lock().unwrap().push(Box::new(cb));
    }

    /// Terminate the shell: graceful signal now, forceful after the grace
    /// period unless exit is observed first. No-op when not running.
    pub fn kill(&self) {
        let mut state = self.state.lock().unwrap();
        let Some(session) = state.as_mut() else {
            return;
        };
        if !session.alive.load(Ordering::SeqCst) {
            return;
        }

        #[cfg(unix)]
        if let Some(pid) = session.pid {
            // SAFETY: pid came from our own spawned child.
            unsafe {
                libc::kill(pid as libc::pid_t, libc::SIGTERM);
            }
        }
        #[cfg(not(unix))]
        warn!("no graceful termination signal on this platform; relying on forced kill");

        if session.kill_timer.is_none() {
            let alive = Arc::clone(&session.alive);
            let mut killer = session.killer.clone_killer();
            let grace = self.kill_grace;
            #[cfg(unix)]
            let pid = session.pid;
            session.kill_timer = Some(tokio::spawn(async move {
                tokio::time::sleep(grace).await;
                // Cancelled via abort on exit; the alive check covers the
                // window between exit and cancellation.
                if !alive.load(Ordering::SeqCst) {
                    return;
                }
                warn!("PTY did not exit within grace period — killing");
                #[cfg(unix)]
                if let Some(pid) = pid {
                    // SAFETY: exit has not been observed, so the pid is
                    // still our child and cannot have been reused.
                    unsafe {
                        libc::kill(pid as libc::pid_t, libc::SIGKILL);
                    }
                    return;
                }
                let _ = killer.kill();
            }));
        }
    }

    /// Kill if running, clear all listeners, reset to `Idle`. Idempotent.
    /// A respawn after dispose starts with an empty listener set.
    pub fn dispose(&self) {
        self.kill();
        *self.state.lock().unwrap() = None;
        self.data_listeners.lock().unwrap().clear();
        self.exit_listeners.lock().unwrap().clear();
    }
}

/// Reads master output on a dedicated thread and fans chunks out to the
/// registered data listeners.
fn spawn_reader_thread(
    mut reader: Box<dyn std::io::Read + Send>,
    listeners: Arc<Mutex<Vec<DataListener>>>,
    alive: Arc<AtomicBool>,
) {
    std::thread::spawn(move || {
        let mut buf = [0u8; 4096];
        loop {
            if !alive.load(Ordering::SeqCst) {
                break;
            }
            match reader.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    let text = String::from_utf8_lossy(&buf[..n]).to_string();
                    for cb in listeners.lock().unwrap().iter() {
                        cb(&text);
                    }
                }
                Err(_) => break,
            }
        }
    });
}

/// Waits for the child on a dedicated thread; on exit flips `alive`,
/// cancels the pending forceful kill, resets the manager to `Idle`, and
/// notifies exit listeners with `(exit_code, signal)`.
fn spawn_wait_thread(
    mut child: Box<dyn portable_pty::Child + Send + Sync>,
    state: Arc<Mutex<Option<Session>>>,
    listeners: Arc<Mutex<Vec<ExitListener>>>,
    alive: Arc<AtomicBool>,
) {
    std::thread::spawn(move || {
        let status = child.wait();
        alive.store(false, Ordering::SeqCst);

        {
            let mut st = state.lock().unwrap();
            if let Some(session) = st.as_mut() {
                // Only clear if this is still our session, not a respawn.
                if Arc::ptr_eq(&session.alive, &alive) {
                    if let Some(timer) = session.kill_timer.take() {
                        timer.abort();
                    }
                    *st = None;
                }
            }
        }

        let (code, signal): (Option<i32>, Option<String>) = match status {
            Ok(s) => (Some(s.exit_code() as i32), None),
            Err(_) => (None, None),
        };
        for cb in listeners.lock().unwrap().iter() {
            cb(code, signal.clone());
        }
    });
}

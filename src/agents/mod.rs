//! External coding-agent process management.
//!
//! Spawns the agent CLI (plain, or with an imported conversation context),
//! tracks at most one live process per task, and exposes stdout/stderr/exit
//! as an event stream the protocol layer relays to clients. Output is
//! push-based with no backpressure — a slow or closed consumer drops
//! chunks, never the daemon.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    process::Command,
    sync::{mpsc, Mutex},
};
use tracing::{debug, info, warn};

use crate::store::now_millis;

// ─── Configuration ───────────────────────────────────────────────────────────

/// How to invoke the external agent CLI.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Agent binary; must be on PATH or an absolute path.
    pub program: String,
    /// Arguments applied to every invocation, before the per-call ones.
    pub base_args: Vec<String>,
    /// Root of the agent CLI's per-project transcript directories, used to
    /// restore imported conversations for `--resume`.
    pub transcript_root: PathBuf,
}

impl Default for AgentConfig {
    fn default() -> Self {
        let home = std::env::var("HOME").map(PathBuf::from).unwrap_or_default();
        Self {
            program: "claude".to_string(),
            base_args: vec![
                "--output-format".to_string(),
                "stream-json".to_string(),
                "--verbose".to_string(),
                "--dangerously-skip-permissions".to_string(),
            ],
            transcript_root: home.join(".claude").join("projects"),
        }
    }
}

// ─── Wire-adjacent types ─────────────────────────────────────────────────────

/// Imported conversation context (`a2aPayload` on the wire).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct A2aPayload {
    pub messages: Vec<A2aMessage>,
    #[serde(default)]
    pub meta: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct A2aMessage {
    pub role: String,
    pub content: String,
}

/// Events surfaced by a spawned agent process.
#[derive(Debug, Clone)]
pub enum AgentEvent {
    Stdout(String),
    Stderr(String),
    /// Process exit. `None` when the OS reports no code (signal-terminated).
    Exited { exit_code: Option<i32> },
    /// OS-level spawn failure, surfaced asynchronously.
    Error { message: String },
}

/// Live handle returned by the spawn calls. `pid` may be `None` on a
/// silent spawn failure — the events stream then carries an `Error`.
#[derive(Debug)]
pub struct AgentHandle {
    pub pid: Option<u32>,
    pub session_id: Option<String>,
    pub events: mpsc::UnboundedReceiver<AgentEvent>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentSummary {
    pub task_id: String,
    pub pid: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    pub started_at: i64,
}

#[derive(Debug, Clone)]
struct TrackedAgent {
    pid: u32,
    session_id: Option<String>,
    started_at: i64,
}

// ─── Spawner ─────────────────────────────────────────────────────────────────

pub struct AgentSpawner {
    config: AgentConfig,
    /// taskId → live process. At most one entry per task; entries are
    /// removed when the OS reports exit, not when stop is requested.
    registry: Arc<Mutex<HashMap<String, TrackedAgent>>>,
}

impl AgentSpawner {
    pub fn new(config: AgentConfig) -> Self {
        Self {
            config,
            registry: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Spawn the agent CLI for `task_id` with a prompt.
    ///
    /// Errors are returned only for protocol-level refusals (a task already
    /// tracked); OS-level spawn failures yield a handle with `pid: None`
    /// plus an async `Error` event.
    pub async fn spawn_claude_code(
        &self,
        task_id: &str,
        prompt: &str,
        cwd: Option<&str>,
    ) -> Result<AgentHandle> {
        let extra = vec!["-p".to_string(), prompt.to_string()];
        self.spawn_process(task_id, extra, cwd, None).await
    }

    /// Restore an imported conversation, then spawn the agent CLI resuming
    /// it. Returns the generated agent session id alongside the handle.
    pub async fn spawn_claude_code_with_context(
        &self,
        task_id: &str,
        cwd: Option<&str>,
        payload: &A2aPayload,
    ) -> Result<(AgentHandle, String)> {
        let session_id = uuid::Uuid::new_v4().to_string();
        self.restore_conversation(cwd, &session_id, payload)
            .await
            .context("failed to restore conversation context")?;

        let extra = vec!["--resume".to_string(), session_id.clone()];
        let handle = self
            .spawn_process(task_id, extra, cwd, Some(session_id.clone()))
            .await?;
        Ok((handle, session_id))
    }

    /// Request termination of the tracked process for `task_id`.
    ///
    /// Sends SIGTERM; exit is reported later through the process's event
    /// stream whenever the OS delivers it. Returns `false` when no process
    /// is tracked for the task.
    pub async fn stop_agent(&self, task_id: &str) -> bool {
        let registry = self.registry.lock().await;
        let Some(tracked) = registry.get(task_id) else {
            return false;
        };
        info!(task_id, pid = tracked.pid, "stopping agent");
        signal_terminate(tracked.pid);
        true
    }

    pub async fn list_agents(&self) -> Vec<AgentSummary> {
        let registry = self.registry.lock().await;
        let mut list: Vec<AgentSummary> = registry
            .iter()
            .map(|(task_id, t)| AgentSummary {
                task_id: task_id.clone(),
                pid: t.pid,
                session_id: t.session_id.clone(),
                started_at: t.started_at,
            })
            .collect();
        list.sort_by(|a, b| a.task_id.cmp(&b.task_id));
        list
    }

    /// Graceful-shutdown sweep: request termination of every tracked agent.
    pub async fn stop_all(&self) {
        let registry = self.registry.lock().await;
        for (task_id, tracked) in registry.iter() {
            debug!(task_id, pid = tracked.pid, "terminating agent on shutdown");
            signal_terminate(tracked.pid);
        }
    }

    async fn spawn_process(
        &self,
        task_id: &str,
        extra_args: Vec<String>,
        cwd: Option<&str>,
        session_id: Option<String>,
    ) -> Result<AgentHandle> {
        let (tx, rx) = mpsc::unbounded_channel();

        let mut registry = self.registry.lock().await;
        if registry.contains_key(task_id) {
            anyhow::bail!("Agent already running for task {task_id}");
        }

        let mut cmd = Command::new(&self.config.program);
        cmd.args(&self.config.base_args)
            .args(&extra_args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .stdin(Stdio::null());
        if let Some(dir) = cwd {
            cmd.current_dir(dir);
        }

        let mut child = match cmd.spawn() {
            Ok(c) => c,
            Err(e) => {
                // Surfaced asynchronously, never thrown into the daemon.
                warn!(task_id, err = %e, "agent spawn failed");
                let _ = tx.send(AgentEvent::Error {
                    message: format!("Failed to spawn agent process: {e}"),
                });
                return Ok(AgentHandle {
                    pid: None,
                    session_id,
                    events: rx,
                });
            }
        };

        let pid = child.id();
        if let Some(pid) = pid {
            registry.insert(
                task_id.to_string(),
                TrackedAgent {
                    pid,
                    session_id: session_id.clone(),
                    started_at: now_millis(),
                },
            );
            info!(task_id, pid, "agent spawned");
        }
        drop(registry);

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        let out_task = stdout.map(|out| {
            let tx = tx.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(out).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    let _ = tx.send(AgentEvent::Stdout(line));
                }
            })
        });
        let err_task = stderr.map(|err| {
            let tx = tx.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(err).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    let _ = tx.send(AgentEvent::Stderr(line));
                }
            })
        });

        // Drain output first, then reap — `Exited` is always the last event.
        let registry = Arc::clone(&self.registry);
        let task_key = task_id.to_string();
        tokio::spawn(async move {
            if let Some(t) = out_task {
                let _ = t.await;
            }
            if let Some(t) = err_task {
                let _ = t.await;
            }
            let exit_code = match child.wait().await {
                Ok(status) => status.code(),
                Err(e) => {
                    warn!(task_id = %task_key, err = %e, "failed to reap agent process");
                    None
                }
            };
            debug!(task_id = %task_key, code = ?exit_code, "agent exited");
            registry.lock().await.remove(&task_key);
            let _ = tx.send(AgentEvent::Exited { exit_code });
        });

        Ok(AgentHandle {
            pid,
            session_id,
            events: rx,
        })
    }

    /// Write the imported conversation as a transcript the agent CLI can
    /// resume: one JSON line per message under the per-project directory.
    async fn restore_conversation(
        &self,
        cwd: Option<&str>,
        session_id: &str,
        payload: &A2aPayload,
    ) -> Result<()> {
        let project = cwd
            .map(str::to_string)
            .or_else(|| {
                std::env::current_dir()
                    .ok()
                    .map(|p| p.to_string_lossy().to_string())
            })
            .unwrap_or_default();
        let project_dir = self.config.transcript_root.join(munge_project_path(&project));
        tokio::fs::create_dir_all(&project_dir).await?;

        let mut transcript = String::new();
        for message in &payload.messages {
            let kind = if message.role == "user" {
                "user"
            } else {
                "assistant"
            };
            let line = json!({
                "type": kind,
                "sessionId": session_id,
                "uuid": uuid::Uuid::new_v4().to_string(),
                "timestamp": chrono::Utc::now().to_rfc3339(),
                "message": {
                    "role": message.role,
                    "content": [{ "type": "text", "text": message.content }],
                },
            });
            transcript.push_str(&line.to_string());
            transcript.push('\n');
        }

        let path = project_dir.join(format!("{session_id}.jsonl"));
        tokio::fs::write(&path, transcript).await?;
        debug!(path = %path.display(), messages = payload.messages.len(), "conversation restored");
        Ok(())
    }
}

/// The agent CLI keys transcript directories by project path with the
/// separators flattened.
fn munge_project_path(path: &str) -> String {
    path.chars()
        .map(|c| match c {
            '/' | '\\' | ':' => '-',
            other => other,
        })
        .collect()
}

#[cfg(unix)]
fn signal_terminate(pid: u32) {
    // SAFETY: pid came from our own spawned child; ESRCH after exit is fine.
    unsafe {
        libc::kill(pid as libc::pid_t, libc::SIGTERM);
    }
}

#[cfg(not(unix))]
fn signal_terminate(pid: u32) {
    warn!(pid, "no termination signal on this platform");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::TempDir;

    fn echo_config() -> AgentConfig {
        AgentConfig {
            program: "/bin/echo".to_string(),
            base_args: vec![],
            transcript_root: std::env::temp_dir(),
        }
    }

    fn sleeper_config() -> AgentConfig {
        AgentConfig {
            // `-p <prompt>` lands in $0/$1 of the -c script and is ignored.
            program: "/bin/sh".to_string(),
            base_args: vec!["-c".to_string(), "sleep 5".to_string()],
            transcript_root: std::env::temp_dir(),
        }
    }

    async fn drain(handle: &mut AgentHandle) -> (Vec<String>, Option<i32>) {
        let mut lines = Vec::new();
        let mut exit = None;
        while let Some(event) =
            tokio::time::timeout(Duration::from_secs(10), handle.events.recv())
                .await
                .expect("agent events timed out")
        {
            match event {
                AgentEvent::Stdout(l) | AgentEvent::Stderr(l) => lines.push(l),
                AgentEvent::Exited { exit_code } => {
                    exit = Some(exit_code.unwrap_or(-1));
                    break;
                }
                AgentEvent::Error { message } => panic!("unexpected error event: {message}"),
            }
        }
        (lines, exit)
    }

    #[tokio::test]
    async fn spawn_streams_output_then_exit() {
        let spawner = AgentSpawner::new(echo_config());
        let mut handle = spawner
            .spawn_claude_code("t1", "hello", None)
            .await
            .unwrap();
        assert!(handle.pid.is_some());

        let (lines, exit) = drain(&mut handle).await;
        assert!(lines.iter().any(|l| l.contains("hello")));
        assert_eq!(exit, Some(0));

        // Registry entry is reaped on exit.
        assert!(spawner.list_agents().await.is_empty());
    }

    #[tokio::test]
    async fn duplicate_task_is_rejected() {
        let spawner = AgentSpawner::new(sleeper_config());
        let _handle = spawner.spawn_claude_code("t1", "x", None).await.unwrap();
        let err = spawner
            .spawn_claude_code("t1", "x", None)
            .await
            .expect_err("second start for a tracked task must be rejected");
        assert!(err.to_string().contains("already running"));
        assert!(spawner.stop_agent("t1").await);
    }

    #[tokio::test]
    async fn stop_agent_false_without_tracked_process() {
        let spawner = AgentSpawner::new(echo_config());
        assert!(!spawner.stop_agent("missing").await);
    }

    #[tokio::test]
    async fn stop_agent_terminates_and_exit_is_reported() {
        let spawner = AgentSpawner::new(sleeper_config());
        let mut handle = spawner.spawn_claude_code("t1", "x", None).await.unwrap();
        assert_eq!(spawner.list_agents().await.len(), 1);

        assert!(spawner.stop_agent("t1").await);
        let (_lines, exit) = drain(&mut handle).await;
        // SIGTERM-terminated: the OS reports no exit code.
        assert_eq!(exit, Some(-1));
        assert!(spawner.list_agents().await.is_empty());
    }

    #[tokio::test]
    async fn os_spawn_failure_surfaces_async_error_event() {
        let config = AgentConfig {
            program: "/nonexistent/agent-binary".to_string(),
            base_args: vec![],
            transcript_root: std::env::temp_dir(),
        };
        let spawner = AgentSpawner::new(config);
        let mut handle = spawner.spawn_claude_code("t1", "x", None).await.unwrap();
        assert!(handle.pid.is_none());

        match handle.events.recv().await {
            Some(AgentEvent::Error { message }) => {
                assert!(message.contains("Failed to spawn agent process"));
            }
            other => panic!("expected error event, got {other:?}"),
        }
        assert!(spawner.list_agents().await.is_empty());
    }

    #[tokio::test]
    async fn with_context_restores_transcript_and_resumes() {
        let root = TempDir::new().unwrap();
        let config = AgentConfig {
            program: "/bin/echo".to_string(),
            base_args: vec![],
            transcript_root: root.path().to_path_buf(),
        };
        let spawner = AgentSpawner::new(config);
        let payload = A2aPayload {
            messages: vec![
                A2aMessage {
                    role: "user".into(),
                    content: "fix the bug".into(),
                },
                A2aMessage {
                    role: "assistant".into(),
                    content: "done".into(),
                },
            ],
            meta: serde_json::Value::Null,
        };

        let (mut handle, session_id) = spawner
            .spawn_claude_code_with_context("t1", Some("/repo/app"), &payload)
            .await
            .unwrap();
        assert_eq!(handle.session_id.as_deref(), Some(session_id.as_str()));

        // Transcript written under the munged project directory.
        let transcript = root
            .path()
            .join("-repo-app")
            .join(format!("{session_id}.jsonl"));
        let content = std::fs::read_to_string(&transcript).unwrap();
        assert_eq!(content.lines().count(), 2);
        assert!(content.contains("fix the bug"));

        // The spawn resumed the generated session.
        let (lines, exit) = drain(&mut handle).await;
        assert!(lines.iter().any(|l| l.contains(&session_id)));
        assert_eq!(exit, Some(0));
    }
}

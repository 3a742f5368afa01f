//! Daemon configuration.
//!
//! Resolved once at startup from CLI flags and environment variables
//! (clap handles the env fallbacks). Configuration loading beyond that is
//! the desktop app's job — the daemon only consumes the resolved values.

use crate::agents::AgentConfig;
use std::path::PathBuf;

pub const DEFAULT_PORT: u16 = 4310;

#[derive(Debug, Clone)]
pub struct DaemonConfig {
    /// WebSocket + HTTP listener port (localhost only).
    pub port: u16,
    /// Data directory for the machine-id cache and the local store file.
    pub data_dir: PathBuf,
    /// Log level filter string, e.g. "debug", "info,reviewd=trace".
    pub log: String,
    /// How to invoke the external agent CLI.
    pub agent: AgentConfig,
}

impl DaemonConfig {
    /// Build config from CLI/env args.
    ///
    /// Priority: CLI / env (passed as `Some(value)` from clap) over
    /// built-in defaults.
    pub fn new(
        port: Option<u16>,
        data_dir: Option<PathBuf>,
        log: Option<String>,
        agent_bin: Option<String>,
    ) -> Self {
        let mut agent = AgentConfig::default();
        if let Some(bin) = agent_bin.filter(|s| !s.is_empty()) {
            agent.program = bin;
        }

        Self {
            port: port.unwrap_or(DEFAULT_PORT),
            data_dir: data_dir.unwrap_or_else(default_data_dir),
            log: log.unwrap_or_else(|| "info".to_string()),
            agent,
        }
    }
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self::new(None, None, None, None)
    }
}

fn default_data_dir() -> PathBuf {
    #[cfg(target_os = "macos")]
    {
        // ~/Library/Application Support/reviewd
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home)
                .join("Library")
                .join("Application Support")
                .join("reviewd");
        }
    }
    #[cfg(target_os = "linux")]
    {
        // $XDG_DATA_HOME/reviewd or ~/.local/share/reviewd
        if let Ok(xdg) = std::env::var("XDG_DATA_HOME") {
            return PathBuf::from(xdg).join("reviewd");
        }
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home)
                .join(".local")
                .join("share")
                .join("reviewd");
        }
    }
    // Fallback
    PathBuf::from(".reviewd")
}

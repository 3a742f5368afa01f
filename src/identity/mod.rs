//! Stable machine identity.
//!
//! The replicated store scopes worktree setup entries to the machine that
//! created them, so the daemon needs an identity that survives restarts.
//! A SHA-256 fingerprint of a platform hardware ID is computed on first
//! run, cached at `{data_dir}/machine_id`, and reused afterwards.

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};
use std::path::Path;

/// Returns the stable machine identity string.
///
/// On first call it reads a platform hardware ID, hashes it with SHA-256,
/// writes the hex digest to `{data_dir}/machine_id`, and returns it.
/// On every subsequent call it reads and returns the cached value.
pub fn get_or_create(data_dir: &Path) -> Result<String> {
    let cache = data_dir.join("machine_id");
    if let Ok(id) = std::fs::read_to_string(&cache) {
        let id = id.trim().to_string();
        if !id.is_empty() {
            return Ok(id);
        }
    }

    let raw = platform_hardware_id().context("failed to read platform hardware ID")?;
    let digest = hex_sha256(raw.trim());

    std::fs::create_dir_all(data_dir).context("failed to create data directory")?;
    std::fs::write(&cache, &digest).context("failed to cache machine id")?;
    Ok(digest)
}

// ─── Platform hardware ID ────────────────────────────────────────────────────

/// Returns a raw platform-specific hardware identifier string.
///
/// The caller is responsible for trimming/hashing this value.
fn platform_hardware_id() -> Result<String> {
    #[cfg(target_os = "macos")]
    return macos_platform_uuid();

    #[cfg(target_os = "linux")]
    return linux_machine_id();

    #[cfg(not(any(target_os = "macos", target_os = "linux")))]
    return fallback_id();
}

#[cfg(target_os = "macos")]
fn macos_platform_uuid() -> Result<String> {
    // ioreg -rd1 -c IOPlatformExpertDevice  (no external crate needed)
    let out = std::process::Command::new("ioreg")
        .args(["-rd1", "-c", "IOPlatformExpertDevice"])
        .output()
        .context("ioreg command failed")?;

    let stdout = String::from_utf8_lossy(&out.stdout);
    for line in stdout.lines() {
        if line.contains("IOPlatformUUID") {
            // line looks like: "IOPlatformUUID" = "XXXXXXXX-XXXX-..."
            if let Some(start) = line.rfind('"') {
                let tail = &line[..start];
                if let Some(end) = tail.rfind('"') {
                    return Ok(line[end + 1..start].to_string());
                }
            }
        }
    }
    anyhow::bail!("IOPlatformUUID not found in ioreg output")
}

#[cfg(target_os = "linux")]
fn linux_machine_id() -> Result<String> {
    // /etc/machine-id is guaranteed on any systemd-based distro
    std::fs::read_to_string("/etc/machine-id")
        .or_else(|_| std::fs::read_to_string("/var/lib/dbus/machine-id"))
        .or_else(|_| {
            // Containers sometimes lack both — fall back to the hostname.
            std::fs::read_to_string("/etc/hostname")
        })
        .context("no machine-id file found")
}

#[cfg(not(any(target_os = "macos", target_os = "linux")))]
fn fallback_id() -> Result<String> {
    // Unsupported platform — use process start time as entropy seed.
    // This won't be stable across reboots, but prevents a hard failure.
    Ok(format!(
        "fallback-{}",
        std::time::SystemTime::UNIX_EPOCH
            .elapsed()
            .unwrap_or_default()
            .as_nanos()
    ))
}

// ─── Hashing ─────────────────────────────────────────────────────────────────

fn hex_sha256(input: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    format!("{:x}", hasher.finalize())
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn sha256_is_deterministic() {
        let a = hex_sha256("test-input");
        let b = hex_sha256("test-input");
        assert_eq!(a, b);
        assert_eq!(a.len(), 64); // 32 bytes × 2 hex chars
    }

    #[test]
    fn identity_is_cached_across_calls() {
        let dir = TempDir::new().unwrap();
        let first = get_or_create(dir.path()).unwrap();
        let second = get_or_create(dir.path()).unwrap();
        assert_eq!(first, second);
        assert!(!first.is_empty());
        assert!(dir.path().join("machine_id").exists());
    }

    #[test]
    fn cached_value_wins_over_hardware_id() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("machine_id"), "pinned-id\n").unwrap();
        assert_eq!(get_or_create(dir.path()).unwrap(), "pinned-id");
    }
}

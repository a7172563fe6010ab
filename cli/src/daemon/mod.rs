// Copyright (c) 2026 Middleware Developers
// SPDX-License-Identifier: AGPL-3.0

//! Daemon mode implementation
//!
//! Handles:
//! - PID file management
//! - Liveness checks over the Unix socket
//! - Graceful shutdown

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::time::sleep;
use tracing::{info, warn};

use middlewared_core::presentation::Client;

pub mod server;

pub use server::start_daemon;

const PID_FILE: &str = "/var/run/middlewared/middlewared.pid";
const PID_FILE_FALLBACK: &str = "/tmp/middlewared.pid";

#[derive(Debug, Clone)]
pub enum DaemonStatus {
    Running { pid: Option<u32>, session: String },
    Stopped,
    Unhealthy { pid: u32, error: String },
}

/// Ping the daemon over its socket, falling back to the PID file.
pub async fn check_daemon_running(socket: &Path) -> Result<DaemonStatus> {
    let pid_file = get_pid_file_path();
    let local_pid = std::fs::read_to_string(&pid_file)
        .ok()
        .and_then(|content| content.trim().parse::<u32>().ok());

    let probe = async {
        let mut client = Client::connect_unix(socket).await?;
        client.call("core.ping", vec![]).await?;
        Ok::<_, middlewared_core::presentation::ClientError>(client.session().to_string())
    };

    match tokio::time::timeout(Duration::from_secs(2), probe).await {
        Ok(Ok(session)) => Ok(DaemonStatus::Running { pid: local_pid, session }),
        Ok(Err(e)) => Ok(classify_unreachable(local_pid, &pid_file, e.to_string())),
        Err(_) => Ok(classify_unreachable(local_pid, &pid_file, "ping timed out".to_string())),
    }
}

fn classify_unreachable(local_pid: Option<u32>, pid_file: &Path, error: String) -> DaemonStatus {
    match local_pid {
        Some(pid) if process_exists(pid) => DaemonStatus::Unhealthy { pid, error },
        Some(_) => {
            // Stale PID file
            let _ = std::fs::remove_file(pid_file);
            DaemonStatus::Stopped
        }
        None => DaemonStatus::Stopped,
    }
}

/// Stop the daemon gracefully
pub async fn stop_daemon(force: bool, timeout_secs: u64) -> Result<()> {
    let pid_file = get_pid_file_path();

    let pid = std::fs::read_to_string(&pid_file)
        .context("Failed to read PID file")?
        .trim()
        .parse::<u32>()
        .context("Invalid PID")?;

    info!("Sending SIGTERM to process {}", pid);
    send_signal(pid, libc::SIGTERM)?;

    for _ in 0..timeout_secs {
        if !process_exists(pid) {
            info!("Daemon stopped gracefully");
            let _ = std::fs::remove_file(&pid_file);
            return Ok(());
        }
        sleep(Duration::from_secs(1)).await;
    }

    if !force {
        anyhow::bail!("Daemon did not stop within timeout");
    }
    warn!("Graceful shutdown timeout, sending SIGKILL");
    send_signal(pid, libc::SIGKILL)?;
    sleep(Duration::from_secs(1)).await;

    let _ = std::fs::remove_file(&pid_file);
    Ok(())
}

fn get_pid_file_path() -> PathBuf {
    let uid = unsafe { libc::geteuid() };
    if uid == 0 {
        PathBuf::from(PID_FILE)
    } else {
        PathBuf::from(PID_FILE_FALLBACK)
    }
}

fn process_exists(pid: u32) -> bool {
    unsafe { libc::kill(pid as i32, 0) == 0 }
}

fn send_signal(pid: u32, signal: i32) -> Result<()> {
    unsafe {
        if libc::kill(pid as i32, signal) != 0 {
            anyhow::bail!("Failed to send signal {} to process {}", signal, pid);
        }
    }
    Ok(())
}

/// Write PID file
pub fn write_pid_file(pid: u32) -> Result<()> {
    let pid_file = get_pid_file_path();
    if let Some(parent) = pid_file.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create PID directory: {:?}", parent))?;
    }
    std::fs::write(&pid_file, pid.to_string())
        .with_context(|| format!("Failed to write PID file: {:?}", pid_file))?;
    info!("Wrote PID file: {:?}", pid_file);
    Ok(())
}

/// Remove PID file
pub fn remove_pid_file() -> Result<()> {
    let pid_file = get_pid_file_path();
    if pid_file.exists() {
        std::fs::remove_file(&pid_file)
            .with_context(|| format!("Failed to remove PID file: {:?}", pid_file))?;
        info!("Removed PID file: {:?}", pid_file);
    }
    Ok(())
}

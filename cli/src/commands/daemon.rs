// Copyright (c) 2026 Middleware Developers
// SPDX-License-Identifier: AGPL-3.0

//! Daemon lifecycle management commands
//!
//! Commands: status, stop

use anyhow::Result;
use clap::Subcommand;
use colored::Colorize;

use super::Target;
use crate::daemon::{check_daemon_running, stop_daemon, DaemonStatus};

#[derive(Subcommand)]
pub enum DaemonCommand {
    /// Stop the daemon gracefully
    Stop {
        /// Force kill if daemon doesn't stop gracefully
        #[arg(short, long)]
        force: bool,

        /// Timeout in seconds (default: 30)
        #[arg(short, long, default_value = "30")]
        timeout: u64,
    },

    /// Check daemon status
    Status,
}

pub async fn handle_command(command: DaemonCommand, target: &Target) -> Result<()> {
    match command {
        DaemonCommand::Stop { force, timeout } => {
            stop_daemon(force, timeout).await?;
            println!("{}", "✓ Daemon stopped".green());
            Ok(())
        }
        DaemonCommand::Status => status(target).await,
    }
}

async fn status(target: &Target) -> Result<()> {
    let socket = target.socket()?;
    match check_daemon_running(&socket).await? {
        DaemonStatus::Running { pid, session } => {
            println!("{}", "✓ Daemon is running".green());
            if let Some(pid) = pid {
                println!("  PID: {}", pid);
            }
            println!("  Socket: {}", socket.display());
            println!("  Probe session: {}", session.dimmed());
        }
        DaemonStatus::Unhealthy { pid, error } => {
            println!("{}", "⚠ Daemon is unhealthy".yellow());
            println!("  PID: {}", pid);
            println!("  Error: {}", error);
        }
        DaemonStatus::Stopped => {
            println!("{}", "✗ Daemon is not running".red());
            println!("  Start it with: middlewared --daemon");
        }
    }
    Ok(())
}

// Copyright (c) 2026 Middleware Developers
// SPDX-License-Identifier: AGPL-3.0

//! # middlewared
//!
//! One binary for both sides of the local socket:
//!
//! - **Daemon mode**: `middlewared --daemon` loads plugins, opens the
//!   WebSocket, TCP and Unix socket listeners and runs until SIGTERM.
//! - **Client mode**: every other command connects to the Unix socket of a
//!   running daemon. Local connections are authenticated by peer uid.
//!
//! ## Commands
//!
//! - `middlewared call <method> [params...]` - Invoke any method
//! - `middlewared subscribe <mask>` - Print events as they arrive
//! - `middlewared job list|wait|abort|logs` - Job operations
//! - `middlewared config show|validate|generate` - Configuration management
//! - `middlewared daemon status|stop` - Daemon lifecycle

use anyhow::Result;
use clap::{Parser, Subcommand};
use colored::Colorize;
use std::path::PathBuf;
use tracing::info;

use middlewared_cli::commands::{self, CallArgs, ConfigCommand, DaemonCommand, JobCommand, SubscribeArgs};
use middlewared_cli::{daemon, logging};

/// Storage appliance middleware daemon and client
#[derive(Parser)]
#[command(name = "middlewared")]
#[command(version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Run the middleware daemon in the foreground
    #[arg(long, global = true)]
    daemon: bool,

    /// Path to configuration file (overrides discovery)
    #[arg(
        short,
        long,
        global = true,
        env = "MIDDLEWARED_CONFIG_PATH",
        value_name = "FILE"
    )]
    config: Option<PathBuf>,

    /// Unix socket of the daemon (overrides configuration)
    #[arg(long, global = true, env = "MIDDLEWARED_UNIX_SOCKET", value_name = "PATH")]
    socket: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, env = "MIDDLEWARED_LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Log format (text, json)
    #[arg(long, global = true, env = "MIDDLEWARED_LOG_FORMAT", default_value = "text")]
    log_format: String,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Invoke a method
    #[command(name = "call")]
    Call(CallArgs),

    /// Print events matching a mask until interrupted
    #[command(name = "subscribe")]
    Subscribe(SubscribeArgs),

    /// Job operations
    #[command(name = "job")]
    Job {
        #[command(subcommand)]
        command: JobCommand,
    },

    /// Configuration management
    #[command(name = "config")]
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },

    /// Manage daemon lifecycle
    #[command(name = "daemon")]
    Daemon {
        #[command(subcommand)]
        command: DaemonCommand,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    logging::init(&cli.log_level, &cli.log_format)?;

    if cli.daemon {
        info!("Starting middlewared in daemon mode");
        return daemon::start_daemon(cli.config).await;
    }

    let target = commands::Target::new(cli.config, cli.socket);
    match cli.command {
        Some(Commands::Call(args)) => commands::call::execute(args, &target).await,
        Some(Commands::Subscribe(args)) => commands::subscribe::execute(args, &target).await,
        Some(Commands::Job { command }) => commands::job::handle_command(command, &target).await,
        Some(Commands::Config { command }) => commands::config::handle_command(command, target.config_path()).await,
        Some(Commands::Daemon { command }) => commands::daemon::handle_command(command, &target).await,
        None => {
            eprintln!("{}", "No command specified. Use --help for usage.".yellow());
            std::process::exit(1);
        }
    }
}

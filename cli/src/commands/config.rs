// Copyright (c) 2026 Middleware Developers
// SPDX-License-Identifier: AGPL-3.0

//! Configuration management commands
//!
//! Commands: show, validate, generate

use anyhow::{Context, Result};
use clap::Subcommand;
use colored::Colorize;
use std::path::PathBuf;

use middlewared_core::domain::config::MiddlewareConfig;

#[derive(Subcommand)]
pub enum ConfigCommand {
    /// Show current configuration
    Show {
        /// Show config file paths checked
        #[arg(long)]
        paths: bool,
    },

    /// Validate configuration file
    Validate {
        /// Path to config file (default: discover)
        #[arg(value_name = "FILE")]
        file: Option<PathBuf>,
    },

    /// Generate a configuration file with every default spelled out
    Generate {
        /// Output path
        #[arg(short, long, default_value = "./middlewared.yaml")]
        output: PathBuf,
    },
}

pub async fn handle_command(command: ConfigCommand, config_override: Option<PathBuf>) -> Result<()> {
    match command {
        ConfigCommand::Show { paths } => show(config_override, paths),
        ConfigCommand::Validate { file } => validate(file.or(config_override)),
        ConfigCommand::Generate { output } => generate(output),
    }
}

fn show(config_override: Option<PathBuf>, show_paths: bool) -> Result<()> {
    let config = MiddlewareConfig::load_or_default(config_override.clone()).context("Failed to load configuration")?;

    if show_paths {
        println!("{}", "Configuration discovery paths:".bold());
        match &config_override {
            Some(path) => println!("  1. --config flag: {}", path.display()),
            None => println!("  1. --config flag: {}", "(not set)".dimmed()),
        }
        println!(
            "  2. MIDDLEWARED_CONFIG_PATH: {}",
            std::env::var("MIDDLEWARED_CONFIG_PATH")
                .unwrap_or_else(|_| "(not set)".to_string())
                .dimmed()
        );
        println!("  3. ./middlewared.yaml");
        println!("  4. ~/.middlewared/config.yaml");
        println!("  5. /etc/middlewared/config.yaml");
        println!();
    }

    let spec = &config.spec;
    println!("{}", "Current configuration:".bold());
    println!();

    println!("{}", "Server:".bold());
    println!("  Unix socket: {}", spec.server.unix_socket.display());
    match spec.server.websocket_port {
        0 => println!("  WebSocket: {}", "disabled".dimmed()),
        port => println!("  WebSocket: ws://{}:{}/websocket", spec.server.bind_address, port),
    }
    if let Some(port) = spec.server.tcp_port {
        println!("  TCP: {}:{}", spec.server.bind_address, port);
    }
    println!("  Send queue: {} frames", spec.server.send_queue);
    println!();

    println!("{}", "Plugins:".bold());
    match &spec.plugins.directory {
        Some(dir) => println!("  Directory: {}", dir.display()),
        None => println!("  Directory: {}", "(built-in only)".dimmed()),
    }
    if !spec.plugins.disabled.is_empty() {
        println!("  Disabled: {}", spec.plugins.disabled.join(", "));
    }
    println!();

    println!("{}", "Jobs:".bold());
    println!("  Workers: {}", spec.jobs.workers);
    println!("  Max jobs: {}", spec.jobs.max_jobs);
    println!();

    println!("{}", "Storage:".bold());
    match &spec.database {
        Some(_) => println!("  Config store: PostgreSQL"),
        None => println!("  Config store: {}", "in-memory".yellow()),
    }
    println!("  Local users: {}", spec.auth.users.len());
    println!("  API keys: {}", spec.auth.api_keys.len());
    println!();

    Ok(())
}

fn validate(config_path: Option<PathBuf>) -> Result<()> {
    println!("Validating configuration...");

    let config = MiddlewareConfig::load_or_default(config_path).context("Failed to load configuration")?;
    config.validate().context("Configuration validation failed")?;

    println!("{}", "✓ Configuration is valid".green());
    Ok(())
}

fn generate(output: PathBuf) -> Result<()> {
    MiddlewareConfig::default()
        .to_yaml_file(&output)
        .with_context(|| format!("Failed to write config to {:?}", output))?;

    println!("{}", format!("✓ Configuration generated: {}", output.display()).green());
    Ok(())
}

// Copyright (c) 2026 Middleware Developers
// SPDX-License-Identifier: AGPL-3.0

//! Job commands
//!
//! Commands: list, wait, abort, logs

use anyhow::{Context, Result};
use clap::Subcommand;
use colored::Colorize;
use serde_json::{json, Value};

use super::{print_json, Target};

#[derive(Subcommand)]
pub enum JobCommand {
    /// List jobs
    List {
        /// Only jobs in this state (WAITING, RUNNING, SUCCESS, FAILED, ABORTED)
        #[arg(long)]
        state: Option<String>,

        /// Maximum number of rows
        #[arg(long, default_value = "50")]
        limit: u64,

        /// Print raw JSON rows
        #[arg(long)]
        json: bool,
    },

    /// Wait for a job and print its result
    Wait {
        id: u64,

        /// Give up after this many seconds
        #[arg(long)]
        timeout: Option<u64>,
    },

    /// Request cancellation of a job
    Abort { id: u64 },

    /// Follow a job's log until it finishes
    Logs { id: u64 },
}

pub async fn handle_command(command: JobCommand, target: &Target) -> Result<()> {
    let mut client = target.connect().await?;
    match command {
        JobCommand::List { state, limit, json } => {
            let filters = match state {
                Some(state) => json!([["state", "=", state.to_uppercase()]]),
                None => json!([]),
            };
            let options = json!({"order_by": ["-id"], "limit": limit});
            let jobs = client
                .call("core.get_jobs", vec![filters, options])
                .await
                .context("Failed to list jobs")?;
            if json {
                return print_json(&jobs);
            }
            print_table(&jobs);
            Ok(())
        }
        JobCommand::Wait { id, timeout } => {
            let timeout = timeout.map(Value::from).unwrap_or(Value::Null);
            let result = client
                .call("core.job_wait", vec![json!(id), timeout])
                .await
                .with_context(|| format!("Job {} failed", id))?;
            print_json(&result)
        }
        JobCommand::Abort { id } => {
            client
                .call("core.job_abort", vec![json!(id)])
                .await
                .with_context(|| format!("Failed to abort job {}", id))?;
            println!("{} {}", "Abort requested for job".green(), id);
            Ok(())
        }
        JobCommand::Logs { id } => {
            client
                .call_streaming("core.job_logs_fd", json!([id]), |chunk| {
                    if let Some(text) = chunk.as_str() {
                        println!("{}", text);
                    }
                })
                .await
                .with_context(|| format!("Failed to follow logs of job {}", id))?;
            Ok(())
        }
    }
}

fn print_table(jobs: &Value) {
    let Some(rows) = jobs.as_array() else {
        println!("{}", jobs);
        return;
    };
    if rows.is_empty() {
        println!("{}", "No jobs".dimmed());
        return;
    }
    println!("{:>6}  {:<8}  {:>4}  {:<32}  {}", "ID".bold(), "STATE".bold(), "%".bold(), "METHOD".bold(), "DESCRIPTION".bold());
    for row in rows {
        let state = row["state"].as_str().unwrap_or("?");
        let colored_state = match state {
            "SUCCESS" => state.green(),
            "FAILED" => state.red(),
            "ABORTED" => state.yellow(),
            "RUNNING" => state.cyan(),
            _ => state.normal(),
        };
        println!(
            "{:>6}  {:<8}  {:>4}  {:<32}  {}",
            row["id"],
            colored_state,
            row["progress"]["percent"].as_u64().unwrap_or(0),
            row["method"].as_str().unwrap_or_default(),
            row["progress"]["description"].as_str().unwrap_or_default(),
        );
    }
}

// Copyright (c) 2026 Middleware Developers
// SPDX-License-Identifier: AGPL-3.0

//! `middlewared subscribe <mask>`

use anyhow::{Context, Result};
use clap::Args;
use colored::Colorize;

use super::Target;

#[derive(Args)]
pub struct SubscribeArgs {
    /// Event name or glob, e.g. `core.job_*`
    pub mask: String,

    /// Print one compact JSON object per event
    #[arg(long)]
    pub json: bool,
}

pub async fn execute(args: SubscribeArgs, target: &Target) -> Result<()> {
    let mut client = target.connect().await?;
    let subscription = client
        .subscribe(&args.mask)
        .await
        .with_context(|| format!("Cannot subscribe to {}", args.mask))?;
    eprintln!("{} {} ({})", "Subscribed to".green(), args.mask.bold(), subscription);

    loop {
        let event = tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = client.next_event() => event?,
        };
        let Some(event) = event else {
            eprintln!("{}", "Connection closed by daemon".yellow());
            break;
        };
        if args.json {
            println!(
                "{}",
                serde_json::json!({"name": event.name, "fields": event.fields})
            );
        } else {
            println!("{} {}", event.name.cyan().bold(), event.fields);
        }
    }
    client.unsubscribe(&subscription).await.ok();
    Ok(())
}

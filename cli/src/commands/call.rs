// Copyright (c) 2026 Middleware Developers
// SPDX-License-Identifier: AGPL-3.0

//! `middlewared call <method> [params...]`

use anyhow::{Context, Result};
use clap::Args;
use serde_json::Value;

use super::{parse_param, print_json, Target};

#[derive(Args)]
pub struct CallArgs {
    /// Dotted method name, e.g. `core.get_jobs`
    pub method: String,

    /// Positional arguments; each is parsed as JSON, falling back to a string
    #[arg(value_name = "PARAM")]
    pub params: Vec<String>,

    /// Keyword arguments as one JSON object (replaces positional arguments)
    #[arg(long, value_name = "JSON", conflicts_with = "params")]
    pub kwargs: Option<String>,

    /// Wait for a job-mode call and print the job's result instead of its id
    #[arg(short, long)]
    pub wait: bool,
}

pub async fn execute(args: CallArgs, target: &Target) -> Result<()> {
    let params = match &args.kwargs {
        Some(kwargs) => {
            let kwargs: Value = serde_json::from_str(kwargs).context("--kwargs is not valid JSON")?;
            anyhow::ensure!(kwargs.is_object(), "--kwargs must be a JSON object");
            kwargs
        }
        None => Value::Array(args.params.iter().map(|p| parse_param(p)).collect()),
    };

    let mut client = target.connect().await?;
    let result = client
        .call_streaming(&args.method, params, |chunk| match chunk {
            Value::String(text) => println!("{}", text),
            other => println!("{}", other),
        })
        .await
        .with_context(|| format!("{} failed", args.method))?;

    let result = match (args.wait, result.as_u64()) {
        (true, Some(job_id)) => client
            .call("core.job_wait", vec![Value::from(job_id)])
            .await
            .with_context(|| format!("Job {} failed", job_id))?,
        _ => result,
    };
    print_json(&result)
}

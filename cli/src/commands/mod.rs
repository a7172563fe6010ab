// Copyright (c) 2026 Middleware Developers
// SPDX-License-Identifier: AGPL-3.0

//! Command implementations for the middlewared CLI

pub mod call;
pub mod config;
pub mod daemon;
pub mod job;
pub mod subscribe;

pub use self::call::CallArgs;
pub use self::config::ConfigCommand;
pub use self::daemon::DaemonCommand;
pub use self::job::JobCommand;
pub use self::subscribe::SubscribeArgs;

use anyhow::{Context, Result};
use serde_json::Value;
use std::path::PathBuf;

use middlewared_core::domain::config::MiddlewareConfig;
use middlewared_core::presentation::Client;

/// Where client commands find the daemon.
pub struct Target {
    config: Option<PathBuf>,
    socket: Option<PathBuf>,
}

impl Target {
    pub fn new(config: Option<PathBuf>, socket: Option<PathBuf>) -> Self {
        Self { config, socket }
    }

    pub fn config_path(&self) -> Option<PathBuf> {
        self.config.clone()
    }

    /// Explicit socket, else the one named by the configuration.
    pub fn socket(&self) -> Result<PathBuf> {
        if let Some(socket) = &self.socket {
            return Ok(socket.clone());
        }
        let config = MiddlewareConfig::load_or_default(self.config.clone()).context("Failed to load configuration")?;
        Ok(config.spec.server.unix_socket)
    }

    pub async fn connect(&self) -> Result<Client> {
        let socket = self.socket()?;
        Client::connect_unix(&socket)
            .await
            .with_context(|| format!("Failed to connect to middlewared at {}. Is the daemon running?", socket.display()))
    }
}

/// Command-line argument as JSON, or as a plain string when it does not parse.
pub fn parse_param(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

pub fn print_json(value: &Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value).context("Failed to render result")?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_param() {
        assert_eq!(parse_param("42"), json!(42));
        assert_eq!(parse_param(r#"{"name":"tank"}"#), json!({"name": "tank"}));
        assert_eq!(parse_param("tank/a@s1"), json!("tank/a@s1"));
        assert_eq!(parse_param("null"), Value::Null);
    }
}

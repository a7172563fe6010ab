// Copyright (c) 2026 Middleware Developers
// SPDX-License-Identifier: AGPL-3.0

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::domain::schema::Schema;

pub const SESSION_CONNECTED: &str = "core.session_connected";
pub const SESSION_DISCONNECTED: &str = "core.session_disconnected";
pub const JOB_ADDED: &str = "core.job_added";
pub const JOB_UPDATED: &str = "core.job_updated";
pub const JOB_FINISHED: &str = "core.job_finished";

/// Event type registered by a plugin at startup.
#[derive(Debug, Clone)]
pub struct EventType {
    /// Dotted name, e.g. `pool.dataset.changed`
    pub name: String,
    /// Payload schema; untyped when absent
    pub payload: Option<Schema>,
    /// Roles a subscriber must hold to receive the event
    pub roles: Vec<String>,
    pub description: Option<String>,
}

impl EventType {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            payload: None,
            roles: Vec::new(),
            description: None,
        }
    }

    pub fn payload(mut self, schema: Schema) -> Self {
        self.payload = Some(schema);
        self
    }

    pub fn roles(mut self, roles: &[&str]) -> Self {
        self.roles = roles.iter().map(|r| r.to_string()).collect();
        self
    }

    pub fn describe(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

/// A published event after payload validation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub name: String,
    pub fields: Value,
    pub emitted_at: DateTime<Utc>,
}

impl Event {
    pub fn new(name: impl Into<String>, fields: Value) -> Self {
        Self {
            name: name.into(),
            fields,
            emitted_at: Utc::now(),
        }
    }
}

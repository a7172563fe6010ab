// Copyright (c) 2026 Middleware Developers
// SPDX-License-Identifier: AGPL-3.0
//! # Audit Records
//!
//! Immutable, append-only history of what the core did and on whose behalf.
//! Callers build an [`AuditEntry`]; the sink stamps it with a process-wide
//! sequence number and a millisecond UTC timestamp, producing the
//! [`AuditRecord`] that is written and never rewritten.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use uuid::Uuid;

use crate::domain::credential::CredentialSummary;

/// Record layout version. Readers switch on `vers` to decode.
pub const AUDIT_VERSION: &str = "0.1";

/// Service category of records written by the core.
pub const SERVICE_MIDDLEWARE: &str = "MIDDLEWARE";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditEventKind {
    MethodCall,
    Authentication,
}

/// Record content before the sink stamps it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub service: String,
    pub credential: Option<CredentialSummary>,
    pub event: AuditEventKind,
    pub event_data: Value,
    pub success: bool,
    pub origin: Option<String>,
    pub session: Option<Uuid>,
}

impl AuditEntry {
    pub fn method_call(
        method: &str,
        description: &str,
        params: Value,
        authenticated: bool,
        authorized: bool,
        success: bool,
    ) -> Self {
        Self {
            service: SERVICE_MIDDLEWARE.to_string(),
            credential: None,
            event: AuditEventKind::MethodCall,
            event_data: json!({
                "method": method,
                "description": description,
                "params": params,
                "authenticated": authenticated,
                "authorized": authorized,
            }),
            success,
            origin: None,
            session: None,
        }
    }

    /// Never carries secret material: only mechanism, outcome and principal.
    pub fn authentication(mechanism: &str, principal: Option<&str>, outcome: &str, success: bool) -> Self {
        Self {
            service: SERVICE_MIDDLEWARE.to_string(),
            credential: None,
            event: AuditEventKind::Authentication,
            event_data: json!({
                "credentials": {
                    "credentials": mechanism,
                    "credentials_data": { "username": principal },
                },
                "error": if success { Value::Null } else { json!(outcome) },
                "outcome": outcome,
            }),
            success,
            origin: None,
            session: None,
        }
    }

    pub fn with_credential(mut self, credential: Option<CredentialSummary>) -> Self {
        self.credential = credential;
        self
    }

    pub fn with_origin(mut self, origin: Option<String>, session: Option<Uuid>) -> Self {
        self.origin = origin;
        self.session = session;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub seq: u64,
    /// Millisecond resolution, never decreasing with `seq`.
    pub timestamp: DateTime<Utc>,
    pub vers: String,
    pub audit_id: Uuid,
    #[serde(flatten)]
    pub entry: AuditEntry,
}

impl AuditRecord {
    pub fn new(seq: u64, timestamp: DateTime<Utc>, entry: AuditEntry) -> Self {
        Self {
            seq,
            timestamp,
            vers: AUDIT_VERSION.to_string(),
            audit_id: Uuid::new_v4(),
            entry,
        }
    }
}

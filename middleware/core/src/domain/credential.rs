// Copyright (c) 2026 Middleware Developers
// SPDX-License-Identifier: AGPL-3.0
//! # Credentials and Roles
//!
//! A [`Credential`] is the authenticated identity attached to a session: the
//! mechanism that produced it, the principal, and the effective role set
//! (already expanded through the [`RoleTable`]). Credentials are immutable;
//! logout or re-authentication replaces the session's `Arc<Credential>`.
//!
//! The per-session authentication progress (anonymous, waiting for an OTP,
//! half-way through a SCRAM exchange, authenticated) is [`AuthState`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::{BTreeSet, HashMap};
use uuid::Uuid;

pub const FULL_ADMIN: &str = "FULL_ADMIN";
pub const READONLY_ADMIN: &str = "READONLY_ADMIN";
pub const SYSTEM_AUDIT_READ: &str = "SYSTEM_AUDIT_READ";
pub const JOB_READ: &str = "JOB_READ";

/// Login mechanisms accepted by `auth.login_ex`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuthMechanism {
    PasswordPlain,
    OtpToken,
    TokenPlain,
    ApiKeyPlain,
    ApiKeyScram,
}

impl AuthMechanism {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PasswordPlain => "PASSWORD_PLAIN",
            Self::OtpToken => "OTP_TOKEN",
            Self::TokenPlain => "TOKEN_PLAIN",
            Self::ApiKeyPlain => "API_KEY_PLAIN",
            Self::ApiKeyScram => "API_KEY_SCRAM",
        }
    }
}

/// How the credential came to be.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CredentialKind {
    LoginPassword,
    LoginTwofactor,
    Token { parent: Box<CredentialSummary> },
    ApiKey { key_id: u64, key_name: String },
    UnixSocket { uid: u32 },
    /// In-process calls made by the middleware itself.
    Internal,
}

impl CredentialKind {
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::LoginPassword => "LOGIN_PASSWORD",
            Self::LoginTwofactor => "LOGIN_TWOFACTOR",
            Self::Token { .. } => "TOKEN",
            Self::ApiKey { .. } => "API_KEY",
            Self::UnixSocket { .. } => "UNIX_SOCKET",
            Self::Internal => "INTERNAL",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Credential {
    pub kind: CredentialKind,
    pub username: String,
    pub uid: Option<u32>,
    /// Effective roles, already expanded through role inclusion.
    pub roles: BTreeSet<String>,
    pub full_admin: bool,
    pub session_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl Credential {
    pub fn new(kind: CredentialKind, username: impl Into<String>, roles: BTreeSet<String>, full_admin: bool) -> Self {
        Self {
            kind,
            username: username.into(),
            uid: None,
            roles,
            full_admin,
            session_id: None,
            created_at: Utc::now(),
            expires_at: None,
        }
    }

    /// Credential used by `Middleware::call`.
    pub fn internal() -> Self {
        let mut roles = BTreeSet::new();
        roles.insert(FULL_ADMIN.to_string());
        Self::new(CredentialKind::Internal, "root", roles, true).with_uid(0)
    }

    pub fn with_uid(mut self, uid: u32) -> Self {
        self.uid = Some(uid);
        self
    }

    pub fn with_session(mut self, session_id: Uuid) -> Self {
        self.session_id = Some(session_id);
        self
    }

    pub fn with_expiry(mut self, expires_at: DateTime<Utc>) -> Self {
        self.expires_at = Some(expires_at);
        self
    }

    pub fn is_internal(&self) -> bool {
        matches!(self.kind, CredentialKind::Internal)
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map(|at| now >= at).unwrap_or(false)
    }

    pub fn has_role(&self, role: &str) -> bool {
        self.full_admin || self.roles.contains(role)
    }

    /// True when every role in `required` is held (or the credential is full
    /// admin). An empty requirement is always satisfied.
    pub fn has_all_roles<'a>(&self, required: impl IntoIterator<Item = &'a String>) -> bool {
        self.full_admin || required.into_iter().all(|r| self.roles.contains(r))
    }

    pub fn has_any_role<'a>(&self, roles: impl IntoIterator<Item = &'a String>) -> bool {
        self.full_admin || roles.into_iter().any(|r| self.roles.contains(r))
    }

    pub fn summary(&self) -> CredentialSummary {
        CredentialSummary {
            credential_type: self.kind.type_name().to_string(),
            username: self.username.clone(),
        }
    }

    /// Shape returned by `auth.me`.
    pub fn user_info(&self) -> Value {
        json!({
            "username": self.username,
            "uid": self.uid,
            "privilege": {
                "roles": self.roles,
                "full_admin": self.full_admin,
            },
            "credential_type": self.kind.type_name(),
            "expires_at": self.expires_at,
        })
    }
}

/// Credential description safe for audit records, job rows and `pass_sender`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialSummary {
    #[serde(rename = "type")]
    pub credential_type: String,
    pub username: String,
}

/// One role definition. `includes` grants the included roles transitively.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleDef {
    pub name: String,
    #[serde(default)]
    pub includes: Vec<String>,
    #[serde(default)]
    pub full_admin: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl RoleDef {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            includes: Vec::new(),
            full_admin: false,
            description: None,
        }
    }

    pub fn includes(mut self, roles: &[&str]) -> Self {
        self.includes.extend(roles.iter().map(|r| r.to_string()));
        self
    }
}

#[derive(Debug, Clone)]
pub struct RoleTable {
    roles: HashMap<String, RoleDef>,
}

impl Default for RoleTable {
    fn default() -> Self {
        let mut table = Self { roles: HashMap::new() };
        table.add(RoleDef {
            full_admin: true,
            ..RoleDef::new(FULL_ADMIN)
        });
        table.add(RoleDef::new(SYSTEM_AUDIT_READ));
        table.add(RoleDef::new(JOB_READ));
        table.add(RoleDef::new(READONLY_ADMIN).includes(&[SYSTEM_AUDIT_READ, JOB_READ]));
        table
    }
}

impl RoleTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or extend a role. Plugins contributing the same role merge their
    /// inclusions.
    pub fn add(&mut self, role: RoleDef) {
        match self.roles.get_mut(&role.name) {
            Some(existing) => {
                for include in role.includes {
                    if !existing.includes.contains(&include) {
                        existing.includes.push(include);
                    }
                }
                existing.full_admin |= role.full_admin;
                if existing.description.is_none() {
                    existing.description = role.description;
                }
            }
            None => {
                self.roles.insert(role.name.clone(), role);
            }
        }
    }

    pub fn get(&self, name: &str) -> Option<&RoleDef> {
        self.roles.get(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.roles.keys().map(String::as_str)
    }

    /// Transitive closure of `granted`. Unknown role names are kept as-is.
    pub fn expand<'a>(&self, granted: impl IntoIterator<Item = &'a String>) -> BTreeSet<String> {
        let mut out = BTreeSet::new();
        let mut stack: Vec<String> = granted.into_iter().cloned().collect();
        while let Some(role) = stack.pop() {
            if !out.insert(role.clone()) {
                continue;
            }
            if let Some(def) = self.roles.get(&role) {
                stack.extend(def.includes.iter().cloned());
            }
        }
        out
    }

    pub fn is_full_admin(&self, roles: &BTreeSet<String>) -> bool {
        roles
            .iter()
            .any(|r| self.roles.get(r).map(|d| d.full_admin).unwrap_or(false))
    }
}

/// In-flight SCRAM exchange between `CLIENT_FIRST_MESSAGE` and
/// `CLIENT_FINAL_MESSAGE`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScramExchange {
    pub key_id: u64,
    pub client_first_bare: String,
    pub server_first: String,
    pub nonce: String,
}

/// Authentication progress of one session.
#[derive(Debug, Clone, Default)]
pub enum AuthState {
    #[default]
    Anonymous,
    OtpRequired {
        username: String,
    },
    Scram(ScramExchange),
    Authenticated(std::sync::Arc<Credential>),
}

impl AuthState {
    pub fn credential(&self) -> Option<&std::sync::Arc<Credential>> {
        match self {
            Self::Authenticated(credential) => Some(credential),
            _ => None,
        }
    }
}

/// Result of one `auth.login_ex` round.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "response_type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuthResponse {
    Success {
        user_info: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        server_signature: Option<String>,
    },
    AuthErr,
    Expired,
    OtpRequired {
        username: String,
    },
    /// Intermediate SCRAM round; `rfc_str` is the RFC 5802 server message.
    ScramResponse {
        scram_type: String,
        rfc_str: String,
    },
}

impl AuthResponse {
    pub fn outcome(&self) -> &'static str {
        match self {
            Self::Success { .. } => "SUCCESS",
            Self::AuthErr => "AUTH_ERR",
            Self::Expired => "EXPIRED",
            Self::OtpRequired { .. } => "OTP_REQUIRED",
            Self::ScramResponse { .. } => "SCRAM_RESPONSE",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_inclusion_is_transitive() {
        let mut table = RoleTable::new();
        table.add(RoleDef::new("SHARING_ADMIN").includes(&["SHARING_READ", "READONLY_ADMIN"]));
        let granted = vec!["SHARING_ADMIN".to_string()];
        let roles = table.expand(&granted);
        assert!(roles.contains("SHARING_READ"));
        assert!(roles.contains(SYSTEM_AUDIT_READ));
        assert!(!table.is_full_admin(&roles));
    }

    #[test]
    fn test_full_admin_satisfies_any_requirement() {
        let table = RoleTable::new();
        let roles = table.expand(&[FULL_ADMIN.to_string()]);
        let credential = Credential::new(CredentialKind::LoginPassword, "root", roles.clone(), table.is_full_admin(&roles));
        let required = vec!["ACCOUNT_WRITE".to_string()];
        assert!(credential.has_all_roles(&required));
    }

    #[test]
    fn test_empty_requirement_is_satisfied() {
        let credential = Credential::new(CredentialKind::LoginPassword, "bob", BTreeSet::new(), false);
        assert!(credential.has_all_roles(&Vec::<String>::new()));
        assert!(!credential.has_role(JOB_READ));
    }

    #[test]
    fn test_auth_response_wire_shape() {
        let encoded = serde_json::to_value(AuthResponse::OtpRequired { username: "bob".into() }).unwrap();
        assert_eq!(encoded, json!({"response_type": "OTP_REQUIRED", "username": "bob"}));
    }
}

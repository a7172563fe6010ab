// Copyright (c) 2026 Middleware Developers
// SPDX-License-Identifier: AGPL-3.0
//! # Authentication
//!
//! `auth.login_ex` drives a per-session state machine over five mechanisms:
//!
//! | Mechanism | Input | Next state on success |
//! |-----------|-------|-----------------------|
//! | `PASSWORD_PLAIN` | username, password | `Authenticated`, or `OtpRequired` when the user has a TOTP secret |
//! | `OTP_TOKEN` | otp_token | `Authenticated` (only from `OtpRequired`) |
//! | `TOKEN_PLAIN` | token | `Authenticated`; the token's parent credential supplies the roles |
//! | `API_KEY_PLAIN` | username, `<id>-<key>` | `Authenticated` |
//! | `API_KEY_SCRAM` | RFC 5802 client-first, then client-final | `Scram`, then `Authenticated` |
//!
//! API keys are stored in SCRAM form only (`salt`, `iterations`, `StoredKey`,
//! `ServerKey`), so a plain key is checked by deriving its `StoredKey` and
//! comparing in constant time. Every outcome is written to the audit sink
//! by the `auth.login_ex` handler; secrets never leave this module.

use base64::engine::general_purpose::{STANDARD as BASE64, URL_SAFE_NO_PAD};
use base64::Engine;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use dashmap::DashMap;
use hmac::{Hmac, Mac};
use serde::Deserialize;
use serde_json::{json, Value};
use sha1::Sha1;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;
use subtle::ConstantTimeEq;
use tracing::{debug, info, warn};

use crate::application::context::{arg, handler, CallContext};
use crate::application::service_registry::ServiceDefinition;
use crate::domain::audit::AuditEntry;
use crate::domain::config::{ApiKeyEntry, AuthConfig, UserEntry};
use crate::domain::credential::{
    AuthMechanism, AuthResponse, AuthState, Credential, CredentialKind, RoleTable, ScramExchange, FULL_ADMIN,
};
use crate::domain::error::CallError;
use crate::domain::schema::Schema;
use crate::domain::service::{MethodDescriptor, ServiceMeta};

type HmacSha256 = Hmac<Sha256>;
type HmacSha1 = Hmac<Sha1>;

pub const DEFAULT_SCRAM_ITERATIONS: u32 = 500_000;
pub const DEFAULT_PASSWORD_ITERATIONS: u32 = 210_000;
const PASSWORD_SCHEME: &str = "pbkdf2-sha256";
const TOTP_STEP_SECS: u64 = 30;
const TOTP_DIGITS: u32 = 6;
const TOTP_SKEW_STEPS: u64 = 1;

/// Rate-limit class of `auth.login_ex`.
pub const AUTH_RATE_CLASS: &str = "auth";

fn hmac_sha256(key: &[u8], data: &[u8]) -> Option<[u8; 32]> {
    let mut mac = HmacSha256::new_from_slice(key).ok()?;
    mac.update(data);
    Some(mac.finalize().into_bytes().into())
}

/// PBKDF2-HMAC-SHA256 with a single output block (RFC 5802 `Hi()`).
pub(crate) fn salted_password(secret: &[u8], salt: &[u8], iterations: u32) -> Option<[u8; 32]> {
    let mut block = salt.to_vec();
    block.extend_from_slice(&1u32.to_be_bytes());
    let mut u = hmac_sha256(secret, &block)?;
    let mut out = u;
    for _ in 1..iterations {
        u = hmac_sha256(secret, &u)?;
        for (o, b) in out.iter_mut().zip(u.iter()) {
            *o ^= b;
        }
    }
    Some(out)
}

/// `(StoredKey, ServerKey)` for a raw key.
pub(crate) fn scram_keys(raw_key: &[u8], salt: &[u8], iterations: u32) -> Option<([u8; 32], [u8; 32])> {
    let salted = salted_password(raw_key, salt, iterations)?;
    let client_key = hmac_sha256(&salted, b"Client Key")?;
    let server_key = hmac_sha256(&salted, b"Server Key")?;
    Some((Sha256::digest(client_key).into(), server_key))
}

/// Build the stored form of a new API key.
pub fn api_key_entry(id: u64, name: &str, username: &str, raw_key: &str, iterations: u32) -> Option<ApiKeyEntry> {
    let salt: [u8; 16] = rand::random();
    let (stored_key, server_key) = scram_keys(raw_key.as_bytes(), &salt, iterations)?;
    Some(ApiKeyEntry {
        id,
        name: name.to_string(),
        username: username.to_string(),
        salt: BASE64.encode(salt),
        iterations,
        stored_key: BASE64.encode(stored_key),
        server_key: BASE64.encode(server_key),
        expires_at: None,
        revoked: false,
    })
}

/// `pbkdf2-sha256:<iterations>:<salt-hex>:<key-hex>`
pub fn hash_password(password: &str) -> String {
    hash_password_with_iterations(password, DEFAULT_PASSWORD_ITERATIONS)
}

pub fn hash_password_with_iterations(password: &str, iterations: u32) -> String {
    let salt: [u8; 16] = rand::random();
    let iterations = iterations.max(1);
    let key = salted_password(password.as_bytes(), &salt, iterations).unwrap_or_default();
    format!(
        "{}:{}:{}:{}",
        PASSWORD_SCHEME,
        iterations,
        hex::encode(salt),
        hex::encode(key)
    )
}

pub fn verify_password(stored: &str, password: &str) -> bool {
    let mut parts = stored.splitn(4, ':');
    let (Some(PASSWORD_SCHEME), Some(iterations), Some(salt), Some(key)) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return false;
    };
    let (Ok(iterations), Ok(salt), Ok(key)) = (iterations.parse::<u32>(), hex::decode(salt), hex::decode(key)) else {
        return false;
    };
    if iterations == 0 {
        return false;
    }
    let Some(candidate) = salted_password(password.as_bytes(), &salt, iterations) else {
        return false;
    };
    candidate.as_slice().ct_eq(key.as_slice()).into()
}

/// RFC 6238 TOTP value for one time step.
pub fn totp(secret: &[u8], counter: u64) -> Option<u32> {
    let mut mac = HmacSha1::new_from_slice(secret).ok()?;
    mac.update(&counter.to_be_bytes());
    let digest = mac.finalize().into_bytes();
    let offset = (digest[digest.len() - 1] & 0x0f) as usize;
    let binary = u32::from_be_bytes([digest[offset], digest[offset + 1], digest[offset + 2], digest[offset + 3]]) & 0x7fff_ffff;
    Some(binary % 10u32.pow(TOTP_DIGITS))
}

/// Accepts the current step and one step either side.
pub fn verify_totp(secret_hex: &str, code: &str, unix_time: u64) -> bool {
    let Ok(secret) = hex::decode(secret_hex) else {
        return false;
    };
    let Ok(code) = code.trim().parse::<u32>() else {
        return false;
    };
    let step = unix_time / TOTP_STEP_SECS;
    (step.saturating_sub(TOTP_SKEW_STEPS)..=step + TOTP_SKEW_STEPS).any(|counter| {
        totp(&secret, counter)
            .map(|expected| bool::from(expected.to_be_bytes().ct_eq(&code.to_be_bytes())))
            .unwrap_or(false)
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ScramType {
    ClientFirstMessage,
    ClientFinalMessage,
}

/// `auth.login_ex` payload. Not `Debug`: it carries secrets.
#[derive(Deserialize)]
#[serde(tag = "mechanism", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LoginRequest {
    PasswordPlain {
        username: String,
        password: String,
    },
    OtpToken {
        otp_token: String,
    },
    TokenPlain {
        token: String,
    },
    ApiKeyPlain {
        username: String,
        api_key: String,
    },
    ApiKeyScram {
        scram_type: ScramType,
        rfc_str: String,
        #[serde(default)]
        api_key_id: Option<u64>,
    },
}

impl LoginRequest {
    pub fn mechanism(&self) -> AuthMechanism {
        match self {
            Self::PasswordPlain { .. } => AuthMechanism::PasswordPlain,
            Self::OtpToken { .. } => AuthMechanism::OtpToken,
            Self::TokenPlain { .. } => AuthMechanism::TokenPlain,
            Self::ApiKeyPlain { .. } => AuthMechanism::ApiKeyPlain,
            Self::ApiKeyScram { .. } => AuthMechanism::ApiKeyScram,
        }
    }
}

/// Result of one login round.
#[derive(Debug)]
pub struct LoginOutcome {
    pub response: AuthResponse,
    pub next: AuthState,
    pub mechanism: AuthMechanism,
    /// Authenticated principal; only set on success.
    pub principal: Option<String>,
}

struct IssuedToken {
    parent: Arc<Credential>,
    expires_at: DateTime<Utc>,
    single_use: bool,
}

pub struct Authenticator {
    users: HashMap<String, UserEntry>,
    api_keys: HashMap<u64, ApiKeyEntry>,
    tokens: DashMap<String, IssuedToken>,
    roles: Arc<RoleTable>,
    token_ttl: ChronoDuration,
}

impl Authenticator {
    pub fn new(config: &AuthConfig, roles: Arc<RoleTable>) -> Self {
        Self {
            users: config.users.iter().map(|u| (u.username.clone(), u.clone())).collect(),
            api_keys: config.api_keys.iter().map(|k| (k.id, k.clone())).collect(),
            tokens: DashMap::new(),
            roles,
            token_ttl: ChronoDuration::seconds(config.token_ttl_secs as i64),
        }
    }

    pub fn roles(&self) -> &RoleTable {
        &self.roles
    }

    fn credential_for(&self, kind: CredentialKind, username: &str, granted: &[String], uid: Option<u32>) -> Credential {
        let roles = self.roles.expand(granted);
        let full_admin = self.roles.is_full_admin(&roles);
        let mut credential = Credential::new(kind, username, roles, full_admin);
        credential.uid = uid;
        credential
    }

    /// Credential of a local peer identified by `SO_PEERCRED`. uid 0 is root.
    pub fn credential_for_uid(&self, uid: u32) -> Option<Credential> {
        if uid == 0 {
            return Some(self.credential_for(
                CredentialKind::UnixSocket { uid },
                "root",
                &[FULL_ADMIN.to_string()],
                Some(0),
            ));
        }
        let user = self.users.values().find(|u| u.uid == uid && !u.locked)?;
        Some(self.credential_for(CredentialKind::UnixSocket { uid }, &user.username, &user.roles, Some(uid)))
    }

    /// Advance the state machine by one round.
    pub fn login(&self, state: &AuthState, request: LoginRequest) -> LoginOutcome {
        let mechanism = request.mechanism();
        let (response, next) = match request {
            LoginRequest::PasswordPlain { username, password } => self.login_password(&username, &password),
            LoginRequest::OtpToken { otp_token } => self.login_otp(state, &otp_token),
            LoginRequest::TokenPlain { token } => self.login_token(&token),
            LoginRequest::ApiKeyPlain { username, api_key } => self.login_api_key(&username, &api_key),
            LoginRequest::ApiKeyScram {
                scram_type: ScramType::ClientFirstMessage,
                rfc_str,
                api_key_id,
            } => self.scram_client_first(&rfc_str, api_key_id),
            LoginRequest::ApiKeyScram {
                scram_type: ScramType::ClientFinalMessage,
                rfc_str,
                ..
            } => self.scram_client_final(state, &rfc_str),
        };
        let principal = next.credential().map(|c| c.username.clone());
        debug!("{} login round ended with {}", mechanism.as_str(), response.outcome());
        LoginOutcome {
            response,
            next,
            mechanism,
            principal,
        }
    }

    fn success(credential: Credential) -> (AuthResponse, AuthState) {
        (
            AuthResponse::Success {
                user_info: credential.user_info(),
                server_signature: None,
            },
            AuthState::Authenticated(Arc::new(credential)),
        )
    }

    fn failure() -> (AuthResponse, AuthState) {
        (AuthResponse::AuthErr, AuthState::Anonymous)
    }

    fn login_password(&self, username: &str, password: &str) -> (AuthResponse, AuthState) {
        let Some(user) = self.users.get(username) else {
            return Self::failure();
        };
        if user.locked || !verify_password(&user.password_hash, password) {
            return Self::failure();
        }
        if user.otp_secret.is_some() {
            return (
                AuthResponse::OtpRequired {
                    username: username.to_string(),
                },
                AuthState::OtpRequired {
                    username: username.to_string(),
                },
            );
        }
        Self::success(self.credential_for(CredentialKind::LoginPassword, username, &user.roles, Some(user.uid)))
    }

    fn login_otp(&self, state: &AuthState, code: &str) -> (AuthResponse, AuthState) {
        let AuthState::OtpRequired { username } = state else {
            return Self::failure();
        };
        let Some(user) = self.users.get(username) else {
            return Self::failure();
        };
        let Some(secret) = &user.otp_secret else {
            return Self::failure();
        };
        let now = Utc::now().timestamp().max(0) as u64;
        if !verify_totp(secret, code, now) {
            return Self::failure();
        }
        Self::success(self.credential_for(CredentialKind::LoginTwofactor, username, &user.roles, Some(user.uid)))
    }

    fn login_token(&self, token: &str) -> (AuthResponse, AuthState) {
        let Some(issued) = self.tokens.get(token) else {
            return Self::failure();
        };
        let now = Utc::now();
        if issued.expires_at <= now || issued.parent.is_expired(now) {
            drop(issued);
            self.tokens.remove(token);
            return (AuthResponse::Expired, AuthState::Anonymous);
        }
        let parent = Arc::clone(&issued.parent);
        let expires_at = issued.expires_at;
        let single_use = issued.single_use;
        drop(issued);
        if single_use {
            self.tokens.remove(token);
        }

        let mut credential = Credential::new(
            CredentialKind::Token {
                parent: Box::new(parent.summary()),
            },
            parent.username.clone(),
            parent.roles.clone(),
            parent.full_admin,
        )
        .with_expiry(expires_at);
        credential.uid = parent.uid;
        Self::success(credential)
    }

    fn api_key_status(entry: &ApiKeyEntry) -> Result<(), AuthResponse> {
        if entry.revoked {
            return Err(AuthResponse::AuthErr);
        }
        if entry.expires_at.map(|at| at <= Utc::now()).unwrap_or(false) {
            return Err(AuthResponse::Expired);
        }
        Ok(())
    }

    fn api_key_credential(&self, entry: &ApiKeyEntry) -> Option<Credential> {
        let user = self.users.get(&entry.username);
        let granted = match (user, entry.username.as_str()) {
            (Some(user), _) if !user.locked => user.roles.clone(),
            (None, "root") => vec![FULL_ADMIN.to_string()],
            _ => return None,
        };
        Some(self.credential_for(
            CredentialKind::ApiKey {
                key_id: entry.id,
                key_name: entry.name.clone(),
            },
            &entry.username,
            &granted,
            user.map(|u| u.uid).or(Some(0)),
        ))
    }

    fn login_api_key(&self, username: &str, api_key: &str) -> (AuthResponse, AuthState) {
        let Some((id, raw)) = api_key.split_once('-') else {
            return Self::failure();
        };
        let Some(entry) = id.parse::<u64>().ok().and_then(|id| self.api_keys.get(&id)) else {
            return Self::failure();
        };
        if entry.username != username {
            return Self::failure();
        }
        if let Err(response) = Self::api_key_status(entry) {
            return (response, AuthState::Anonymous);
        }

        let (Ok(salt), Ok(stored)) = (BASE64.decode(&entry.salt), BASE64.decode(&entry.stored_key)) else {
            warn!("API key {} has a malformed stored form", entry.id);
            return Self::failure();
        };
        let Some((candidate, _)) = scram_keys(raw.as_bytes(), &salt, entry.iterations) else {
            return Self::failure();
        };
        if !bool::from(candidate.as_slice().ct_eq(stored.as_slice())) {
            return Self::failure();
        }
        match self.api_key_credential(entry) {
            Some(credential) => Self::success(credential),
            None => Self::failure(),
        }
    }

    fn scram_client_first(&self, rfc_str: &str, key_id: Option<u64>) -> (AuthResponse, AuthState) {
        let Some(bare) = rfc_str.strip_prefix("n,,").or_else(|| rfc_str.strip_prefix("y,,")) else {
            return Self::failure();
        };
        let attrs = parse_scram_attrs(bare);
        let (Some(username), Some(client_nonce)) = (attrs.get("n"), attrs.get("r")) else {
            return Self::failure();
        };
        let Some(entry) = key_id.and_then(|id| self.api_keys.get(&id)) else {
            return Self::failure();
        };
        if &entry.username != username {
            return Self::failure();
        }
        if let Err(response) = Self::api_key_status(entry) {
            return (response, AuthState::Anonymous);
        }

        let server_nonce: [u8; 18] = rand::random();
        let nonce = format!("{}{}", client_nonce, BASE64.encode(server_nonce));
        let server_first = format!("r={},s={},i={}", nonce, entry.salt, entry.iterations);
        (
            AuthResponse::ScramResponse {
                scram_type: "SERVER_FIRST_RESPONSE".to_string(),
                rfc_str: server_first.clone(),
            },
            AuthState::Scram(ScramExchange {
                key_id: entry.id,
                client_first_bare: bare.to_string(),
                server_first,
                nonce,
            }),
        )
    }

    fn scram_client_final(&self, state: &AuthState, rfc_str: &str) -> (AuthResponse, AuthState) {
        let AuthState::Scram(exchange) = state else {
            return Self::failure();
        };
        let Some(entry) = self.api_keys.get(&exchange.key_id) else {
            return Self::failure();
        };
        let Some((without_proof, proof)) = rfc_str.rsplit_once(",p=") else {
            return Self::failure();
        };
        let attrs = parse_scram_attrs(without_proof);
        if attrs.get("r").map(String::as_str) != Some(exchange.nonce.as_str()) {
            return Self::failure();
        }

        let auth_message = format!("{},{},{}", exchange.client_first_bare, exchange.server_first, without_proof);
        let (Ok(proof), Ok(stored), Ok(server_key)) = (
            BASE64.decode(proof),
            BASE64.decode(&entry.stored_key),
            BASE64.decode(&entry.server_key),
        ) else {
            return Self::failure();
        };
        let Some(client_signature) = hmac_sha256(&stored, auth_message.as_bytes()) else {
            return Self::failure();
        };
        if proof.len() != client_signature.len() {
            return Self::failure();
        }
        let client_key: Vec<u8> = proof.iter().zip(client_signature.iter()).map(|(p, s)| p ^ s).collect();
        let derived: [u8; 32] = Sha256::digest(&client_key).into();
        if !bool::from(derived.as_slice().ct_eq(stored.as_slice())) {
            return Self::failure();
        }
        let Some(server_signature) = hmac_sha256(&server_key, auth_message.as_bytes()) else {
            return Self::failure();
        };
        let Some(credential) = self.api_key_credential(entry) else {
            return Self::failure();
        };
        (
            AuthResponse::Success {
                user_info: credential.user_info(),
                server_signature: Some(format!("v={}", BASE64.encode(server_signature))),
            },
            AuthState::Authenticated(Arc::new(credential)),
        )
    }

    /// Mint an opaque token bound to `parent`.
    pub fn generate_token(&self, parent: Arc<Credential>, ttl_secs: Option<u64>, single_use: bool) -> String {
        let raw: [u8; 32] = rand::random();
        let token = URL_SAFE_NO_PAD.encode(raw);
        let ttl = ttl_secs
            .map(|s| ChronoDuration::seconds(s as i64))
            .unwrap_or(self.token_ttl);
        self.tokens.insert(
            token.clone(),
            IssuedToken {
                parent,
                expires_at: Utc::now() + ttl,
                single_use,
            },
        );
        token
    }

    /// Forget expired tokens.
    pub fn prune_tokens(&self) {
        let now = Utc::now();
        self.tokens.retain(|_, issued| issued.expires_at > now);
    }
}

fn parse_scram_attrs(message: &str) -> HashMap<String, String> {
    message
        .split(',')
        .filter_map(|part| part.split_once('='))
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

/// `auth.*` methods.
pub(crate) fn service_definition() -> ServiceDefinition {
    ServiceDefinition::plain(ServiceMeta::new("auth"))
        .method(
            MethodDescriptor::new("login_ex")
                .accepts(Schema::dict("login_data").additional_attrs(true).required())
                .public()
                .rate_limit(AUTH_RATE_CLASS)
                .describe("Authenticate the session with a mechanism-tagged request"),
            handler(|ctx, args| async move { login_ex(ctx, arg(&args, 0)) }),
        )
        .method(
            MethodDescriptor::new("generate_token")
                .accepts(Schema::integer("ttl").nullable().min(1))
                .accepts(Schema::boolean("single_use").default_value(json!(false)))
                .returns(Schema::string("token"))
                .describe("Mint a short-lived token derived from the current credential"),
            handler(|ctx, args| async move {
                let parent = Arc::clone(ctx.credential()?);
                let ttl = arg(&args, 0).as_u64();
                let single_use = arg(&args, 1).as_bool().unwrap_or(false);
                Ok(Value::String(ctx.middleware.authenticator().generate_token(parent, ttl, single_use)))
            }),
        )
        .method(
            MethodDescriptor::new("me")
                .returns(Schema::any("user_info"))
                .describe("Describe the authenticated credential"),
            handler(|ctx, _args| async move { Ok(ctx.credential()?.user_info()) }),
        )
        .method(
            MethodDescriptor::new("logout")
                .returns(Schema::boolean("logged_out"))
                .describe("Drop the session's credential"),
            handler(|ctx, _args| async move {
                let session = ctx.session()?;
                session.set_auth_state(AuthState::Anonymous);
                info!("Session {} logged out", session.id);
                Ok(Value::Bool(true))
            }),
        )
}

fn login_ex(ctx: CallContext, data: Value) -> Result<Value, CallError> {
    let session = Arc::clone(ctx.session()?);
    let mechanism = data.get("mechanism").and_then(Value::as_str).unwrap_or("UNKNOWN").to_string();
    let audit = ctx.middleware.audit();

    let request: LoginRequest = match serde_json::from_value(data) {
        Ok(request) => request,
        Err(e) => {
            // serde messages may quote input; keep only the mechanism.
            debug!("Malformed {} login request: {:?}", mechanism, e.classify());
            audit.record(
                AuditEntry::authentication(&mechanism, None, AuthResponse::AuthErr.outcome(), false)
                    .with_origin(session.origin.clone(), Some(session.id)),
            );
            return Err(CallError::validation("login_data", "Invalid login request"));
        }
    };

    let outcome = ctx.middleware.authenticator().login(&session.auth_state(), request);
    let success = matches!(outcome.response, AuthResponse::Success { .. });
    audit.record(
        AuditEntry::authentication(
            outcome.mechanism.as_str(),
            outcome.principal.as_deref(),
            outcome.response.outcome(),
            success,
        )
        .with_credential(outcome.next.credential().map(|c| c.summary()))
        .with_origin(session.origin.clone(), Some(session.id)),
    );

    let next = match outcome.next {
        AuthState::Authenticated(credential) => {
            info!("Session {} authenticated as {} via {}", session.id, credential.username, outcome.mechanism.as_str());
            AuthState::Authenticated(Arc::new(Credential::clone(&credential).with_session(session.id)))
        }
        other => other,
    };
    session.set_auth_state(next);
    serde_json::to_value(&outcome.response).map_err(CallError::internal)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::credential::{READONLY_ADMIN, SYSTEM_AUDIT_READ};

    fn authenticator() -> Authenticator {
        let mut config = AuthConfig::default();
        config.users.push(UserEntry {
            username: "alice".into(),
            uid: 1000,
            password_hash: hash_password_with_iterations("wonderland", 64),
            roles: vec![READONLY_ADMIN.into()],
            otp_secret: None,
            locked: false,
        });
        config.users.push(UserEntry {
            username: "bob".into(),
            uid: 1001,
            password_hash: hash_password_with_iterations("builder", 64),
            roles: vec![],
            otp_secret: Some(hex::encode(b"12345678901234567890")),
            locked: false,
        });
        config.api_keys.push(api_key_entry(7, "ci", "alice", "s3cr3t", 16).unwrap());
        Authenticator::new(&config, Arc::new(RoleTable::new()))
    }

    fn password(username: &str, password: &str) -> LoginRequest {
        LoginRequest::PasswordPlain {
            username: username.into(),
            password: password.into(),
        }
    }

    #[test]
    fn test_password_hash_roundtrip() {
        let stored = hash_password_with_iterations("pw", 1000);
        assert!(stored.starts_with("pbkdf2-sha256:1000:"));
        assert!(verify_password(&stored, "pw"));
        assert!(!verify_password(&stored, "pW"));
        assert!(!verify_password("md5:00:00", "pw"));
    }

    #[test]
    fn test_password_hash_is_iterated_and_salted() {
        let first = hash_password_with_iterations("pw", 1000);
        let second = hash_password_with_iterations("pw", 1000);
        assert_ne!(first, second);

        let salt = first.split(':').nth(2).unwrap();
        let single_round = format!("pbkdf2-sha256:1:{}:{}", salt, first.split(':').nth(3).unwrap());
        assert!(!verify_password(&single_round, "pw"));

        // Legacy single-round SHA-256 hashes are refused.
        let mut hasher = Sha256::new();
        hasher.update([0u8; 16]);
        hasher.update(b"pw");
        let legacy = format!("sha256:{}:{}", hex::encode([0u8; 16]), hex::encode(hasher.finalize()));
        assert!(!verify_password(&legacy, "pw"));
        assert!(!verify_password("pbkdf2-sha256:0:00:00", "pw"));
    }

    #[test]
    fn test_totp_rfc6238_vector() {
        // RFC 6238 appendix B, SHA1, T = 59s: 94287082 (8 digits).
        assert_eq!(totp(b"12345678901234567890", 1), Some(287_082));
        let secret = hex::encode(b"12345678901234567890");
        assert!(verify_totp(&secret, "287082", 59));
        assert!(verify_totp(&secret, "287082", 59 + 30));
        assert!(!verify_totp(&secret, "287082", 59 + 90));
    }

    #[test]
    fn test_password_login_expands_roles() {
        let auth = authenticator();
        let outcome = auth.login(&AuthState::Anonymous, password("alice", "wonderland"));
        assert_eq!(outcome.response.outcome(), "SUCCESS");
        assert_eq!(outcome.principal.as_deref(), Some("alice"));
        let credential = outcome.next.credential().unwrap();
        assert!(credential.has_role(SYSTEM_AUDIT_READ));
        assert!(!credential.full_admin);

        let bad = auth.login(&AuthState::Anonymous, password("alice", "nope"));
        assert_eq!(bad.response, AuthResponse::AuthErr);
        assert!(bad.principal.is_none());
    }

    #[test]
    fn test_otp_round() {
        let auth = authenticator();
        let first = auth.login(&AuthState::Anonymous, password("bob", "builder"));
        assert_eq!(first.response, AuthResponse::OtpRequired { username: "bob".into() });

        let secret = b"12345678901234567890";
        let code = totp(secret, Utc::now().timestamp() as u64 / TOTP_STEP_SECS).unwrap();
        let second = auth.login(
            &first.next,
            LoginRequest::OtpToken {
                otp_token: format!("{:06}", code),
            },
        );
        assert_eq!(second.response.outcome(), "SUCCESS");

        let out_of_order = auth.login(
            &AuthState::Anonymous,
            LoginRequest::OtpToken {
                otp_token: format!("{:06}", code),
            },
        );
        assert_eq!(out_of_order.response, AuthResponse::AuthErr);
    }

    #[test]
    fn test_single_use_token() {
        let auth = authenticator();
        let parent = Arc::new(Credential::internal());
        let token = auth.generate_token(parent, Some(60), true);
        let first = auth.login(&AuthState::Anonymous, LoginRequest::TokenPlain { token: token.clone() });
        assert_eq!(first.response.outcome(), "SUCCESS");
        assert!(first.next.credential().unwrap().full_admin);
        let second = auth.login(&AuthState::Anonymous, LoginRequest::TokenPlain { token });
        assert_eq!(second.response, AuthResponse::AuthErr);
    }

    #[test]
    fn test_expired_token() {
        let auth = authenticator();
        let parent = Arc::new(Credential::internal().with_expiry(Utc::now() - ChronoDuration::seconds(1)));
        let token = auth.generate_token(parent, Some(60), false);
        let outcome = auth.login(&AuthState::Anonymous, LoginRequest::TokenPlain { token });
        assert_eq!(outcome.response, AuthResponse::Expired);
    }

    #[test]
    fn test_api_key_plain() {
        let auth = authenticator();
        let ok = auth.login(
            &AuthState::Anonymous,
            LoginRequest::ApiKeyPlain {
                username: "alice".into(),
                api_key: "7-s3cr3t".into(),
            },
        );
        assert_eq!(ok.response.outcome(), "SUCCESS");
        assert!(matches!(
            ok.next.credential().unwrap().kind,
            CredentialKind::ApiKey { key_id: 7, .. }
        ));

        let wrong = auth.login(
            &AuthState::Anonymous,
            LoginRequest::ApiKeyPlain {
                username: "alice".into(),
                api_key: "7-guess".into(),
            },
        );
        assert_eq!(wrong.response, AuthResponse::AuthErr);
    }

    #[test]
    fn test_api_key_scram_exchange() {
        let auth = authenticator();
        let client_first_bare = "n=alice,r=clientnonce";
        let first = auth.login(
            &AuthState::Anonymous,
            LoginRequest::ApiKeyScram {
                scram_type: ScramType::ClientFirstMessage,
                rfc_str: format!("n,,{}", client_first_bare),
                api_key_id: Some(7),
            },
        );
        let AuthResponse::ScramResponse { rfc_str: server_first, .. } = &first.response else {
            panic!("expected SCRAM response, got {:?}", first.response);
        };
        let attrs = parse_scram_attrs(server_first);
        let nonce = attrs["r"].clone();
        assert!(nonce.starts_with("clientnonce"));
        let salt = BASE64.decode(&attrs["s"]).unwrap();
        let iterations: u32 = attrs["i"].parse().unwrap();

        let salted = salted_password(b"s3cr3t", &salt, iterations).unwrap();
        let client_key = hmac_sha256(&salted, b"Client Key").unwrap();
        let stored_key: [u8; 32] = Sha256::digest(client_key).into();
        let without_proof = format!("c=biws,r={}", nonce);
        let auth_message = format!("{},{},{}", client_first_bare, server_first, without_proof);
        let signature = hmac_sha256(&stored_key, auth_message.as_bytes()).unwrap();
        let proof: Vec<u8> = client_key.iter().zip(signature.iter()).map(|(k, s)| k ^ s).collect();

        let last = auth.login(
            &first.next,
            LoginRequest::ApiKeyScram {
                scram_type: ScramType::ClientFinalMessage,
                rfc_str: format!("{},p={}", without_proof, BASE64.encode(proof)),
                api_key_id: None,
            },
        );
        let AuthResponse::Success { server_signature, .. } = &last.response else {
            panic!("expected success, got {:?}", last.response);
        };
        let server_key = hmac_sha256(&salted, b"Server Key").unwrap();
        let expected = hmac_sha256(&server_key, auth_message.as_bytes()).unwrap();
        assert_eq!(server_signature.as_deref(), Some(format!("v={}", BASE64.encode(expected)).as_str()));
    }

    #[test]
    fn test_unix_peer_credentials() {
        let auth = authenticator();
        assert!(auth.credential_for_uid(0).unwrap().full_admin);
        assert_eq!(auth.credential_for_uid(1000).unwrap().username, "alice");
        assert!(auth.credential_for_uid(4242).is_none());
    }

    #[test]
    fn test_login_request_wire_shape() {
        let request: LoginRequest = serde_json::from_value(json!({
            "mechanism": "PASSWORD_PLAIN",
            "username": "root",
            "password": "x",
        }))
        .unwrap();
        assert_eq!(request.mechanism(), AuthMechanism::PasswordPlain);
    }
}

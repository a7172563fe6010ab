// Copyright (c) 2026 Middleware Developers
// SPDX-License-Identifier: AGPL-3.0
//! # Call Context and Method Handlers
//!
//! Every method implementation is a [`ServiceMethod`]: an async function of a
//! [`CallContext`] and the validated positional arguments. Plugins rarely
//! implement the trait by hand; [`handler`] wraps an async closure and
//! [`blocking`] wraps a CPU-bound closure that must run on the blocking pool.
//!
//! ```text
//! Session ──► Dispatcher ──► CallContext { middleware, credential, session,
//!                                          job?, stream?, cancel }
//!                                 │
//!                                 ▼
//!                          ServiceMethod::call(ctx, args)
//! ```
//!
//! [`SessionState`] is the part of a session the application layer shares
//! with the transport: identity, origin, and the authentication state that
//! `auth.login_ex` advances.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde_json::{json, Value};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::application::job_manager::JobHandle;
use crate::application::middleware::Middleware;
use crate::application::panics;
use crate::domain::credential::{AuthState, Credential};
use crate::domain::error::CallError;
use crate::domain::repository::ConfigStore;

/// Shared, mutable view of one connected session.
#[derive(Debug)]
pub struct SessionState {
    pub id: Uuid,
    /// Peer address, or `unix:<uid>` for local connections.
    pub origin: Option<String>,
    pub transport: &'static str,
    pub connected_at: DateTime<Utc>,
    auth: RwLock<AuthState>,
    /// Cancelled when the session closes.
    pub closed: CancellationToken,
}

impl SessionState {
    pub fn new(transport: &'static str, origin: Option<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            origin,
            transport,
            connected_at: Utc::now(),
            auth: RwLock::new(AuthState::Anonymous),
            closed: CancellationToken::new(),
        }
    }

    pub fn auth_state(&self) -> AuthState {
        self.auth.read().clone()
    }

    pub fn set_auth_state(&self, state: AuthState) {
        *self.auth.write() = state;
    }

    /// Attached credential, dropping it first if it has expired.
    pub fn credential(&self) -> Option<Arc<Credential>> {
        let credential = self.auth.read().credential().cloned()?;
        if credential.is_expired(Utc::now()) {
            self.set_auth_state(AuthState::Anonymous);
            return None;
        }
        Some(credential)
    }

    pub fn is_authenticated(&self) -> bool {
        self.credential().is_some()
    }

    /// Rate-limit key: the principal once authenticated, the peer before.
    pub fn rate_key(&self) -> String {
        match self.credential() {
            Some(credential) => format!("user:{}", credential.username),
            None => format!("addr:{}", self.origin.as_deref().unwrap_or("unknown")),
        }
    }

    /// Row returned by `core.sessions`.
    pub fn info(&self) -> Value {
        let credential = self.credential();
        json!({
            "id": self.id,
            "origin": self.origin,
            "transport": self.transport,
            "connected_at": self.connected_at,
            "authenticated": credential.is_some(),
            "credentials": credential.map(|c| c.summary()),
        })
    }
}

/// Everything a method invocation may need besides its arguments.
#[derive(Clone)]
pub struct CallContext {
    pub middleware: Middleware,
    /// Full dotted name of the method being run.
    pub method: String,
    pub credential: Option<Arc<Credential>>,
    /// Absent for in-process calls.
    pub session: Option<Arc<SessionState>>,
    /// Set when the method runs as a job.
    pub job: Option<JobHandle>,
    /// Chunk channel of streaming calls.
    pub stream: Option<mpsc::Sender<Value>>,
    pub cancel: CancellationToken,
}

impl CallContext {
    pub fn new(middleware: Middleware, method: impl Into<String>) -> Self {
        Self {
            middleware,
            method: method.into(),
            credential: None,
            session: None,
            job: None,
            stream: None,
            cancel: CancellationToken::new(),
        }
    }

    pub fn credential(&self) -> Result<&Arc<Credential>, CallError> {
        self.credential.as_ref().ok_or(CallError::NotAuthenticated)
    }

    pub fn session(&self) -> Result<&Arc<SessionState>, CallError> {
        self.session
            .as_ref()
            .ok_or_else(|| CallError::invalid(format!("{} requires a client session", self.method)))
    }

    pub fn job(&self) -> Result<&JobHandle, CallError> {
        self.job
            .as_ref()
            .ok_or_else(|| CallError::internal(format!("{} is not running as a job", self.method)))
    }

    pub fn store(&self) -> Arc<dyn ConfigStore> {
        self.middleware.store()
    }

    /// Emit one chunk frame. Non-streaming calls ignore chunks.
    pub async fn send_chunk(&self, data: Value) -> Result<(), CallError> {
        let Some(stream) = &self.stream else {
            return Ok(());
        };
        tokio::select! {
            sent = stream.send(data) => sent.map_err(|_| CallError::internal("stream receiver closed")),
            _ = self.cancel.cancelled() => Err(CallError::internal("call cancelled")),
        }
    }

    /// In-process call with the middleware's internal credential.
    pub async fn call(&self, method: &str, params: Vec<Value>) -> Result<Value, CallError> {
        self.middleware.call(method, params).await
    }
}

/// One RPC endpoint implementation.
#[async_trait]
pub trait ServiceMethod: Send + Sync {
    async fn call(&self, ctx: CallContext, args: Vec<Value>) -> Result<Value, CallError>;
}

/// Async closure adapter.
pub struct FnMethod<F> {
    f: F,
}

#[async_trait]
impl<F, Fut> ServiceMethod for FnMethod<F>
where
    F: Fn(CallContext, Vec<Value>) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value, CallError>> + Send + 'static,
{
    async fn call(&self, ctx: CallContext, args: Vec<Value>) -> Result<Value, CallError> {
        (self.f)(ctx, args).await
    }
}

/// CPU-bound closure adapter; runs on the blocking thread pool.
pub struct BlockingFnMethod<F> {
    f: Arc<F>,
}

#[async_trait]
impl<F> ServiceMethod for BlockingFnMethod<F>
where
    F: Fn(CallContext, Vec<Value>) -> Result<Value, CallError> + Send + Sync + 'static,
{
    async fn call(&self, ctx: CallContext, args: Vec<Value>) -> Result<Value, CallError> {
        let f = Arc::clone(&self.f);
        panics::install_hook();
        let task = tokio::task::spawn_blocking(move || {
            std::panic::catch_unwind(AssertUnwindSafe(|| f(ctx, args))).unwrap_or_else(|panic| Err(panics::caught(panic)))
        });
        match task.await {
            Ok(result) => result,
            Err(e) => Err(CallError::internal(e)),
        }
    }
}

pub fn handler<F, Fut>(f: F) -> Arc<dyn ServiceMethod>
where
    F: Fn(CallContext, Vec<Value>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, CallError>> + Send + 'static,
{
    Arc::new(FnMethod { f })
}

pub fn blocking<F>(f: F) -> Arc<dyn ServiceMethod>
where
    F: Fn(CallContext, Vec<Value>) -> Result<Value, CallError> + Send + Sync + 'static,
{
    Arc::new(BlockingFnMethod { f: Arc::new(f) })
}

/// Positional argument `index`, or `null` when absent.
pub fn arg(args: &[Value], index: usize) -> Value {
    args.get(index).cloned().unwrap_or(Value::Null)
}

// Copyright (c) 2026 Middleware Developers
// SPDX-License-Identifier: AGPL-3.0
//! # Service and Method Descriptors
//!
//! Metadata attached to every RPC method at load time: argument and result
//! schemas, roles, execution mode, audit policy, job options. The descriptor
//! is pure data plus a few caller-supplied closures (audit descriptions,
//! derived lock keys, per-call predicates); the handler itself lives next to
//! it in the service registry.
//!
//! ```text
//! ServiceMeta { namespace, shape, private, rate_limit, config schema }
//!   └─ MethodDescriptor { name, accepts[], returns, roles, mode, audit, job }
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::domain::credential::Credential;
use crate::domain::schema::Schema;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    #[default]
    Sync,
    /// Runs through the job manager; the call returns the job id.
    Job,
    /// Emits chunk frames before the final result.
    Streaming,
}

/// Canonical service shapes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceShape {
    #[default]
    Plain,
    Config,
    Crud,
}

/// Produces a one-line human summary from validated arguments.
pub type Describer = Arc<dyn Fn(&[Value]) -> Option<String> + Send + Sync>;

/// Derives a job lock key from validated arguments.
pub type LockFn = Arc<dyn Fn(&[Value]) -> Option<String> + Send + Sync>;

/// Extra authorization check evaluated after the role check.
pub trait CallPredicate: Send + Sync {
    /// `Err(reason)` rejects the call with `NOT_AUTHORIZED`.
    fn check(&self, credential: &Credential, args: &[Value]) -> Result<(), String>;
}

impl<F> CallPredicate for F
where
    F: Fn(&Credential, &[Value]) -> Result<(), String> + Send + Sync,
{
    fn check(&self, credential: &Credential, args: &[Value]) -> Result<(), String> {
        self(credential, args)
    }
}

#[derive(Clone)]
pub struct AuditPolicy {
    /// Static description, used when no describer is set or it yields nothing.
    pub description: String,
    pub describer: Option<Describer>,
    /// Also audit failed calls (validation and method errors).
    pub failures: bool,
}

impl AuditPolicy {
    pub fn new(description: impl Into<String>) -> Self {
        Self {
            description: description.into(),
            describer: None,
            failures: true,
        }
    }

    pub fn describe(&self, args: &[Value]) -> String {
        self.describer
            .as_ref()
            .and_then(|d| d(args))
            .unwrap_or_else(|| self.description.clone())
    }
}

impl fmt::Debug for AuditPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuditPolicy")
            .field("description", &self.description)
            .field("describer", &self.describer.is_some())
            .field("failures", &self.failures)
            .finish()
    }
}

#[derive(Clone)]
pub enum LockKey {
    Static(String),
    Derived(LockFn),
}

impl LockKey {
    pub fn resolve(&self, args: &[Value]) -> Option<String> {
        match self {
            Self::Static(key) => Some(key.clone()),
            Self::Derived(f) => f(args),
        }
    }
}

impl fmt::Debug for LockKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Static(key) => f.debug_tuple("Static").field(key).finish(),
            Self::Derived(_) => f.write_str("Derived(..)"),
        }
    }
}

/// Options for job-mode methods.
#[derive(Clone)]
pub struct JobOptions {
    pub lock: Option<LockKey>,
    /// Maximum queued jobs per lock key; `Some(0)` rejects when one is running.
    pub queue_limit: Option<usize>,
    pub abandon_on_disconnect: bool,
    /// Mirror the job row to the config store.
    pub durable: bool,
    /// Do not announce through `core.job_*` events.
    pub transient: bool,
    pub abortable: bool,
    /// Keep a log buffer that `core.job_logs_fd` can stream.
    pub logs: bool,
    /// Roles that may see other principals' jobs of this method.
    pub read_roles: Vec<String>,
    pub describer: Option<Describer>,
}

impl Default for JobOptions {
    fn default() -> Self {
        Self {
            lock: None,
            queue_limit: None,
            abandon_on_disconnect: false,
            durable: false,
            transient: false,
            abortable: true,
            logs: false,
            read_roles: Vec::new(),
            describer: None,
        }
    }
}

impl fmt::Debug for JobOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobOptions")
            .field("lock", &self.lock)
            .field("queue_limit", &self.queue_limit)
            .field("abandon_on_disconnect", &self.abandon_on_disconnect)
            .field("durable", &self.durable)
            .field("transient", &self.transient)
            .field("abortable", &self.abortable)
            .field("logs", &self.logs)
            .field("read_roles", &self.read_roles)
            .field("describer", &self.describer.is_some())
            .finish()
    }
}

impl JobOptions {
    pub fn lock(mut self, key: impl Into<String>) -> Self {
        self.lock = Some(LockKey::Static(key.into()));
        self
    }

    pub fn lock_with<F>(mut self, f: F) -> Self
    where
        F: Fn(&[Value]) -> Option<String> + Send + Sync + 'static,
    {
        self.lock = Some(LockKey::Derived(Arc::new(f)));
        self
    }

    pub fn queue_limit(mut self, limit: usize) -> Self {
        self.queue_limit = Some(limit);
        self
    }

    pub fn abandon_on_disconnect(mut self) -> Self {
        self.abandon_on_disconnect = true;
        self
    }

    pub fn durable(mut self) -> Self {
        self.durable = true;
        self
    }

    pub fn transient(mut self) -> Self {
        self.transient = true;
        self
    }

    pub fn with_logs(mut self) -> Self {
        self.logs = true;
        self
    }

    pub fn not_abortable(mut self) -> Self {
        self.abortable = false;
        self
    }

    pub fn read_roles(mut self, roles: &[&str]) -> Self {
        self.read_roles = roles.iter().map(|r| r.to_string()).collect();
        self
    }
}

/// Everything the dispatcher knows about one method.
#[derive(Clone)]
pub struct MethodDescriptor {
    /// Short name; the full name is `<namespace>.<name>`.
    pub name: String,
    pub accepts: Vec<Schema>,
    pub returns: Option<Schema>,
    pub roles: Vec<String>,
    pub mode: ExecutionMode,
    /// Callable without authentication.
    pub public: bool,
    /// Callable only in-process.
    pub private: bool,
    /// Append the caller's credential summary as a trailing argument.
    pub pass_sender: bool,
    /// Fail the call when the result does not match `returns`.
    pub strict_result: bool,
    pub audit: Option<AuditPolicy>,
    pub job: JobOptions,
    pub rate_limit: Option<String>,
    pub timeout: Option<Duration>,
    pub predicates: Vec<Arc<dyn CallPredicate>>,
    pub description: Option<String>,
}

impl fmt::Debug for MethodDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MethodDescriptor")
            .field("name", &self.name)
            .field("roles", &self.roles)
            .field("mode", &self.mode)
            .field("public", &self.public)
            .field("private", &self.private)
            .field("audit", &self.audit)
            .field("job", &self.job)
            .field("predicates", &self.predicates.len())
            .finish()
    }
}

impl MethodDescriptor {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            accepts: Vec::new(),
            returns: None,
            roles: Vec::new(),
            mode: ExecutionMode::Sync,
            public: false,
            private: false,
            pass_sender: false,
            strict_result: false,
            audit: None,
            job: JobOptions::default(),
            rate_limit: None,
            timeout: None,
            predicates: Vec::new(),
            description: None,
        }
    }

    pub fn accepts(mut self, schema: Schema) -> Self {
        self.accepts.push(schema);
        self
    }

    pub fn returns(mut self, schema: Schema) -> Self {
        self.returns = Some(schema);
        self
    }

    pub fn roles(mut self, roles: &[&str]) -> Self {
        self.roles = roles.iter().map(|r| r.to_string()).collect();
        self
    }

    pub fn job(mut self, options: JobOptions) -> Self {
        self.mode = ExecutionMode::Job;
        self.job = options;
        self
    }

    pub fn streaming(mut self) -> Self {
        self.mode = ExecutionMode::Streaming;
        self
    }

    pub fn public(mut self) -> Self {
        self.public = true;
        self
    }

    pub fn private(mut self) -> Self {
        self.private = true;
        self
    }

    pub fn pass_sender(mut self) -> Self {
        self.pass_sender = true;
        self
    }

    pub fn strict_result(mut self) -> Self {
        self.strict_result = true;
        self
    }

    pub fn audit(mut self, description: impl Into<String>) -> Self {
        self.audit = Some(AuditPolicy::new(description));
        self
    }

    pub fn audit_with<F>(mut self, description: impl Into<String>, describer: F) -> Self
    where
        F: Fn(&[Value]) -> Option<String> + Send + Sync + 'static,
    {
        let mut policy = AuditPolicy::new(description);
        policy.describer = Some(Arc::new(describer));
        self.audit = Some(policy);
        self
    }

    pub fn rate_limit(mut self, class: impl Into<String>) -> Self {
        self.rate_limit = Some(class.into());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn predicate<P: CallPredicate + 'static>(mut self, predicate: P) -> Self {
        self.predicates.push(Arc::new(predicate));
        self
    }

    pub fn describe(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

/// Per-service metadata.
#[derive(Debug, Clone, Default)]
pub struct ServiceMeta {
    /// Dotted namespace, e.g. `pool.snapshot`.
    pub namespace: String,
    pub shape: ServiceShape,
    /// Every method is private.
    pub private: bool,
    /// Default rate-limit class for methods that do not name one.
    pub rate_limit: Option<String>,
    /// Default audit description prefix for the service's methods.
    pub audit_category: Option<String>,
    /// Config shape: schema of the singleton; CRUD shape: schema of `create`.
    pub entry_schema: Option<Schema>,
    /// Roles required by read-only methods (`config`, `query`, `get_instance`).
    pub read_roles: Vec<String>,
    /// Roles required by mutating methods (`update`, `create`, `delete`).
    pub write_roles: Vec<String>,
}

impl ServiceMeta {
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            ..Default::default()
        }
    }

    pub fn method_name(&self, method: &str) -> String {
        format!("{}.{}", self.namespace, method)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_derived_lock_key() {
        let options = JobOptions::default().lock_with(|args| {
            args.first()
                .and_then(|a| a.get("dataset_dst"))
                .and_then(Value::as_str)
                .map(|d| format!("clone_{}", d))
        });
        let key = options.lock.unwrap().resolve(&[json!({"dataset_dst": "tank/b"})]);
        assert_eq!(key.as_deref(), Some("clone_tank/b"));
    }

    #[test]
    fn test_audit_describer_falls_back_to_static_description() {
        let descriptor = MethodDescriptor::new("create")
            .audit_with("Create user", |args| args.first()?.get("username")?.as_str().map(|u| format!("Create user {}", u)));
        let policy = descriptor.audit.unwrap();
        assert_eq!(policy.describe(&[json!({"username": "bob"})]), "Create user bob");
        assert_eq!(policy.describe(&[json!({})]), "Create user");
    }

    #[test]
    fn test_closure_predicate() {
        let descriptor = MethodDescriptor::new("delete").predicate(|cred: &Credential, _args: &[Value]| {
            if cred.username == "root" {
                Ok(())
            } else {
                Err("only root".to_string())
            }
        });
        let cred = Credential::internal();
        assert!(descriptor.predicates[0].check(&cred, &[]).is_ok());
    }
}
